//! Cron expressions.
//!
//! Five mandatory fields — minutes, hours, day of month, month, day of
//! week — with an optional leading seconds field:
//!
//! ```text
//! Field name   | Mandatory? | Allowed values | Allowed special characters
//! ----------   | ---------- | -------------- | --------------------------
//! Seconds      | No         | 0-59           | * / , -
//! Minutes      | Yes        | 0-59           | * / , -
//! Hours        | Yes        | 0-23           | * / , -
//! Day of month | Yes        | 1-31           | * / , -
//! Month        | Yes        | 1-12           | * / , -
//! Day of week  | Yes        | 0-6            | * / , -
//! ```
//!
//! Each field is a comma-separated list of `*`, `n`, `a-b`, `*/s`, `n/s`
//! (meaning `n-max/s`) or `a-b/s`, compiled into a bitmask. When the
//! day-of-month field is restricted, matching follows the usual cron rule:
//! a day matches if it satisfies day-of-month *or* day-of-week, unless one
//! of the two is unrestricted.

use chrono::{DateTime, Datelike, Days, Duration, TimeZone, Timelike};

use crate::error::{Error, Result};

/// A compiled cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    sec: u64,
    min: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
}

impl CronExpr {
    /// Parse a 5- or 6-field cron expression.
    pub fn new(expr: &str) -> Result<Self> {
        let mut fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 && fields.len() != 6 {
            return Err(Error::Protocol(format!(
                "invalid expr {}: expected 5 or 6 fields, got {}",
                expr,
                fields.len()
            )));
        }
        if fields.len() == 5 {
            fields.insert(0, "0");
        }

        let parse = |field: &str, min: u32, max: u32| {
            parse_cron_field(field, min, max)
                .map_err(|e| Error::Protocol(format!("invalid expr {}: {}", expr, e)))
        };

        Ok(Self {
            sec: parse(fields[0], 0, 59)?,
            min: parse(fields[1], 0, 59)?,
            hour: parse(fields[2], 0, 23)?,
            dom: parse(fields[3], 1, 31)?,
            month: parse(fields[4], 1, 12)?,
            dow: parse(fields[5], 0, 6)?,
        })
    }

    fn match_day<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        // Day-of-month unrestricted (bits 1-31 all set): day-of-week decides.
        if self.dom == 0xffff_fffe {
            return 1 << t.weekday().num_days_from_sunday() & self.dow != 0;
        }
        // Day-of-week unrestricted (bits 0-6 all set): day-of-month decides.
        if self.dow == 0x7f {
            return 1 << t.day() & self.dom != 0;
        }
        1 << t.weekday().num_days_from_sunday() & self.dow != 0
            || 1 << t.day() & self.dom != 0
    }

    /// The first matching instant strictly after `t`, or `None` when no
    /// match exists within roughly the next year.
    pub fn next_after<Tz: TimeZone>(&self, t: DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut t = t.with_nanosecond(0)? + Duration::seconds(1);
        let year = t.year();
        let mut init = false;

        'retry: loop {
            if t.year() > year + 1 {
                return None;
            }

            while 1u64 << t.month() & self.month == 0 {
                if !init {
                    init = true;
                    t = start_of_month(&t)?;
                }
                t = next_month(&t)?;
                if t.month() == 1 {
                    continue 'retry;
                }
            }

            while !self.match_day(&t) {
                if !init {
                    init = true;
                    t = start_of_day(&t)?;
                }
                t = t.checked_add_days(Days::new(1))?;
                if t.day() == 1 {
                    continue 'retry;
                }
            }

            while 1u64 << t.hour() & self.hour == 0 {
                if !init {
                    init = true;
                    t = t.with_minute(0)?.with_second(0)?;
                }
                t = t + Duration::hours(1);
                if t.hour() == 0 {
                    continue 'retry;
                }
            }

            while 1u64 << t.minute() & self.min == 0 {
                if !init {
                    init = true;
                    t = t.with_second(0)?;
                }
                t = t + Duration::minutes(1);
                if t.minute() == 0 {
                    continue 'retry;
                }
            }

            while 1u64 << t.second() & self.sec == 0 {
                init = true;
                t = t + Duration::seconds(1);
                if t.second() == 0 {
                    continue 'retry;
                }
            }

            return Some(t);
        }
    }
}

fn start_of_month<Tz: TimeZone>(t: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    t.timezone()
        .with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
        .earliest()
}

fn next_month<Tz: TimeZone>(t: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let (y, m) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    t.timezone().with_ymd_and_hms(y, m, 1, 0, 0, 0).earliest()
}

fn start_of_day<Tz: TimeZone>(t: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    t.with_hour(0)?.with_minute(0)?.with_second(0)
}

/// Parse one field into its bitmask.
fn parse_cron_field(field: &str, min: u32, max: u32) -> std::result::Result<u64, String> {
    let mut mask = 0u64;

    for part in field.split(',') {
        let range_and_incr: Vec<&str> = part.split('/').collect();
        if range_and_incr.len() > 2 {
            return Err(format!("too many slashes: {}", part));
        }

        let start_and_end: Vec<&str> = range_and_incr[0].split('-').collect();
        if start_and_end.len() > 2 {
            return Err(format!("too many hyphens: {}", range_and_incr[0]));
        }

        let (start, end) = if start_and_end[0] == "*" {
            if start_and_end.len() != 1 {
                return Err(format!("invalid range: {}", range_and_incr[0]));
            }
            (min, max)
        } else {
            let start: u32 = start_and_end[0]
                .parse()
                .map_err(|_| format!("invalid range: {}", range_and_incr[0]))?;
            let end = if start_and_end.len() == 1 {
                if range_and_incr.len() == 2 {
                    // `n/s` means `n-max/s`.
                    max
                } else {
                    start
                }
            } else {
                start_and_end[1]
                    .parse()
                    .map_err(|_| format!("invalid range: {}", range_and_incr[0]))?
            };
            (start, end)
        };

        if start > end {
            return Err(format!("invalid range: {}", range_and_incr[0]));
        }
        if start < min || end > max {
            return Err(format!(
                "out of range [{}, {}]: {}",
                min, max, range_and_incr[0]
            ));
        }

        let incr: u32 = if range_and_incr.len() == 1 {
            1
        } else {
            let incr = range_and_incr[1]
                .parse()
                .map_err(|_| format!("invalid increment: {}", range_and_incr[1]))?;
            if incr == 0 {
                return Err(format!("invalid increment: {}", range_and_incr[1]));
            }
            incr
        };

        if incr == 1 {
            mask |= !(u64::MAX << (end + 1)) & (u64::MAX << start);
        } else {
            let mut i = start;
            while i <= end {
                mask |= 1 << i;
                i += incr;
            }
        }
    }

    Ok(mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_parse_field_forms() {
        assert_eq!(parse_cron_field("*", 0, 6).unwrap(), 0x7f);
        assert_eq!(parse_cron_field("3", 0, 59).unwrap(), 1 << 3);
        assert_eq!(parse_cron_field("1-3", 0, 59).unwrap(), 0b1110);
        assert_eq!(
            parse_cron_field("*/20", 0, 59).unwrap(),
            (1 << 0) | (1 << 20) | (1 << 40)
        );
        assert_eq!(
            parse_cron_field("50/5", 0, 59).unwrap(),
            (1 << 50) | (1 << 55)
        );
        assert_eq!(
            parse_cron_field("1,5,30", 0, 59).unwrap(),
            (1 << 1) | (1 << 5) | (1 << 30)
        );
    }

    #[test]
    fn test_parse_field_errors() {
        assert!(parse_cron_field("1/2/3", 0, 59).is_err());
        assert!(parse_cron_field("5-1", 0, 59).is_err());
        assert!(parse_cron_field("61", 0, 59).is_err());
        assert!(parse_cron_field("x", 0, 59).is_err());
        assert!(parse_cron_field("1/0", 0, 59).is_err());
    }

    #[test]
    fn test_expr_field_count() {
        assert!(CronExpr::new("* * * * *").is_ok());
        assert!(CronExpr::new("0 * * * * *").is_ok());
        assert!(CronExpr::new("* * * *").is_err());
        assert!(CronExpr::new("* * * * * * *").is_err());
    }

    #[test]
    fn test_next_every_minute() {
        let e = CronExpr::new("* * * * *").unwrap();
        let t = at(2024, 3, 10, 12, 30, 15);
        assert_eq!(e.next_after(t), Some(at(2024, 3, 10, 12, 31, 0)));
    }

    #[test]
    fn test_next_specific_time_rolls_to_tomorrow() {
        // 08:30 daily, asked at 09:00.
        let e = CronExpr::new("30 8 * * *").unwrap();
        let t = at(2024, 3, 10, 9, 0, 0);
        assert_eq!(e.next_after(t), Some(at(2024, 3, 11, 8, 30, 0)));
    }

    #[test]
    fn test_next_with_seconds_field() {
        let e = CronExpr::new("*/15 * * * * *").unwrap();
        let t = at(2024, 3, 10, 12, 0, 16);
        assert_eq!(e.next_after(t), Some(at(2024, 3, 10, 12, 0, 30)));
    }

    #[test]
    fn test_next_month_rollover() {
        // Noon on the 31st; asked in April (30 days) -> May 31st.
        let e = CronExpr::new("0 12 31 * *").unwrap();
        let t = at(2024, 4, 2, 0, 0, 0);
        assert_eq!(e.next_after(t), Some(at(2024, 5, 31, 12, 0, 0)));
    }

    #[test]
    fn test_next_weekday() {
        // Sundays at 00:00. 2024-03-10 is a Sunday.
        let e = CronExpr::new("0 0 * * 0").unwrap();
        let t = at(2024, 3, 10, 0, 0, 0);
        assert_eq!(e.next_after(t), Some(at(2024, 3, 17, 0, 0, 0)));
    }

    #[test]
    fn test_next_no_match_within_horizon() {
        // February 30th never exists.
        let e = CronExpr::new("0 0 30 2 *").unwrap();
        let t = at(2024, 1, 1, 0, 0, 0);
        assert_eq!(e.next_after(t), None);
    }

    #[test]
    fn test_next_is_strictly_monotonic() {
        let e = CronExpr::new("*/5 * * * * *").unwrap();
        let mut t = at(2024, 3, 10, 12, 0, 0);
        for _ in 0..100 {
            let n = e.next_after(t.clone()).unwrap();
            assert!(n > t);
            t = n;
        }
    }
}
