//! Record files: tabular game data loaded at startup.
//!
//! A record file is a delimited text file (tab by default, `#` comments)
//! whose first data row is a human-readable header and is discarded. Each
//! remaining row deserializes positionally into the record type; columns
//! holding structs or arrays carry JSON text and are declared with
//! [`json_cell`]. Indexed columns are declared with key extractors and
//! build value→record maps, rejecting duplicates at load time.
//!
//! # Example
//!
//! ```ignore
//! #[derive(serde::Deserialize)]
//! struct Monster {
//!     id: u32,
//!     name: String,
//!     #[serde(deserialize_with = "volley::recordfile::json_cell")]
//!     drops: Vec<u32>,
//! }
//!
//! let mut rf = RecordFile::<Monster>::new();
//! rf.add_index(|m| m.id.into());
//! rf.read("data/monster.txt")?;
//! let boss = rf.index(&5u32.into());
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};

/// Default field delimiter.
pub const COMMA: u8 = b'\t';
/// Default comment character.
pub const COMMENT: u8 = b'#';

/// Key of an indexed column. Only primitive-typed columns may be indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexKey {
    /// Boolean column.
    Bool(bool),
    /// Signed integer column.
    Int(i64),
    /// Unsigned integer column.
    Uint(u64),
    /// String column.
    Str(String),
}

impl From<bool> for IndexKey {
    fn from(v: bool) -> Self {
        IndexKey::Bool(v)
    }
}
impl From<i32> for IndexKey {
    fn from(v: i32) -> Self {
        IndexKey::Int(v as i64)
    }
}
impl From<i64> for IndexKey {
    fn from(v: i64) -> Self {
        IndexKey::Int(v)
    }
}
impl From<u16> for IndexKey {
    fn from(v: u16) -> Self {
        IndexKey::Uint(v as u64)
    }
}
impl From<u32> for IndexKey {
    fn from(v: u32) -> Self {
        IndexKey::Uint(v as u64)
    }
}
impl From<u64> for IndexKey {
    fn from(v: u64) -> Self {
        IndexKey::Uint(v)
    }
}
impl From<&str> for IndexKey {
    fn from(v: &str) -> Self {
        IndexKey::Str(v.to_string())
    }
}
impl From<String> for IndexKey {
    fn from(v: String) -> Self {
        IndexKey::Str(v)
    }
}

type IndexFn<T> = Box<dyn Fn(&T) -> IndexKey + Send + Sync>;

/// A loaded record file.
pub struct RecordFile<T> {
    /// Field delimiter.
    pub comma: u8,
    /// Comment character.
    pub comment: u8,
    index_fns: Vec<IndexFn<T>>,
    records: Vec<Arc<T>>,
    indexes: Vec<HashMap<IndexKey, Arc<T>>>,
}

impl<T: DeserializeOwned> RecordFile<T> {
    /// Create an empty record file with the default delimiter and comment
    /// character.
    pub fn new() -> Self {
        Self {
            comma: COMMA,
            comment: COMMENT,
            index_fns: Vec::new(),
            records: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Declare an indexed column via its key extractor. Must precede
    /// [`read`].
    ///
    /// [`read`]: RecordFile::read
    pub fn add_index(&mut self, f: impl Fn(&T) -> IndexKey + Send + Sync + 'static) {
        self.index_fns.push(Box::new(f));
    }

    /// Load records from `path`, replacing any previously loaded content.
    ///
    /// Fields map positionally; the first data row is a human-readable
    /// header and is discarded without being parsed.
    pub fn read(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.comma)
            .comment(Some(self.comment))
            .has_headers(false)
            .from_path(path.as_ref())?;

        let mut records = Vec::new();
        let mut rows = reader.records();
        if let Some(header) = rows.next() {
            header?;
        }
        for row in rows {
            let record: T = row?.deserialize(None)?;
            records.push(Arc::new(record));
        }

        let mut indexes: Vec<HashMap<IndexKey, Arc<T>>> =
            self.index_fns.iter().map(|_| HashMap::new()).collect();
        for (n, record) in records.iter().enumerate() {
            for (i, f) in self.index_fns.iter().enumerate() {
                let key = f(record);
                if indexes[i].insert(key, record.clone()).is_some() {
                    return Err(Error::Protocol(format!(
                        "index error: duplicate at (row={}, index={})",
                        n + 1,
                        i
                    )));
                }
            }
        }

        self.records = records;
        self.indexes = indexes;
        Ok(())
    }

    /// The `i`-th record.
    pub fn record(&self, i: usize) -> Option<&Arc<T>> {
        self.records.get(i)
    }

    /// Number of loaded records.
    pub fn num_record(&self) -> usize {
        self.records.len()
    }

    /// The `i`-th index map.
    pub fn indexes(&self, i: usize) -> Option<&HashMap<IndexKey, Arc<T>>> {
        self.indexes.get(i)
    }

    /// Look a record up in the first index.
    pub fn index(&self, key: &IndexKey) -> Option<&Arc<T>> {
        self.indexes.first()?.get(key)
    }
}

impl<T: DeserializeOwned> Default for RecordFile<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Deserializer for columns carrying JSON text (structs, arrays, slices).
pub fn json_cell<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let text = String::deserialize(deserializer)?;
    serde_json::from_str(&text).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Monster {
        id: u32,
        name: String,
        boss: bool,
        #[serde(deserialize_with = "json_cell")]
        drops: Vec<u32>,
    }

    fn write_file(name: &str, content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("volley-rf-{}-{}", std::process::id(), name));
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    // The header row is descriptive text, not field names.
    const SAMPLE: &str = "\
monster id\tdisplay name\tis boss\tdrop table
# wave one
1\tslime\tfalse\t[1,2]
2\tdragon\ttrue\t[7]
";

    #[test]
    fn test_read_skips_header_and_comments() {
        let path = write_file("basic.txt", SAMPLE);
        let mut rf = RecordFile::<Monster>::new();
        rf.read(&path).unwrap();

        assert_eq!(rf.num_record(), 2);
        let first = rf.record(0).unwrap();
        assert_eq!(first.name, "slime");
        assert_eq!(first.drops, vec![1, 2]);
        assert!(rf.record(2).is_none());
    }

    #[test]
    fn test_indexed_lookup() {
        let path = write_file("indexed.txt", SAMPLE);
        let mut rf = RecordFile::<Monster>::new();
        rf.add_index(|m| m.id.into());
        rf.add_index(|m| m.name.as_str().into());
        rf.read(&path).unwrap();

        assert_eq!(rf.index(&2u32.into()).unwrap().name, "dragon");
        assert_eq!(
            rf.indexes(1).unwrap().get(&"slime".into()).unwrap().id,
            1
        );
        assert!(rf.index(&9u32.into()).is_none());
    }

    #[test]
    fn test_duplicate_index_value_fails() {
        let dup = "\
monster id\tdisplay name\tis boss\tdrop table
1\tslime\tfalse\t[]
1\tghost\tfalse\t[]
";
        let path = write_file("dup.txt", dup);
        let mut rf = RecordFile::<Monster>::new();
        rf.add_index(|m| m.id.into());
        let err = rf.read(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_field_count_mismatch_fails() {
        let bad = "\
monster id\tdisplay name\tis boss\tdrop table
1\tslime\tfalse
";
        let path = write_file("short.txt", bad);
        let mut rf = RecordFile::<Monster>::new();
        assert!(rf.read(&path).is_err());
    }

    #[test]
    fn test_bad_cell_type_fails() {
        let bad = "\
monster id\tdisplay name\tis boss\tdrop table
x\tslime\tfalse\t[]
";
        let path = write_file("badtype.txt", bad);
        let mut rf = RecordFile::<Monster>::new();
        assert!(rf.read(&path).is_err());
    }
}
