//! Textual message codec: JSON keyed by type name.
//!
//! Wire layout is a single-member object:
//!
//! ```text
//! {"<TypeName>": { ...message body... }}
//! ```
//!
//! The registry is keyed by the message type's short name, so ids stay
//! stable across peers regardless of registration order.

use std::any::TypeId;
use std::collections::HashMap;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::processor::Processor as ProcessorTrait;
use crate::chanrpc::{Args, CallId, ServerHandle, Value};
use crate::error::{Error, Result};

/// Synchronous message handler, invoked with `[msg, user_data]`.
pub type MsgHandler = Box<dyn Fn(Args) + Send + Sync>;

struct MsgInfo {
    call_id: CallId,
    decode: Box<dyn Fn(serde_json::Value) -> Result<Value> + Send + Sync>,
    encode: Box<dyn Fn(&Value) -> Result<serde_json::Value> + Send + Sync>,
    msg_router: Option<ServerHandle>,
    msg_handler: Option<MsgHandler>,
}

/// The JSON processor.
pub struct Processor {
    msg_info: HashMap<String, MsgInfo>,
    msg_name: HashMap<TypeId, String>,
}

impl Processor {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            msg_info: HashMap::new(),
            msg_name: HashMap::new(),
        }
    }

    /// Register a message type under its short type name.
    ///
    /// # Panics
    ///
    /// Re-registration is a fatal programmer error.
    pub fn register<M>(&mut self)
    where
        M: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let name = short_name::<M>().to_string();
        if self.msg_info.contains_key(&name) {
            panic!("message {} is already registered", name);
        }

        self.msg_info.insert(
            name.clone(),
            MsgInfo {
                call_id: CallId::of::<M>(),
                decode: Box::new(|raw| {
                    let msg: M = serde_json::from_value(raw)?;
                    Ok(std::sync::Arc::new(msg) as Value)
                }),
                encode: Box::new(|msg| {
                    let m = msg
                        .downcast_ref::<M>()
                        .ok_or_else(|| Error::Protocol("message type mismatch".to_string()))?;
                    Ok(serde_json::to_value(m)?)
                }),
                msg_router: None,
                msg_handler: None,
            },
        );
        self.msg_name.insert(TypeId::of::<M>(), name);
    }

    /// Route a message type to a channel-RPC server; the call id is the
    /// message type itself.
    ///
    /// # Panics
    ///
    /// The message must already be registered.
    pub fn set_router<M: 'static>(&mut self, router: ServerHandle) {
        self.info_mut::<M>().msg_router = Some(router);
    }

    /// Attach a synchronous handler to a message type.
    ///
    /// # Panics
    ///
    /// The message must already be registered.
    pub fn set_handler<M: 'static>(&mut self, handler: impl Fn(Args) + Send + Sync + 'static) {
        self.info_mut::<M>().msg_handler = Some(Box::new(handler));
    }

    fn info_mut<M: 'static>(&mut self) -> &mut MsgInfo {
        let Some(name) = self.msg_name.get(&TypeId::of::<M>()) else {
            panic!("message {} not registered", short_name::<M>());
        };
        self.msg_info
            .get_mut(name.as_str())
            .expect("name table out of sync")
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorTrait for Processor {
    fn route(&self, msg: Value, user_data: Value) -> Result<()> {
        let type_id = msg.as_ref().type_id();
        let Some(name) = self.msg_name.get(&type_id) else {
            return Err(Error::Protocol("message not registered".to_string()));
        };
        let info = &self.msg_info[name.as_str()];

        if let Some(handler) = &info.msg_handler {
            handler(vec![msg.clone(), user_data.clone()]);
        }
        if let Some(router) = &info.msg_router {
            router.go(info.call_id.clone(), vec![msg, user_data]);
        }
        Ok(())
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(data)?;
        if object.len() != 1 {
            return Err(Error::Protocol("invalid json data".to_string()));
        }
        let Some((name, raw)) = object.into_iter().next() else {
            return Err(Error::Protocol("invalid json data".to_string()));
        };

        let Some(info) = self.msg_info.get(&name) else {
            return Err(Error::Protocol(format!("message {} not registered", name)));
        };
        (info.decode)(raw)
    }

    fn marshal(&self, msg: &Value) -> Result<Vec<Bytes>> {
        let type_id = msg.as_ref().type_id();
        let Some(name) = self.msg_name.get(&type_id) else {
            return Err(Error::Protocol("message not registered".to_string()));
        };

        let body = (self.msg_info[name.as_str()].encode)(msg)?;
        let mut object = serde_json::Map::new();
        object.insert(name.clone(), body);
        Ok(vec![Bytes::from(serde_json::to_vec(&object)?)])
    }
}

fn short_name<M>() -> &'static str {
    std::any::type_name::<M>().rsplit("::").next().unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chanrpc::value;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Chat {
        text: String,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Move {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_marshal_wraps_in_named_object() {
        let mut p = Processor::new();
        p.register::<Chat>();

        let msg: Value = Arc::new(Chat {
            text: "hi".to_string(),
        });
        let chunks = p.marshal(&msg).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], br#"{"Chat":{"text":"hi"}}"#);
    }

    #[test]
    fn test_unmarshal_roundtrip() {
        let mut p = Processor::new();
        p.register::<Chat>();
        p.register::<Move>();

        let decoded = p.unmarshal(br#"{"Move":{"x":3,"y":-1}}"#).unwrap();
        assert_eq!(
            decoded.downcast_ref::<Move>().unwrap(),
            &Move { x: 3, y: -1 }
        );
    }

    #[test]
    fn test_unmarshal_requires_exactly_one_member() {
        let mut p = Processor::new();
        p.register::<Chat>();
        p.register::<Move>();

        let err = p
            .unmarshal(br#"{"Chat":{"text":"a"},"Move":{"x":1,"y":2}}"#)
            .unwrap_err();
        assert!(err.to_string().contains("invalid json data"));

        let err = p.unmarshal(br#"{}"#).unwrap_err();
        assert!(err.to_string().contains("invalid json data"));
    }

    #[test]
    fn test_unknown_message_name() {
        let p = Processor::new();
        let err = p.unmarshal(br#"{"Ghost":{}}"#).unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_is_fatal() {
        let mut p = Processor::new();
        p.register::<Chat>();
        p.register::<Chat>();
    }

    #[test]
    fn test_route_handler_first() {
        let mut p = Processor::new();
        p.register::<Chat>();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let slot = seen.clone();
        p.set_handler::<Chat>(move |args| {
            let chat = args[0].downcast_ref::<Chat>().unwrap();
            slot.lock().unwrap().push(chat.text.clone());
        });

        let msg: Value = Arc::new(Chat {
            text: "routed".to_string(),
        });
        p.route(msg, value(())).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["routed"]);
    }
}
