//! Binary message codec: protobuf payloads behind a compact id.
//!
//! ```text
//! ┌──────────────┬──────────────────┐
//! │ id           │ protobuf message │
//! │ u16, BE/LE   │ prost-encoded    │
//! └──────────────┴──────────────────┘
//! ```
//!
//! Ids are assigned in registration order, so both peers must register the
//! same message types in the same order. The registry is built at startup
//! and read-only afterwards; instead of runtime reflection it keeps
//! per-type encode/decode closures keyed by `TypeId`.

use std::any::TypeId;
use std::collections::HashMap;

use bytes::Bytes;
use prost::Message;

use super::processor::Processor as ProcessorTrait;
use crate::chanrpc::{Args, CallId, ServerHandle, Value};
use crate::error::{Error, Result};

/// Synchronous message handler, invoked with `[msg, user_data]`.
pub type MsgHandler = Box<dyn Fn(Args) + Send + Sync>;

struct MsgInfo {
    type_name: &'static str,
    call_id: CallId,
    decode: Box<dyn Fn(&[u8]) -> Result<Value> + Send + Sync>,
    encode: Box<dyn Fn(&Value) -> Result<Bytes> + Send + Sync>,
    msg_router: Option<ServerHandle>,
    msg_handler: Option<MsgHandler>,
}

/// The protobuf processor.
pub struct Processor {
    little_endian: bool,
    msg_info: Vec<MsgInfo>,
    msg_id: HashMap<TypeId, u16>,
}

impl Processor {
    /// Empty registry, big-endian ids.
    pub fn new() -> Self {
        Self {
            little_endian: false,
            msg_info: Vec::new(),
            msg_id: HashMap::new(),
        }
    }

    /// Set the id byte order.
    pub fn set_byte_order(&mut self, little_endian: bool) {
        self.little_endian = little_endian;
    }

    /// Register a message type; its id is the registration index.
    ///
    /// # Panics
    ///
    /// Re-registration and overflowing the u16 id space are fatal
    /// programmer errors.
    pub fn register<M>(&mut self) -> u16
    where
        M: Message + Default + 'static,
    {
        let type_id = TypeId::of::<M>();
        let type_name = short_name::<M>();
        if self.msg_id.contains_key(&type_id) {
            panic!("message {} is already registered", type_name);
        }
        if self.msg_info.len() >= u16::MAX as usize {
            panic!("too many protobuf messages (max = {})", u16::MAX);
        }

        self.msg_info.push(MsgInfo {
            type_name,
            call_id: CallId::of::<M>(),
            decode: Box::new(|data| {
                let msg = M::decode(data)?;
                Ok(std::sync::Arc::new(msg) as Value)
            }),
            encode: Box::new(|msg| {
                let m = msg
                    .downcast_ref::<M>()
                    .ok_or_else(|| Error::Protocol("message type mismatch".to_string()))?;
                Ok(Bytes::from(m.encode_to_vec()))
            }),
            msg_router: None,
            msg_handler: None,
        });
        let id = (self.msg_info.len() - 1) as u16;
        self.msg_id.insert(type_id, id);
        id
    }

    /// Route a message type to a channel-RPC server; the call id is the
    /// message type itself.
    ///
    /// # Panics
    ///
    /// The message must already be registered.
    pub fn set_router<M: 'static>(&mut self, router: ServerHandle) {
        let info = self.info_mut::<M>();
        info.msg_router = Some(router);
    }

    /// Attach a synchronous handler to a message type.
    ///
    /// # Panics
    ///
    /// The message must already be registered.
    pub fn set_handler<M: 'static>(&mut self, handler: impl Fn(Args) + Send + Sync + 'static) {
        let info = self.info_mut::<M>();
        info.msg_handler = Some(Box::new(handler));
    }

    fn info_mut<M: 'static>(&mut self) -> &mut MsgInfo {
        let type_name = short_name::<M>();
        let Some(&id) = self.msg_id.get(&TypeId::of::<M>()) else {
            panic!("message {} not registered", type_name);
        };
        &mut self.msg_info[id as usize]
    }

    /// Visit every registered message as `(id, type name)`.
    pub fn range(&self, mut f: impl FnMut(u16, &'static str)) {
        for (id, info) in self.msg_info.iter().enumerate() {
            f(id as u16, info.type_name);
        }
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
        let Some(&id) = self.msg_id.get(&type_id) else {
            return Err(Error::Protocol("message not registered".to_string()));
        };
        let info = &self.msg_info[id as usize];

        if let Some(handler) = &info.msg_handler {
            handler(vec![msg.clone(), user_data.clone()]);
        }
        if let Some(router) = &info.msg_router {
            router.go(info.call_id.clone(), vec![msg, user_data]);
        }
        Ok(())
    }

    fn unmarshal(&self, data: &[u8]) -> Result<Value> {
        if data.len() < 2 {
            return Err(Error::Protocol("protobuf data too short".to_string()));
        }

        let id = if self.little_endian {
            u16::from_le_bytes([data[0], data[1]])
        } else {
            u16::from_be_bytes([data[0], data[1]])
        };
        let Some(info) = self.msg_info.get(id as usize) else {
            return Err(Error::Protocol(format!("message id {} not registered", id)));
        };
        (info.decode)(&data[2..])
    }

    fn marshal(&self, msg: &Value) -> Result<Vec<Bytes>> {
        let type_id = msg.as_ref().type_id();
        let Some(&id) = self.msg_id.get(&type_id) else {
            return Err(Error::Protocol("message not registered".to_string()));
        };

        let id_bytes = if self.little_endian {
            id.to_le_bytes()
        } else {
            id.to_be_bytes()
        };
        let payload = (self.msg_info[id as usize].encode)(msg)?;
        Ok(vec![Bytes::copy_from_slice(&id_bytes), payload])
    }
}

fn short_name<M>() -> &'static str {
    std::any::type_name::<M>().rsplit("::").next().unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chanrpc::{value, Function, Server};
    use std::sync::Arc;

    #[derive(Clone, PartialEq, Message)]
    struct Hello {
        #[prost(string, tag = "1")]
        name: String,
    }

    #[derive(Clone, PartialEq, Message)]
    struct Score {
        #[prost(uint32, tag = "1")]
        points: u32,
    }

    #[test]
    fn test_ids_assigned_in_registration_order() {
        let mut p = Processor::new();
        assert_eq!(p.register::<Hello>(), 0);
        assert_eq!(p.register::<Score>(), 1);

        let mut seen = Vec::new();
        p.range(|id, name| seen.push((id, name)));
        assert_eq!(seen, vec![(0, "Hello"), (1, "Score")]);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_duplicate_registration_is_fatal() {
        let mut p = Processor::new();
        p.register::<Hello>();
        p.register::<Hello>();
    }

    #[test]
    fn test_marshal_unmarshal_roundtrip() {
        let mut p = Processor::new();
        p.register::<Hello>();
        p.register::<Score>();

        let msg: Value = Arc::new(Score { points: 99 });
        let chunks = p.marshal(&msg).unwrap();
        assert_eq!(&chunks[0][..], &[0x00, 0x01]);

        let wire = [chunks[0].as_ref(), chunks[1].as_ref()].concat();
        let decoded = p.unmarshal(&wire).unwrap();
        assert_eq!(decoded.downcast_ref::<Score>().unwrap().points, 99);
    }

    #[test]
    fn test_little_endian_id() {
        let mut p = Processor::new();
        p.set_byte_order(true);
        p.register::<Hello>();
        p.register::<Score>();

        let msg: Value = Arc::new(Score { points: 1 });
        let chunks = p.marshal(&msg).unwrap();
        assert_eq!(&chunks[0][..], &[0x01, 0x00]);
    }

    #[test]
    fn test_unmarshal_rejects_bad_input() {
        let mut p = Processor::new();
        p.register::<Hello>();

        assert!(p.unmarshal(&[0x00]).unwrap_err().to_string().contains("too short"));
        assert!(p
            .unmarshal(&[0x00, 0x07])
            .unwrap_err()
            .to_string()
            .contains("not registered"));
    }

    #[test]
    fn test_marshal_unregistered_fails() {
        let p = Processor::new();
        let msg: Value = Arc::new(Hello::default());
        assert!(p.marshal(&msg).is_err());
    }

    #[test]
    fn test_route_handler_and_router() {
        let mut p = Processor::new();
        p.register::<Hello>();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let slot = seen.clone();
        p.set_handler::<Hello>(move |args| {
            let hello = args[0].downcast_ref::<Hello>().unwrap();
            slot.lock().unwrap().push(hello.name.clone());
        });

        let mut server = Server::new(10);
        server.register(CallId::of::<Hello>(), Function::no_ret(|_| {}));
        p.set_router::<Hello>(server.handle());

        let msg: Value = Arc::new(Hello {
            name: "bob".to_string(),
        });
        p.route(msg, value(())).unwrap();

        // Handler ran synchronously; the router enqueued a call.
        assert_eq!(seen.lock().unwrap().as_slice(), ["bob"]);
    }

    #[test]
    fn test_route_unregistered_is_error() {
        let p = Processor::new();
        let msg: Value = Arc::new(Hello::default());
        assert!(p.route(msg, value(())).is_err());
    }
}
