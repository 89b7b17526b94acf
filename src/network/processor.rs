//! The message-processor contract: decode wire bytes into typed messages,
//! encode them back, and route decoded messages to their handlers.

use bytes::Bytes;

use crate::chanrpc::Value;
use crate::error::Result;

/// A type registry plus codec plus dispatch.
///
/// `unmarshal` and `marshal` translate between wire bytes and registered
/// message values; `route` delivers a decoded message either to its
/// synchronous handler, to its channel-RPC router, or both (handler first).
pub trait Processor: Send + Sync {
    /// Dispatch a decoded message. Routing an unregistered message is an
    /// error.
    fn route(&self, msg: Value, user_data: Value) -> Result<()>;

    /// Decode one wire message.
    fn unmarshal(&self, data: &[u8]) -> Result<Value>;

    /// Encode a message into wire chunks; the connection frames their
    /// concatenation.
    fn marshal(&self, msg: &Value) -> Result<Vec<Bytes>>;
}
