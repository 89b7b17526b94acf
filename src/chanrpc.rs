//! In-process RPC whose transport is a bounded channel of call descriptors.
//!
//! One task services a [`Server`]; any number of [`Client`]s (and the
//! server itself, via [`ServerHandle::go`]) enqueue calls. The call channel
//! is the single serialization point: I/O tasks dispatch work into a logic
//! task without blocking either side, and one logic task can offload work to
//! another and await a structured reply.
//!
//! Registered functions come in three shapes — no return, one return, many
//! returns — and a client's expected arity is validated against the
//! registered shape before the call is enqueued.
//!
//! # Example
//!
//! ```ignore
//! use volley::chanrpc::{Args, Callback, Function, Server};
//!
//! let mut s = Server::new(10);
//! s.register("add", Function::one_ret(|args: Args| {
//!     let a = args[0].downcast_ref::<i32>().copied().unwrap_or(0);
//!     let b = args[1].downcast_ref::<i32>().copied().unwrap_or(0);
//!     volley::chanrpc::value(a + b)
//! }));
//!
//! let mut c = s.open(10);
//! // elsewhere: while let Some(ci) = s.recv().await { s.exec(ci).await }
//! let sum = c.call1("add", vec![volley::chanrpc::value(3), volley::chanrpc::value(4)]).await?;
//! ```

use std::any::{Any, TypeId};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::debug;

use crate::conf;
use crate::error::{Error, Result};

/// Opaque argument / return value. `Arc` so a single value can travel to a
/// synchronous handler and an RPC router without copying the payload.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Argument vector of a call.
pub type Args = Vec<Value>;

/// Wrap a concrete value for use as an argument or return.
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

/// Identifier a function is registered under: a static name for lifecycle
/// calls, or a message type for protocol routing.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CallId {
    /// Named function, e.g. `"NewAgent"`.
    Name(&'static str),
    /// Message-typed function; the type name rides along for diagnostics.
    Type(TypeId, &'static str),
}

impl CallId {
    /// The call id of a message type.
    pub fn of<T: 'static>() -> Self {
        let name = std::any::type_name::<T>().rsplit("::").next().unwrap_or("?");
        CallId::Type(TypeId::of::<T>(), name)
    }
}

impl From<&'static str> for CallId {
    fn from(name: &'static str) -> Self {
        CallId::Name(name)
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallId::Name(n) => f.write_str(n),
            CallId::Type(_, n) => f.write_str(n),
        }
    }
}

/// Result arity of a registered function or callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// No return value.
    NoRet,
    /// One return value.
    OneRet,
    /// A vector of return values.
    ManyRet,
}

/// A registered function. Executes only on the server's task, so stateful
/// closures are allowed.
pub enum Function {
    /// Takes the argument vector, returns nothing.
    NoRet(Box<dyn FnMut(Args) + Send>),
    /// Takes the argument vector, returns one value.
    OneRet(Box<dyn FnMut(Args) -> Value + Send>),
    /// Takes the argument vector, returns a value vector.
    ManyRet(Box<dyn FnMut(Args) -> Vec<Value> + Send>),
}

impl Function {
    /// Wrap a no-return function.
    pub fn no_ret(f: impl FnMut(Args) + Send + 'static) -> Self {
        Function::NoRet(Box::new(f))
    }

    /// Wrap a one-return function.
    pub fn one_ret(f: impl FnMut(Args) -> Value + Send + 'static) -> Self {
        Function::OneRet(Box::new(f))
    }

    /// Wrap a many-return function.
    pub fn many_ret(f: impl FnMut(Args) -> Vec<Value> + Send + 'static) -> Self {
        Function::ManyRet(Box::new(f))
    }

    fn shape(&self) -> Shape {
        match self {
            Function::NoRet(_) => Shape::NoRet,
            Function::OneRet(_) => Shape::OneRet,
            Function::ManyRet(_) => Shape::ManyRet,
        }
    }
}

/// Completion callback of an asynchronous call. The variant fixes the
/// expected result arity.
pub enum Callback {
    /// Receives only the error outcome.
    NoRet(Box<dyn FnOnce(Result<()>) + Send>),
    /// Receives one value or the error.
    OneRet(Box<dyn FnOnce(Result<Value>) + Send>),
    /// Receives the value vector or the error.
    ManyRet(Box<dyn FnOnce(Result<Vec<Value>>) + Send>),
}

impl Callback {
    /// Wrap an error-only callback.
    pub fn no_ret(cb: impl FnOnce(Result<()>) + Send + 'static) -> Self {
        Callback::NoRet(Box::new(cb))
    }

    /// Wrap a value-or-error callback.
    pub fn one_ret(cb: impl FnOnce(Result<Value>) + Send + 'static) -> Self {
        Callback::OneRet(Box::new(cb))
    }

    /// Wrap a vector-or-error callback.
    pub fn many_ret(cb: impl FnOnce(Result<Vec<Value>>) + Send + 'static) -> Self {
        Callback::ManyRet(Box::new(cb))
    }

    fn shape(&self) -> Shape {
        match self {
            Callback::NoRet(_) => Shape::NoRet,
            Callback::OneRet(_) => Shape::OneRet,
            Callback::ManyRet(_) => Shape::ManyRet,
        }
    }

    fn invoke(self, ret: Ret, err: Option<Error>) {
        match self {
            Callback::NoRet(cb) => cb(match err {
                Some(e) => Err(e),
                None => Ok(()),
            }),
            Callback::OneRet(cb) => cb(match (ret, err) {
                (_, Some(e)) => Err(e),
                (Ret::One(v), None) => Ok(v),
                _ => Err(Error::Protocol("missing return value".to_string())),
            }),
            Callback::ManyRet(cb) => cb(match (ret, err) {
                (_, Some(e)) => Err(e),
                (Ret::Many(vs), None) => Ok(vs),
                _ => Err(Error::Protocol("missing return values".to_string())),
            }),
        }
    }
}

/// Return payload of a completed call.
pub enum Ret {
    /// No value (no-return shape, or an errored call).
    None,
    /// One value.
    One(Value),
    /// A value vector.
    Many(Vec<Value>),
}

/// Call descriptor. Produced by a client, consumed exactly once by the
/// server; crossing the channel transfers ownership of the arguments and
/// the return-channel reference.
pub struct CallInfo {
    id: CallId,
    args: Args,
    chan_ret: Option<mpsc::Sender<RetInfo>>,
    cb: Option<Callback>,
}

/// Return descriptor, delivered to the return channel named in the call.
pub struct RetInfo {
    ret: Ret,
    err: Option<Error>,
    cb: Option<Callback>,
}

/// RPC server: the function registry plus the receiving end of the call
/// channel. Exactly one task pumps [`Server::recv`] / [`Server::exec`].
pub struct Server {
    functions: HashMap<CallId, Function>,
    shapes: Arc<RwLock<HashMap<CallId, Shape>>>,
    tx: mpsc::Sender<CallInfo>,
    rx: mpsc::Receiver<CallInfo>,
}

impl Server {
    /// Create a server with the given call-channel capacity (minimum 1).
    pub fn new(l: usize) -> Self {
        let (tx, rx) = mpsc::channel(l.max(1));
        Self {
            functions: HashMap::new(),
            shapes: Arc::new(RwLock::new(HashMap::new())),
            tx,
            rx,
        }
    }

    /// Register a function under an id. Must complete before any client
    /// invokes a call.
    ///
    /// # Panics
    ///
    /// Re-registration of an id is a fatal programmer error.
    pub fn register(&mut self, id: impl Into<CallId>, f: Function) {
        let id = id.into();
        let mut shapes = self.shapes.write().expect("shape table poisoned");
        if shapes.contains_key(&id) {
            panic!("function id {}: already registered", id);
        }
        shapes.insert(id.clone(), f.shape());
        self.functions.insert(id, f);
    }

    /// A cheap handle for enqueuing calls and opening clients.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.tx.clone(),
            shapes: self.shapes.clone(),
        }
    }

    /// Open a client bound to this server.
    pub fn open(&self, ret_queue_len: usize) -> Client {
        self.handle().open(ret_queue_len)
    }

    /// Fire-and-forget self-invocation; enqueue failures are swallowed.
    pub fn go(&self, id: impl Into<CallId>, args: Args) {
        self.handle().go(id, args);
    }

    /// Dequeue the next call descriptor. Returns `None` once the channel is
    /// closed and drained.
    pub async fn recv(&mut self) -> Option<CallInfo> {
        self.rx.recv().await
    }

    /// Execute one call: dispatch by the registered function's shape,
    /// package the result (a panic becomes the returned error) and forward
    /// it to the descriptor's return channel.
    pub async fn exec(&mut self, ci: CallInfo) {
        let CallInfo {
            id,
            args,
            chan_ret,
            cb,
        } = ci;

        let Some(f) = self.functions.get_mut(&id) else {
            let ri = RetInfo {
                ret: Ret::None,
                err: Some(Error::NotRegistered(id.to_string())),
                cb,
            };
            ret(chan_ret, ri).await;
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match f {
            Function::NoRet(f) => {
                f(args);
                Ret::None
            }
            Function::OneRet(f) => Ret::One(f(args)),
            Function::ManyRet(f) => Ret::Many(f(args)),
        }));

        let ri = match outcome {
            Ok(r) => RetInfo {
                ret: r,
                err: None,
                cb,
            },
            Err(payload) => RetInfo {
                ret: Ret::None,
                err: Some(Error::CallPanic(panic_report(&payload))),
                cb,
            },
        };
        ret(chan_ret, ri).await;
    }

    /// Close the call channel, then drain remaining descriptors, replying
    /// to each with `chanrpc server closed`.
    pub async fn close(&mut self) {
        self.rx.close();
        while let Some(ci) = self.rx.recv().await {
            let ri = RetInfo {
                ret: Ret::None,
                err: Some(Error::ChanRpcClosed),
                cb: ci.cb,
            };
            ret(ci.chan_ret, ri).await;
        }
    }
}

/// Deliver a return descriptor. A return channel whose client is gone is
/// logged and otherwise ignored.
async fn ret(chan_ret: Option<mpsc::Sender<RetInfo>>, ri: RetInfo) {
    let Some(tx) = chan_ret else { return };
    if tx.send(ri).await.is_err() {
        debug!("chanrpc return channel dropped");
    }
}

/// Stringify a panic payload, appending a bounded stack trace when
/// configured.
fn panic_report(payload: &(dyn Any + Send)) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    };

    let len = conf::len_stack_buf();
    if len == 0 {
        return msg;
    }
    let mut trace = Backtrace::force_capture().to_string();
    trace.truncate(len);
    format!("{}: {}", msg, trace)
}

/// Cloneable reference to a server: the sending end of the call channel
/// plus the read-only shape table. Back-reference only; owns nothing of the
/// server's lifetime.
#[derive(Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<CallInfo>,
    shapes: Arc<RwLock<HashMap<CallId, Shape>>>,
}

impl ServerHandle {
    fn shape_of(&self, id: &CallId) -> Option<Shape> {
        self.shapes.read().expect("shape table poisoned").get(id).copied()
    }

    /// Fire-and-forget invocation: enqueue a descriptor with no return
    /// channel. Unknown ids and enqueue failures are swallowed.
    pub fn go(&self, id: impl Into<CallId>, args: Args) {
        let id = id.into();
        if self.shape_of(&id).is_none() {
            return;
        }
        let ci = CallInfo {
            id,
            args,
            chan_ret: None,
            cb: None,
        };
        if let Err(e) = self.tx.try_send(ci) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "channel full",
                mpsc::error::TrySendError::Closed(_) => "server closed",
            };
            debug!("chanrpc go dropped: {}", reason);
        }
    }

    /// Open a client with the given asynchronous return-queue capacity.
    pub fn open(&self, ret_queue_len: usize) -> Client {
        let (sync_tx, chan_sync_ret) = mpsc::channel(1);
        let (asyn_tx, chan_asyn_ret) = mpsc::channel(ret_queue_len.max(1));
        Client {
            server: self.clone(),
            sync_tx,
            chan_sync_ret,
            asyn_tx,
            chan_asyn_ret,
            pending_asyn_call: 0,
        }
    }
}

/// RPC client bound to one server.
///
/// Synchronous calls block on a capacity-1 return channel; asynchronous
/// completions arrive on [`Client::chan_asyn_ret`], which the owning task
/// drains with [`Client::cb`].
pub struct Client {
    server: ServerHandle,
    sync_tx: mpsc::Sender<RetInfo>,
    chan_sync_ret: mpsc::Receiver<RetInfo>,
    asyn_tx: mpsc::Sender<RetInfo>,
    /// Asynchronous return channel; drain with [`Client::cb`].
    pub chan_asyn_ret: mpsc::Receiver<RetInfo>,
    pending_asyn_call: usize,
}

impl Client {
    fn validate(&self, id: &CallId, want: Shape) -> Result<()> {
        match self.server.shape_of(id) {
            None => Err(Error::NotRegistered(id.to_string())),
            Some(shape) if shape != want => Err(Error::RetTypeMismatch(id.to_string())),
            Some(_) => Ok(()),
        }
    }

    async fn enqueue(&self, ci: CallInfo) -> Result<()> {
        self.server
            .tx
            .send(ci)
            .await
            .map_err(|_| Error::ChanRpcClosed)
    }

    async fn sync_reply(&mut self) -> Result<RetInfo> {
        self.chan_sync_ret.recv().await.ok_or(Error::ChanRpcClosed)
    }

    /// Call a no-return function and wait for completion.
    pub async fn call0(&mut self, id: impl Into<CallId>, args: Args) -> Result<()> {
        let id = id.into();
        self.validate(&id, Shape::NoRet)?;
        self.enqueue(CallInfo {
            id,
            args,
            chan_ret: Some(self.sync_tx.clone()),
            cb: None,
        })
        .await?;

        let ri = self.sync_reply().await?;
        match ri.err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Call a one-return function and wait for its value.
    pub async fn call1(&mut self, id: impl Into<CallId>, args: Args) -> Result<Value> {
        let id = id.into();
        self.validate(&id, Shape::OneRet)?;
        self.enqueue(CallInfo {
            id,
            args,
            chan_ret: Some(self.sync_tx.clone()),
            cb: None,
        })
        .await?;

        let ri = self.sync_reply().await?;
        if let Some(e) = ri.err {
            return Err(e);
        }
        match ri.ret {
            Ret::One(v) => Ok(v),
            _ => Err(Error::Protocol("missing return value".to_string())),
        }
    }

    /// Call a many-return function and wait for its values.
    pub async fn call_n(&mut self, id: impl Into<CallId>, args: Args) -> Result<Vec<Value>> {
        let id = id.into();
        self.validate(&id, Shape::ManyRet)?;
        self.enqueue(CallInfo {
            id,
            args,
            chan_ret: Some(self.sync_tx.clone()),
            cb: None,
        })
        .await?;

        let ri = self.sync_reply().await?;
        if let Some(e) = ri.err {
            return Err(e);
        }
        match ri.ret {
            Ret::Many(vs) => Ok(vs),
            _ => Err(Error::Protocol("missing return values".to_string())),
        }
    }

    /// Start an asynchronous call. The callback's variant fixes the
    /// expected result arity; on any failure to enqueue (full channel,
    /// closed server, shape mismatch, unknown id) the callback fires
    /// immediately with the error and the pending counter is not touched.
    pub fn asyn_call(&mut self, id: impl Into<CallId>, args: Args, cb: Callback) {
        let id = id.into();
        if let Err(e) = self.validate(&id, cb.shape()) {
            cb.invoke(Ret::None, Some(e));
            return;
        }

        let ci = CallInfo {
            id,
            args,
            chan_ret: Some(self.asyn_tx.clone()),
            cb: Some(cb),
        };
        match self.server.tx.try_send(ci) {
            Ok(()) => self.pending_asyn_call += 1,
            Err(e) => {
                let (err, ci) = match e {
                    mpsc::error::TrySendError::Full(ci) => (Error::ChanRpcFull, ci),
                    mpsc::error::TrySendError::Closed(ci) => (Error::ChanRpcClosed, ci),
                };
                if let Some(cb) = ci.cb {
                    cb.invoke(Ret::None, Some(err));
                }
            }
        }
    }

    /// Run the callback bound to a completed asynchronous call and
    /// decrement the pending counter.
    pub fn cb(&mut self, ri: RetInfo) {
        if let Some(cb) = ri.cb {
            cb.invoke(ri.ret, ri.err);
        }
        self.pending_asyn_call = self.pending_asyn_call.saturating_sub(1);
    }

    /// Outstanding asynchronous calls.
    pub fn pending_asyn_call(&self) -> usize {
        self.pending_asyn_call
    }

    /// Drain outstanding asynchronous callbacks until none are pending.
    pub async fn close(&mut self) {
        while self.pending_asyn_call > 0 {
            let next = self.chan_asyn_ret.recv().await;
            match next {
                Some(ri) => self.cb(ri),
                None => break,
            }
        }
    }
}
