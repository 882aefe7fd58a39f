//! Concurrent JSON-RPC client engine.
//!
//! A [`Client`] multiplexes any number of in-flight calls over one
//! connection. Each call gets the next sequence id, is registered in the
//! pending table, and is written through the codec. A single background read
//! loop decodes responses, looks the id up, fills the caller's reply target
//! and delivers the finished [`Call`] on its completion channel.
//!
//! # Lifecycle
//!
//! ```text
//!   Active ──close()──► Closing
//!     │                    │
//!     └──read loop exits───┴──► Shutdown (terminal)
//! ```
//!
//! Once the read loop exits, every call still pending is completed with a
//! shutdown error and every later call fails fast.

use std::collections::HashMap;
#[cfg(unix)]
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, warn};

use crate::codec::{ClientCodec, CodecError, JsonCodec};
use crate::config::ClientConfig;
use crate::proto::{MethodCall, Notifications, Reply, ReplyTarget, Request, Response, RpcError};

/// Client API errors.
///
/// Per-call failures are [`RpcError`] values; this type wraps them for the
/// convenience APIs and adds the failures that happen outside any call.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failed to connect the transport.
    #[error("Connection failed: {0}")]
    Connect(#[source] std::io::Error),

    /// Request timed out waiting for response.
    #[error("Request timed out after {0}s")]
    Timeout(u64),

    /// The call itself failed (shutdown, invalid response, parse failure).
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Server returned an error payload.
    #[error("Server error {code}: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// `close()` was already called.
    #[error("client is shut down")]
    Shutdown,

    /// A completion channel needs room for at least one call.
    #[error("completion channel must have capacity for at least one call")]
    UnbufferedCompletion,
}

impl ClientError {
    /// Interpret a server `error` payload.
    ///
    /// Accepts the JSON-RPC 2.0 `{code, message, data}` object and the bare
    /// string used by JSON-RPC 1.0 servers.
    pub fn from_server_error(payload: Value) -> Self {
        match payload {
            Value::String(message) => ClientError::Server {
                code: 0,
                message,
                data: None,
            },
            Value::Object(mut map) => {
                let code = map.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = match map.remove("message") {
                    Some(Value::String(message)) => message,
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                let data = map.remove("data");
                ClientError::Server {
                    code,
                    message,
                    data,
                }
            }
            other => ClientError::Server {
                code: 0,
                message: other.to_string(),
                data: None,
            },
        }
    }
}

// =============================================================================
// Call Future
// =============================================================================

/// One remote invocation and, once delivered, its outcome.
///
/// A call is delivered exactly once on its [`Completion`] channel: after the
/// send fails, after its response arrives, or when the connection shuts
/// down.
pub struct Call<Q, T> {
    request: Arc<Q>,
    reply: T,
    error: Option<RpcError>,
    done: Completion<Q, T>,
}

impl<Q, T> Call<Q, T> {
    pub fn request(&self) -> &Q {
        &self.request
    }

    pub fn reply(&self) -> &T {
        &self.reply
    }

    pub fn reply_mut(&mut self) -> &mut T {
        &mut self.reply
    }

    pub fn error(&self) -> Option<&RpcError> {
        self.error.as_ref()
    }

    /// The reply on success, the call's error otherwise.
    pub fn into_result(self) -> Result<T, RpcError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.reply),
        }
    }

    pub fn into_parts(self) -> (Arc<Q>, T, Option<RpcError>) {
        (self.request, self.reply, self.error)
    }
}

impl<Q: Request, T: ReplyTarget> Call<Q, T> {
    /// Record the outcome and deliver without blocking.
    ///
    /// A full or closed completion channel drops the call.
    fn complete(mut self, error: Option<RpcError>) {
        self.error = error;
        let done = self.done.tx.clone();
        match done.try_send(self) {
            Ok(()) => {}
            Err(TrySendError::Full(call)) => warn!(
                seq = call.request.seq(),
                method = call.request.method(),
                "Discarding call reply due to insufficient completion capacity"
            ),
            Err(TrySendError::Closed(call)) => debug!(
                seq = call.request.seq(),
                "Completion receiver dropped, discarding call reply"
            ),
        }
    }
}

impl<Q: Request, T> std::fmt::Debug for Call<Q, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call")
            .field("seq", &self.request.seq())
            .field("method", &self.request.method())
            .field("error", &self.error)
            .finish()
    }
}

/// Sending side of a completion channel.
///
/// Several calls may share one completion; it must have capacity for every
/// call that can be outstanding on it at once, or deliveries are dropped.
pub struct Completion<Q, T> {
    tx: mpsc::Sender<Call<Q, T>>,
}

impl<Q, T> Clone for Completion<Q, T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Create a completion channel with room for `capacity` finished calls.
///
/// # Errors
///
/// Returns `ClientError::UnbufferedCompletion` for a capacity of zero: an
/// unbuffered channel would silently lose every delivery.
pub fn completion<Q, T>(
    capacity: usize,
) -> Result<(Completion<Q, T>, mpsc::Receiver<Call<Q, T>>), ClientError> {
    if capacity == 0 {
        return Err(ClientError::UnbufferedCompletion);
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((Completion { tx }, rx))
}

/// Type-erased view of a [`Call`] held by the pending table.
trait PendingCall: Send {
    fn target(&mut self) -> &mut dyn ReplyTarget;
    fn finish(self: Box<Self>, error: Option<RpcError>);
}

impl<Q: Request, T: ReplyTarget> PendingCall for Call<Q, T> {
    fn target(&mut self) -> &mut dyn ReplyTarget {
        &mut self.reply
    }

    fn finish(self: Box<Self>, error: Option<RpcError>) {
        (*self).complete(error);
    }
}

// =============================================================================
// Client Engine
// =============================================================================

/// Sequence counter, pending table and shutdown flags, guarded as one unit.
struct ClientState {
    seq: u64,
    pending: HashMap<u64, Box<dyn PendingCall>>,
    /// The user called `close()`.
    closing: bool,
    /// The read loop has exited.
    shutdown: bool,
}

struct Inner<C> {
    codec: C,
    state: Mutex<ClientState>,
    notifications: Notifications,
    config: ClientConfig,
}

/// JSON-RPC client over one connection.
///
/// Cheap to clone; all clones share the connection. The client may be used
/// from many tasks at once.
///
/// # Example
///
/// ```ignore
/// use linerpc::{Client, MethodCall, Notifications, Reply};
///
/// let client = Client::dial("127.0.0.1:9999", Notifications::none(), Default::default()).await?;
/// let reply: Reply<CalcReply> = client
///     .call(MethodCall::new("Calc.Compute", vec![args]), Reply::new())
///     .await?;
/// ```
pub struct Client<C: ClientCodec = JsonCodec> {
    inner: Arc<Inner<C>>,
}

impl<C: ClientCodec> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Client<JsonCodec> {
    /// Connect over TCP and start the client.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connect` if the connection cannot be established.
    pub async fn dial<A: ToSocketAddrs>(
        addr: A,
        notifications: Notifications,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(ClientError::Connect)?;
        let codec = JsonCodec::with_config(stream, &config);
        Ok(Self::with_config(codec, notifications, config))
    }

    /// Connect over a Unix domain socket and start the client.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Connect` if:
    /// - The socket file does not exist
    /// - Connection is refused (server not running)
    /// - Permission denied
    #[cfg(unix)]
    pub async fn dial_unix(
        socket_path: &Path,
        notifications: Notifications,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        let stream = tokio::net::UnixStream::connect(socket_path)
            .await
            .map_err(ClientError::Connect)?;
        let codec = JsonCodec::with_config(stream, &config);
        Ok(Self::with_config(codec, notifications, config))
    }
}

impl<C: ClientCodec> Client<C> {
    /// Start a client over `codec` with default configuration.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the read loop is spawned
    /// immediately.
    pub fn new(codec: C, notifications: Notifications) -> Self {
        Self::with_config(codec, notifications, ClientConfig::default())
    }

    /// Start a client over `codec`.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_config(codec: C, notifications: Notifications, config: ClientConfig) -> Self {
        let inner = Arc::new(Inner {
            codec,
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            notifications,
            config,
        });
        tokio::spawn(Arc::clone(&inner).input());
        Self { inner }
    }

    /// Invoke a call and wait for it to finish.
    ///
    /// Returns the filled reply target, or the call's error.
    pub async fn call<Q, T>(&self, request: Q, reply: T) -> Result<T, RpcError>
    where
        Q: Request,
        T: ReplyTarget,
    {
        let (tx, mut rx) = mpsc::channel(1);
        self.go(request, reply, &Completion { tx }).await;

        match rx.recv().await {
            Some(call) => call.into_result(),
            None => Err(RpcError::shutdown("call abandoned")),
        }
    }

    /// Invoke a call without waiting for it.
    ///
    /// The finished [`Call`] is delivered on `done`. Returns the assigned
    /// sequence id once the request is written; `None` means the call was
    /// already delivered with a shutdown error (client closed or the write
    /// failed).
    pub async fn go<Q, T>(&self, mut request: Q, reply: T, done: &Completion<Q, T>) -> Option<u64>
    where
        Q: Request,
        T: ReplyTarget,
    {
        let (seq, request) = {
            let mut state = self.inner.lock_state();
            if state.closing || state.shutdown {
                drop(state);
                debug!(method = request.method(), "Rejecting call on shut down client");
                let call = Call {
                    request: Arc::new(request),
                    reply,
                    error: None,
                    done: done.clone(),
                };
                call.complete(Some(RpcError::shutdown("client shutdown")));
                return None;
            }

            let seq = state.seq;
            state.seq += 1;
            request.set_seq(seq);

            let request = Arc::new(request);
            let call = Call {
                request: Arc::clone(&request),
                reply,
                error: None,
                done: done.clone(),
            };
            state.pending.insert(seq, Box::new(call));
            (seq, request)
        };

        debug!(seq, method = request.method(), "Sending call");
        if let Err(err) = self.inner.codec.write_request(&*request).await {
            self.inner.codec.forget(seq);
            let call = self.inner.lock_state().pending.remove(&seq);
            if let Some(call) = call {
                warn!(seq, error = %err, "Failed to write call");
                call.finish(Some(RpcError::shutdown(err.to_string())));
            }
            return None;
        }

        // The read loop may have drained this call before the codec recorded
        // its method; that entry would never be reclaimed.
        if self.inner.lock_state().shutdown {
            self.inner.codec.forget(seq);
        }
        Some(seq)
    }

    /// Invoke a call on a fresh completion channel and return its receiver.
    ///
    /// The channel has `default_completion_capacity` slots.
    pub async fn go_detached<Q, T>(&self, request: Q, reply: T) -> mpsc::Receiver<Call<Q, T>>
    where
        Q: Request,
        T: ReplyTarget,
    {
        let capacity = self.inner.config.default_completion_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        self.go(request, reply, &Completion { tx }).await;
        rx
    }

    /// Send a JSON-RPC request and wait for its typed result.
    ///
    /// This method:
    /// 1. Builds a [`MethodCall`] with the next sequence id
    /// 2. Sends it and waits for the response (with the configured timeout)
    /// 3. Maps a server `error` payload to `ClientError::Server`
    /// 4. Decodes `result` into `R`
    ///
    /// A timed-out call stays in the pending table until the connection shuts
    /// down; a late response is then discarded.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let jobs: Vec<JobStatus> = client.request("jobs.list", json!({"limit": 100})).await?;
    /// ```
    pub async fn request<P, R>(&self, method: &str, params: P) -> Result<R, ClientError>
    where
        P: Serialize + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let request = MethodCall::new(method, params);
        let reply: Reply<R, Value, Value> = Reply::new().with_error();
        let timeout = self.inner.config.request_timeout();

        let mut reply = match tokio::time::timeout(timeout, self.call(request, reply)).await {
            Ok(result) => result?,
            Err(_) => return Err(ClientError::Timeout(timeout.as_secs())),
        };

        if let Some(error) = reply.error.take() {
            return Err(ClientError::from_server_error(error));
        }
        reply.result.take().ok_or_else(|| {
            ClientError::Rpc(RpcError::invalid_response(
                "Response missing both result and error",
            ))
        })
    }

    /// Close the connection.
    ///
    /// Pending calls are drained by the read loop once it observes the
    /// closed transport.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Shutdown` if the client was already closed.
    pub async fn close(&self) -> Result<(), ClientError> {
        {
            let mut state = self.inner.lock_state();
            if state.closing {
                return Err(ClientError::Shutdown);
            }
            state.closing = true;
        }
        debug!("Closing client");
        self.inner.codec.close().await?;
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.inner.lock_state().closing
    }

    /// Whether the read loop has exited.
    pub fn is_shutdown(&self) -> bool {
        self.inner.lock_state().shutdown
    }

    /// Number of calls waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn codec(&self) -> &C {
        &self.inner.codec
    }
}

impl<C: ClientCodec> Inner<C> {
    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The read loop. Runs until the codec reports a hard error.
    async fn input(self: Arc<Self>) {
        let err = loop {
            let header = match self.codec.read_response_header().await {
                Ok(header) => header,
                Err(err) => break err,
            };

            if header.is_notification() {
                self.dispatch_notification(header).await;
                continue;
            }

            let call = self.lock_state().pending.remove(&header.id);
            match call {
                None => {
                    warn!(id = header.id, "Received response for unknown call");
                    self.report(RpcError::invalid_response(format!(
                        "orphan response for id {}",
                        header.id
                    )))
                    .await;
                }
                Some(mut call) => {
                    let error = match header.check_error.clone() {
                        Some(check) => Some(check),
                        None => self
                            .codec
                            .read_response_body(&header, Some(call.target()))
                            .err(),
                    };
                    debug!(id = header.id, method = %header.method, failed = error.is_some(), "Call finished");
                    call.finish(error);
                }
            }
        };

        let closing = self.terminate(&err);
        if !closing {
            error!(error = %err, "Read loop terminated");
            self.report(RpcError::invalid_response(err.to_string())).await;
        }
    }

    async fn dispatch_notification(&self, mut header: Response) {
        if let Some(check) = header.check_error.take() {
            warn!(error = %check, "Invalid notification frame");
            self.report(check).await;
            return;
        }

        match &self.notifications.messages {
            Some(messages) => {
                if messages.send(header).await.is_err() {
                    debug!("Notification receiver dropped");
                }
            }
            None => debug!(method = %header.method, "Dropping notification, no sink configured"),
        }
    }

    async fn report(&self, error: RpcError) {
        if let Some(errors) = &self.notifications.errors {
            if errors.send(error).await.is_err() {
                debug!("Error receiver dropped");
            }
        }
    }

    /// Mark the client shut down and fail every pending call.
    ///
    /// Returns whether the user had asked to close.
    fn terminate(&self, err: &CodecError) -> bool {
        let mut state = self.lock_state();
        state.shutdown = true;
        let closing = state.closing;

        let reason = match err {
            CodecError::Eof | CodecError::Closed if closing => "connection is shut down".to_string(),
            CodecError::Eof | CodecError::UnexpectedEof => "unexpected EOF".to_string(),
            CodecError::Closed => "connection is shut down".to_string(),
            other => other.to_string(),
        };

        let pending = std::mem::take(&mut state.pending);
        debug!(pending = pending.len(), reason = %reason, "Terminating pending calls");
        for (seq, call) in pending {
            self.codec.forget(seq);
            call.finish(Some(RpcError::shutdown(reason.clone())));
        }
        closing
    }
}
