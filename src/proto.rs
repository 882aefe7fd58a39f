//! Protocol contract shared by the codec and the client engine.
//!
//! Everything in here is plain data or a small capability trait:
//!
//! - [`RpcError`] - the `(code, message)` error value carried by calls
//! - [`Request`] - what the engine needs from an outgoing request
//! - [`Response`] - a decoded response header with lazily decoded payloads
//! - [`ReplyTarget`] / [`Reply`] - where a caller wants payloads decoded to
//! - [`Notifications`] - optional sinks for server pushes and async errors

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;

/// Malformed frame, orphan id, or a failed header validity check.
pub const INVALID_RESPONSE: i64 = -42700;
/// The client is closing or closed, or the connection died.
pub const SHUTDOWN: i64 = -42701;
/// A payload could not be decoded into the caller's requested type.
pub const RESPONSE_PARSE_FAILED: i64 = -42702;

// =============================================================================
// Error Value
// =============================================================================

/// Error value delivered to calls and to the diagnostic sink.
///
/// This is data, not a control-flow exception: the engine stores it in the
/// affected [`Call`](crate::client::Call) or pushes it on the error sink.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    /// One of [`INVALID_RESPONSE`], [`SHUTDOWN`] or [`RESPONSE_PARSE_FAILED`].
    pub code: i64,
    /// Human readable detail.
    pub message: String,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(INVALID_RESPONSE, message)
    }

    pub fn shutdown(message: impl Into<String>) -> Self {
        Self::new(SHUTDOWN, message)
    }

    pub fn parse_failed(message: impl Into<String>) -> Self {
        Self::new(RESPONSE_PARSE_FAILED, message)
    }

    pub fn is_invalid_response(&self) -> bool {
        self.code == INVALID_RESPONSE
    }

    pub fn is_shutdown(&self) -> bool {
        self.code == SHUTDOWN
    }

    pub fn is_parse_failure(&self) -> bool {
        self.code == RESPONSE_PARSE_FAILED
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Capability set the engine needs from an outgoing request.
///
/// The serialized form must carry an integer `id` (the value last given to
/// [`set_seq`](Request::set_seq)), a string `method` and a `params`
/// array or object. [`MethodCall`] is a ready-made implementation.
pub trait Request: Serialize + Send + Sync + 'static {
    /// Store the sequence id assigned by the client.
    fn set_seq(&mut self, seq: u64);

    /// The sequence id, `0` until the client assigns one.
    fn seq(&self) -> u64;

    /// Remote method name, e.g. `"Calc.Compute"`.
    fn method(&self) -> &str;
}

/// A generic `{"id", "method", "params"}` request.
///
/// # Example
///
/// ```ignore
/// let request = MethodCall::new("mining.subscribe", serde_json::json!([]));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCall<P = Value> {
    pub id: u64,
    pub method: String,
    pub params: P,
}

impl<P> MethodCall<P> {
    pub fn new(method: impl Into<String>, params: P) -> Self {
        Self {
            id: 0,
            method: method.into(),
            params,
        }
    }
}

impl<P> Request for MethodCall<P>
where
    P: Serialize + Send + Sync + 'static,
{
    fn set_seq(&mut self, seq: u64) {
        self.id = seq;
    }

    fn seq(&self) -> u64 {
        self.id
    }

    fn method(&self) -> &str {
        &self.method
    }
}

// =============================================================================
// Response Header
// =============================================================================

/// A decoded response header.
///
/// Payloads stay as untyped JSON until a caller asks for them through a
/// [`ReplyTarget`]. `raw` keeps the whole frame for diagnostics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    /// Correlation id; `0` marks a server notification.
    pub id: u64,
    /// Method name. Sent by the server on notifications, resolved from the
    /// codec's side table for responses.
    pub method: String,
    pub error: Option<Value>,
    pub params: Option<Value>,
    pub result: Option<Value>,
    pub raw: Map<String, Value>,
    /// Soft validity failure; the header is still usable for diagnostics.
    pub check_error: Option<RpcError>,
}

impl Response {
    pub fn is_notification(&self) -> bool {
        self.id == 0
    }

    /// Decode the `params` payload, if present.
    ///
    /// Mostly useful for notifications, which are delivered as raw headers.
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.params
            .as_ref()
            .map(|params| T::deserialize(params))
            .transpose()
    }
}

// =============================================================================
// Reply Targets
// =============================================================================

/// One of the three decodable payloads of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Result,
    Params,
    Error,
}

impl Field {
    pub fn name(self) -> &'static str {
        match self {
            Field::Result => "result",
            Field::Params => "params",
            Field::Error => "error",
        }
    }
}

/// Destination for the payloads of one response.
///
/// The codec only decodes the fields a target [`wants`](ReplyTarget::wants);
/// everything else is discarded.
pub trait ReplyTarget: Send + 'static {
    fn wants(&self, field: Field) -> bool;

    /// Decode `payload` into the destination for `field`.
    fn fill(&mut self, field: Field, payload: &Value) -> Result<(), serde_json::Error>;

    /// Called for a wanted field that is absent from the response.
    fn clear(&mut self, _field: Field) {}

    /// Receives the header the payloads came from.
    fn attach(&mut self, _header: Response) {}
}

/// Wants nothing; every payload is discarded.
impl ReplyTarget for () {
    fn wants(&self, _field: Field) -> bool {
        false
    }

    fn fill(&mut self, _field: Field, _payload: &Value) -> Result<(), serde_json::Error> {
        Ok(())
    }
}

/// A typed destination that is either requested or skipped.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot<T> {
    wanted: bool,
    value: Option<T>,
}

impl<T> Slot<T> {
    pub fn wanted() -> Self {
        Self {
            wanted: true,
            value: None,
        }
    }

    pub fn skip() -> Self {
        Self {
            wanted: false,
            value: None,
        }
    }

    pub fn is_wanted(&self) -> bool {
        self.wanted
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn take(&mut self) -> Option<T> {
        self.value.take()
    }

    pub fn into_inner(self) -> Option<T> {
        self.value
    }

    fn set(&mut self, value: Option<T>) {
        self.value = value;
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self::skip()
    }
}

/// Standard [`ReplyTarget`] with one [`Slot`] per payload.
///
/// `Reply::new()` wants only the result; opt into more with
/// [`with_params`](Reply::with_params) and [`with_error`](Reply::with_error).
///
/// # Example
///
/// ```ignore
/// let reply: Reply<CalcReply> = Reply::new().with_error();
/// let reply = client.call(request, reply).await?;
/// let data = reply.result.get().map(|r| r.data);
/// ```
#[derive(Debug)]
pub struct Reply<R = Value, P = Value, E = Value> {
    pub result: Slot<R>,
    pub params: Slot<P>,
    pub error: Slot<E>,
    /// Header of the response that filled this reply.
    pub header: Option<Response>,
}

impl<R, P, E> Reply<R, P, E> {
    pub fn new() -> Self {
        Self {
            result: Slot::wanted(),
            params: Slot::skip(),
            error: Slot::skip(),
            header: None,
        }
    }

    pub fn with_params(mut self) -> Self {
        self.params = Slot::wanted();
        self
    }

    pub fn with_error(mut self) -> Self {
        self.error = Slot::wanted();
        self
    }
}

impl<R, P, E> Default for Reply<R, P, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, P, E> ReplyTarget for Reply<R, P, E>
where
    R: DeserializeOwned + Send + 'static,
    P: DeserializeOwned + Send + 'static,
    E: DeserializeOwned + Send + 'static,
{
    fn wants(&self, field: Field) -> bool {
        match field {
            Field::Result => self.result.is_wanted(),
            Field::Params => self.params.is_wanted(),
            Field::Error => self.error.is_wanted(),
        }
    }

    fn fill(&mut self, field: Field, payload: &Value) -> Result<(), serde_json::Error> {
        match field {
            Field::Result => self.result.set(Some(R::deserialize(payload)?)),
            Field::Params => self.params.set(Some(P::deserialize(payload)?)),
            Field::Error => self.error.set(Some(E::deserialize(payload)?)),
        }
        Ok(())
    }

    fn clear(&mut self, field: Field) {
        match field {
            Field::Result => self.result.set(None),
            Field::Params => self.params.set(None),
            Field::Error => self.error.set(None),
        }
    }

    fn attach(&mut self, header: Response) {
        self.header = Some(header);
    }
}

// =============================================================================
// Notification Sinks
// =============================================================================

/// Optional sinks the read loop pushes into.
///
/// - `messages` receives unsolicited `id == 0` frames.
/// - `errors` receives orphan responses, failed validity checks on
///   notifications, and the error that ended the read loop.
///
/// A missing sink drops the message. A full sink applies backpressure to the
/// read loop; draining it promptly is the consumer's job.
#[derive(Debug, Clone, Default)]
pub struct Notifications {
    pub messages: Option<mpsc::Sender<Response>>,
    pub errors: Option<mpsc::Sender<RpcError>>,
}

impl Notifications {
    /// No sinks: notifications and diagnostics are dropped.
    pub fn none() -> Self {
        Self::default()
    }

    /// Create both sinks with the given capacity and return their receivers.
    pub fn channels(
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Response>, mpsc::Receiver<RpcError>) {
        let (message_tx, message_rx) = mpsc::channel(capacity.max(1));
        let (error_tx, error_rx) = mpsc::channel(capacity.max(1));
        let sinks = Self {
            messages: Some(message_tx),
            errors: Some(error_tx),
        };
        (sinks, message_rx, error_rx)
    }

    pub fn with_messages(mut self, messages: mpsc::Sender<Response>) -> Self {
        self.messages = Some(messages);
        self
    }

    pub fn with_errors(mut self, errors: mpsc::Sender<RpcError>) -> Self {
        self.errors = Some(errors);
        self
    }
}
