//! Wire codec for newline-delimited JSON-RPC.
//!
//! The codec owns the transport. Requests go out as one JSON value per line;
//! responses come back as self-delimited JSON values and are decoded in two
//! phases: first into a generic map, then into a [`Response`] header whose
//! payloads stay untyped until [`ClientCodec::read_response_body`] decodes
//! them into a caller's [`ReplyTarget`].
//!
//! JSON-RPC responses carry the request id but not the method, so the codec
//! remembers `id -> method` for every request it writes and reclaims the entry
//! when the matching response header is read.

mod framing;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::proto::{Field, ReplyTarget, Request, Response, RpcError};

pub use framing::{write_frame, Frame, FrameReader, MAX_FRAME_SIZE};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Codec and transport failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The stream ended cleanly between frames.
    #[error("end of stream")]
    Eof,

    /// The stream ended in the middle of a frame.
    #[error("unexpected end of stream inside a frame")]
    UnexpectedEof,

    /// The codec was closed locally.
    #[error("codec is closed")]
    Closed,

    /// Incoming bytes are not valid JSON.
    #[error("Failed to decode frame: {0}")]
    Decode(#[source] serde_json::Error),

    /// A request could not be serialized.
    #[error("Failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// A frame decoded to something other than a JSON object.
    #[error("invalid response type: expected object, got {0}")]
    InvalidFrame(&'static str),

    #[error("Frame size {size} exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

// =============================================================================
// Debug Hook
// =============================================================================

/// Receives the exact text of every frame written and read.
///
/// Implementations must not block; they run inline on the write path and on
/// the read loop.
pub trait WireObserver: Send + Sync {
    fn outgoing(&self, _frame: &str) {}
    fn incoming(&self, _frame: &str) {}
}

/// Emits every frame as a `trace!` event on the `linerpc::wire` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl WireObserver for TracingObserver {
    fn outgoing(&self, frame: &str) {
        trace!(target: "linerpc::wire", "=> {}", frame);
    }

    fn incoming(&self, frame: &str) {
        trace!(target: "linerpc::wire", "<= {}", frame);
    }
}

// =============================================================================
// Codec Trait
// =============================================================================

/// Client side of a request/response codec.
///
/// The client writes requests from any number of tasks and reads response
/// headers from exactly one task (its read loop), calling
/// [`read_response_body`](ClientCodec::read_response_body) after each header
/// that belongs to a pending call.
#[async_trait]
pub trait ClientCodec: Send + Sync + 'static {
    /// Record `seq -> method` and write one request frame.
    ///
    /// On failure the `seq -> method` entry is left in place; the caller
    /// reclaims it with [`forget`](ClientCodec::forget).
    async fn write_request<Q: Request>(&self, request: &Q) -> Result<(), CodecError>;

    /// Read and decode the next response header.
    ///
    /// Type mismatches on individual fields yield absent fields; only a frame
    /// that is not a JSON object is a hard error. Validity failures are
    /// reported through [`Response::check_error`].
    async fn read_response_header(&self) -> Result<Response, CodecError>;

    /// Decode the payloads of `header` into `target`.
    ///
    /// Only fields the target wants are decoded, in the order result, params,
    /// error. The first failure is returned; fields decoded before it keep
    /// their values. `None` discards the payloads.
    fn read_response_body(
        &self,
        header: &Response,
        target: Option<&mut dyn ReplyTarget>,
    ) -> Result<(), RpcError> {
        let Some(target) = target else {
            return Ok(());
        };
        target.attach(header.clone());

        decode_field(target, Field::Result, header.result.as_ref())?;
        decode_field(target, Field::Params, header.params.as_ref())?;
        decode_field(target, Field::Error, header.error.as_ref())?;
        Ok(())
    }

    /// Drop the remembered method for `seq`, if any.
    fn forget(&self, seq: u64);

    /// Close the transport. Pending and later reads fail with
    /// [`CodecError::Closed`].
    async fn close(&self) -> Result<(), CodecError>;
}

fn decode_field(
    target: &mut dyn ReplyTarget,
    field: Field,
    payload: Option<&Value>,
) -> Result<(), RpcError> {
    if !target.wants(field) {
        return Ok(());
    }
    match payload {
        Some(payload) => target.fill(field, payload).map_err(|e| {
            RpcError::parse_failed(format!("parse {} field failed: {}", field.name(), e))
        }),
        None => {
            target.clear(field);
            Ok(())
        }
    }
}

// =============================================================================
// JSON Codec
// =============================================================================

/// Frames queued for the writer task before `write_request` waits.
const OUTGOING_QUEUE: usize = 64;

/// A serialized request and the channel its write result goes back on.
struct OutgoingFrame {
    text: String,
    ack: oneshot::Sender<Result<(), CodecError>>,
}

/// Newline-delimited JSON codec over any byte stream.
///
/// Frames are written by a dedicated task, so a caller that stops waiting
/// never leaves half a frame on the wire, and `close` never waits behind a
/// stalled write.
///
/// # Example
///
/// ```ignore
/// let stream = tokio::net::TcpStream::connect("127.0.0.1:9999").await?;
/// let codec = JsonCodec::new(stream).with_observer(Arc::new(TracingObserver));
/// ```
pub struct JsonCodec {
    reader: tokio::sync::Mutex<FrameReader<BoxedReader>>,
    frames: mpsc::Sender<OutgoingFrame>,
    /// Request id -> method name for responses still outstanding.
    pending: Mutex<HashMap<u64, String>>,
    observer: Option<Arc<dyn WireObserver>>,
    closed: watch::Sender<bool>,
}

impl JsonCodec {
    /// Split a bidirectional stream into the codec's read and write halves.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime; the writer task is
    /// spawned immediately.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(read_half, write_half)
    }

    /// Build a codec from separate read and write halves.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let (closed, closed_rx) = watch::channel(false);
        let (frames, frames_rx) = mpsc::channel(OUTGOING_QUEUE);
        tokio::spawn(write_loop(writer, frames_rx, closed_rx));

        Self {
            reader: tokio::sync::Mutex::new(FrameReader::new(reader)),
            frames,
            pending: Mutex::new(HashMap::new()),
            observer: None,
            closed,
        }
    }

    /// Build a codec with the frame limit and wire tracing from `config`.
    pub fn with_config<S>(stream: S, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let codec = Self::new(stream).with_max_frame_size(config.max_frame_size);
        if config.trace_wire {
            codec.with_observer(Arc::new(TracingObserver))
        } else {
            codec
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn WireObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.reader.get_mut().set_max_frame_size(max_frame_size);
        self
    }

    /// Number of requests whose method is still remembered.
    pub fn pending_methods(&self) -> usize {
        lock(&self.pending).len()
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn read_frame(&self) -> Result<Frame, CodecError> {
        let mut closed = self.closed.subscribe();
        let already_closed = *closed.borrow();
        if already_closed {
            return Err(CodecError::Closed);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            frame = reader.read_frame() => frame,
            _ = closed.changed() => Err(CodecError::Closed),
        }
    }
}

/// Owns the write half. Writes whole frames in queue order until the codec
/// closes, the codec is dropped, or a write fails.
///
/// A failed write may have left part of a frame on the wire, so nothing is
/// written after it; later requests fail with [`CodecError::Closed`].
async fn write_loop(
    mut writer: BoxedWriter,
    mut frames: mpsc::Receiver<OutgoingFrame>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.changed() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = tokio::select! {
            biased;
            _ = closed.changed() => Err(CodecError::Closed),
            result = write_frame(&mut writer, &frame.text) => result,
        };
        let failed = result.is_err();
        if let Err(err @ (CodecError::Io(_) | CodecError::Encode(_))) = &result {
            warn!(error = %err, "Frame write failed, stopping writer");
        }
        // The requester may have stopped waiting.
        let _ = frame.ack.send(result);
        if failed {
            break;
        }
    }

    // Queued frames are answered with `Closed` when their acks drop.
    drop(frames);
    if let Err(err) = writer.shutdown().await {
        debug!(error = %err, "Failed to shut down write half");
    }
}

#[async_trait]
impl ClientCodec for JsonCodec {
    async fn write_request<Q: Request>(&self, request: &Q) -> Result<(), CodecError> {
        lock(&self.pending).insert(request.seq(), request.method().to_owned());
        if self.is_closed() {
            return Err(CodecError::Closed);
        }

        let text = serde_json::to_string(request).map_err(CodecError::Encode)?;
        if let Some(observer) = &self.observer {
            observer.outgoing(&text);
        }

        let (ack, written) = oneshot::channel();
        self.frames
            .send(OutgoingFrame { text, ack })
            .await
            .map_err(|_| CodecError::Closed)?;
        written.await.unwrap_or(Err(CodecError::Closed))
    }

    async fn read_response_header(&self) -> Result<Response, CodecError> {
        let frame = self.read_frame().await?;
        if let Some(observer) = &self.observer {
            observer.incoming(&frame.text);
        }

        let map = match frame.value {
            Value::Object(map) => map,
            other => return Err(CodecError::InvalidFrame(kind_of(&other))),
        };

        let mut response = header_from_map(map);
        if response.id == 0 {
            if response.method.is_empty() {
                response.check_error = Some(RpcError::invalid_response("method is missing"));
            }
            return Ok(response);
        }

        response.method = lock(&self.pending).remove(&response.id).unwrap_or_default();

        if response.error.is_none() && response.result.is_none() {
            response.check_error = Some(RpcError::invalid_response("no result and error field"));
        }
        Ok(response)
    }

    fn forget(&self, seq: u64) {
        lock(&self.pending).remove(&seq);
    }

    /// Signals the reader and the writer task. The write half is shut down
    /// by the writer task once any in-progress frame is abandoned.
    async fn close(&self) -> Result<(), CodecError> {
        self.closed.send_replace(true);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Header Extraction
// =============================================================================

/// Build a header from a decoded frame, treating wrong-typed fields as absent.
fn header_from_map(map: Map<String, Value>) -> Response {
    let error = payload(map.get("error"));
    // `"result": null` next to a real error is the JSON-RPC 1.0 way of saying
    // "no result"; on its own it is a legitimate null result.
    let result = match map.get("result") {
        Some(Value::Null) if error.is_some() => None,
        Some(value) => Some(value.clone()),
        None => None,
    };

    Response {
        id: as_id(map.get("id")),
        method: as_string(map.get("method")),
        error,
        params: payload(map.get("params")),
        result,
        check_error: None,
        raw: map,
    }
}

/// Accepts unsigned integers and non-negative floats (truncated).
fn as_id(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or_else(|| match n.as_f64() {
            Some(f) if f >= 0.0 => f as u64,
            _ => 0,
        }),
        _ => 0,
    }
}

fn as_string(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        _ => String::new(),
    }
}

fn payload(value: Option<&Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.clone()),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
