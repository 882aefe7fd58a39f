//! Self-delimited JSON framing for byte streams.
//!
//! Each frame is one complete JSON value. Outgoing frames are terminated by a
//! newline; incoming frames may be newline-separated or simply concatenated,
//! since the value itself delimits the frame:
//!
//! ```text
//! {"id":1,"result":{"Data":30},"error":null}\n
//! {"id":0,"method":"push.event","params":["tick"]}{"id":2,"result":true}
//! ```

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::CodecError;

/// Maximum frame size (100MB) to prevent OOM from malicious/buggy servers.
pub const MAX_FRAME_SIZE: usize = 100 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// One decoded frame plus the exact text it was cut from.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub value: Value,
    pub text: String,
}

/// Buffered reader that cuts exactly one JSON value per call.
///
/// Bytes are scanned once as they arrive to find where the current value
/// ends; the value is then parsed a single time.
pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    scan: Scan,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            scan: Scan::default(),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }

    /// Read the next frame from the stream.
    ///
    /// # Errors
    ///
    /// - `CodecError::Eof` if the stream ends between frames
    /// - `CodecError::UnexpectedEof` if the stream ends inside a frame
    /// - `CodecError::Decode` if the bytes are not valid JSON
    /// - `CodecError::FrameTooLarge` if a frame exceeds the size limit
    /// - `CodecError::Io` if the underlying read fails
    pub async fn read_frame(&mut self) -> Result<Frame, CodecError> {
        loop {
            if let Some(frame) = self.cut_frame()? {
                return Ok(frame);
            }

            if self.buf.len() > self.max_frame_size {
                return Err(CodecError::FrameTooLarge {
                    size: self.buf.len(),
                    max: self.max_frame_size,
                });
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.reader.read(&mut chunk).await.map_err(CodecError::Io)?;
            if n == 0 {
                return self.cut_at_eof();
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Try to cut one complete value off the front of the buffer.
    fn cut_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.scan.offset == 0 {
            let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
                self.buf.clear();
                return Ok(None);
            };
            self.buf.drain(..start);
        }

        match self.scan.find_end(&self.buf) {
            Some(end) => self.take_frame(end).map(Some),
            None => Ok(None),
        }
    }

    /// The stream ended; whatever is buffered is all there will be.
    fn cut_at_eof(&mut self) -> Result<Frame, CodecError> {
        match self.buf.first() {
            None => Err(CodecError::Eof),
            Some(b'{' | b'[' | b'"') => Err(CodecError::UnexpectedEof),
            // A bare scalar is only terminated by what follows it.
            Some(_) => self.take_frame(self.buf.len()),
        }
    }

    fn take_frame(&mut self, end: usize) -> Result<Frame, CodecError> {
        self.scan = Scan::default();
        if end > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: end,
                max: self.max_frame_size,
            });
        }

        let bytes: Vec<u8> = self.buf.drain(..end).collect();
        let value = serde_json::from_slice(&bytes).map_err(CodecError::Decode)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        Ok(Frame { value, text })
    }
}

/// Progress through the value at the front of the buffer.
#[derive(Debug, Default)]
struct Scan {
    /// Bytes already examined; `0` means no value has started.
    offset: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Continue scanning `buf`, whose first byte starts a value, and return
    /// the length of the value once its end is seen.
    ///
    /// Only nesting and string boundaries are tracked; the parser validates
    /// everything else.
    fn find_end(&mut self, buf: &[u8]) -> Option<usize> {
        let first = *buf.first()?;
        let structured = matches!(first, b'{' | b'[' | b'"');

        while self.offset < buf.len() {
            let i = self.offset;
            let b = buf[i];
            self.offset += 1;

            if !structured {
                if i > 0 && ends_scalar(b) {
                    return Some(i);
                }
                continue;
            }

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                    if self.depth == 0 {
                        return Some(i + 1);
                    }
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                // Unbalanced closers end the value too; the parser rejects it.
                b'}' | b']' if self.depth <= 1 => return Some(i + 1),
                b'}' | b']' => self.depth -= 1,
                _ => {}
            }
        }
        None
    }
}

fn ends_scalar(b: u8) -> bool {
    b.is_ascii_whitespace() || matches!(b, b'{' | b'[' | b'"' | b'}' | b']' | b',' | b':')
}

/// Write one newline-terminated frame and flush it.
///
/// The frame and its terminator go out in a single `write_all` so a frame is
/// never split across two writes by this function.
pub async fn write_frame<W>(writer: &mut W, text: &str) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(b'\n');

    writer.write_all(&bytes).await.map_err(CodecError::Io)?;
    writer.flush().await.map_err(CodecError::Io)?;
    Ok(())
}
