//! Streaming request execution.
//!
//! One attempt moves through
//!
//! ```text
//! Sending -> AwaitingHeaders -> NonStreamError            (status >= 400)
//!                            -> StreamingBody -> StreamComplete
//! ```
//!
//! and ends in exactly one [`Outcome`]. The first-token event is reported to
//! the sink while the body is still streaming; the terminal event is derived
//! from the returned outcome by the caller.

use crate::classifier::{business_code_of, is_violation};
use crate::error::AttemptError;
use crate::metrics::{Event, EventKind, EventSink};
use crate::request::RequestAttempt;
use futures_util::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

const DATA_PREFIX: &str = "data:";
const DONE_MARKER: &str = "[DONE]";
const ERROR_BODY_LIMIT: usize = 64 * 1024;
const ERROR_DETAIL_CHARS: usize = 200;
const MAX_LINE_BYTES: usize = 1024 * 1024;

// =============================================================================
// Outcome
// =============================================================================

#[derive(Debug)]
pub enum Outcome {
    Success {
        elapsed: Duration,
        chunks: usize,
    },
    /// Upstream rejected the content. `chunks` is zero for non-streamed rejections.
    BusinessViolation {
        elapsed: Duration,
        chunks: usize,
    },
    ProtocolError {
        elapsed: Duration,
        cause: AttemptError,
    },
}

impl Outcome {
    pub fn elapsed(&self) -> Duration {
        match self {
            Outcome::Success { elapsed, .. }
            | Outcome::BusinessViolation { elapsed, .. }
            | Outcome::ProtocolError { elapsed, .. } => *elapsed,
        }
    }

    /// The terminal event for this attempt.
    pub fn to_event(&self) -> Event {
        match self {
            Outcome::Success { elapsed, chunks } => Event::new(EventKind::Total, *elapsed, *chunks),
            Outcome::BusinessViolation { elapsed, chunks } => {
                Event::new(EventKind::TotalViolation, *elapsed, *chunks)
            }
            Outcome::ProtocolError { elapsed, cause } => {
                Event::error(*elapsed, cause.label(), cause.to_string())
            }
        }
    }
}

// =============================================================================
// SSE Line Decoding
// =============================================================================

/// Splits a byte stream into lines. Bytes are kept until a full line is seen so
/// that multi-byte characters split across chunks decode correctly. A line that
/// grows past `MAX_LINE_BYTES` without a newline is dropped up to and including
/// its terminating newline.
#[derive(Debug, Default)]
pub struct LineDecoder {
    /// Never contains a `\n` between calls.
    buffer: Vec<u8>,
    discarding: bool,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns every line completed by them, without line endings.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut bytes = bytes;
        if self.discarding {
            match bytes.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    bytes = &bytes[pos + 1..];
                    self.discarding = false;
                }
                None => return Vec::new(),
            }
        }

        let mut search_from = self.buffer.len();
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut line_start = 0;
        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            lines.push(decode_line(&self.buffer[line_start..end]));
            line_start = end + 1;
            search_from = line_start;
        }
        self.buffer.drain(..line_start);

        if self.buffer.len() > MAX_LINE_BYTES {
            warn!(
                "SSE line exceeded {} bytes without a newline, dropping it",
                MAX_LINE_BYTES
            );
            self.buffer.clear();
            self.discarding = true;
        }

        lines
    }

    /// Returns the trailing unterminated line, if any, once the stream has closed.
    pub fn finish(&mut self) -> Option<String> {
        if std::mem::take(&mut self.discarding) || self.buffer.is_empty() {
            self.buffer.clear();
            return None;
        }
        let line = decode_line(&self.buffer);
        self.buffer.clear();
        Some(line)
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

// =============================================================================
// Stream State
// =============================================================================

/// What a single line did to the attempt.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct LineEffect {
    /// Set only for the first non-empty line of the attempt.
    pub first_token: Option<Duration>,
    /// The termination marker was seen.
    pub done: bool,
}

/// Per-attempt streaming state. The violation flag only ever goes from false to true.
#[derive(Debug, Default)]
pub struct StreamState {
    first_token: Option<Duration>,
    chunks: usize,
    violation: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn chunks(&self) -> usize {
        self.chunks
    }

    #[cfg(test)]
    fn violation(&self) -> bool {
        self.violation
    }

    #[cfg(test)]
    fn first_token(&self) -> Option<Duration> {
        self.first_token
    }

    /// Applies one received line. `elapsed` is the time since the attempt started.
    pub fn on_line(&mut self, raw: &str, elapsed: Duration) -> LineEffect {
        let mut effect = LineEffect::default();
        if raw.is_empty() {
            return effect;
        }

        if self.first_token.is_none() {
            self.first_token = Some(elapsed);
            effect.first_token = Some(elapsed);
        }

        let Some(data) = raw.trim().strip_prefix(DATA_PREFIX) else {
            return effect;
        };
        let data = data.trim();
        if data == DONE_MARKER {
            effect.done = true;
            return effect;
        }

        self.chunks += 1;
        if is_violation(business_code_of(data.as_bytes())) {
            self.violation = true;
        }
        effect
    }

    pub fn into_outcome(self, elapsed: Duration) -> Outcome {
        if self.violation {
            Outcome::BusinessViolation {
                elapsed,
                chunks: self.chunks,
            }
        } else {
            Outcome::Success {
                elapsed,
                chunks: self.chunks,
            }
        }
    }
}

// =============================================================================
// Stream Consumer
// =============================================================================

/// Executes attempts over one virtual user's HTTP client.
#[derive(Debug, Clone)]
pub struct StreamConsumer {
    client: Client,
    read_timeout: Duration,
}

impl StreamConsumer {
    pub fn new(client: Client, read_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
        }
    }

    /// Runs the attempt to completion. Never fails: every failure is an outcome.
    pub async fn execute(&self, attempt: RequestAttempt, sink: &dyn EventSink) -> Outcome {
        let started = attempt.started;
        let error = |cause: AttemptError| Outcome::ProtocolError {
            elapsed: started.elapsed(),
            cause,
        };

        let send = self
            .client
            .post(attempt.url)
            .headers(attempt.headers)
            .body(attempt.body)
            .send();

        let response = match timeout(self.read_timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return error(AttemptError::from_send(e)),
            Err(_) => return error(AttemptError::Timeout(self.read_timeout)),
        };

        let status = response.status();
        if status.as_u16() >= 400 {
            return self.classify_error_response(status, response, started).await;
        }

        let mut body = response.bytes_stream();
        let mut decoder = LineDecoder::new();
        let mut state = StreamState::new();

        'stream: loop {
            let chunk = match timeout(self.read_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return error(AttemptError::Body(e)),
                Ok(None) => break,
                Err(_) => return error(AttemptError::Timeout(self.read_timeout)),
            };

            for line in decoder.feed(&chunk) {
                if self.apply_line(&mut state, &line, started, sink) {
                    break 'stream;
                }
            }
        }

        if let Some(line) = decoder.finish() {
            self.apply_line(&mut state, &line, started, sink);
        }

        let outcome = state.into_outcome(started.elapsed());
        debug!(?outcome, "stream complete");
        outcome
    }

    /// Returns true when the stream is finished.
    fn apply_line(
        &self,
        state: &mut StreamState,
        line: &str,
        started: Instant,
        sink: &dyn EventSink,
    ) -> bool {
        let effect = state.on_line(line, started.elapsed());
        if let Some(first_token) = effect.first_token {
            sink.report(Event::new(EventKind::FirstToken, first_token, 0));
        }
        effect.done
    }

    async fn classify_error_response(
        &self,
        status: StatusCode,
        response: Response,
        started: Instant,
    ) -> Outcome {
        let declared_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("application/json"));

        let body = self.read_error_body(response).await;
        let code = if declared_json || !body.is_empty() {
            business_code_of(&body)
        } else {
            None
        };

        let elapsed = started.elapsed();
        if is_violation(code) {
            debug!(status = status.as_u16(), ?code, "business violation");
            return Outcome::BusinessViolation { elapsed, chunks: 0 };
        }

        let text = String::from_utf8_lossy(&body);
        Outcome::ProtocolError {
            elapsed,
            cause: AttemptError::Http {
                status,
                body: text.chars().take(ERROR_DETAIL_CHARS).collect(),
            },
        }
    }

    /// Reads up to `ERROR_BODY_LIMIT` bytes. A read failure keeps what arrived so far.
    async fn read_error_body(&self, response: Response) -> Vec<u8> {
        let mut stream = response.bytes_stream();
        let mut body = Vec::new();
        while body.len() < ERROR_BODY_LIMIT {
            match timeout(self.read_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => {
                    let take = chunk.len().min(ERROR_BODY_LIMIT - body.len());
                    body.extend_from_slice(&chunk[..take]);
                }
                Ok(Some(Err(e))) => {
                    debug!("error body read failed: {}", e);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("error body read timed out");
                    break;
                }
            }
        }
        body
    }
}
