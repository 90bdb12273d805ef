//! Per-orchestration response handling.
//!
//! Demultiplexes interleaved replies by correlated request id: direct
//! responses resolve immediately, streamed replies accumulate in bounded
//! buffers until `stream-complete`. Each pending request arms its own
//! deadline. A resolver settles at most once — the slot is removed from the
//! map before its sender fires, so anything arriving later is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

use agora_primitives::AgentMessage;

/// Per-request limits.
#[derive(Debug, Clone)]
pub struct ResponseConfig {
    /// Deadline for one request.
    pub request_timeout: Duration,
    /// Ceiling on buffered stream bytes per request.
    pub max_stream_bytes: usize,
    /// Ceiling on buffered chunks per request.
    pub max_stream_chunks: usize,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            max_stream_bytes: 10 * 1024 * 1024,
            max_stream_chunks: 4096,
        }
    }
}

/// How a pending request failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResponseError {
    /// The per-request deadline fired.
    #[error("response timeout")]
    Timeout,

    /// Buffered stream exceeded a ceiling.
    #[error("stream exceeded maximum size")]
    StreamLimit,

    /// The peer reported an error.
    #[error("agent error: {0}")]
    Upstream(String),

    /// The orchestrator aborted the request.
    #[error("request cancelled: {0}")]
    Cancelled(String),
}

/// Resolution of one pending request.
pub type ResponseResult = Result<String, ResponseError>;

/// Callback invoked per accepted stream chunk: `(request_id, chunk)`.
pub type ChunkCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[derive(Default)]
struct StreamBuffer {
    text: String,
    bytes: usize,
    chunks: usize,
}

struct Slot {
    tx: oneshot::Sender<ResponseResult>,
    buffer: StreamBuffer,
    timer: JoinHandle<()>,
}

struct Inner {
    pending: Mutex<HashMap<String, Slot>>,
    config: ResponseConfig,
    on_chunk: Option<ChunkCallback>,
}

/// Demultiplexer for one orchestration's replies. Cheap to clone.
#[derive(Clone)]
pub struct ResponseHandler {
    inner: Arc<Inner>,
}

impl ResponseHandler {
    /// A handler with the given limits.
    pub fn new(config: ResponseConfig, on_chunk: Option<ChunkCallback>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                config,
                on_chunk,
            }),
        }
    }

    /// Register a resolver for `request_id` and arm its deadline.
    pub fn add_pending(&self, request_id: &str) -> oneshot::Receiver<ResponseResult> {
        let (tx, rx) = oneshot::channel();

        let timer = {
            let handler = self.clone();
            let request_id = request_id.to_owned();
            let timeout = self.inner.config.request_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                handler.settle(&request_id, Err(ResponseError::Timeout));
            })
        };

        self.inner.pending.lock().insert(
            request_id.to_owned(),
            Slot {
                tx,
                buffer: StreamBuffer::default(),
                timer,
            },
        );
        rx
    }

    /// Requests still awaiting resolution.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Route one inbound message. Non-response messages and unknown request
    /// ids are ignored.
    pub fn handle(&self, message: &AgentMessage) {
        match message {
            AgentMessage::StreamChunk(chunk) => self.on_stream_chunk(&chunk.request_id, &chunk.chunk),
            AgentMessage::StreamComplete(complete) => {
                if let Some(slot) = self.take(&complete.request_id) {
                    // Prefer the accumulated buffer; fall back to the
                    // payload for peers that never streamed chunks.
                    let text = if slot.buffer.text.is_empty() {
                        complete.text.clone()
                    } else {
                        slot.buffer.text
                    };
                    let _ = slot.tx.send(Ok(text));
                }
            }
            AgentMessage::AgentResponse(reply) => {
                if let Some(slot) = self.take(&reply.request_id) {
                    let result = match &reply.error {
                        Some(error) => Err(ResponseError::Upstream(error.clone())),
                        None => Ok(reply.response.clone().unwrap_or_default()),
                    };
                    let _ = slot.tx.send(result);
                }
            }
            _ => {}
        }
    }

    fn on_stream_chunk(&self, request_id: &str, chunk: &str) {
        let callback = {
            let mut pending = self.inner.pending.lock();
            let Some(slot) = pending.get_mut(request_id) else {
                // Late chunk after settlement: dropped silently.
                trace!(request_id, "Dropping chunk for settled request");
                return;
            };

            if slot.buffer.bytes + chunk.len() > self.inner.config.max_stream_bytes
                || slot.buffer.chunks + 1 > self.inner.config.max_stream_chunks
            {
                drop(pending);
                self.settle(request_id, Err(ResponseError::StreamLimit));
                return;
            }

            slot.buffer.text.push_str(chunk);
            slot.buffer.bytes += chunk.len();
            slot.buffer.chunks += 1;
            self.inner.on_chunk.clone()
        };
        if let Some(callback) = callback {
            callback(request_id, chunk);
        }
    }

    /// Abort one request from outside (publish failure, cancellation).
    pub fn reject(&self, request_id: &str, error: ResponseError) {
        self.settle(request_id, Err(error));
    }

    /// Settle every outstanding request as cancelled and drop all timers.
    /// Idempotent.
    pub fn cleanup(&self) {
        let drained: Vec<(String, Slot)> = self.inner.pending.lock().drain().collect();
        for (_, slot) in drained {
            slot.timer.abort();
            let _ = slot
                .tx
                .send(Err(ResponseError::Cancelled("handler cleanup".into())));
        }
    }

    fn take(&self, request_id: &str) -> Option<Slot> {
        let slot = self.inner.pending.lock().remove(request_id)?;
        slot.timer.abort();
        Some(slot)
    }

    fn settle(&self, request_id: &str, result: ResponseResult) {
        if let Some(slot) = self.take(request_id) {
            let _ = slot.tx.send(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_primitives::message::{AgentReply, StreamChunk, StreamComplete};

    fn quick_handler() -> ResponseHandler {
        ResponseHandler::new(
            ResponseConfig {
                request_timeout: Duration::from_millis(50),
                max_stream_bytes: 64,
                max_stream_chunks: 4,
            },
            None,
        )
    }

    fn chunk(id: &str, text: &str) -> AgentMessage {
        AgentMessage::StreamChunk(StreamChunk {
            request_id: id.into(),
            chunk: text.into(),
            partial: Some(true),
        })
    }

    fn complete(id: &str, text: &str) -> AgentMessage {
        AgentMessage::StreamComplete(StreamComplete {
            request_id: id.into(),
            text: text.into(),
            complete: Some(true),
        })
    }

    fn reply(id: &str, response: Option<&str>, error: Option<&str>) -> AgentMessage {
        AgentMessage::AgentResponse(AgentReply {
            request_id: id.into(),
            response: response.map(Into::into),
            error: error.map(Into::into),
        })
    }

    #[tokio::test]
    async fn test_direct_response_resolves() {
        let handler = quick_handler();
        let rx = handler.add_pending("r1");

        handler.handle(&reply("r1", Some("42"), None));
        assert_eq!(rx.await.unwrap(), Ok("42".into()));
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_upstream_error_rejects() {
        let handler = quick_handler();
        let rx = handler.add_pending("r1");

        handler.handle(&reply("r1", None, Some("model exploded")));
        assert_eq!(
            rx.await.unwrap(),
            Err(ResponseError::Upstream("model exploded".into()))
        );
    }

    #[tokio::test]
    async fn test_chunks_accumulate_until_complete() {
        let handler = quick_handler();
        let rx = handler.add_pending("r1");

        handler.handle(&chunk("r1", "foo"));
        handler.handle(&chunk("r1", "bar"));
        handler.handle(&complete("r1", "ignored in favor of the buffer"));

        assert_eq!(rx.await.unwrap(), Ok("foobar".into()));
    }

    #[tokio::test]
    async fn test_complete_without_chunks_uses_payload() {
        let handler = quick_handler();
        let rx = handler.add_pending("r1");

        handler.handle(&complete("r1", "full text"));
        assert_eq!(rx.await.unwrap(), Ok("full text".into()));
    }

    #[tokio::test]
    async fn test_byte_ceiling_rejects_stream() {
        let handler = quick_handler();
        let rx = handler.add_pending("r1");

        handler.handle(&chunk("r1", &"x".repeat(60)));
        handler.handle(&chunk("r1", &"x".repeat(10)));

        assert_eq!(rx.await.unwrap(), Err(ResponseError::StreamLimit));
        assert_eq!(handler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_chunk_ceiling_rejects_stream() {
        let handler = quick_handler();
        let rx = handler.add_pending("r1");

        for _ in 0..4 {
            handler.handle(&chunk("r1", "x"));
        }
        handler.handle(&chunk("r1", "x"));

        assert_eq!(rx.await.unwrap(), Err(ResponseError::StreamLimit));
    }

    #[tokio::test]
    async fn test_deadline_rejects_with_timeout() {
        let handler = quick_handler();
        let rx = handler.add_pending("r1");

        assert_eq!(rx.await.unwrap(), Err(ResponseError::Timeout));
    }

    #[tokio::test]
    async fn test_late_messages_are_dropped() {
        let handler = quick_handler();
        let rx = handler.add_pending("r1");

        handler.handle(&reply("r1", Some("first"), None));
        // Already settled; all of these are no-ops.
        handler.handle(&reply("r1", Some("second"), None));
        handler.handle(&chunk("r1", "late"));
        handler.handle(&complete("r1", "late"));

        assert_eq!(rx.await.unwrap(), Ok("first".into()));
    }

    #[tokio::test]
    async fn test_chunk_callback_fires_per_chunk() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let callback: ChunkCallback = {
            let seen = Arc::clone(&seen);
            Arc::new(move |_, chunk: &str| seen.lock().push(chunk.to_owned()))
        };
        let handler = ResponseHandler::new(
            ResponseConfig {
                request_timeout: Duration::from_millis(50),
                ..Default::default()
            },
            Some(callback),
        );

        let rx = handler.add_pending("r1");
        handler.handle(&chunk("r1", "a"));
        handler.handle(&chunk("r1", "b"));
        handler.handle(&complete("r1", ""));

        rx.await.unwrap().unwrap();
        assert_eq!(*seen.lock(), vec!["a".to_owned(), "b".to_owned()]);
    }

    #[tokio::test]
    async fn test_reject_and_cleanup() {
        let handler = quick_handler();
        let r1 = handler.add_pending("r1");
        let r2 = handler.add_pending("r2");

        handler.reject("r1", ResponseError::Cancelled("publish failed".into()));
        assert_eq!(
            r1.await.unwrap(),
            Err(ResponseError::Cancelled("publish failed".into()))
        );

        handler.cleanup();
        assert_eq!(
            r2.await.unwrap(),
            Err(ResponseError::Cancelled("handler cleanup".into()))
        );
        assert_eq!(handler.pending_count(), 0);

        // Idempotent.
        handler.cleanup();
    }
}
