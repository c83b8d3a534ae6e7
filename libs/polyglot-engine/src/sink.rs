use polyglot_common::types::ExecutionEvent;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Events buffered per streamed execution before producers wait for the
/// listener to catch up
pub const EVENT_BUFFER: usize = 256;

/// Which stream a chunk of output belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Forwards incremental output of one execution to its listener.
///
/// Clones share one bounded channel, so a slow listener holds producers
/// back instead of queueing output in memory. Once [`OutputSink::seal`]
/// returns, no chunk can be delivered anymore, which lets the coordinator
/// emit the terminal event knowing nothing will trail it.
#[derive(Clone, Default)]
pub struct OutputSink {
    inner: Arc<Mutex<Option<mpsc::Sender<ExecutionEvent>>>>,
}

impl OutputSink {
    pub fn new(tx: mpsc::Sender<ExecutionEvent>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// A sink that drops everything, for buffered executions
    pub fn disabled() -> Self {
        Self::default()
    }

    pub async fn emit(&self, stream: Stream, data: impl Into<String>) {
        let data = data.into();
        if data.is_empty() {
            return;
        }
        let event = match stream {
            Stream::Stdout => ExecutionEvent::Stdout { data },
            Stream::Stderr => ExecutionEvent::Stderr { data },
        };
        // Held across the send so seal() waits for an in-flight chunk
        let guard = self.inner.lock().await;
        if let Some(tx) = guard.as_ref() {
            // Receiver gone means the client left; output is still captured
            let _ = tx.send(event).await;
        }
    }

    /// Stop forwarding and hand back the sender for the terminal event
    pub async fn seal(&self) -> Option<mpsc::Sender<ExecutionEvent>> {
        self.inner.lock().await.take()
    }

    pub async fn is_sealed(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

/// Incremental UTF-8 decoder for pipe chunks.
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives instead of being replaced with U+FFFD.
#[derive(Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let out = s.to_string();
                self.pending.clear();
                out
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete sequence at the tail
                let valid = e.valid_up_to();
                let tail = self.pending.split_off(valid);
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending = tail;
                out
            }
            Err(_) => {
                let out = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                out
            }
        }
    }

    pub fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sealed_sink_drops_chunks() {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let sink = OutputSink::new(tx);
        sink.emit(Stream::Stdout, "before").await;
        let tx = sink.seal().await.expect("first seal returns the sender");
        sink.emit(Stream::Stdout, "after").await;
        assert!(sink.is_sealed().await);
        assert!(sink.seal().await.is_none());
        drop(tx);

        assert_eq!(
            rx.try_recv().unwrap(),
            ExecutionEvent::Stdout {
                data: "before".into()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_chunks_are_skipped() {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let sink = OutputSink::new(tx);
        sink.emit(Stream::Stderr, "").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disabled_sink_accepts_writes() {
        let sink = OutputSink::disabled();
        sink.emit(Stream::Stdout, "ignored").await;
        assert!(sink.is_sealed().await);
    }

    #[tokio::test]
    async fn test_full_channel_holds_producer_back() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = OutputSink::new(tx);
        sink.emit(Stream::Stdout, "one").await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            sink.emit(Stream::Stdout, "two"),
        )
        .await;
        assert!(blocked.is_err(), "second chunk must wait for the listener");

        assert_eq!(rx.recv().await, Some(ExecutionEvent::Stdout { data: "one".into() }));
        sink.emit(Stream::Stdout, "three").await;
        assert_eq!(rx.recv().await, Some(ExecutionEvent::Stdout { data: "three".into() }));
    }

    #[tokio::test]
    async fn test_departed_listener_does_not_block() {
        let (tx, rx) = mpsc::channel(1);
        let sink = OutputSink::new(tx);
        drop(rx);
        for _ in 0..10 {
            sink.emit(Stream::Stdout, "x").await;
        }
    }

    #[test]
    fn test_chunker_holds_split_multibyte_char() {
        let bytes = "héllo".as_bytes();
        let mut chunker = Utf8Chunker::default();
        // 'é' is two bytes starting at index 1
        assert_eq!(chunker.push(&bytes[..2]), "h");
        assert_eq!(chunker.push(&bytes[2..]), "éllo");
        assert_eq!(chunker.finish(), "");
    }

    #[test]
    fn test_chunker_replaces_invalid_bytes() {
        let mut chunker = Utf8Chunker::default();
        let out = chunker.push(&[b'a', 0xff, b'b']);
        assert_eq!(out, "a\u{fffd}b");
    }
}
