//! Data Stream Reader
//!
//! Turns the byte stream of one session into newline-delimited frames and
//! hands them to the [`WeightStream`]. Each session gets exactly one reader,
//! which picks push or poll once, when it starts.

use crate::domain::errors::StreamingError;
use crate::domain::stream::WeightStream;
use crate::infrastructure::link::{LinkChunk, LinkError, LinkSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Longest partial line kept while waiting for a terminator
pub const MAX_PENDING_BYTES: usize = 1024;

/// Consecutive transient read errors tolerated before the link counts as lost
const MAX_CONSECUTIVE_READ_FAILURES: u32 = 5;

/// What the session tasks report to the connection manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    LinkLost(StreamingError),
    Liveness { alive: bool },
}

/// Splits bytes on `\r` / `\n`, keeping the trailing partial line.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
    /// Dropping an oversized line until its terminator shows up
    discarding: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut frames = Vec::new();
        for &byte in bytes {
            match byte {
                b'\r' | b'\n' => {
                    if self.discarding {
                        self.discarding = false;
                    } else if !self.buffer.is_empty() {
                        frames.push(String::from_utf8_lossy(&self.buffer).into_owned());
                    }
                    self.buffer.clear();
                }
                _ if self.discarding => {}
                _ => {
                    if self.buffer.len() >= MAX_PENDING_BYTES {
                        warn!(len = self.buffer.len(), "Dropping unterminated line");
                        self.buffer.clear();
                        self.discarding = true;
                    } else {
                        self.buffer.push(byte);
                    }
                }
            }
        }
        frames
    }

    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Push,
    Poll,
}

/// Running reader for one session. Dropping it does not stop the task;
/// call [`ReaderHandle::stop`].
pub struct ReaderHandle {
    mode: IngestMode,
    task: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn mode(&self) -> IngestMode {
        self.mode
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

pub struct DataStreamReader {
    session: Arc<dyn LinkSession>,
    stream: Arc<WeightStream>,
    events: mpsc::UnboundedSender<SessionEvent>,
    assembler: FrameAssembler,
}

impl DataStreamReader {
    /// Probe the session once and start the matching ingestion task.
    pub fn spawn(
        session: Arc<dyn LinkSession>,
        stream: Arc<WeightStream>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> ReaderHandle {
        let pushed = session.subscribe();
        let reader = Self {
            session,
            stream,
            events,
            assembler: FrameAssembler::new(),
        };

        match pushed {
            Some(rx) => {
                debug!(device = %reader.session.device().id, "Reader using pushed data");
                ReaderHandle {
                    mode: IngestMode::Push,
                    task: tokio::spawn(reader.run_push(rx)),
                }
            }
            None => {
                debug!(device = %reader.session.device().id, "Reader polling");
                ReaderHandle {
                    mode: IngestMode::Poll,
                    task: tokio::spawn(reader.run_poll()),
                }
            }
        }
    }

    fn ingest(&mut self, bytes: &[u8]) {
        for frame in self.assembler.push(bytes) {
            if !self.stream.ingest_frame(&frame) {
                trace!(frame = %frame, "Frame carried no weight");
            }
        }
    }

    fn report_lost(&self, reason: String) {
        warn!(device = %self.session.device().id, "Link lost: {}", reason);
        let _ = self
            .events
            .send(SessionEvent::LinkLost(StreamingError::LinkLost(reason)));
    }

    /// Returns false once the link is gone.
    fn handle_error(&self, error: LinkError, failures: &mut u32) -> bool {
        if error.is_link_lost() {
            self.report_lost(error.to_string());
            return false;
        }

        *failures += 1;
        let failure = StreamingError::ReadFailure(error.to_string());
        if *failures >= MAX_CONSECUTIVE_READ_FAILURES {
            self.report_lost(format!("{} ({} consecutive failures)", failure, failures));
            return false;
        }
        warn!(device = %self.session.device().id, "{}", failure);
        true
    }

    async fn run_push(mut self, mut rx: mpsc::Receiver<LinkChunk>) {
        let mut failures = 0;
        while let Some(chunk) = rx.recv().await {
            match chunk {
                Ok(bytes) => {
                    failures = 0;
                    self.ingest(&bytes);
                }
                Err(e) => {
                    if !self.handle_error(e, &mut failures) {
                        return;
                    }
                }
            }
        }
        self.report_lost("notification channel closed".to_string());
    }

    async fn run_poll(mut self) {
        let mut failures = 0;
        loop {
            // Burst cadence right after connect, normal cadence afterwards
            let policy = self.stream.policy();
            let period = policy.current_interval(tokio::time::Instant::now());
            tokio::time::sleep(period.max(Duration::from_millis(1))).await;

            match self.session.read_available().await {
                Ok(bytes) => {
                    failures = 0;
                    if !bytes.is_empty() {
                        self.ingest(&bytes);
                    }
                }
                Err(e) => {
                    if !self.handle_error(e, &mut failures) {
                        return;
                    }
                }
            }
        }
    }
}
