//! Streaming transcription: provider contract, per-turn session glue and the
//! transcript buffer.
//!
//! A `TranscriptionSession` is opened once per Listening phase. It drains the
//! capture queue into the provider on a background task, and hands provider
//! events back to the orchestrator through a single receiver, so every write
//! to the `TranscriptBuffer` happens on the orchestrator task in arrival order.

use crate::audio::PcmFrame;
use crate::error::VoiceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One event from a streaming recognizer.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
    /// Voice activity at the time of the event.
    pub is_speaking: bool,
    /// Silence since the speaker last spoke.
    pub silence: Duration,
}

impl TranscriptEvent {
    pub fn interim(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            is_speaking: true,
            silence: Duration::ZERO,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            is_speaking: false,
            silence: Duration::ZERO,
        }
    }

    /// A pure voice-activity update with no text.
    pub fn activity(is_speaking: bool, silence: Duration) -> Self {
        Self {
            text: String::new(),
            is_final: false,
            is_speaking,
            silence,
        }
    }
}

/// What a provider pushes back over the session's event channel.
#[derive(Debug, Clone)]
pub enum TranscriptionMessage {
    Event(TranscriptEvent),
    /// Device or stream failure; the turn's text is discarded.
    Error(String),
}

/// Options for opening a provider session.
#[derive(Debug, Clone)]
pub struct TranscriptionOptions {
    pub sample_rate: u32,
    pub frame_ms: u32,
    pub language: String,
    pub interim_results: bool,
}

impl Default for TranscriptionOptions {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 30,
            language: "en".to_string(),
            interim_results: true,
        }
    }
}

/// A speech-recognition service that can open duplex streaming sessions.
#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Open a session. Events go to `events` until the returned link is finished.
    async fn open(
        &self,
        options: TranscriptionOptions,
        events: mpsc::UnboundedSender<TranscriptionMessage>,
    ) -> VoiceResult<Box<dyn TranscriptionLink>>;
}

/// The sending half of an open provider session.
#[async_trait]
pub trait TranscriptionLink: Send {
    async fn send_frame(&mut self, frame: PcmFrame) -> VoiceResult<()>;

    /// Flush and close. Every event the provider will ever produce has been
    /// sent once this returns. Must be idempotent.
    async fn finish(&mut self) -> VoiceResult<()>;

    /// Drop the session without flushing. In-flight provider work is cancelled
    /// and nothing further is awaited. Must not block.
    fn abort(&mut self);
}

/// Live text for the current turn: finalized segments plus the latest interim guess.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptSnapshot {
    pub finalized: String,
    pub interim: String,
}

impl TranscriptSnapshot {
    /// What a live caption should show.
    pub fn display(&self) -> String {
        match (self.finalized.is_empty(), self.interim.is_empty()) {
            (true, _) => self.interim.clone(),
            (false, true) => self.finalized.clone(),
            (false, false) => format!("{} {}", self.finalized, self.interim),
        }
    }
}

/// Per-turn accumulator. Owned by the orchestrator; readers get snapshots.
#[derive(Debug, Default)]
pub struct TranscriptBuffer {
    finalized: String,
    interim: String,
}

impl TranscriptBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event. Returns true when the visible text changed.
    pub fn apply(&mut self, event: &TranscriptEvent) -> bool {
        let text = event.text.trim();
        if event.is_final {
            let had_interim = !self.interim.is_empty();
            self.interim.clear();
            if text.is_empty() {
                return had_interim;
            }
            if !self.finalized.is_empty() {
                self.finalized.push(' ');
            }
            self.finalized.push_str(text);
            true
        } else if self.interim != text {
            self.interim = text.to_string();
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> TranscriptSnapshot {
        TranscriptSnapshot {
            finalized: self.finalized.clone(),
            interim: self.interim.clone(),
        }
    }

    pub fn finalized(&self) -> &str {
        &self.finalized
    }

    /// Hand over the finalized text and clear the buffer.
    pub fn take_final(&mut self) -> String {
        self.interim.clear();
        std::mem::take(&mut self.finalized)
    }

    pub fn reset(&mut self) {
        self.finalized.clear();
        self.interim.clear();
    }
}

/// One listening phase's connection to the transcription provider.
pub struct TranscriptionSession {
    events: mpsc::UnboundedReceiver<TranscriptionMessage>,
    cancel: CancellationToken,
    abort: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
    closed: bool,
}

impl TranscriptionSession {
    /// Open a provider session and start forwarding captured frames into it.
    pub async fn open(
        provider: &dyn TranscriptionProvider,
        options: TranscriptionOptions,
        frames: mpsc::Receiver<PcmFrame>,
    ) -> VoiceResult<Self> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let link = provider.open(options, event_tx).await?;
        let cancel = CancellationToken::new();
        let abort = CancellationToken::new();
        let forwarder = tokio::spawn(forward_frames(link, frames, cancel.clone(), abort.clone()));
        info!("📝 Transcription session opened");

        Ok(Self {
            events: event_rx,
            cancel,
            abort,
            forwarder: Some(forwarder),
            closed: false,
        })
    }

    /// Next provider message. `None` once the provider dropped its sender or the session is closed.
    pub async fn next_message(&mut self) -> Option<TranscriptionMessage> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    /// Stop forwarding, finish the provider session and return any events it
    /// produced while flushing. Calling it again returns nothing.
    pub async fn close(&mut self) -> Vec<TranscriptEvent> {
        if self.closed {
            return Vec::new();
        }
        self.closed = true;
        self.cancel.cancel();

        if let Some(forwarder) = self.forwarder.take() {
            if let Err(e) = forwarder.await {
                warn!("Transcription forwarder ended abnormally: {}", e);
            }
        }

        let mut trailing = Vec::new();
        while let Ok(message) = self.events.try_recv() {
            match message {
                TranscriptionMessage::Event(event) => trailing.push(event),
                TranscriptionMessage::Error(e) => warn!("Transcription error while closing: {}", e),
            }
        }
        self.events.close();
        debug!("Transcription session closed ({} trailing events)", trailing.len());
        trailing
    }

    /// Close without flushing: the provider link is aborted and pending
    /// events are dropped. Returns immediately.
    pub fn abort(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.abort.cancel();
        // Detached: the forwarder only has to call `abort()` on the link.
        self.forwarder.take();
        self.events.close();
        debug!("Transcription session aborted");
    }
}

impl Drop for TranscriptionSession {
    fn drop(&mut self) {
        if !self.closed {
            self.abort.cancel();
        }
    }
}

async fn forward_frames(
    mut link: Box<dyn TranscriptionLink>,
    mut frames: mpsc::Receiver<PcmFrame>,
    cancel: CancellationToken,
    abort: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = abort.cancelled() => {
                link.abort();
                return;
            }
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = link.send_frame(frame).await {
                        warn!("Transcription send failed: {}", e);
                        break;
                    }
                }
                None => break,
            },
        }
    }

    let finished = tokio::select! {
        biased;
        _ = abort.cancelled() => None,
        result = link.finish() => Some(result),
    };
    match finished {
        Some(Ok(())) => {}
        Some(Err(e)) => warn!("Transcription finish failed: {}", e),
        None => link.abort(),
    }
}
