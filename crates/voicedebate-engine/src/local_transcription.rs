//! On-device transcription provider: local VAD plus a segment recognizer.
//!
//! Each session runs WebRTC VAD on a dedicated thread (the detector is not
//! `Send`), reports voice activity every few frames, and sends each committed
//! segment to a `SpeechRecognizer`. Recognized text arrives as a final event.

use crate::audio::PcmFrame;
use crate::error::{VoiceError, VoiceResult};
use crate::segment::{SegmentEvent, SegmenterConfig, SpeechSegmenter};
use crate::stt::SpeechRecognizer;
use crate::transcription::{
    TranscriptEvent, TranscriptionLink, TranscriptionMessage, TranscriptionOptions,
    TranscriptionProvider,
};
use crate::vad::{VadConfig, VadDetector};
use async_trait::async_trait;
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Configuration for the local provider.
#[derive(Debug, Clone)]
pub struct LocalTranscriptionConfig {
    /// WebRTC aggressiveness (0-3, default 2).
    pub vad_mode: u8,
    pub segmenter: SegmenterConfig,
    /// Frames between voice-activity reports (default 5 = 150ms at 30ms frames).
    pub activity_every: u32,
}

impl Default for LocalTranscriptionConfig {
    fn default() -> Self {
        Self {
            vad_mode: 2,
            segmenter: SegmenterConfig::default(),
            activity_every: 5,
        }
    }
}

/// Transcription provider backed by local VAD and a `SpeechRecognizer`.
pub struct VadTranscriptionProvider {
    recognizer: Arc<dyn SpeechRecognizer>,
    config: LocalTranscriptionConfig,
}

impl VadTranscriptionProvider {
    pub fn new(recognizer: Arc<dyn SpeechRecognizer>, config: LocalTranscriptionConfig) -> Self {
        Self { recognizer, config }
    }
}

#[async_trait]
impl TranscriptionProvider for VadTranscriptionProvider {
    async fn open(
        &self,
        options: TranscriptionOptions,
        events: mpsc::UnboundedSender<TranscriptionMessage>,
    ) -> VoiceResult<Box<dyn TranscriptionLink>> {
        let vad_config = VadConfig {
            sample_rate: options.sample_rate,
            mode: self.config.vad_mode,
            frame_ms: options.frame_ms,
        };
        vad_config.validate()?;

        let (frame_tx, frame_rx) = std_mpsc::channel::<PcmFrame>();
        let pending = Arc::new(Mutex::new(PendingRecognitions::default()));
        let worker = VadWorker {
            vad_config,
            segmenter: SpeechSegmenter::new(self.config.segmenter.clone()),
            activity_every: self.config.activity_every.max(1),
            recognizer: Arc::clone(&self.recognizer),
            events,
            pending: Arc::clone(&pending),
            runtime: Handle::current(),
        };

        let handle = thread::Builder::new()
            .name("voicedebate-vad".to_string())
            .spawn(move || worker.run(frame_rx))?;

        info!("🎙️ Local transcription session opened ({}ms frames)", options.frame_ms);
        Ok(Box::new(VadLink {
            frames: Some(frame_tx),
            worker: Some(handle),
            pending,
            finished: false,
        }))
    }
}

/// Recognitions spawned by the VAD worker. Once aborted, nothing new is spawned.
#[derive(Default)]
struct PendingRecognitions {
    tasks: Vec<JoinHandle<()>>,
    aborted: bool,
}

struct VadLink {
    frames: Option<std_mpsc::Sender<PcmFrame>>,
    worker: Option<thread::JoinHandle<()>>,
    pending: Arc<Mutex<PendingRecognitions>>,
    finished: bool,
}

#[async_trait]
impl TranscriptionLink for VadLink {
    async fn send_frame(&mut self, frame: PcmFrame) -> VoiceResult<()> {
        let frames = self
            .frames
            .as_ref()
            .ok_or_else(|| VoiceError::ChannelSend("transcription session finished".to_string()))?;
        frames
            .send(frame)
            .map_err(|_| VoiceError::ChannelSend("VAD worker stopped".to_string()))
    }

    async fn finish(&mut self) -> VoiceResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        // Closing the frame channel makes the worker flush its open segment and exit.
        self.frames = None;

        if let Some(worker) = self.worker.take() {
            tokio::task::spawn_blocking(move || worker.join())
                .await
                .map_err(|e| VoiceError::Transcription(format!("VAD join failed: {}", e)))?
                .map_err(|_| VoiceError::Transcription("VAD worker panicked".to_string()))?;
        }

        let recognitions = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|e| VoiceError::Transcription(format!("pending lock poisoned: {}", e)))?;
            std::mem::take(&mut pending.tasks)
        };
        for recognition in recognitions {
            if let Err(e) = recognition.await {
                warn!("Recognition task failed: {}", e);
            }
        }
        debug!("Local transcription session finished");
        Ok(())
    }

    fn abort(&mut self) {
        self.finished = true;
        self.frames = None;
        // The worker exits on its own once the frame channel is closed.
        self.worker.take();

        match self.pending.lock() {
            Ok(mut pending) => {
                pending.aborted = true;
                let count = pending.tasks.len();
                for task in pending.tasks.drain(..) {
                    task.abort();
                }
                debug!("Local transcription session aborted ({} recognitions cancelled)", count);
            }
            Err(e) => warn!("pending lock poisoned, recognitions left running: {}", e),
        }
    }
}

struct VadWorker {
    vad_config: VadConfig,
    segmenter: SpeechSegmenter,
    activity_every: u32,
    recognizer: Arc<dyn SpeechRecognizer>,
    events: mpsc::UnboundedSender<TranscriptionMessage>,
    pending: Arc<Mutex<PendingRecognitions>>,
    runtime: Handle,
}

impl VadWorker {
    fn run(mut self, frames: std_mpsc::Receiver<PcmFrame>) {
        let mut vad = match VadDetector::new(self.vad_config.clone()) {
            Ok(v) => v,
            Err(e) => {
                error!("VAD init failed: {}", e);
                let _ = self.events.send(TranscriptionMessage::Error(e.to_string()));
                return;
            }
        };

        let mut frame_count: u32 = 0;
        let mut was_speaking = false;

        while let Ok(frame) = frames.recv() {
            if frame.samples.len() != vad.frame_samples() {
                debug!(
                    "Skipping frame of {} samples (VAD wants {})",
                    frame.samples.len(),
                    vad.frame_samples()
                );
                continue;
            }
            let is_speech = vad.is_speech(&frame.samples).unwrap_or_else(|e| {
                debug!("VAD error, treating frame as silence: {}", e);
                false
            });

            if let Some(SegmentEvent::Committed { samples, .. }) =
                self.segmenter.push(is_speech, &frame.samples, frame.duration())
            {
                self.recognize(samples, frame.sample_rate);
            }

            frame_count = frame_count.wrapping_add(1);
            let speaking = self.segmenter.is_speaking();
            if speaking != was_speaking || frame_count % self.activity_every == 0 {
                was_speaking = speaking;
                let event = TranscriptEvent::activity(speaking, self.segmenter.silence());
                if self.events.send(TranscriptionMessage::Event(event)).is_err() {
                    break;
                }
            }
        }

        if let Some(SegmentEvent::Committed { samples, .. }) = self.segmenter.flush() {
            self.recognize(samples, self.vad_config.sample_rate);
        }
        debug!("VAD worker exiting after {} frames", frame_count);
    }

    fn recognize(&self, samples: Vec<i16>, sample_rate: u32) {
        let mut pending = match self.pending.lock() {
            Ok(pending) => pending,
            Err(e) => {
                warn!("pending lock poisoned, segment dropped: {}", e);
                return;
            }
        };
        if pending.aborted {
            debug!("Session aborted, segment of {} samples not recognized", samples.len());
            return;
        }

        let recognizer = Arc::clone(&self.recognizer);
        let events = self.events.clone();
        let task = self.runtime.spawn(async move {
            let message = match recognizer.recognize(&samples, sample_rate).await {
                Ok(text) => TranscriptionMessage::Event(TranscriptEvent::final_text(text)),
                Err(e) => {
                    warn!("Segment recognition failed: {}", e);
                    TranscriptionMessage::Error(e.to_string())
                }
            };
            let _ = events.send(message);
        });
        pending.tasks.push(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::PlaceholderRecognizer;
    use crate::transcription::TranscriptionSession;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silence_reports_activity_and_no_text() {
        let provider = VadTranscriptionProvider::new(
            Arc::new(PlaceholderRecognizer::with_response("never")),
            LocalTranscriptionConfig::default(),
        );
        let (tx, rx) = mpsc::channel(128);
        let mut session = TranscriptionSession::open(&provider, TranscriptionOptions::default(), rx)
            .await
            .unwrap();

        for _ in 0..20 {
            tx.send(PcmFrame::silence(480, 16000)).await.unwrap();
        }
        drop(tx);

        let mut last_silence = Duration::ZERO;
        let mut texts = Vec::new();
        while let Some(message) = session.next_message().await {
            if let TranscriptionMessage::Event(event) = message {
                assert!(!event.is_speaking);
                last_silence = event.silence;
                if event.is_final {
                    texts.push(event.text);
                }
            }
        }
        for event in session.close().await {
            assert!(!event.is_final);
        }
        assert!(texts.is_empty());
        assert_eq!(last_silence, Duration::from_millis(600));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unsupported_rate_fails_to_open() {
        let provider = VadTranscriptionProvider::new(
            Arc::new(PlaceholderRecognizer::new()),
            LocalTranscriptionConfig::default(),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let options = TranscriptionOptions {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(provider.open(options, tx).await.is_err());
    }

    /// Flags `dropped` when its future is dropped.
    struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn abort_cancels_pending_recognitions() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = DropFlag(Arc::clone(&dropped));
        let stuck = tokio::spawn(async move {
            let _flag = flag;
            std::future::pending::<()>().await
        });

        let (frame_tx, _frame_rx) = std_mpsc::channel();
        let pending = Arc::new(Mutex::new(PendingRecognitions {
            tasks: vec![stuck],
            aborted: false,
        }));
        let mut link = VadLink {
            frames: Some(frame_tx),
            worker: None,
            pending: Arc::clone(&pending),
            finished: false,
        };

        link.abort();
        tokio::time::timeout(Duration::from_secs(1), async {
            while !dropped.load(std::sync::atomic::Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("recognition still running after abort");

        assert!(pending.lock().unwrap().aborted);
        assert!(pending.lock().unwrap().tasks.is_empty());
        assert!(link.send_frame(PcmFrame::silence(480, 16000)).await.is_err());
        link.finish().await.unwrap();
    }
}
