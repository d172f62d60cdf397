//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use voicedebate_engine::{
    AudioConfig, AudioInput, AudioPlayer, CaptureGuard, ConversationState, DecisionFactory, DecisionSource,
    EngineConfig, EngineContext, InMemoryCharacterStore, LlmProvider, LlmRegistry, LlmRequest, OrchestratorEvent,
    PcmFrame, PlaybackOutcome, SynthesisProvider, SynthesisRequest, TranscriptEvent, TranscriptionLink,
    TranscriptionMessage, TranscriptionOptions, TranscriptionProvider, VoiceResult,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A microphone that never produces frames. The queue stays open until released.
pub struct SilentInput;

impl AudioInput for SilentInput {
    fn open(&self, _config: &AudioConfig, frames: mpsc::Sender<PcmFrame>) -> VoiceResult<CaptureGuard> {
        Ok(CaptureGuard::new(move || drop(frames)))
    }
}

/// Replays one script per opened session, all at once.
#[derive(Default)]
pub struct ScriptedTranscription {
    scripts: Mutex<VecDeque<Vec<TranscriptionMessage>>>,
    opens: AtomicUsize,
}

impl ScriptedTranscription {
    pub fn new(scripts: Vec<Vec<TranscriptionMessage>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            opens: AtomicUsize::new(0),
        }
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

struct ScriptedLink {
    events: Option<mpsc::UnboundedSender<TranscriptionMessage>>,
}

#[async_trait]
impl TranscriptionLink for ScriptedLink {
    async fn send_frame(&mut self, _frame: PcmFrame) -> VoiceResult<()> {
        Ok(())
    }

    async fn finish(&mut self) -> VoiceResult<()> {
        self.events.take();
        Ok(())
    }

    fn abort(&mut self) {
        self.events.take();
    }
}

#[async_trait]
impl TranscriptionProvider for ScriptedTranscription {
    async fn open(
        &self,
        _options: TranscriptionOptions,
        events: mpsc::UnboundedSender<TranscriptionMessage>,
    ) -> VoiceResult<Box<dyn TranscriptionLink>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        for message in script {
            let _ = events.send(message);
        }
        Ok(Box::new(ScriptedLink { events: Some(events) }))
    }
}

/// Sessions whose flush never completes. Counts aborts.
#[derive(Default)]
pub struct HangingTranscription {
    aborts: Arc<AtomicUsize>,
}

impl HangingTranscription {
    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

struct HangingLink {
    events: Option<mpsc::UnboundedSender<TranscriptionMessage>>,
    aborts: Arc<AtomicUsize>,
}

#[async_trait]
impl TranscriptionLink for HangingLink {
    async fn send_frame(&mut self, _frame: PcmFrame) -> VoiceResult<()> {
        Ok(())
    }

    async fn finish(&mut self) -> VoiceResult<()> {
        std::future::pending().await
    }

    fn abort(&mut self) {
        self.events.take();
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TranscriptionProvider for HangingTranscription {
    async fn open(
        &self,
        _options: TranscriptionOptions,
        events: mpsc::UnboundedSender<TranscriptionMessage>,
    ) -> VoiceResult<Box<dyn TranscriptionLink>> {
        Ok(Box::new(HangingLink {
            events: Some(events),
            aborts: Arc::clone(&self.aborts),
        }))
    }
}

/// A spoken turn: the words, then enough silence to end it.
pub fn spoken(text: &str) -> Vec<TranscriptionMessage> {
    vec![
        TranscriptionMessage::Event(TranscriptEvent::interim(text)),
        TranscriptionMessage::Event(TranscriptEvent::final_text(text)),
        TranscriptionMessage::Event(TranscriptEvent::activity(false, Duration::from_millis(2500))),
    ]
}

/// Replies `Echo: <last user message>` and records every request.
#[derive(Default)]
pub struct EchoLlm {
    pub requests: Mutex<Vec<LlmRequest>>,
}

impl EchoLlm {
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmProvider for EchoLlm {
    async fn complete(&self, request: &LlmRequest) -> VoiceResult<String> {
        self.requests.lock().unwrap().push(request.clone());
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == voicedebate_engine::ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(format!("Echo: {}", last))
    }
}

/// Like `EchoLlm`, but each call waits for `gate` after signalling `started`.
#[derive(Default)]
pub struct GatedLlm {
    pub requests: Mutex<Vec<LlmRequest>>,
    pub started: Notify,
    pub gate: Notify,
}

#[async_trait]
impl LlmProvider for GatedLlm {
    async fn complete(&self, request: &LlmRequest) -> VoiceResult<String> {
        self.requests.lock().unwrap().push(request.clone());
        self.started.notify_one();
        self.gate.notified().await;
        EchoLlm::default().complete(request).await
    }
}

pub struct FixedTts(pub Vec<u8>);

#[async_trait]
impl SynthesisProvider for FixedTts {
    async fn synthesize(&self, _request: &SynthesisRequest) -> VoiceResult<Vec<u8>> {
        Ok(self.0.clone())
    }
}

pub struct InstantPlayer;

#[async_trait]
impl AudioPlayer for InstantPlayer {
    async fn play(&self, _path: &Path, _cancel: CancellationToken) -> VoiceResult<PlaybackOutcome> {
        Ok(PlaybackOutcome::Finished)
    }
}

/// Blocks until `gate` is notified, ignoring cancellation, then reports Finished.
#[derive(Default)]
pub struct GatedPlayer {
    pub started: Notify,
    pub gate: Notify,
}

#[async_trait]
impl AudioPlayer for GatedPlayer {
    async fn play(&self, _path: &Path, _cancel: CancellationToken) -> VoiceResult<PlaybackOutcome> {
        self.started.notify_one();
        self.gate.notified().await;
        Ok(PlaybackOutcome::Finished)
    }
}

/// Every chance is `answer`, every pick is the first entry.
pub struct Fixed {
    pub answer: bool,
}

impl DecisionSource for Fixed {
    fn chance(&mut self, _probability: f64) -> bool {
        self.answer
    }

    fn pick(&mut self, _len: usize) -> usize {
        0
    }
}

/// Chances answered in order, `false` once exhausted. Picks are the first entry.
pub struct Sequence(pub VecDeque<bool>);

impl DecisionSource for Sequence {
    fn chance(&mut self, _probability: f64) -> bool {
        self.0.pop_front().unwrap_or(false)
    }

    fn pick(&mut self, _len: usize) -> usize {
        0
    }
}

pub fn fixed_decisions(answer: bool) -> DecisionFactory {
    Arc::new(move || Box::new(Fixed { answer }) as Box<dyn DecisionSource>)
}

pub struct Harness {
    pub ctx: EngineContext,
    pub transcription: Arc<ScriptedTranscription>,
    pub llm: Arc<EchoLlm>,
    pub logger: Arc<voicedebate_engine::MemorySessionLogger>,
    pub data_dir: tempfile::TempDir,
}

pub fn harness(
    scripts: Vec<Vec<TranscriptionMessage>>,
    synthesis: Arc<dyn SynthesisProvider>,
    player: Arc<dyn AudioPlayer>,
) -> Harness {
    let data_dir = tempfile::tempdir().unwrap();
    let transcription = Arc::new(ScriptedTranscription::new(scripts));
    let llm = Arc::new(EchoLlm::default());
    let logger = Arc::new(voicedebate_engine::MemorySessionLogger::new());

    let mut llms = LlmRegistry::new();
    llms.register("claude", llm.clone());
    llms.register("gpt", llm.clone());

    let config = EngineConfig {
        data_dir: Some(data_dir.path().to_path_buf()),
        ..EngineConfig::default()
    };

    let ctx = EngineContext::new(
        Arc::new(InMemoryCharacterStore::with_builtins()),
        llms,
        transcription.clone(),
        synthesis,
        Arc::new(SilentInput),
        player,
    )
    .with_logger(logger.clone())
    .with_decisions(fixed_decisions(false))
    .with_config(config);

    Harness {
        ctx,
        transcription,
        llm,
        logger,
        data_dir,
    }
}

/// Wait for the next event matching `pred`, failing after a minute of virtual time.
pub async fn next_matching<F>(events: &mut broadcast::Receiver<OrchestratorEvent>, mut pred: F) -> OrchestratorEvent
where
    F: FnMut(&OrchestratorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Collect state changes until `target` is reached.
pub async fn states_until(
    events: &mut broadcast::Receiver<OrchestratorEvent>,
    target: ConversationState,
) -> Vec<ConversationState> {
    let mut seen = Vec::new();
    loop {
        if let OrchestratorEvent::StateChanged(state) =
            next_matching(events, |e| matches!(e, OrchestratorEvent::StateChanged(_))).await
        {
            seen.push(state);
            if state == target {
                return seen;
            }
        }
    }
}
