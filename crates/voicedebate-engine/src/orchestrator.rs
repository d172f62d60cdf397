//! Conversation Orchestrator - the turn-taking state machine
//!
//! One task owns the conversation state and reacts to commands, transcript
//! events, finished generations, playback completions and restart timers.
//! Every asynchronous result is tagged with the epoch it was started under;
//! results from an older epoch are dropped without touching state.
//!
//! ```text
//!   Idle ──start──▶ Listening ──silence ≥ threshold / end_turn──▶ Processing
//!    ▲                                                   │ empty      │ text
//!    │◀──────────────────────────────────────────────────┘            ▼
//!    │◀──playback complete (restart after delay)──────────────── Responding
//!    └◀──stop (any state)
//! ```

use crate::audio::AudioCaptureStream;
use crate::character::CharacterProfile;
use crate::context::EngineContext;
use crate::error::{VoiceError, VoiceResult};
use crate::history::ChatMessage;
use crate::response::{Reply, ReplySource, ResponseGenerator, ResponseSettings};
use crate::session_log::USER_SPEAKER;
use crate::transcription::{
    TranscriptBuffer, TranscriptEvent, TranscriptSnapshot, TranscriptionMessage, TranscriptionSession,
};
use crate::turn::TurnEndpointer;
use crate::voice_output::{PlaybackComplete, PlaybackOutcome, SynthesisPlayer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the conversation is in its turn cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationState {
    Idle,
    Listening,
    Processing,
    Responding,
}

/// Notifications for UIs and tests.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    StateChanged(ConversationState),
    CharacterSelected(String),
    Transcript(TranscriptSnapshot),
    UserTurn(String),
    AssistantTurn {
        character: String,
        text: String,
        source: ReplySource,
    },
    PlaybackFinished {
        epoch: u64,
        outcome: PlaybackOutcome,
    },
    /// Recoverable failure; the conversation keeps going.
    Error(String),
}

enum Command {
    SelectCharacter {
        name: String,
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    Start {
        reply: oneshot::Sender<VoiceResult<()>>,
    },
    EndTurn {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    ResetHistory {
        reply: oneshot::Sender<()>,
    },
    History {
        reply: oneshot::Sender<Vec<ChatMessage>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// A finished (or cancelled) generation, returning the generator it borrowed.
/// The exchange is not in the generator's history yet.
struct Generated {
    epoch: u64,
    selection: u64,
    generator: ResponseGenerator,
    user_text: String,
    reply: Option<Reply>,
}

/// Cloneable control surface for a running orchestrator.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConversationState>,
    transcript: watch::Receiver<TranscriptSnapshot>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> VoiceResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| VoiceError::ChannelSend("orchestrator is not running".to_string()))?;
        rx.await
            .map_err(|_| VoiceError::ChannelReceive("orchestrator dropped the request".to_string()))
    }

    /// Select a character by name. Cancels any active turn, starts a fresh history and begins listening.
    pub async fn select_character(&self, name: &str) -> VoiceResult<()> {
        let name = name.to_string();
        self.request(|reply| Command::SelectCharacter { name, reply }).await?
    }

    /// Begin listening with the current character. No-op unless Idle.
    pub async fn start(&self) -> VoiceResult<()> {
        self.request(|reply| Command::Start { reply }).await?
    }

    /// Stop listening and answer what has been said so far.
    pub async fn end_turn(&self) -> VoiceResult<()> {
        self.request(|reply| Command::EndTurn { reply }).await
    }

    /// Cancel everything in flight and return to Idle. Safe to call at any time.
    pub async fn stop(&self) -> VoiceResult<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn reset_history(&self) -> VoiceResult<()> {
        self.request(|reply| Command::ResetHistory { reply }).await
    }

    /// Snapshot of the current character's conversation history.
    pub async fn history(&self) -> VoiceResult<Vec<ChatMessage>> {
        self.request(|reply| Command::History { reply }).await
    }

    pub async fn shutdown(&self) -> VoiceResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn state(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> ConversationState {
        *self.state.borrow()
    }

    /// Live caption for the current turn.
    pub fn transcript(&self) -> watch::Receiver<TranscriptSnapshot> {
        self.transcript.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }
}

/// The conversation state machine. Create with `new` and drive with `run`, or use `spawn`.
pub struct ConversationOrchestrator {
    ctx: EngineContext,
    capture: AudioCaptureStream,
    session: Option<TranscriptionSession>,
    buffer: TranscriptBuffer,
    endpointer: TurnEndpointer,
    speaker: SynthesisPlayer,

    character: Option<Arc<CharacterProfile>>,
    /// `None` while lent to a generation task.
    generator: Option<ResponseGenerator>,
    /// History as it was when the generator was lent.
    history_on_loan: Vec<ChatMessage>,
    /// Bumped on every character selection, so a returning generator for an old character is dropped.
    selection: u64,
    history_reset_pending: bool,

    state: ConversationState,
    epoch: u64,
    turn_cancel: CancellationToken,
    restart_pending: bool,

    commands: mpsc::Receiver<Command>,
    generated_tx: mpsc::UnboundedSender<Generated>,
    generated_rx: mpsc::UnboundedReceiver<Generated>,
    playback_tx: mpsc::UnboundedSender<PlaybackComplete>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackComplete>,
    restart_tx: mpsc::UnboundedSender<u64>,
    restart_rx: mpsc::UnboundedReceiver<u64>,

    state_tx: watch::Sender<ConversationState>,
    transcript_tx: watch::Sender<TranscriptSnapshot>,
    events_tx: broadcast::Sender<OrchestratorEvent>,
}

enum Step {
    Command(Command),
    Transcription(Option<TranscriptionMessage>),
    Generated(Generated),
    Playback(PlaybackComplete),
    Restart(u64),
    Closed,
}

async fn next_transcription(session: &mut Option<TranscriptionSession>) -> Option<TranscriptionMessage> {
    match session {
        Some(session) => session.next_message().await,
        None => std::future::pending().await,
    }
}

impl ConversationOrchestrator {
    pub fn new(ctx: EngineContext) -> (Self, OrchestratorHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (generated_tx, generated_rx) = mpsc::unbounded_channel();
        let (playback_tx, playback_rx) = mpsc::unbounded_channel();
        let (restart_tx, restart_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConversationState::Idle);
        let (transcript_tx, transcript_rx) = watch::channel(TranscriptSnapshot::default());
        let (events_tx, _) = broadcast::channel(128);

        let capture = AudioCaptureStream::new(ctx.audio_input.clone(), ctx.audio_config());
        let speaker = SynthesisPlayer::new(ctx.synthesis.clone(), ctx.player.clone(), ctx.config.audio_dir());
        let endpointer = TurnEndpointer::new(ctx.config.silence_threshold());

        let handle = OrchestratorHandle {
            commands: command_tx,
            state: state_rx,
            transcript: transcript_rx,
            events: events_tx.clone(),
        };

        let orchestrator = Self {
            ctx,
            capture,
            session: None,
            buffer: TranscriptBuffer::new(),
            endpointer,
            speaker,
            character: None,
            generator: None,
            history_on_loan: Vec::new(),
            selection: 0,
            history_reset_pending: false,
            state: ConversationState::Idle,
            epoch: 0,
            turn_cancel: CancellationToken::new(),
            restart_pending: false,
            commands: command_rx,
            generated_tx,
            generated_rx,
            playback_tx,
            playback_rx,
            restart_tx,
            restart_rx,
            state_tx,
            transcript_tx,
            events_tx,
        };
        (orchestrator, handle)
    }

    /// Run on the current runtime and return the control handle.
    pub fn spawn(ctx: EngineContext) -> (OrchestratorHandle, JoinHandle<()>) {
        let (orchestrator, handle) = Self::new(ctx);
        let task = tokio::spawn(orchestrator.run());
        (handle, task)
    }

    /// Event loop. Returns after `shutdown` or when every handle is dropped.
    pub async fn run(mut self) {
        info!("🎭 Conversation orchestrator running");
        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::Closed,
                },
                message = next_transcription(&mut self.session) => Step::Transcription(message),
                Some(generated) = self.generated_rx.recv() => Step::Generated(generated),
                Some(done) = self.playback_rx.recv() => Step::Playback(done),
                Some(epoch) = self.restart_rx.recv() => Step::Restart(epoch),
            };

            match step {
                Step::Command(Command::Shutdown { reply }) => {
                    self.shutdown_now();
                    let _ = reply.send(());
                    break;
                }
                Step::Command(command) => self.on_command(command).await,
                Step::Transcription(message) => self.on_transcription(message).await,
                Step::Generated(generated) => self.on_generated(generated),
                Step::Playback(done) => self.on_playback(done),
                Step::Restart(epoch) => self.on_restart(epoch).await,
                Step::Closed => {
                    self.shutdown_now();
                    break;
                }
            }
        }
        info!("🛑 Conversation orchestrator stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SelectCharacter { name, reply } => {
                let result = self.select_character(&name).await;
                let _ = reply.send(result);
            }
            Command::Start { reply } => {
                let result = self.start_requested().await;
                let _ = reply.send(result);
            }
            Command::EndTurn { reply } => {
                if self.state == ConversationState::Listening {
                    info!("⏹️ Turn ended by request");
                    self.end_turn(false).await;
                }
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(());
            }
            Command::ResetHistory { reply } => {
                match self.generator.as_mut() {
                    Some(generator) => generator.clear_history(),
                    None => {
                        self.history_reset_pending = true;
                        self.history_on_loan.clear();
                    }
                }
                info!("🧹 Conversation history cleared");
                let _ = reply.send(());
            }
            Command::History { reply } => {
                let history = match self.generator.as_ref() {
                    Some(generator) => generator.history().messages().to_vec(),
                    None => self.history_on_loan.clone(),
                };
                let _ = reply.send(history);
            }
            Command::Shutdown { reply } => {
                // Handled in run(); kept for exhaustiveness.
                let _ = reply.send(());
            }
        }
    }

    async fn select_character(&mut self, name: &str) -> VoiceResult<()> {
        let profile = self.ctx.characters.lookup(name)?;
        let llm = self.ctx.llms.resolve(&profile.provider)?;

        self.stop();
        if let Some(previous) = self.character.take() {
            info!("Switching character from {} to {}", previous.name, profile.name);
            self.ctx.logger.end_conversation();
        }

        self.selection += 1;
        self.history_reset_pending = false;
        self.history_on_loan.clear();
        self.generator = Some(ResponseGenerator::new(
            Arc::clone(&profile),
            llm,
            (self.ctx.decisions)(),
            ResponseSettings::from(&self.ctx.config),
        ));
        self.ctx.logger.start_conversation(&profile.name);
        info!("🎭 Selected character: {} ({} / {})", profile.name, profile.provider, profile.model);
        self.emit(OrchestratorEvent::CharacterSelected(profile.name.clone()));
        self.character = Some(profile);

        self.start_listening().await
    }

    async fn start_requested(&mut self) -> VoiceResult<()> {
        if self.character.is_none() {
            return Err(VoiceError::Config("no character selected".to_string()));
        }
        if self.state != ConversationState::Idle {
            debug!("Start ignored in {:?}", self.state);
            return Ok(());
        }
        self.start_listening().await
    }

    /// Idle -> Listening: new epoch, clean buffer, capture and transcription opened.
    async fn start_listening(&mut self) -> VoiceResult<()> {
        self.restart_pending = false;
        self.epoch += 1;
        self.turn_cancel = CancellationToken::new();
        self.buffer.reset();
        self.endpointer.reset();
        self.publish_transcript();

        let frames = match self.capture.start() {
            Ok(frames) => frames,
            Err(e) => {
                error!("Failed to start audio capture: {}", e);
                self.emit(OrchestratorEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let options = self.ctx.transcription_options();
        match TranscriptionSession::open(self.ctx.transcription.as_ref(), options, frames).await {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                self.capture.stop();
                error!("Failed to open transcription session: {}", e);
                self.emit(OrchestratorEvent::Error(e.to_string()));
                return Err(e);
            }
        }

        info!("👂 Listening (epoch {})", self.epoch);
        self.set_state(ConversationState::Listening);
        Ok(())
    }

    async fn on_transcription(&mut self, message: Option<TranscriptionMessage>) {
        if self.state != ConversationState::Listening {
            if let Some(mut session) = self.session.take() {
                session.abort();
            }
            return;
        }
        match message {
            Some(TranscriptionMessage::Event(event)) => {
                self.apply_transcript(&event);
                if self.endpointer.observe(event.is_speaking, event.silence) {
                    self.end_turn(false).await;
                }
            }
            Some(TranscriptionMessage::Error(e)) => {
                error!("Transcription failed, discarding turn: {}", e);
                self.emit(OrchestratorEvent::Error(format!("transcription: {}", e)));
                self.end_turn(true).await;
            }
            None => {
                warn!("Transcription stream closed by provider");
                self.end_turn(false).await;
            }
        }
    }

    fn apply_transcript(&mut self, event: &TranscriptEvent) {
        if self.buffer.apply(event) {
            self.publish_transcript();
        }
    }

    /// Listening -> Processing, then Responding or back to Idle.
    async fn end_turn(&mut self, failed: bool) {
        if self.state != ConversationState::Listening {
            return;
        }
        self.capture.stop();
        if let Some(mut session) = self.session.take() {
            for event in session.close().await {
                self.apply_transcript(&event);
            }
        }

        let text = self.buffer.take_final();
        self.publish_transcript();
        self.set_state(ConversationState::Processing);

        if failed || text.trim().is_empty() {
            info!("Nothing to answer this turn");
            self.set_state(ConversationState::Idle);
            return;
        }

        info!("🗣️ User: {}", text);
        self.ctx.logger.append(USER_SPEAKER, &text, None);
        self.emit(OrchestratorEvent::UserTurn(text.clone()));
        self.begin_response(text);
    }

    fn begin_response(&mut self, text: String) {
        let Some(mut generator) = self.generator.take() else {
            warn!("No response generator available, dropping turn");
            self.set_state(ConversationState::Idle);
            return;
        };
        if std::mem::take(&mut self.history_reset_pending) {
            generator.clear_history();
        }
        self.history_on_loan = generator.history().messages().to_vec();

        self.set_state(ConversationState::Responding);
        let epoch = self.epoch;
        let selection = self.selection;
        let cancel = self.turn_cancel.clone();
        let done = self.generated_tx.clone();

        tokio::spawn(async move {
            let reply = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                reply = generator.draft(&text) => Some(reply),
            };
            let _ = done.send(Generated {
                epoch,
                selection,
                generator,
                user_text: text,
                reply,
            });
        });
    }

    fn on_generated(&mut self, generated: Generated) {
        let Generated {
            epoch,
            selection,
            mut generator,
            user_text,
            reply,
        } = generated;

        let current = epoch == self.epoch && self.state == ConversationState::Responding;
        if selection == self.selection && self.generator.is_none() {
            if std::mem::take(&mut self.history_reset_pending) {
                generator.clear_history();
            }
            match reply.as_ref() {
                Some(reply) if current => generator.commit(&user_text, reply),
                _ => {}
            }
            self.history_on_loan.clear();
            self.generator = Some(generator);
        }

        if !current {
            debug!("Discarding reply from stale epoch {}", epoch);
            return;
        }
        let (Some(reply), Some(profile)) = (reply, self.character.clone()) else {
            return;
        };

        info!("🤖 {}: {}", profile.name, reply.text);
        self.ctx
            .logger
            .append(&profile.name, &reply.text, reply.model_tag.as_deref());
        self.emit(OrchestratorEvent::AssistantTurn {
            character: profile.name.clone(),
            text: reply.text.clone(),
            source: reply.source,
        });

        self.speaker.speak(
            reply.text,
            profile.voice.clone(),
            self.epoch,
            self.turn_cancel.clone(),
            self.playback_tx.clone(),
        );
    }

    fn on_playback(&mut self, done: PlaybackComplete) {
        self.emit(OrchestratorEvent::PlaybackFinished {
            epoch: done.epoch,
            outcome: done.outcome,
        });
        if done.epoch != self.epoch || self.state != ConversationState::Responding {
            debug!("Ignoring playback completion from stale epoch {}", done.epoch);
            return;
        }

        self.set_state(ConversationState::Idle);
        if self.ctx.config.auto_restart {
            self.schedule_restart();
        }
    }

    fn schedule_restart(&mut self) {
        self.restart_pending = true;
        let epoch = self.epoch;
        let delay = self.ctx.config.restart_delay();
        let cancel = self.turn_cancel.clone();
        let due = self.restart_tx.clone();
        debug!("Restart in {:?} (epoch {})", delay, epoch);

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = due.send(epoch);
                }
            }
        });
    }

    async fn on_restart(&mut self, epoch: u64) {
        if epoch != self.epoch || !self.restart_pending || self.state != ConversationState::Idle {
            debug!("Ignoring stale restart for epoch {}", epoch);
            return;
        }
        if let Err(e) = self.start_listening().await {
            warn!("Auto-restart failed, staying idle: {}", e);
        }
    }

    /// Cancel whatever is in flight and return to Idle. No-op when nothing is active.
    fn stop(&mut self) {
        if self.state == ConversationState::Idle && !self.restart_pending && self.session.is_none() {
            debug!("Stop while idle: nothing to do");
            return;
        }

        self.epoch += 1;
        self.turn_cancel.cancel();
        self.restart_pending = false;
        self.capture.stop();
        // Not flushed: a provider's flush may never complete.
        if let Some(mut session) = self.session.take() {
            session.abort();
        }
        self.buffer.reset();
        self.publish_transcript();

        info!("⏹️ Conversation stopped (epoch {})", self.epoch);
        self.set_state(ConversationState::Idle);
    }

    fn shutdown_now(&mut self) {
        self.stop();
        if self.character.take().is_some() {
            self.ctx.logger.end_conversation();
        }
    }

    fn set_state(&mut self, next: ConversationState) {
        if self.state == next {
            return;
        }
        debug!("State {:?} -> {:?}", self.state, next);
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(OrchestratorEvent::StateChanged(next));
    }

    fn publish_transcript(&mut self) {
        let snapshot = self.buffer.snapshot();
        if *self.transcript_tx.borrow() != snapshot {
            self.transcript_tx.send_replace(snapshot.clone());
            self.emit(OrchestratorEvent::Transcript(snapshot));
        }
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}
