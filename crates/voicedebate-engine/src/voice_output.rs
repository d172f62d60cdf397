//! **Voice output**: synthesis, scoped audio files and stoppable playback.
//!
//! `SynthesisPlayer::speak` runs one reply end to end on a background task and
//! always reports a `PlaybackComplete` tagged with the caller's epoch, whether
//! the audio played, was cut off, or never existed.

use crate::character::VoiceParams;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use rodio::{Decoder, OutputStream, Sink};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const ELEVENLABS_API_BASE: &str = "https://api.elevenlabs.io/v1";
const ELEVENLABS_MODEL: &str = "eleven_monolingual_v1";

/// One synthesis request.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: VoiceParams,
}

/// Backend that turns text into encoded audio (MP3/WAV). Empty bytes = nothing to play.
#[async_trait]
pub trait SynthesisProvider: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> VoiceResult<Vec<u8>>;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl SynthesisProvider for PlaceholderTts {
    async fn synthesize(&self, _request: &SynthesisRequest) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// ElevenLabs streaming text-to-speech.
#[derive(Debug, Clone)]
pub struct ElevenLabsTts {
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl ElevenLabsTts {
    pub fn new(api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        Ok(Self {
            api_key: api_key.into().trim().to_string(),
            base_url: ELEVENLABS_API_BASE.to_string(),
            model: ELEVENLABS_MODEL.to_string(),
            client,
        })
    }

    fn body(&self, request: &SynthesisRequest) -> serde_json::Value {
        serde_json::json!({
            "text": request.text.trim(),
            "model_id": self.model,
            "voice_settings": {
                "stability": request.voice.stability,
                "similarity_boost": request.voice.clarity,
                "style": request.voice.style,
                "use_speaker_boost": true,
            },
        })
    }
}

#[async_trait]
impl SynthesisProvider for ElevenLabsTts {
    async fn synthesize(&self, request: &SynthesisRequest) -> VoiceResult<Vec<u8>> {
        if request.text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "{}/text-to-speech/{}/stream",
            self.base_url.trim_end_matches('/'),
            request.voice.voice_id
        );
        let res = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
        debug!("Synthesized {} bytes for voice {}", bytes.len(), request.voice.voice_id);
        Ok(bytes.to_vec())
    }
}

/// How a playback attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Audio played to the end.
    Finished,
    /// Cancelled before or during playback.
    Stopped,
    /// Nothing to play: empty or failed synthesis, or the audio file could not be written.
    Skipped,
    /// The audio device or decoder failed.
    Failed,
}

/// Completion signal for one `speak` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackComplete {
    pub epoch: u64,
    pub outcome: PlaybackOutcome,
}

/// Plays an audio file until it ends or `cancel` fires.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    async fn play(&self, path: &Path, cancel: CancellationToken) -> VoiceResult<PlaybackOutcome>;
}

/// Default output device via rodio. The output stream lives on a blocking thread for the duration of one file.
#[derive(Debug, Clone)]
pub struct RodioPlayer {
    poll_interval: Duration,
}

impl Default for RodioPlayer {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(20),
        }
    }
}

impl RodioPlayer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AudioPlayer for RodioPlayer {
    async fn play(&self, path: &Path, cancel: CancellationToken) -> VoiceResult<PlaybackOutcome> {
        let path = path.to_path_buf();
        let poll = self.poll_interval;

        tokio::task::spawn_blocking(move || {
            let (_stream, handle) =
                OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
            let sink = Sink::try_new(&handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
            let file = File::open(&path)?;
            let source = Decoder::new(BufReader::new(file))
                .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
            sink.append(source);
            info!("🔊 Playing {}", path.display());

            loop {
                if cancel.is_cancelled() {
                    sink.stop();
                    info!("🔇 Playback stopped");
                    return Ok(PlaybackOutcome::Stopped);
                }
                if sink.empty() {
                    return Ok(PlaybackOutcome::Finished);
                }
                std::thread::sleep(poll);
            }
        })
        .await
        .map_err(|e| VoiceError::Playback(format!("playback task failed: {}", e)))?
    }
}

/// Synthesizes a reply, stages it in a scoped temp file and plays it.
#[derive(Clone)]
pub struct SynthesisPlayer {
    synthesis: Arc<dyn SynthesisProvider>,
    player: Arc<dyn AudioPlayer>,
    audio_dir: PathBuf,
}

impl SynthesisPlayer {
    pub fn new(
        synthesis: Arc<dyn SynthesisProvider>,
        player: Arc<dyn AudioPlayer>,
        audio_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            synthesis,
            player,
            audio_dir: audio_dir.into(),
        }
    }

    /// Voice `text` on a background task; `done` receives the completion tagged with `epoch`.
    pub fn speak(
        &self,
        text: String,
        voice: VoiceParams,
        epoch: u64,
        cancel: CancellationToken,
        done: mpsc::UnboundedSender<PlaybackComplete>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.speak_now(SynthesisRequest { text, voice }, cancel).await;
            debug!("Playback for epoch {} ended: {:?}", epoch, outcome);
            let _ = done.send(PlaybackComplete { epoch, outcome });
        })
    }

    /// Run synthesis and playback inline. Every failure degrades to an outcome.
    pub async fn speak_now(&self, request: SynthesisRequest, cancel: CancellationToken) -> PlaybackOutcome {
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PlaybackOutcome::Stopped,
            result = self.synthesis.synthesize(&request) => match result {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Synthesis failed, skipping playback: {}", e);
                    return PlaybackOutcome::Skipped;
                }
            },
        };
        if bytes.is_empty() {
            info!("Synthesis returned no audio, skipping playback");
            return PlaybackOutcome::Skipped;
        }

        // Removed when dropped at the end of this call, on every path.
        let file = match write_scoped_audio(&self.audio_dir, &bytes) {
            Ok(file) => file,
            Err(e) => {
                warn!("{}", e);
                return PlaybackOutcome::Skipped;
            }
        };

        match self.player.play(file.path(), cancel).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Audio playback failed: {}", e);
                PlaybackOutcome::Failed
            }
        }
    }
}

fn write_scoped_audio(dir: &Path, bytes: &[u8]) -> VoiceResult<tempfile::NamedTempFile> {
    let resource = |e: std::io::Error| {
        VoiceError::Resource(format!("could not stage audio in {}: {}", dir.display(), e))
    };
    let mut file = tempfile::Builder::new()
        .prefix("voicedebate-")
        .suffix(".mp3")
        .tempfile_in(dir)
        .map_err(resource)?;
    file.write_all(bytes).map_err(resource)?;
    file.flush().map_err(resource)?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedTts(Vec<u8>);

    #[async_trait]
    impl SynthesisProvider for FixedTts {
        async fn synthesize(&self, _request: &SynthesisRequest) -> VoiceResult<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingPlayer {
        played: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    }

    #[async_trait]
    impl AudioPlayer for RecordingPlayer {
        async fn play(&self, path: &Path, _cancel: CancellationToken) -> VoiceResult<PlaybackOutcome> {
            let bytes = std::fs::read(path)?;
            self.played.lock().unwrap().push((path.to_path_buf(), bytes));
            Ok(PlaybackOutcome::Finished)
        }
    }

    fn request() -> SynthesisRequest {
        SynthesisRequest {
            text: "Know thyself.".to_string(),
            voice: VoiceParams::new("voice", 0.5, 0.75),
        }
    }

    #[tokio::test]
    async fn audio_file_is_removed_after_playback() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(RecordingPlayer::default());
        let speaker = SynthesisPlayer::new(Arc::new(FixedTts(vec![1, 2, 3])), player.clone(), dir.path());

        let outcome = speaker.speak_now(request(), CancellationToken::new()).await;
        assert_eq!(outcome, PlaybackOutcome::Finished);

        let played = player.played.lock().unwrap();
        assert_eq!(played[0].1, vec![1, 2, 3]);
        assert!(!played[0].0.exists());
    }

    #[tokio::test]
    async fn empty_audio_skips_player_and_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let player = Arc::new(RecordingPlayer::default());
        let speaker = SynthesisPlayer::new(Arc::new(PlaceholderTts), player.clone(), dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();

        speaker
            .speak("hi".to_string(), VoiceParams::new("v", 0.5, 0.5), 9, CancellationToken::new(), tx)
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await,
            Some(PlaybackComplete {
                epoch: 9,
                outcome: PlaybackOutcome::Skipped
            })
        );
        assert!(player.played.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unwritable_dir_is_a_skipped_resource_failure() {
        let player = Arc::new(RecordingPlayer::default());
        let speaker = SynthesisPlayer::new(
            Arc::new(FixedTts(vec![1])),
            player,
            "/nonexistent/voicedebate/audio",
        );
        let outcome = speaker.speak_now(request(), CancellationToken::new()).await;
        assert_eq!(outcome, PlaybackOutcome::Skipped);
    }

    #[tokio::test]
    async fn cancelled_before_synthesis_is_stopped() {
        let speaker = SynthesisPlayer::new(
            Arc::new(FixedTts(vec![1])),
            Arc::new(RecordingPlayer::default()),
            std::env::temp_dir(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(speaker.speak_now(request(), cancel).await, PlaybackOutcome::Stopped);
    }

    #[test]
    fn elevenlabs_body_maps_voice_settings() {
        let tts = ElevenLabsTts::new("key").unwrap();
        let body = tts.body(&request());
        assert_eq!(body["model_id"], "eleven_monolingual_v1");
        assert_eq!(body["voice_settings"]["similarity_boost"], 0.75);
        assert_eq!(body["voice_settings"]["use_speaker_boost"], true);
    }
}
