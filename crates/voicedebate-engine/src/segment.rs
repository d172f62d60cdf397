//! Speech segmentation from per-frame VAD decisions.
//!
//! Groups speech frames into utterances for the local recognizer: a segment
//! opens on the first speech frame, survives short pauses, and is committed
//! once the pause reaches `gap`. Time is measured in audio, not wall clock, so
//! the segmenter behaves the same on replayed or buffered input.

use std::time::Duration;
use tracing::{debug, info, warn};

/// Events emitted by the segmenter
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// First speech frame of a new segment
    SpeechStarted,

    /// A complete utterance, ready for recognition
    Committed {
        samples: Vec<i16>,
        speech: Duration,
    },
}

/// Configuration for segment detection
#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Pause that closes a segment (default: 600ms)
    pub gap: Duration,

    /// Segments with less speech than this are dropped (default: 200ms)
    pub min_speech: Duration,

    /// Segments are force-committed at this length (default: 30s)
    pub max_segment: Duration,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            gap: Duration::from_millis(600),
            min_speech: Duration::from_millis(200),
            max_segment: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentState {
    Idle,
    Speaking,
    Gap,
}

/// Turns a stream of (is_speech, frame) pairs into committed segments.
pub struct SpeechSegmenter {
    config: SegmenterConfig,
    state: SegmentState,
    buffer: Vec<i16>,
    segment_length: Duration,
    speech: Duration,
    gap: Duration,
    /// Silence since the last speech frame, or since the first frame if none yet.
    silence: Duration,
}

impl SpeechSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            state: SegmentState::Idle,
            buffer: Vec::new(),
            segment_length: Duration::ZERO,
            speech: Duration::ZERO,
            gap: Duration::ZERO,
            silence: Duration::ZERO,
        }
    }

    /// Feed one classified frame.
    pub fn push(&mut self, is_speech: bool, frame: &[i16], frame_duration: Duration) -> Option<SegmentEvent> {
        if is_speech {
            self.silence = Duration::ZERO;
        } else {
            self.silence += frame_duration;
        }

        match (self.state, is_speech) {
            (SegmentState::Idle, true) => {
                debug!("🎤 Speech started");
                self.state = SegmentState::Speaking;
                self.buffer.clear();
                self.buffer.extend_from_slice(frame);
                self.segment_length = frame_duration;
                self.speech = frame_duration;
                self.gap = Duration::ZERO;
                Some(SegmentEvent::SpeechStarted)
            }

            (SegmentState::Speaking, true) | (SegmentState::Gap, true) => {
                self.state = SegmentState::Speaking;
                self.buffer.extend_from_slice(frame);
                self.segment_length += frame_duration;
                self.speech += frame_duration;
                self.gap = Duration::ZERO;

                if self.segment_length >= self.config.max_segment {
                    warn!("⏱️ Max segment length reached, committing");
                    return self.commit();
                }
                None
            }

            (SegmentState::Speaking, false) | (SegmentState::Gap, false) => {
                // Trailing silence stays in the segment so the recognizer hears the word end.
                self.state = SegmentState::Gap;
                self.buffer.extend_from_slice(frame);
                self.segment_length += frame_duration;
                self.gap += frame_duration;

                if self.gap >= self.config.gap {
                    return self.commit();
                }
                None
            }

            (SegmentState::Idle, false) => None,
        }
    }

    /// Close any open segment (end of input).
    pub fn flush(&mut self) -> Option<SegmentEvent> {
        if self.state == SegmentState::Idle {
            return None;
        }
        self.commit()
    }

    /// True while inside a segment and the last frame was speech.
    pub fn is_speaking(&self) -> bool {
        self.state == SegmentState::Speaking
    }

    pub fn silence(&self) -> Duration {
        self.silence
    }

    fn commit(&mut self) -> Option<SegmentEvent> {
        let speech = self.speech;
        let samples = std::mem::take(&mut self.buffer);
        self.reset_segment();

        if speech < self.config.min_speech {
            debug!("⏭️ Segment too short ({:?}), ignoring", speech);
            return None;
        }

        info!("🎯 Segment committed: {:?} speech, {} samples", speech, samples.len());
        Some(SegmentEvent::Committed { samples, speech })
    }

    fn reset_segment(&mut self) {
        self.state = SegmentState::Idle;
        self.segment_length = Duration::ZERO;
        self.speech = Duration::ZERO;
        self.gap = Duration::ZERO;
    }
}
