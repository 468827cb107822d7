//! Voice Activity Segmentation
//!
//! Turns a continuous stream of microphone samples into discrete speech
//! segments. Each fixed-size frame is scored twice: a speech probability from a
//! [`SpeechClassifier`] and a loudness figure in decibels. Both are smoothed
//! over the last few frames, and the pair drives a three-state machine:
//!
//! ```text
//!            required_hits              required_misses
//!   IDLE ───────────────────▶ ACTIVE ───────────────────▶ INACTIVE
//!    ▲     (SpeechStart)        ▲                            │  │
//!    │                          └──── required_hits ─────────┘  │
//!    └──────────── required_misses (SpeechEnd, Segment) ────────┘
//! ```
//!
//! While idle, frames go to a fixed-depth pre-roll ring so the first syllable
//! of an utterance is not clipped. A finished segment is emitted only when it
//! spans more than `min_segment_frames` frames; shorter bursts are noise.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Loudness reported for a frame of pure silence
///
/// RMS is offset by a tiny epsilon before taking the log, so silence maps to
/// `20 * log10(1e-7)` instead of negative infinity.
pub const DB_FLOOR: f32 = -140.0;

/// Scale from float samples to the 16-bit range loudness is measured in
const PCM16_SCALE: f32 = 32767.0;

const RMS_EPSILON: f32 = 1e-7;

/// Tuning for [`VoiceActivitySegmenter`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Samples per second of the incoming audio
    pub sample_rate: u32,
    /// Samples per analysis frame
    pub frame_samples: usize,
    /// Smoothed probability a frame must reach to count as a hit
    pub prob_threshold: f32,
    /// Smoothed loudness (dB) a frame must reach to count as a hit
    pub db_threshold: f32,
    /// Consecutive hits that start (or resume) speech
    pub required_hits: usize,
    /// Consecutive misses that pause, then end, speech
    pub required_misses: usize,
    /// Frames in the moving-average windows
    pub smoothing_window: usize,
    /// Frames of idle audio kept as pre-roll
    pub pre_roll_frames: usize,
    /// A segment must span more than this many frames to be emitted
    pub min_segment_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_samples: 512,
            prob_threshold: 0.4,
            db_threshold: 60.0,
            required_hits: 3,
            required_misses: 24,
            smoothing_window: 5,
            pre_roll_frames: 20,
            min_segment_frames: 30,
        }
    }
}

/// Per-frame speech probability source
pub trait SpeechClassifier: Send + Sync {
    /// Probability in `[0, 1]` that `frame` contains speech
    fn probability(&mut self, frame: &[f32]) -> f32;
}

/// Classifier that scores frames by loudness alone
///
/// Maps the frame's decibel level linearly from `noise_floor_db` (0.0) to
/// `speech_db` (1.0).
#[derive(Clone, Debug, PartialEq)]
pub struct EnergyClassifier {
    /// Level at or below which a frame scores 0
    pub noise_floor_db: f32,
    /// Level at or above which a frame scores 1
    pub speech_db: f32,
}

impl Default for EnergyClassifier {
    fn default() -> Self {
        Self {
            noise_floor_db: 40.0,
            speech_db: 70.0,
        }
    }
}

impl SpeechClassifier for EnergyClassifier {
    fn probability(&mut self, frame: &[f32]) -> f32 {
        let span = (self.speech_db - self.noise_floor_db).max(f32::EPSILON);
        ((frame_db(frame) - self.noise_floor_db) / span).clamp(0.0, 1.0)
    }
}

/// Loudness of a frame in decibels, floored at [`DB_FLOOR`]
#[must_use]
pub fn frame_db(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return DB_FLOOR;
    }
    let sum_sq: f32 = frame
        .iter()
        .map(|s| {
            let scaled = s * PCM16_SCALE;
            scaled * scaled
        })
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let rms = (sum_sq / frame.len() as f32).sqrt();
    (20.0 * (rms + RMS_EPSILON).log10()).max(DB_FLOOR)
}

/// Where the segmenter is in an utterance
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VadState {
    /// No speech
    Idle,
    /// Speech ongoing
    Active,
    /// Tentative end of speech, still buffering in case it was a pause
    Inactive,
}

/// Output of the segmenter
#[derive(Clone, Debug, PartialEq)]
pub enum VadEvent {
    /// Speech onset. Clients stop playback when they see this.
    SpeechStart,
    /// Speech ended
    SpeechEnd,
    /// A finished utterance: pre-roll followed by the buffered speech
    Segment(Vec<f32>),
}

/// Moving average over the last `capacity` values
#[derive(Debug)]
struct SmoothingWindow {
    values: VecDeque<f32>,
    capacity: usize,
}

impl SmoothingWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f32) -> f32 {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
        #[allow(clippy::cast_precision_loss)]
        let len = self.values.len() as f32;
        self.values.iter().sum::<f32>() / len
    }
}

/// Streaming voice activity state machine
pub struct VoiceActivitySegmenter {
    config: VadConfig,
    classifier: Box<dyn SpeechClassifier>,
    state: VadState,
    probs: SmoothingWindow,
    dbs: SmoothingWindow,
    hits: usize,
    misses: usize,
    pre_roll: VecDeque<Vec<f32>>,
    segment: Vec<f32>,
    segment_frames: usize,
    /// Samples waiting to fill the next frame
    carry: Vec<f32>,
}

impl VoiceActivitySegmenter {
    /// Create a segmenter scoring frames with `classifier`
    #[must_use]
    pub fn new(config: VadConfig, classifier: Box<dyn SpeechClassifier>) -> Self {
        Self {
            probs: SmoothingWindow::new(config.smoothing_window),
            dbs: SmoothingWindow::new(config.smoothing_window),
            pre_roll: VecDeque::with_capacity(config.pre_roll_frames),
            config,
            classifier,
            state: VadState::Idle,
            hits: 0,
            misses: 0,
            segment: Vec::new(),
            segment_frames: 0,
            carry: Vec::new(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> VadState {
        self.state
    }

    /// The configuration in use
    #[must_use]
    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Feed arbitrary-length audio
    ///
    /// Samples are cut into `frame_samples` frames; a trailing partial frame
    /// is held until the next call completes it.
    pub fn push_samples(&mut self, samples: &[f32]) -> Vec<VadEvent> {
        let frame_len = self.config.frame_samples.max(1);
        self.carry.extend_from_slice(samples);

        let mut events = Vec::new();
        let mut offset = 0;
        let carry = std::mem::take(&mut self.carry);
        while carry.len() - offset >= frame_len {
            let frame = &carry[offset..offset + frame_len];
            let probability = self.classifier.probability(frame);
            events.extend(self.push_frame(probability, frame));
            offset += frame_len;
        }
        self.carry = carry[offset..].to_vec();
        events
    }

    /// Advance the state machine by one scored frame
    pub fn push_frame(&mut self, probability: f32, frame: &[f32]) -> Vec<VadEvent> {
        let smoothed_prob = self.probs.push(probability);
        let smoothed_db = self.dbs.push(frame_db(frame));
        let hit =
            smoothed_prob >= self.config.prob_threshold && smoothed_db >= self.config.db_threshold;

        let mut events = Vec::new();
        match self.state {
            VadState::Idle => {
                self.hits = if hit { self.hits + 1 } else { 0 };
                if self.hits >= self.config.required_hits {
                    debug!(prob = smoothed_prob, db = smoothed_db, "speech onset");
                    self.state = VadState::Active;
                    self.hits = 0;
                    self.misses = 0;
                    self.buffer(frame);
                    events.push(VadEvent::SpeechStart);
                } else {
                    self.remember_pre_roll(frame);
                }
            }
            VadState::Active => {
                self.buffer(frame);
                if hit {
                    self.misses = 0;
                } else {
                    self.misses += 1;
                    if self.misses >= self.config.required_misses {
                        debug!("speech paused");
                        self.state = VadState::Inactive;
                        self.misses = 0;
                        self.hits = 0;
                    }
                }
            }
            VadState::Inactive => {
                self.buffer(frame);
                if hit {
                    self.misses = 0;
                    self.hits += 1;
                    if self.hits >= self.config.required_hits {
                        debug!("speech resumed");
                        self.state = VadState::Active;
                        self.hits = 0;
                    }
                } else {
                    self.hits = 0;
                    self.misses += 1;
                    if self.misses >= self.config.required_misses {
                        events.push(VadEvent::SpeechEnd);
                        if let Some(segment) = self.finish_segment() {
                            events.push(VadEvent::Segment(segment));
                        }
                    }
                }
            }
        }
        events
    }

    /// Drop any in-progress utterance and return to idle
    pub fn reset(&mut self) {
        self.state = VadState::Idle;
        self.hits = 0;
        self.misses = 0;
        self.pre_roll.clear();
        self.segment.clear();
        self.segment_frames = 0;
        self.carry.clear();
    }

    fn buffer(&mut self, frame: &[f32]) {
        self.segment.extend_from_slice(frame);
        self.segment_frames += 1;
    }

    fn remember_pre_roll(&mut self, frame: &[f32]) {
        if self.config.pre_roll_frames == 0 {
            return;
        }
        if self.pre_roll.len() == self.config.pre_roll_frames {
            self.pre_roll.pop_front();
        }
        self.pre_roll.push_back(frame.to_vec());
    }

    /// Return to idle, yielding the utterance if it is long enough
    fn finish_segment(&mut self) -> Option<Vec<f32>> {
        let frames = self.segment_frames;
        let long_enough = frames > self.config.min_segment_frames;

        let segment = long_enough.then(|| {
            let mut samples: Vec<f32> = self.pre_roll.drain(..).flatten().collect();
            samples.append(&mut self.segment);
            samples
        });
        if segment.is_none() {
            debug!(frames, "discarding short segment as noise");
        }

        self.state = VadState::Idle;
        self.hits = 0;
        self.misses = 0;
        self.pre_roll.clear();
        self.segment.clear();
        self.segment_frames = 0;
        segment
    }
}

impl std::fmt::Debug for VoiceActivitySegmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceActivitySegmenter")
            .field("state", &self.state)
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .field("segment_frames", &self.segment_frames)
            .finish_non_exhaustive()
    }
}
