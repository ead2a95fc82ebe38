//! Voice activity detection.
//!
//! Classifies one fixed-duration PCM frame at a time as speech or silence
//! using RMS-based thresholding. The gate keeps no state between calls;
//! segmentation decisions built on top of these verdicts live in
//! [`crate::audio::segmenter`].

use crate::error::{AppError, AppResult};

/// Frame durations the gate accepts, in milliseconds.
pub const ALLOWED_FRAME_MS: [u32; 3] = [10, 20, 30];

/// Sample rates the gate accepts, in Hz.
pub const ALLOWED_SAMPLE_RATES: [u32; 4] = [8000, 16000, 32000, 48000];

/// RMS thresholds indexed by aggressiveness mode. Higher modes demand more
/// energy before a frame counts as speech.
const MODE_THRESHOLDS: [f32; 4] = [0.008, 0.012, 0.02, 0.03];

/// Stateless per-frame speech classifier.
///
/// Aggressiveness runs 0 (permissive) to 3 (labels borderline frames as
/// silence). Callers must slice audio into frames of exactly 10, 20, or
/// 30 ms at a supported sample rate; anything else is rejected rather than
/// guessed at.
#[derive(Debug, Clone, Copy)]
pub struct VoiceActivityGate {
    aggressiveness: u8,
    threshold: f32,
}

impl VoiceActivityGate {
    pub fn new(aggressiveness: u8) -> AppResult<Self> {
        if aggressiveness as usize >= MODE_THRESHOLDS.len() {
            return Err(AppError::ValidationError(format!(
                "VAD aggressiveness must be 0-3, got {}",
                aggressiveness
            )));
        }
        Ok(Self {
            aggressiveness,
            threshold: MODE_THRESHOLDS[aggressiveness as usize],
        })
    }

    pub fn aggressiveness(&self) -> u8 {
        self.aggressiveness
    }

    /// Classify one frame.
    ///
    /// The frame length must correspond to an allowed duration at the given
    /// sample rate; every other length is a `Classification` error so that
    /// malformed slicing upstream surfaces instead of skewing verdicts.
    pub fn is_speech(&self, frame: &[i16], sample_rate: u32) -> AppResult<bool> {
        if !ALLOWED_SAMPLE_RATES.contains(&sample_rate) {
            return Err(AppError::Classification(format!(
                "unsupported sample rate {} Hz (allowed: {:?})",
                sample_rate, ALLOWED_SAMPLE_RATES
            )));
        }

        let allowed = ALLOWED_FRAME_MS
            .iter()
            .any(|&ms| frame.len() == frame_samples(sample_rate, ms));
        if !allowed {
            return Err(AppError::Classification(format!(
                "frame of {} samples is not a 10/20/30 ms frame at {} Hz",
                frame.len(),
                sample_rate
            )));
        }

        Ok(calculate_rms(frame) > self.threshold)
    }
}

/// Number of samples in one frame of `frame_ms` milliseconds.
pub fn frame_samples(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate / 1000 * frame_ms) as usize
}

/// Root-mean-square amplitude of a PCM frame, normalized to [0.0, 1.0].
///
/// Accumulates in f64 so long frames do not lose precision.
pub fn calculate_rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum_squares: f64 = samples
        .iter()
        .map(|&sample| {
            let normalized = sample as f64 / i16::MAX as f64;
            normalized * normalized
        })
        .sum();

    let mean_square = sum_squares / samples.len() as f64;
    mean_square.sqrt() as f32
}
