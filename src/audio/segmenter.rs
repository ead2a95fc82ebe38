//! # Speech Segmentation
//!
//! Decides, chunk by chunk, when enough coherent speech has been buffered to
//! hand off for transcription. This is the policy core of the realtime
//! pipeline; the WebSocket session feeds it and acts on its flush signals.
//!
//! ## Decision policy (evaluated after every inbound chunk):
//! 1. Empty buffer never flushes.
//! 2. Silence longer than `silence_threshold_seconds` with more than
//!    `min_chunk_seconds` buffered flushes (a silence-terminated utterance).
//! 3. More than `max_chunk_seconds` buffered forces a flush even while
//!    speech is ongoing, bounding worst-case latency and memory.
//! 4. Otherwise keep buffering.
//!
//! Silent chunks are never stored; they only let the silence measurement
//! grow. A flush clears the buffer but leaves `last_speech_time` alone, so
//! trailing silence cannot re-trigger on an empty buffer.
//!
//! Time is read through the [`Clock`] seam so the silence transitions are
//! testable without real sleeps.

use crate::audio::vad::VoiceActivityGate;
use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::debug;

/// Trait for time operations, allowing mock time in tests.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Real system clock using `std::time::Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Tuning for the segmentation policy. Embedded in the application
/// configuration under `[segmenter]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SegmenterConfig {
    /// Expected PCM sample rate of inbound audio, in Hz.
    pub sample_rate: u32,
    /// VAD frame duration; inbound chunks are sliced into frames of this
    /// length for classification.
    pub vad_frame_ms: u32,
    /// VAD aggressiveness mode, 0-3.
    pub vad_aggressiveness: u8,
    /// A silence-terminated flush requires at least this much buffered audio.
    pub min_chunk_seconds: f32,
    /// Accepted for parity with upstream tuning; the flush policy does not
    /// consult it.
    pub initial_chunk_seconds: f32,
    /// Hard ceiling on buffered audio before a forced flush.
    pub max_chunk_seconds: f32,
    /// Silence needed to consider an utterance finished.
    pub silence_threshold_seconds: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            vad_frame_ms: 30,
            vad_aggressiveness: 3,
            min_chunk_seconds: 0.5,
            initial_chunk_seconds: 1.5,
            max_chunk_seconds: 5.0,
            silence_threshold_seconds: 0.5,
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !crate::audio::vad::ALLOWED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(format!(
                "sample_rate must be one of {:?}, got {}",
                crate::audio::vad::ALLOWED_SAMPLE_RATES,
                self.sample_rate
            ));
        }
        if !crate::audio::vad::ALLOWED_FRAME_MS.contains(&self.vad_frame_ms) {
            return Err(format!(
                "vad_frame_ms must be one of {:?}, got {}",
                crate::audio::vad::ALLOWED_FRAME_MS,
                self.vad_frame_ms
            ));
        }
        if self.vad_aggressiveness > 3 {
            return Err(format!(
                "vad_aggressiveness must be 0-3, got {}",
                self.vad_aggressiveness
            ));
        }
        if self.min_chunk_seconds <= 0.0 {
            return Err("min_chunk_seconds must be positive".to_string());
        }
        if self.max_chunk_seconds <= self.min_chunk_seconds {
            return Err(format!(
                "max_chunk_seconds ({}) must exceed min_chunk_seconds ({})",
                self.max_chunk_seconds, self.min_chunk_seconds
            ));
        }
        if self.silence_threshold_seconds <= 0.0 {
            return Err("silence_threshold_seconds must be positive".to_string());
        }
        Ok(())
    }

    /// Samples per VAD frame at the configured rate.
    pub fn frame_samples(&self) -> usize {
        crate::audio::vad::frame_samples(self.sample_rate, self.vad_frame_ms)
    }
}

/// One flushed utterance: normalized float samples ready for transcription.
#[derive(Debug, Clone)]
pub struct Segment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Segment {
    pub fn duration_seconds(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }
}

/// Per-connection speech buffer implementing the flush policy above.
///
/// Owned exclusively by one session; not shared or locked.
pub struct SegmentAccumulator<C: Clock = SystemClock> {
    config: SegmenterConfig,
    buffer: Vec<f32>,
    last_speech_time: Instant,
    started: bool,
    clock: C,
}

impl SegmentAccumulator<SystemClock> {
    pub fn new(config: SegmenterConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> SegmentAccumulator<C> {
    /// `last_speech_time` starts at "now" so a session that opens into pure
    /// silence measures that silence from connection time.
    pub fn with_clock(config: SegmenterConfig, clock: C) -> Self {
        let now = clock.now();
        Self {
            config,
            buffer: Vec::new(),
            last_speech_time: now,
            started: false,
            clock,
        }
    }

    /// Feed one inbound chunk of PCM audio and evaluate the flush policy.
    ///
    /// The chunk is sliced into VAD frames and counts as speech if any frame
    /// classifies positive (short-circuiting on the first hit; the earliest
    /// frame wins and the outcome is the same whichever positive frame is
    /// found). A speech chunk is appended whole, including any sub-frame
    /// tail the classifier never saw.
    ///
    /// Returns `Some(segment)` when the policy decides the buffered speech
    /// should be transcribed now.
    pub fn push_chunk(
        &mut self,
        pcm: &[i16],
        gate: &VoiceActivityGate,
    ) -> AppResult<Option<Segment>> {
        let frame_len = self.config.frame_samples();

        let mut has_speech = false;
        for frame in pcm.chunks_exact(frame_len) {
            if gate.is_speech(frame, self.config.sample_rate)? {
                has_speech = true;
                break;
            }
        }

        let now = self.clock.now();
        if has_speech {
            if !self.started {
                self.started = true;
                debug!("speech started");
            }
            self.last_speech_time = now;
            self.buffer.extend(pcm.iter().map(|&s| s as f32 / 32768.0));
        }

        if self.buffer.is_empty() {
            return Ok(None);
        }

        let silence_seconds = now.duration_since(self.last_speech_time).as_secs_f32();
        let buffered_seconds = self.buffered_seconds();

        if silence_seconds > self.config.silence_threshold_seconds
            && buffered_seconds > self.config.min_chunk_seconds
        {
            debug!(
                buffered_seconds,
                silence_seconds, "flushing silence-terminated segment"
            );
            return Ok(Some(self.take_segment()));
        }

        if buffered_seconds > self.config.max_chunk_seconds {
            debug!(buffered_seconds, "forcing flush at max chunk duration");
            return Ok(Some(self.take_segment()));
        }

        Ok(None)
    }

    /// Duration of buffered speech in seconds.
    pub fn buffered_seconds(&self) -> f32 {
        self.buffer.len() as f32 / self.config.sample_rate as f32
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Whether any speech has been detected since the session opened.
    pub fn has_started(&self) -> bool {
        self.started
    }

    fn take_segment(&mut self) -> Segment {
        Segment {
            samples: std::mem::take(&mut self.buffer),
            sample_rate: self.config.sample_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Mock clock for testing that allows manual time advancement.
    #[derive(Debug, Clone)]
    struct MockClock {
        current: Arc<Mutex<Instant>>,
    }

    impl MockClock {
        fn new() -> Self {
            Self {
                current: Arc::new(Mutex::new(Instant::now())),
            }
        }

        fn advance(&self, duration: Duration) {
            let mut current = self.current.lock().unwrap();
            *current += duration;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> Instant {
            *self.current.lock().unwrap()
        }
    }

    const CHUNK_MS: u64 = 30;

    fn test_setup() -> (SegmentAccumulator<MockClock>, VoiceActivityGate, MockClock) {
        let config = SegmenterConfig::default();
        let gate = VoiceActivityGate::new(config.vad_aggressiveness).unwrap();
        let clock = MockClock::new();
        let acc = SegmentAccumulator::with_clock(config, clock.clone());
        (acc, gate, clock)
    }

    /// One 30 ms frame of loud audio at 16 kHz.
    fn speech_chunk() -> Vec<i16> {
        vec![6000; 480]
    }

    /// One 30 ms frame of silence at 16 kHz.
    fn silence_chunk() -> Vec<i16> {
        vec![0; 480]
    }

    /// Advance the clock by one chunk duration, then push.
    fn push(
        acc: &mut SegmentAccumulator<MockClock>,
        gate: &VoiceActivityGate,
        clock: &MockClock,
        chunk: &[i16],
    ) -> Option<Segment> {
        clock.advance(Duration::from_millis(CHUNK_MS));
        acc.push_chunk(chunk, gate).unwrap()
    }

    #[test]
    fn test_pure_silence_never_flushes() {
        let (mut acc, gate, clock) = test_setup();

        for _ in 0..200 {
            let flushed = push(&mut acc, &gate, &clock, &silence_chunk());
            assert!(flushed.is_none());
        }
        assert!(acc.is_empty());
        assert!(!acc.has_started());
    }

    #[test]
    fn test_silence_terminated_utterance_flushes_once() {
        let (mut acc, gate, clock) = test_setup();

        // ~2 seconds of continuous speech: no flush while speech is ongoing.
        for _ in 0..66 {
            assert!(push(&mut acc, &gate, &clock, &speech_chunk()).is_none());
        }
        assert!((acc.buffered_seconds() - 1.98).abs() < 0.01);

        // Trailing silence: the flush fires once the 0.5 s threshold is
        // crossed, carrying the ~2 s utterance.
        let mut flushed = None;
        let mut silence_chunks = 0;
        for _ in 0..40 {
            silence_chunks += 1;
            if let Some(segment) = push(&mut acc, &gate, &clock, &silence_chunk()) {
                flushed = Some(segment);
                break;
            }
        }

        let segment = flushed.expect("silence should have triggered a flush");
        assert_eq!(silence_chunks, 17, "flush should fire just past 0.5 s of silence");
        assert!((segment.duration_seconds() - 2.0).abs() < 0.1);
        assert!(acc.is_empty());

        // Continued silence after the flush must not re-trigger.
        for _ in 0..100 {
            assert!(push(&mut acc, &gate, &clock, &silence_chunk()).is_none());
        }
    }

    #[test]
    fn test_continuous_speech_forces_flush_at_max() {
        let (mut acc, gate, clock) = test_setup();

        // 5.0 s / 30 ms = 166.7 chunks, so the forced flush lands on chunk 167.
        let mut first_flush_at = None;
        let mut segment = None;
        for i in 1..=200 {
            if let Some(s) = push(&mut acc, &gate, &clock, &speech_chunk()) {
                first_flush_at = Some(i);
                segment = Some(s);
                break;
            }
        }

        assert_eq!(first_flush_at, Some(167));
        let segment = segment.unwrap();
        assert!(segment.duration_seconds() > 5.0);
        assert!((segment.duration_seconds() - 5.01).abs() < 0.05);

        // The buffer keeps accumulating the remainder of the ongoing speech.
        for _ in 0..100 {
            assert!(push(&mut acc, &gate, &clock, &speech_chunk()).is_none());
        }
        assert!((acc.buffered_seconds() - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_silence_advances_time_without_buffering() {
        let (mut acc, gate, clock) = test_setup();

        for _ in 0..10 {
            push(&mut acc, &gate, &clock, &speech_chunk());
        }
        let before = acc.buffered_seconds();

        // Five silent chunks, below the silence threshold: nothing stored.
        for _ in 0..5 {
            assert!(push(&mut acc, &gate, &clock, &silence_chunk()).is_none());
        }
        assert_eq!(acc.buffered_seconds(), before);

        // Speech resumes and appends again.
        push(&mut acc, &gate, &clock, &speech_chunk());
        assert!((acc.buffered_seconds() - (before + 0.03)).abs() < 0.001);
    }

    #[test]
    fn test_short_utterance_below_min_is_held() {
        let (mut acc, gate, clock) = test_setup();

        // 0.3 s of speech, under min_chunk_seconds.
        for _ in 0..10 {
            push(&mut acc, &gate, &clock, &speech_chunk());
        }

        // A full second of silence: the silence rule requires min_chunk, so
        // the short utterance stays buffered.
        for _ in 0..34 {
            assert!(push(&mut acc, &gate, &clock, &silence_chunk()).is_none());
        }
        assert!(!acc.is_empty());

        // More speech arrives, pushing past the minimum; the next silence
        // stretch flushes the combined utterance.
        for _ in 0..10 {
            push(&mut acc, &gate, &clock, &speech_chunk());
        }
        let mut flushed = None;
        for _ in 0..40 {
            if let Some(segment) = push(&mut acc, &gate, &clock, &silence_chunk()) {
                flushed = Some(segment);
                break;
            }
        }
        let segment = flushed.expect("combined utterance should flush");
        assert!((segment.duration_seconds() - 0.6).abs() < 0.01);
    }

    #[test]
    fn test_sub_frame_tail_is_retained_with_speech() {
        let (mut acc, gate, clock) = test_setup();

        // 480 classified samples plus a 100-sample tail that no frame covers.
        let mut chunk = speech_chunk();
        chunk.extend(vec![6000i16; 100]);

        push(&mut acc, &gate, &clock, &chunk);
        assert_eq!((acc.buffered_seconds() * 16000.0).round() as usize, 580);
    }

    #[test]
    fn test_mixed_chunk_counts_as_speech() {
        let (mut acc, gate, clock) = test_setup();

        // Silent frame followed by a loud frame: any positive frame marks the
        // chunk as speech and the whole chunk is buffered.
        let mut chunk = silence_chunk();
        chunk.extend(speech_chunk());

        push(&mut acc, &gate, &clock, &chunk);
        assert!(acc.has_started());
        assert_eq!((acc.buffered_seconds() * 16000.0).round() as usize, 960);
    }

    #[test]
    fn test_started_flag_survives_flush() {
        let (mut acc, gate, clock) = test_setup();
        assert!(!acc.has_started());

        for _ in 0..20 {
            push(&mut acc, &gate, &clock, &speech_chunk());
        }
        assert!(acc.has_started());

        let mut flushed = false;
        for _ in 0..40 {
            if push(&mut acc, &gate, &clock, &silence_chunk()).is_some() {
                flushed = true;
                break;
            }
        }
        assert!(flushed);
        assert!(acc.has_started());
    }
}
