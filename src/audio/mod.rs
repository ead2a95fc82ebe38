//! # Audio Processing Module
//!
//! Everything between raw bytes on the wire and float samples handed to a
//! model lives here.
//!
//! ## Key Components:
//! - **VoiceActivityGate**: stateless per-frame speech/silence classifier
//! - **SegmentAccumulator**: per-connection buffering and flush policy
//! - **I/O helpers**: PCM16 parsing, WAV read/write, scratch artifacts
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16 kHz by default (8/16/32/48 kHz accepted by the gate)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: mono on the wire; WAV uploads are downmixed
//! - **Encoding**: little-endian signed integers

pub mod io;
pub mod segmenter;
pub mod vad;
