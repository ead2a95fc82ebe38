//! # Models Module
//!
//! Model lifecycle and inference: the shared model cache, the bundled Whisper
//! engine, and the NDJSON adapter for batch responses.
//!
//! ## Key Components:
//! - **ModelCache**: load-once-per-key cache of shared model handles
//! - **WhisperEngine**: candle-based Whisper inference with Hub resolution
//! - **BatchTranscriptionStream**: newline-delimited JSON response body
//!
//! ## Model Keys:
//! Keys are either short aliases (`tiny`, `base`, `small`, `medium`, `large`)
//! resolved to the corresponding `openai/whisper-*` repository, or full
//! Hugging Face repository ids.

pub mod batch;
pub mod cache;
pub mod whisper;

pub use batch::BatchTranscriptionStream;
pub use cache::{
    ModelCache, ModelHandle, ModelLoader, SpeechToText, TranscribeRequest, TranscriptSegment,
    TranscriptionOutput,
};
#[cfg(test)]
pub use cache::{MockLoader, MockSpeechToText};
pub use whisper::{WhisperLoader, WhisperVariant};
