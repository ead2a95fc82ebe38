//! # Interviews Module
//!
//! Persistence and background transcription for uploaded interview
//! recordings. Uploads land in the store as `pending` records; a spawned
//! worker transcribes them and attaches the transcript artifacts.
//!
//! ## Key Components:
//! - **InterviewRecord / InterviewStatus**: the persisted entity and its
//!   lifecycle
//! - **InterviewStore**: SQLite-backed CRUD behind one connection lock
//! - **worker**: the per-upload background transcription task

pub mod records;
pub mod store;
pub mod worker;

pub use records::{InterviewRecord, InterviewStatus};
pub use store::InterviewStore;
