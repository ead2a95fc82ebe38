//! Background transcription of uploaded interview recordings.
//!
//! Every upload spawns exactly one task here. The task walks the record
//! through `processing` and into `completed` or `failed`; nothing it does
//! can take the service down with it.

use crate::audio::io::read_wav;
use crate::error::{AppError, AppResult};
use crate::models::TranscribeRequest;
use crate::state::AppState;
use std::path::PathBuf;
use tracing::{error, info};

/// Spawn the transcription task for one interview. The returned handle can
/// be awaited by tests; the upload handler drops it.
pub fn spawn(state: AppState, interview_id: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = process(&state, &interview_id).await {
            error!(interview = %interview_id, error = %err, "interview transcription failed");
            if let Err(store_err) = state
                .interviews
                .mark_failed(&interview_id, &err.to_string())
            {
                error!(
                    interview = %interview_id,
                    error = %store_err,
                    "could not record interview failure"
                );
            }
        }
    })
}

/// Transcribe one stored recording and persist its transcript artifacts.
///
/// Writes `{id}.txt` (full text) and `{id}.json` (segment list) under the
/// transcript directory, then marks the record completed with both paths.
pub(crate) async fn process(state: &AppState, id: &str) -> AppResult<()> {
    let record = state
        .interviews
        .get(id)?
        .ok_or_else(|| AppError::NotFound(format!("interview {} not found", id)))?;

    // A record deleted between upload and pickup is nothing to transcribe.
    if !state.interviews.mark_processing(id)? {
        return Ok(());
    }
    info!(interview = %id, file = %record.filepath, "transcribing interview");

    let handle = state
        .models
        .acquire(&state.config.models.default_stt_model)
        .await?;

    let audio_path = PathBuf::from(&record.filepath);
    let transcript_dir = PathBuf::from(&state.config.storage.transcript_dir);
    let interview_id = id.to_string();

    let (transcript_path, segments_path) =
        tokio::task::spawn_blocking(move || -> AppResult<(String, String)> {
            let (samples, sample_rate) = read_wav(&audio_path)?;
            let request = TranscribeRequest::new(samples, sample_rate);
            let output = handle.transcribe(&request)?;

            std::fs::create_dir_all(&transcript_dir)?;
            let text_path = transcript_dir.join(format!("{}.txt", interview_id));
            let json_path = transcript_dir.join(format!("{}.json", interview_id));
            std::fs::write(&text_path, &output.text)?;
            let segments = serde_json::to_vec_pretty(&output.segments)
                .map_err(|err| AppError::Internal(format!("segment encoding failed: {}", err)))?;
            std::fs::write(&json_path, segments)?;

            Ok((
                text_path.display().to_string(),
                json_path.display().to_string(),
            ))
        })
        .await
        .map_err(|err| AppError::Internal(format!("interview task failed: {}", err)))??;

    state
        .interviews
        .mark_completed(id, &transcript_path, &segments_path)?;
    info!(interview = %id, transcript = %transcript_path, "interview transcription completed");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::io::write_wav;
    use crate::config::AppConfig;
    use crate::interviews::records::{InterviewRecord, InterviewStatus};
    use crate::interviews::store::InterviewStore;
    use crate::models::{MockLoader, ModelCache, TranscriptSegment};
    use candle_core::Device;
    use std::path::Path;
    use std::sync::Arc;
    use uuid::Uuid;

    fn state_with_storage(root: &Path) -> AppState {
        let mut config = AppConfig::default();
        config.storage.upload_dir = root.join("uploads").display().to_string();
        config.storage.transcript_dir = root.join("transcripts").display().to_string();
        config.storage.scratch_dir = root.join("tmp").display().to_string();

        AppState::new(
            config,
            Device::Cpu,
            Arc::new(ModelCache::new(Box::new(MockLoader::new()))),
            Arc::new(InterviewStore::new_in_memory().unwrap()),
        )
    }

    fn scratch_root() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("interview_worker_{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_process_completes_a_pending_interview() {
        let root = scratch_root();
        std::fs::create_dir_all(root.join("uploads")).unwrap();
        let state = state_with_storage(&root);

        let audio_path = root.join("uploads").join("a1_take.wav");
        write_wav(&audio_path, &vec![0.25; 16000], 16000).unwrap();

        let record = InterviewRecord::new(
            "a1".to_string(),
            "take.wav".to_string(),
            audio_path.display().to_string(),
        );
        state.interviews.insert(&record).unwrap();

        process(&state, "a1").await.unwrap();

        let done = state.interviews.get("a1").unwrap().unwrap();
        assert_eq!(done.status, InterviewStatus::Completed);

        let text = std::fs::read_to_string(done.transcript_path.unwrap()).unwrap();
        assert_eq!(text, "transcript from base");

        let raw = std::fs::read(done.segments_path.unwrap()).unwrap();
        let segments: Vec<TranscriptSegment> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "transcript from base");

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn test_process_rejects_unknown_interview() {
        let root = scratch_root();
        let state = state_with_storage(&root);

        let result = process(&state, "missing").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_spawn_marks_failure_when_audio_is_unreadable() {
        let root = scratch_root();
        let state = state_with_storage(&root);

        let record = InterviewRecord::new(
            "a1".to_string(),
            "gone.wav".to_string(),
            root.join("uploads").join("gone.wav").display().to_string(),
        );
        state.interviews.insert(&record).unwrap();

        spawn(state.clone(), "a1".to_string()).await.unwrap();

        let failed = state.interviews.get("a1").unwrap().unwrap();
        assert_eq!(failed.status, InterviewStatus::Failed);
        assert!(failed.error.is_some());
    }
}
