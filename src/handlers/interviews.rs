//! # Interview REST API Handlers
//!
//! CRUD surface over the interview store plus the transcript artifacts the
//! background worker produces. Uploading a recording persists it, inserts a
//! `pending` record, and kicks off transcription; the remaining endpoints
//! read or remove what that pipeline left behind.
//!
//! ## Available Endpoints:
//! - `POST /v1/interviews` - Upload a recording and start transcription
//! - `GET /v1/interviews` - List interviews, newest first
//! - `GET /v1/interviews/{id}` - Fetch one interview record
//! - `GET /v1/interviews/{id}/transcript` - Fetch the finished transcript
//! - `DELETE /v1/interviews/{id}` - Remove an interview and its files

use crate::error::AppError;
use crate::interviews::{worker, InterviewRecord, InterviewStatus};
use crate::state::AppState;
use actix_multipart::Multipart;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use tracing::{debug, info, warn};

use super::transcriptions::{read_file_field, read_text_field};

/// Query parameters for the transcript endpoint.
#[derive(Debug, Deserialize)]
pub struct TranscriptQuery {
    /// `segments` selects the JSON segment transcript; anything else (or
    /// nothing) selects the plain text.
    pub format: Option<String>,
}

/// Upload an interview recording and start its background transcription.
///
/// ## Endpoint: `POST /v1/interviews`
///
/// ## Request:
/// Multipart form data: the recording in the `file` field (16-bit PCM WAV),
/// plus optional text fields `interviewee`, `project_name` and `date`
/// (`YYYY-MM-DD`; an unparseable date falls back to the upload time).
///
/// ## Response:
/// The freshly inserted record with status `pending`. Transcription progress
/// is visible through `GET /v1/interviews/{id}`.
pub async fn create_interview(
    mut payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    let mut audio_data: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut interviewee: Option<String> = None;
    let mut project_name: Option<String> = None;
    let mut raw_date: Option<String> = None;

    while let Some(item) = payload.next().await {
        let mut field =
            item.map_err(|e| AppError::ValidationError(format!("Multipart error: {}", e)))?;

        let content_disposition = field.content_disposition().ok_or_else(|| {
            AppError::ValidationError("Missing content disposition".to_string())
        })?;
        let field_name = content_disposition
            .get_name()
            .ok_or_else(|| AppError::ValidationError("Missing field name".to_string()))?
            .to_string();

        if field_name == "file" {
            original_name = content_disposition.get_filename().map(|s| s.to_string());
            audio_data =
                Some(read_file_field(&mut field, config.performance.max_upload_bytes).await?);
        } else {
            let value = read_text_field(&mut field, &field_name).await?;
            match field_name.as_str() {
                "interviewee" => interviewee = Some(value),
                "project_name" => project_name = Some(value),
                "date" => raw_date = Some(value),
                other => debug!("Ignoring unknown form field '{}'", other),
            }
        }
    }

    let audio_bytes = audio_data
        .ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;

    let id = uuid::Uuid::new_v4().to_string();
    let safe_name = sanitize_filename(original_name.as_deref());
    let stored_path = Path::new(&config.storage.upload_dir).join(format!("{}_{}", id, safe_name));

    tokio::fs::write(&stored_path, &audio_bytes)
        .await
        .map_err(|e| {
            AppError::Storage(format!("cannot store upload {}: {}", stored_path.display(), e))
        })?;

    let date = raw_date.as_deref().and_then(|raw| {
        let parsed = parse_interview_date(raw);
        if parsed.is_none() && !raw.trim().is_empty() {
            debug!("Ignoring unparseable interview date '{}'", raw);
        }
        parsed
    });

    let record = InterviewRecord::new(id.clone(), safe_name, stored_path.display().to_string())
        .with_interviewee(interviewee)
        .with_project_name(project_name)
        .with_date(date);

    state.interviews.insert(&record)?;

    info!(
        "Created interview {} for '{}' ({} bytes uploaded)",
        id,
        record.interviewee,
        audio_bytes.len()
    );

    worker::spawn(state.get_ref().clone(), id);

    Ok(HttpResponse::Ok().json(record))
}

/// List all interviews, newest first.
///
/// ## Endpoint: `GET /v1/interviews`
pub async fn list_interviews(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let records = state.interviews.list()?;
    Ok(HttpResponse::Ok().json(records))
}

/// Fetch one interview record.
///
/// ## Endpoint: `GET /v1/interviews/{id}`
pub async fn get_interview(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let record = state
        .interviews
        .get(&id)?
        .ok_or_else(|| AppError::NotFound(format!("interview '{}' not found", id)))?;
    Ok(HttpResponse::Ok().json(record))
}

/// Fetch the finished transcript for an interview.
///
/// ## Endpoint: `GET /v1/interviews/{id}/transcript`
///
/// Serves the plain-text transcript by default, or the segment-level JSON
/// with `?format=segments`. Responds 409 while the interview is still
/// pending, processing, or failed, and 404 when the artifact is missing.
pub async fn get_interview_transcript(
    path: web::Path<String>,
    query: web::Query<TranscriptQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let record = state
        .interviews
        .get(&id)?
        .ok_or_else(|| AppError::NotFound(format!("interview '{}' not found", id)))?;

    if record.status != InterviewStatus::Completed {
        return Err(AppError::Conflict(format!(
            "transcript for interview '{}' is not ready (status: {})",
            id, record.status
        )));
    }

    let want_segments = query.format.as_deref() == Some("segments");
    let artifact = if want_segments {
        record.segments_path
    } else {
        record.transcript_path
    };
    let artifact = artifact
        .ok_or_else(|| AppError::NotFound(format!("transcript for interview '{}' missing", id)))?;

    let content = tokio::fs::read_to_string(&artifact).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AppError::NotFound(format!("transcript file for interview '{}' missing", id))
        } else {
            AppError::Storage(format!("cannot read transcript {}: {}", artifact, e))
        }
    })?;

    let response = if want_segments {
        HttpResponse::Ok()
            .content_type("application/json")
            .body(content)
    } else {
        HttpResponse::Ok()
            .content_type("text/plain; charset=utf-8")
            .body(content)
    };
    Ok(response)
}

/// Remove an interview, its stored recording, and any transcript artifacts.
///
/// ## Endpoint: `DELETE /v1/interviews/{id}`
///
/// ## Response:
/// ```json
/// {"ok": true}
/// ```
///
/// File removal is best effort; a file that cannot be removed is logged and
/// does not fail the request.
pub async fn delete_interview(
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let record = state
        .interviews
        .get(&id)?
        .ok_or_else(|| AppError::NotFound(format!("interview '{}' not found", id)))?;

    remove_artifact(&record.filepath).await;
    if let Some(transcript_path) = &record.transcript_path {
        remove_artifact(transcript_path).await;
    }
    if let Some(segments_path) = &record.segments_path {
        remove_artifact(segments_path).await;
    }

    state.interviews.delete(&id)?;

    info!("Deleted interview {}", id);

    Ok(HttpResponse::Ok().json(json!({ "ok": true })))
}

async fn remove_artifact(path: &str) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", path, e);
        }
    }
}

/// Strip any path components from a client-supplied filename.
fn sanitize_filename(raw: Option<&str>) -> String {
    raw.and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "recording.wav".to_string())
}

/// Parse a `YYYY-MM-DD` form value into a UTC timestamp at midnight.
fn parse_interview_date(raw: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_sanitize_filename_strips_path_components() {
        assert_eq!(sanitize_filename(Some("session.wav")), "session.wav");
        assert_eq!(sanitize_filename(Some("../../etc/passwd")), "passwd");
        assert_eq!(sanitize_filename(Some("nested/dir/audio.wav")), "audio.wav");
    }

    #[test]
    fn test_sanitize_filename_falls_back_on_unusable_names() {
        assert_eq!(sanitize_filename(None), "recording.wav");
        assert_eq!(sanitize_filename(Some("")), "recording.wav");
        assert_eq!(sanitize_filename(Some("..")), "recording.wav");
    }

    #[test]
    fn test_parse_interview_date_accepts_iso_dates() {
        let date = parse_interview_date("2025-03-14").unwrap();
        assert_eq!(date.year(), 2025);
        assert_eq!(date.month(), 3);
        assert_eq!(date.day(), 14);
    }

    #[test]
    fn test_parse_interview_date_rejects_malformed_input() {
        assert!(parse_interview_date("14/03/2025").is_none());
        assert!(parse_interview_date("2025-13-40").is_none());
        assert!(parse_interview_date("recently").is_none());
    }

    #[test]
    fn test_transcript_query_formats() {
        let query: TranscriptQuery = serde_json::from_str(r#"{"format": "segments"}"#).unwrap();
        assert_eq!(query.format.as_deref(), Some("segments"));

        let query: TranscriptQuery = serde_json::from_str("{}").unwrap();
        assert!(query.format.is_none());
    }
}
