//! # Audio Transcription REST API Handlers
//!
//! Batch speech-to-text over HTTP: a complete audio file arrives as multipart
//! form data and the transcript comes back either as one JSON body or as an
//! incremental NDJSON stream.
//!
//! ## Available Endpoints:
//! - `POST /v1/audio/transcriptions` - Transcribe an uploaded WAV file

use crate::audio::io::parse_wav;
use crate::error::AppError;
use crate::models::{BatchTranscriptionStream, TranscribeRequest};
use crate::state::AppState;
use actix_multipart::{Field, Multipart};
use actix_web::{web, HttpResponse};
use futures_util::StreamExt;
use serde_json::json;
use tracing::{debug, info};

/// Text fields accepted alongside the audio file.
#[derive(Debug, Default)]
struct TranscriptionFields {
    model: Option<String>,
    language: Option<String>,
    temperature: Option<f64>,
    stream: bool,
}

/// Transcribe an uploaded audio file.
///
/// ## Endpoint: `POST /v1/audio/transcriptions`
///
/// ## Request:
/// Multipart form data with a 16-bit PCM WAV file in the `file` field, plus
/// optional text fields `model`, `language`, `temperature` and `stream`.
///
/// ## Response (stream=false):
/// ```json
/// {
///   "text": "full transcript",
///   "segments": [
///     {"id": 0, "start": 0.0, "end": 4.2, "text": "full transcript"}
///   ],
///   "model": "base",
///   "timestamp": "2025-01-01T12:00:00Z"
/// }
/// ```
///
/// With `stream=true` the body is `application/x-ndjson` instead: one record
/// per segment, then a terminal record carrying the full text. A failure
/// before the first record is a plain error response, not a broken stream.
pub async fn transcribe_upload(
    mut payload: Multipart,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    let mut audio_data: Option<Vec<u8>> = None;
    let mut filename: Option<String> = None;
    let mut fields = TranscriptionFields::default();

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
            filename = content_disposition.get_filename().map(|s| s.to_string());
            audio_data =
                Some(read_file_field(&mut field, config.performance.max_upload_bytes).await?);
        } else {
            let value = read_text_field(&mut field, &field_name).await?;
            match field_name.as_str() {
                "model" => fields.model = Some(value),
                "language" => fields.language = Some(value),
                "temperature" => fields.temperature = Some(parse_temperature(&value)?),
                "stream" => fields.stream = parse_stream_flag(&value)?,
                other => debug!("Ignoring unknown form field '{}'", other),
            }
        }
    }

    let audio_bytes = audio_data
        .ok_or_else(|| AppError::ValidationError("No audio file provided".to_string()))?;
    let filename = filename.unwrap_or_else(|| "unknown".to_string());

    let (samples, sample_rate) = parse_wav(&audio_bytes)?;

    let model_key = fields
        .model
        .unwrap_or_else(|| config.models.default_stt_model.clone());
    let handle = state.models.acquire(&model_key).await?;

    info!(
        "Transcribing upload '{}' ({} samples @ {} Hz) with model '{}'",
        filename,
        samples.len(),
        sample_rate,
        model_key
    );

    let request = TranscribeRequest::new(samples, sample_rate)
        .with_language(fields.language)
        .with_temperature(fields.temperature);
    let output = tokio::task::spawn_blocking(move || handle.transcribe(&request))
        .await
        .map_err(|e| AppError::Internal(format!("transcription task failed: {}", e)))??;

    if fields.stream {
        Ok(HttpResponse::Ok()
            .content_type("application/x-ndjson")
            .streaming(BatchTranscriptionStream::from_output(output)))
    } else {
        Ok(HttpResponse::Ok().json(json!({
            "text": output.text,
            "segments": output.segments,
            "model": model_key,
            "timestamp": chrono::Utc::now().to_rfc3339()
        })))
    }
}

/// Drain a file field, enforcing the upload cap as chunks arrive rather than
/// after buffering an arbitrarily large body.
pub(crate) async fn read_file_field(
    field: &mut Field,
    max_bytes: usize,
) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        if bytes.len() + chunk.len() > max_bytes {
            return Err(AppError::ValidationError(format!(
                "File too large: exceeds {} bytes",
                max_bytes
            )));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Drain a text field into a UTF-8 string.
pub(crate) async fn read_text_field(field: &mut Field, name: &str) -> Result<String, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk = chunk.map_err(|e| AppError::ValidationError(format!("Chunk error: {}", e)))?;
        bytes.extend_from_slice(&chunk);
    }
    String::from_utf8(bytes)
        .map_err(|_| AppError::ValidationError(format!("Field '{}' is not valid UTF-8", name)))
}

fn parse_temperature(raw: &str) -> Result<f64, AppError> {
    let value: f64 = raw.trim().parse().map_err(|_| {
        AppError::BadRequest(format!("Invalid temperature '{}': expected a number", raw))
    })?;
    if !(0.0..=1.0).contains(&value) {
        return Err(AppError::BadRequest(format!(
            "Invalid temperature {}: must be between 0.0 and 1.0",
            value
        )));
    }
    Ok(value)
}

fn parse_stream_flag(raw: &str) -> Result<bool, AppError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(AppError::BadRequest(format!(
            "Invalid stream flag '{}': expected true or false",
            other
        ))),
    }
}
