//! # Batch Transcription Stream
//!
//! Adapts one whole-file transcription result into newline-delimited JSON for
//! incremental delivery over an HTTP response body: one record per produced
//! segment, then a terminal record carrying the full text.

use std::pin::Pin;
use std::task::{Context, Poll};

use actix_web::web::Bytes;
use futures_util::Stream;
use serde_json::{json, Number, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::AppError;
use crate::models::cache::{TranscriptSegment, TranscriptionOutput};

/// Records buffered ahead of a slow reader before the producer task parks.
const CHANNEL_CAPACITY: usize = 16;

/// Lazy, finite NDJSON body for an HTTP transcription response.
///
/// A background task feeds the records through a bounded channel, so a slow
/// client applies backpressure instead of forcing the whole body into memory,
/// and a disconnected client simply ends the producer.
pub struct BatchTranscriptionStream {
    inner: ReceiverStream<Result<Bytes, AppError>>,
}

impl BatchTranscriptionStream {
    /// Turn a finished transcription into a record sequence.
    pub fn from_output(output: TranscriptionOutput) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            for segment in &output.segments {
                let line = encode_line(segment_record(segment));
                if tx.send(line).await.is_err() {
                    debug!("ndjson reader went away mid-stream");
                    return;
                }
            }
            let line = encode_line(json!({ "text": output.text }));
            if tx.send(line).await.is_err() {
                debug!("ndjson reader went away before the final record");
            }
        });

        Self {
            inner: ReceiverStream::new(rx),
        }
    }
}

impl Stream for BatchTranscriptionStream {
    type Item = Result<Bytes, AppError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// One NDJSON record per segment. Time offsets go through [`json_f64`] so the
/// line stays valid JSON whatever the decoder produced.
fn segment_record(segment: &TranscriptSegment) -> Value {
    json!({
        "id": segment.id,
        "start": json_f64(segment.start),
        "end": json_f64(segment.end),
        "text": segment.text,
    })
}

/// JSON has no NaN or infinities; coerce them to null rather than emitting an
/// unparseable line.
pub fn json_f64(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn encode_line(record: Value) -> Result<Bytes, AppError> {
    let mut line = serde_json::to_vec(&record)
        .map_err(|e| AppError::Internal(format!("encode ndjson record: {}", e)))?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}
