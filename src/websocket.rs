//! # Realtime Transcription WebSocket
//!
//! Streams microphone audio to a speech model and returns utterance-level
//! transcripts as they are recognized. Clients connect to
//! `/ws/transcriptions`.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the server refuses the upgrade when the session cap is
//!    reached
//! 2. **Configuration**: first text frame is a JSON config selecting the
//!    model, an optional language hint, and the PCM sample rate
//! 3. **Ready**: the server loads (or reuses) the model, then acknowledges
//!    with `{"status": "ready"}`
//! 4. **Audio Streaming**: subsequent binary frames carry raw PCM audio
//! 5. **Results**: each flushed utterance comes back as
//!    `{"text": "...", "is_partial": false}`
//!
//! ## Message Format:
//! - **Client → Server**: binary 16-bit little-endian mono PCM
//! - **Server → Client**: JSON text frames (ready, results, errors)
//!
//! Configuration failures send an error frame and close the connection.
//! A segment that fails to transcribe is logged and skipped; the session
//! keeps running. Segments are transcribed one at a time in arrival order,
//! and audio received mid-transcription waits in the mailbox.

use crate::audio::io::{parse_pcm16, TempArtifact};
use crate::audio::segmenter::{Segment, SegmentAccumulator};
use crate::audio::vad::VoiceActivityGate;
use crate::error::AppError;
use crate::models::{ModelHandle, TranscribeRequest};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Ping cadence for open connections.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Close the connection when the client has been silent this long.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// First frame a client sends. Everything is optional; omitted fields fall
/// back to the server configuration.
#[derive(Debug, Deserialize)]
struct SessionConfig {
    /// Model key: a size alias or a full Hugging Face repository id.
    model: Option<String>,
    /// Language hint forwarded to the decoder.
    language: Option<String>,
    /// PCM sample rate of the inbound audio, in Hz.
    sample_rate: Option<u32>,
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    /// Connected, waiting for the configuration frame.
    AwaitingConfig,
    /// Model acquired and acknowledged, no audio received yet.
    Ready,
    /// Audio frames are flowing.
    Receiving,
    /// Terminal. Remaining mailbox frames are ignored.
    Closed,
}

fn ready_frame() -> String {
    json!({ "status": "ready", "message": "Ready to transcribe" }).to_string()
}

fn result_frame(text: &str) -> String {
    json!({ "text": text, "is_partial": false }).to_string()
}

/// Same envelope the HTTP error responses use.
fn error_frame(err: &AppError) -> String {
    json!({
        "error": {
            "type": err.error_type(),
            "message": err.to_string(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }
    })
    .to_string()
}

/// Actor owning one realtime transcription session.
///
/// Each connection gets its own accumulator and model handle; nothing here
/// is shared across sessions except the model cache behind `AppState`.
pub struct StreamingSession {
    /// Server-assigned identifier, used in logs.
    id: Uuid,

    /// Shared application state (model cache, config, session accounting).
    state: web::Data<AppState>,

    phase: SessionPhase,

    /// Loaded model handle, populated when configuration succeeds.
    model: Option<Arc<ModelHandle>>,

    /// Language hint from the configuration frame.
    language: Option<String>,

    /// Energy gate classifying VAD frames.
    gate: VoiceActivityGate,

    /// Speech buffer, created once the sample rate is known.
    accumulator: Option<SegmentAccumulator>,

    /// Last time the client gave any sign of life.
    last_heartbeat: Instant,
}

impl StreamingSession {
    pub fn new(state: web::Data<AppState>, gate: VoiceActivityGate) -> Self {
        Self {
            id: Uuid::new_v4(),
            state,
            phase: SessionPhase::AwaitingConfig,
            model: None,
            language: None,
            gate,
            accumulator: None,
            last_heartbeat: Instant::now(),
        }
    }

    /// Emit an error frame and stop the actor. Only unrecoverable failures
    /// come through here; per-segment errors are logged and skipped.
    fn fail(&mut self, ctx: &mut ws::WebsocketContext<Self>, err: AppError) {
        warn!(session = %self.id, error = %err, "closing realtime session");
        ctx.text(error_frame(&err));
        self.phase = SessionPhase::Closed;
        ctx.stop();
    }

    /// Handle the configuration frame: build the segmenter for the client's
    /// sample rate and acquire the requested model.
    ///
    /// The acquire runs through `ctx.wait`, so no audio is processed until
    /// the model is ready and the acknowledgement has been sent.
    fn apply_config(&mut self, config: SessionConfig, ctx: &mut ws::WebsocketContext<Self>) {
        let mut segmenter = self.state.config.segmenter;
        if let Some(rate) = config.sample_rate {
            segmenter.sample_rate = rate;
        }
        if let Err(reason) = segmenter.validate() {
            self.fail(ctx, AppError::BadRequest(reason));
            return;
        }

        let model_key = config
            .model
            .unwrap_or_else(|| self.state.config.models.default_stt_model.clone());
        self.language = config.language;
        self.accumulator = Some(SegmentAccumulator::new(segmenter));

        info!(
            session = %self.id,
            model = %model_key,
            sample_rate = segmenter.sample_rate,
            "configuring realtime session"
        );

        let models = Arc::clone(&self.state.models);
        let load = async move { models.acquire(&model_key).await };
        ctx.wait(load.into_actor(self).map(|result, act, ctx| match result {
            Ok(handle) => {
                act.model = Some(handle);
                act.phase = SessionPhase::Ready;
                ctx.text(ready_frame());
            }
            Err(err) => act.fail(ctx, err),
        }));
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match self.phase {
            SessionPhase::AwaitingConfig => match serde_json::from_str::<SessionConfig>(text) {
                Ok(config) => self.apply_config(config, ctx),
                Err(err) => self.fail(
                    ctx,
                    AppError::BadRequest(format!("invalid session config: {}", err)),
                ),
            },
            SessionPhase::Closed => {}
            // Control frames after configuration carry no meaning yet.
            _ => debug!(session = %self.id, frame = %text, "ignoring control frame"),
        }
    }

    /// Feed one binary frame into the accumulator and transcribe whatever
    /// it flushes.
    fn handle_audio(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match self.phase {
            SessionPhase::AwaitingConfig => {
                self.fail(
                    ctx,
                    AppError::BadRequest(
                        "configuration frame must precede audio".to_string(),
                    ),
                );
                return;
            }
            SessionPhase::Closed => return,
            SessionPhase::Ready => self.phase = SessionPhase::Receiving,
            SessionPhase::Receiving => {}
        }

        let pcm = match parse_pcm16(data) {
            Ok(pcm) => pcm,
            Err(err) => {
                // Drop the malformed frame, keep the session alive.
                warn!(session = %self.id, error = %err, "discarding malformed audio frame");
                return;
            }
        };

        let Some(accumulator) = self.accumulator.as_mut() else {
            return;
        };
        match accumulator.push_chunk(&pcm, &self.gate) {
            Ok(Some(segment)) => self.transcribe_segment(segment, ctx),
            Ok(None) => {}
            Err(err) => {
                warn!(session = %self.id, error = %err, "voice activity check failed");
            }
        }
    }

    /// Run one flushed segment through the model.
    ///
    /// `ctx.wait` pauses the mailbox until the result lands, so segments are
    /// transcribed strictly in order and never concurrently within a
    /// session. The staged WAV file is removed when the artifact drops,
    /// whether inference succeeded or not.
    fn transcribe_segment(&mut self, segment: Segment, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(handle) = self.model.clone() else {
            return;
        };
        let scratch_dir = PathBuf::from(&self.state.config.storage.scratch_dir);
        let language = self.language.clone();
        let session = self.id;

        debug!(
            session = %session,
            duration_seconds = segment.duration_seconds(),
            "transcribing segment"
        );

        let work = async move {
            tokio::task::spawn_blocking(move || {
                let artifact =
                    TempArtifact::create(&scratch_dir, &segment.samples, segment.sample_rate)?;
                debug!(session = %session, path = %artifact.path().display(), "segment staged");

                let request = TranscribeRequest::new(segment.samples, segment.sample_rate)
                    .with_language(language);
                handle.transcribe(&request)
            })
            .await
            .map_err(|err| AppError::Internal(format!("transcription task failed: {}", err)))?
        };

        ctx.wait(work.into_actor(self).map(|result, act, ctx| match result {
            Ok(output) => ctx.text(result_frame(&output.text)),
            Err(err) => {
                warn!(session = %act.id, error = %err, "segment transcription failed");
            }
        }));
    }
}

impl Actor for StreamingSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session = %self.id, "realtime session connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session = %act.id, "heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(accumulator) = &self.accumulator {
            if !accumulator.is_empty() {
                debug!(
                    session = %self.id,
                    discarded_seconds = accumulator.buffered_seconds(),
                    "discarding unflushed audio"
                );
            }
        }
        self.state.end_session();
        info!(session = %self.id, "realtime session closed");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for StreamingSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                self.handle_text(&text, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.last_heartbeat = Instant::now();
                self.handle_audio(&data, ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(session = %self.id, ?reason, "client closed connection");
                self.phase = SessionPhase::Closed;
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session = %self.id, "continuation frames are not supported");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(session = %self.id, error = %err, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// HTTP entry point that upgrades the request to a realtime session.
pub async fn transcription_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let gate = VoiceActivityGate::new(state.config.segmenter.vad_aggressiveness)?;

    if !state.try_begin_session() {
        warn!(
            max_sessions = state.config.performance.max_concurrent_sessions,
            "refusing realtime session, capacity reached"
        );
        return Err(AppError::SessionLimit(
            "too many concurrent transcription sessions".to_string(),
        )
        .into());
    }

    info!(
        peer = ?req.connection_info().peer_addr(),
        "websocket connection request"
    );

    let session = StreamingSession::new(state.clone(), gate);
    match ws::start(session, &req, stream) {
        Ok(response) => Ok(response),
        Err(err) => {
            // Handshake failed before the actor started; give the slot back.
            state.end_session();
            Err(err)
        }
    }
}
