//! # Whisper Engine
//!
//! Bundled speech-to-text engine: candle-transformers Whisper inference with
//! Hugging Face Hub model resolution.
//!
//! ## Transcription pipeline:
//! 1. Resample to 16 kHz mono if the input arrives at another rate
//! 2. Log-mel spectrogram over the whole clip
//! 3. Decode 30-second windows sequentially, retrying each window across a
//!    temperature ladder when the decoder degenerates
//! 4. Assemble per-window segments with absolute time offsets

use std::borrow::Cow;
use std::path::PathBuf;

use anyhow::{anyhow, Context};
use candle_core::{Device, IndexOp, Tensor, D};
use candle_nn::ops::softmax;
use candle_nn::VarBuilder;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::whisper::{self as m, audio, Config};
use futures_util::future::BoxFuture;
use hf_hub::api::tokio::{Api, ApiBuilder};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};
use crate::models::cache::{
    ModelLoader, SpeechToText, TranscribeRequest, TranscriptSegment, TranscriptionOutput,
};

/// Seed for the sampling rungs of the temperature ladder. Fixed so repeated
/// runs over the same audio stay comparable.
const DECODE_SEED: u64 = 299_792_458;

/// Short aliases for the openai checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WhisperVariant {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl WhisperVariant {
    /// The Hub repository backing this alias.
    pub fn repo_id(&self) -> &'static str {
        match self {
            WhisperVariant::Tiny => "openai/whisper-tiny",
            WhisperVariant::Base => "openai/whisper-base",
            WhisperVariant::Small => "openai/whisper-small",
            WhisperVariant::Medium => "openai/whisper-medium",
            WhisperVariant::Large => "openai/whisper-large-v2",
        }
    }
}

impl std::str::FromStr for WhisperVariant {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(WhisperVariant::Tiny),
            "base" => Ok(WhisperVariant::Base),
            "small" => Ok(WhisperVariant::Small),
            "medium" => Ok(WhisperVariant::Medium),
            "large" => Ok(WhisperVariant::Large),
            other => Err(AppError::ModelLoad(format!("unknown model alias: {}", other))),
        }
    }
}

impl std::fmt::Display for WhisperVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            WhisperVariant::Tiny => "tiny",
            WhisperVariant::Base => "base",
            WhisperVariant::Small => "small",
            WhisperVariant::Medium => "medium",
            WhisperVariant::Large => "large",
        };
        write!(f, "{}", name)
    }
}

/// Resolve a model key to a Hub repository id. Keys containing a slash are
/// taken as full repository ids; anything else must be a known alias.
pub fn resolve_repo(key: &str) -> AppResult<String> {
    if key.contains('/') {
        return Ok(key.to_string());
    }
    let variant: WhisperVariant = key.parse()?;
    Ok(variant.repo_id().to_string())
}

/// Production [`ModelLoader`]: resolves keys against the Hub and builds
/// [`WhisperEngine`]s on the configured device.
pub struct WhisperLoader {
    device: Device,
}

impl WhisperLoader {
    pub fn new(device: Device) -> Self {
        Self { device }
    }
}

impl ModelLoader for WhisperLoader {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, AppResult<Box<dyn SpeechToText>>> {
        Box::pin(async move {
            let engine = WhisperEngine::load(key, self.device.clone()).await?;
            Ok(Box::new(engine) as Box<dyn SpeechToText>)
        })
    }
}

/// Outcome of one decoding pass over a single mel window.
struct DecodingResult {
    text: String,
    avg_logprob: f64,
    no_speech_prob: f64,
    repetitive: bool,
    temperature: f64,
}

/// A loaded Whisper checkpoint ready for transcription.
pub struct WhisperEngine {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    device: Device,
    mel_filters: Vec<f32>,
    sot_token: u32,
    eot_token: u32,
    transcribe_token: u32,
    no_timestamps_token: u32,
    no_speech_token: Option<u32>,
    multilingual: bool,
}

impl WhisperEngine {
    /// Resolve `key` on the Hugging Face Hub, download the model files, and
    /// map the weights onto `device`.
    pub async fn load(key: &str, device: Device) -> AppResult<Self> {
        let repo_id = resolve_repo(key)?;
        info!(model = %key, repo = %repo_id, "fetching model files");

        let (config_path, tokenizer_path, weights_path) = fetch_model_files(&repo_id)
            .await
            .map_err(|e| AppError::ModelLoad(format!("{:#}", e)))?;

        // Weight mapping and the smoke test are seconds of CPU work; keep
        // them off the event loop.
        let engine = tokio::task::spawn_blocking(move || -> anyhow::Result<WhisperEngine> {
            let mut engine = Self::from_files(config_path, tokenizer_path, weights_path, device)?;
            engine.smoke_test()?;
            Ok(engine)
        })
        .await
        .map_err(|e| AppError::Internal(format!("model load task failed: {}", e)))?
        .map_err(|e| AppError::ModelLoad(format!("{:#}", e)))?;

        info!(model = %key, "model ready");
        Ok(engine)
    }

    fn from_files(
        config_path: PathBuf,
        tokenizer_path: PathBuf,
        weights_path: PathBuf,
        device: Device,
    ) -> anyhow::Result<Self> {
        let started = std::time::Instant::now();

        let config: Config =
            serde_json::from_str(&std::fs::read_to_string(&config_path).context("read model config")?)
                .context("parse model config")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("load tokenizer: {}", e))?;

        let mel_filters = mel_filter_bank(config.num_mel_bins);

        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], m::DTYPE, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone()).context("map model weights")?;

        let sot_token = token_id(&tokenizer, m::SOT_TOKEN)?;
        let eot_token = token_id(&tokenizer, m::EOT_TOKEN)?;
        let transcribe_token = token_id(&tokenizer, m::TRANSCRIBE_TOKEN)?;
        let no_timestamps_token = token_id(&tokenizer, m::NO_TIMESTAMPS_TOKEN)?;
        let no_speech_token = m::NO_SPEECH_TOKENS
            .iter()
            .find_map(|token| tokenizer.token_to_id(token));
        // English-only checkpoints ship without language tokens.
        let multilingual = tokenizer.token_to_id("<|en|>").is_some();

        debug!(
            mel_bins = config.num_mel_bins,
            multilingual,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "model weights mapped"
        );

        Ok(Self {
            model,
            config,
            tokenizer,
            device,
            mel_filters,
            sot_token,
            eot_token,
            transcribe_token,
            no_timestamps_token,
            no_speech_token,
            multilingual,
        })
    }

    /// Decode one second of silence so a broken checkpoint fails at load time
    /// rather than on the first request.
    fn smoke_test(&mut self) -> anyhow::Result<()> {
        let silence = vec![0f32; m::SAMPLE_RATE];
        let request = TranscribeRequest::new(silence, m::SAMPLE_RATE as u32);
        let output = self.transcribe_inner(&request)?;
        debug!(text = %output.text, "load smoke test passed");
        Ok(())
    }

    fn transcribe_inner(&mut self, request: &TranscribeRequest) -> anyhow::Result<TranscriptionOutput> {
        if request.samples.is_empty() {
            anyhow::bail!("audio is empty");
        }

        let samples: Cow<'_, [f32]> = if request.sample_rate == m::SAMPLE_RATE as u32 {
            Cow::Borrowed(&request.samples)
        } else {
            debug!(from_rate = request.sample_rate, "resampling to 16 kHz");
            Cow::Owned(resample_linear(
                &request.samples,
                request.sample_rate,
                m::SAMPLE_RATE as u32,
            ))
        };

        let started = std::time::Instant::now();
        let language_token = self.language_token(request.language.as_deref());
        let base_temperature = request.temperature.unwrap_or(0.0);

        let mel = audio::pcm_to_mel(&self.config, samples.as_ref(), &self.mel_filters);
        let mel_len = mel.len();
        let n_mels = self.config.num_mel_bins;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_len / n_mels), &self.device)?;
        let (_, _, content_frames) = mel.dims3()?;

        let mut segments: Vec<TranscriptSegment> = Vec::new();
        let mut seek = 0;
        while seek < content_frames {
            let window = usize::min(content_frames - seek, m::N_FRAMES);
            let start = seek as f64 * m::HOP_LENGTH as f64 / m::SAMPLE_RATE as f64;
            let end = (seek + window) as f64 * m::HOP_LENGTH as f64 / m::SAMPLE_RATE as f64;
            let mel_window = mel.narrow(2, seek, window)?;
            seek += window;

            let decoded = self.decode_with_fallback(&mel_window, language_token, base_temperature)?;
            if decoded.no_speech_prob > m::NO_SPEECH_THRESHOLD
                && decoded.avg_logprob < m::LOGPROB_THRESHOLD
            {
                debug!(start, end, no_speech_prob = decoded.no_speech_prob, "skipping no-speech window");
                continue;
            }

            let text = decoded.text.trim().to_string();
            if text.is_empty() {
                continue;
            }
            debug!(start, end, temperature = decoded.temperature, text = %text, "window decoded");
            segments.push(TranscriptSegment {
                id: segments.len(),
                start,
                end,
                text,
            });
        }

        let text = segments
            .iter()
            .map(|segment| segment.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        debug!(
            audio_secs = samples.len() as f64 / m::SAMPLE_RATE as f64,
            segments = segments.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "transcription complete"
        );

        Ok(TranscriptionOutput { text, segments })
    }

    /// Map a language hint to its token. English-only checkpoints carry no
    /// language tokens, so the hint is ignored there.
    fn language_token(&self, language: Option<&str>) -> Option<u32> {
        let language = language?;
        if !self.multilingual {
            debug!(language, "english-only checkpoint, ignoring language hint");
            return None;
        }
        let token = format!("<|{}|>", language.to_lowercase());
        match self.tokenizer.token_to_id(&token) {
            Some(id) => Some(id),
            None => {
                warn!(language, "unknown language hint, letting the model decide");
                None
            }
        }
    }

    /// Decode one window, walking the temperature ladder upward from
    /// `base_temperature` while the output looks degenerate.
    fn decode_with_fallback(
        &mut self,
        mel: &Tensor,
        language_token: Option<u32>,
        base_temperature: f64,
    ) -> anyhow::Result<DecodingResult> {
        let ladder: Vec<f64> = m::TEMPERATURES
            .iter()
            .copied()
            .filter(|t| *t >= base_temperature)
            .collect();
        let ladder = if ladder.is_empty() {
            vec![base_temperature]
        } else {
            ladder
        };

        for &temperature in &ladder[..ladder.len() - 1] {
            match self.decode(mel, language_token, temperature) {
                Ok(decoded) => {
                    let needs_fallback =
                        decoded.repetitive || decoded.avg_logprob < m::LOGPROB_THRESHOLD;
                    if !needs_fallback || decoded.no_speech_prob > m::NO_SPEECH_THRESHOLD {
                        return Ok(decoded);
                    }
                    debug!(
                        temperature,
                        avg_logprob = decoded.avg_logprob,
                        repetitive = decoded.repetitive,
                        "degenerate decode, retrying hotter"
                    );
                }
                Err(err) => {
                    warn!(temperature, error = %err, "decode attempt failed, retrying hotter");
                }
            }
        }

        // Last rung: whatever comes back is the answer.
        self.decode(mel, language_token, ladder[ladder.len() - 1])
    }

    fn decode(
        &mut self,
        mel: &Tensor,
        language_token: Option<u32>,
        temperature: f64,
    ) -> anyhow::Result<DecodingResult> {
        let audio_features = self.model.encoder.forward(mel, true)?;
        let sample_len = self.config.max_target_positions / 2;
        let sampling_temperature = if temperature > 0.0 { Some(temperature) } else { None };
        let mut logits_processor = LogitsProcessor::new(DECODE_SEED, sampling_temperature, None);

        let mut tokens = vec![self.sot_token];
        if let Some(language_token) = language_token {
            tokens.push(language_token);
        }
        tokens.push(self.transcribe_token);
        tokens.push(self.no_timestamps_token);
        let prompt_len = tokens.len();

        let mut sum_logprob = 0f64;
        let mut no_speech_prob = f64::NAN;
        let mut repetitive = false;

        for i in 0..sample_len {
            let input = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
            let ys = self.model.decoder.forward(&input, &audio_features, i == 0)?;

            // The no-speech probability is read off the first forward pass at
            // the start-of-transcript position.
            if i == 0 {
                if let Some(no_speech_token) = self.no_speech_token {
                    let first = self.model.decoder.final_linear(&ys.i(..1)?)?.i(0)?.i(0)?;
                    no_speech_prob = softmax(&first, 0)?
                        .i(no_speech_token as usize)?
                        .to_scalar::<f32>()? as f64;
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let logits = self
                .model
                .decoder
                .final_linear(&ys.i((..1, seq_len - 1..))?)?
                .i(0)?
                .i(0)?;

            let next_token = logits_processor.sample(&logits)?;
            if next_token == self.eot_token || tokens.len() > self.config.max_target_positions {
                break;
            }
            if is_repetitive(&tokens[prompt_len..], next_token) {
                repetitive = true;
                break;
            }

            let prob = softmax(&logits, D::Minus1)?
                .i(next_token as usize)?
                .to_scalar::<f32>()? as f64;
            sum_logprob += prob.ln();
            tokens.push(next_token);
        }

        let text = self
            .tokenizer
            .decode(&tokens[prompt_len..], true)
            .map_err(|e| anyhow!("decode tokens: {}", e))?;
        let avg_logprob = sum_logprob / tokens.len() as f64;

        Ok(DecodingResult {
            text,
            avg_logprob,
            no_speech_prob,
            repetitive,
            temperature,
        })
    }
}

impl SpeechToText for WhisperEngine {
    fn transcribe(&mut self, request: &TranscribeRequest) -> AppResult<TranscriptionOutput> {
        self.transcribe_inner(request)
            .map_err(|e| AppError::Transcription(format!("{:#}", e)))
    }
}

async fn fetch_model_files(repo_id: &str) -> anyhow::Result<(PathBuf, PathBuf, PathBuf)> {
    let api = hub_api()?;
    let repo = api.model(repo_id.to_string());

    let config_path = repo
        .get("config.json")
        .await
        .with_context(|| format!("download config.json from {}", repo_id))?;
    let tokenizer_path = repo
        .get("tokenizer.json")
        .await
        .with_context(|| format!("download tokenizer.json from {}", repo_id))?;
    let weights_path = repo.get("model.safetensors").await.with_context(|| {
        format!(
            "download model.safetensors from {} (only safetensors checkpoints are supported)",
            repo_id
        )
    })?;

    Ok((config_path, tokenizer_path, weights_path))
}

/// Hub client honoring the usual `HF_*` environment variables.
fn hub_api() -> anyhow::Result<Api> {
    let mut builder = ApiBuilder::new().with_progress(false);
    builder = builder.with_token(std::env::var("HF_TOKEN").ok());
    if let Ok(endpoint) = std::env::var("HF_ENDPOINT") {
        builder = builder.with_endpoint(endpoint);
    }
    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
    }
    builder.build().context("create Hugging Face Hub client")
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> anyhow::Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("token {:?} missing from vocabulary", token))
}

/// Convert frequency in Hz to the Slaney mel scale: linear below 1 kHz,
/// logarithmic above.
fn hz_to_mel(freq: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = 15.0;
    const LOGSTEP: f64 = 0.06875177742094912; // ln(6.4) / 27

    if freq < MIN_LOG_HZ {
        freq / F_SP
    } else {
        MIN_LOG_MEL + (freq / MIN_LOG_HZ).ln() / LOGSTEP
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    const F_SP: f64 = 200.0 / 3.0;
    const MIN_LOG_HZ: f64 = 1000.0;
    const MIN_LOG_MEL: f64 = 15.0;
    const LOGSTEP: f64 = 0.06875177742094912;

    if mel < MIN_LOG_MEL {
        mel * F_SP
    } else {
        MIN_LOG_HZ * ((mel - MIN_LOG_MEL) * LOGSTEP).exp()
    }
}

/// Build the triangular mel filter bank for the spectrogram step, laid out
/// row-major as `n_mels` rows of `N_FFT / 2 + 1` coefficients. Matches the
/// filters the reference checkpoints were trained with (Slaney scale, area
/// normalized, 0 Hz to Nyquist).
fn mel_filter_bank(n_mels: usize) -> Vec<f32> {
    let n_freqs = m::N_FFT / 2 + 1;
    let f_max = m::SAMPLE_RATE as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|i| i as f64 * m::SAMPLE_RATE as f64 / m::N_FFT as f64)
        .collect();

    let mel_max = hz_to_mel(f_max);
    let freq_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0f32; n_mels * n_freqs];
    for i in 0..n_mels {
        let lower = freq_points[i];
        let center = freq_points[i + 1];
        let upper = freq_points[i + 2];
        let enorm = 2.0 / (upper - lower);

        for (j, &freq) in fft_freqs.iter().enumerate() {
            let weight = if freq >= lower && freq <= center {
                (freq - lower) / (center - lower)
            } else if freq > center && freq <= upper {
                (upper - freq) / (upper - center)
            } else {
                continue;
            };
            filters[i * n_freqs + j] = (enorm * weight) as f32;
        }
    }

    filters
}

/// Degenerate-output check: the decoder occasionally falls into short token
/// loops, which a hotter temperature usually breaks.
fn is_repetitive(tokens: &[u32], next_token: u32) -> bool {
    if tokens.len() >= 3 && tokens[tokens.len() - 3..] == [next_token; 3] {
        return true;
    }
    if tokens.len() >= 6 {
        let last = &tokens[tokens.len() - 3..];
        let previous = &tokens[tokens.len() - 6..tokens.len() - 3];
        if last == previous {
            return true;
        }
    }
    false
}

/// Linear-interpolation resampler. Good enough for speech heading into a
/// 16 kHz model; quality-critical callers should resample upstream.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / ratio) as usize;
    let mut resampled = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src = i as f64 * ratio;
        let idx = src.floor() as usize;
        let next = (idx + 1).min(samples.len() - 1);
        let frac = (src - idx as f64) as f32;
        resampled.push(samples[idx] * (1.0 - frac) + samples[next] * frac);
    }

    resampled
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_parsing() {
        assert_eq!("medium".parse::<WhisperVariant>().unwrap(), WhisperVariant::Medium);
        assert_eq!("LARGE".parse::<WhisperVariant>().unwrap(), WhisperVariant::Large);
        assert!("invalid".parse::<WhisperVariant>().is_err());
    }

    #[test]
    fn test_variant_round_trips_through_display() {
        for variant in [
            WhisperVariant::Tiny,
            WhisperVariant::Base,
            WhisperVariant::Small,
            WhisperVariant::Medium,
            WhisperVariant::Large,
        ] {
            let parsed: WhisperVariant = variant.to_string().parse().unwrap();
            assert_eq!(parsed, variant);
        }
    }

    #[test]
    fn test_resolve_repo_maps_aliases() {
        assert_eq!(resolve_repo("base").unwrap(), "openai/whisper-base");
        assert_eq!(resolve_repo("large").unwrap(), "openai/whisper-large-v2");
    }

    #[test]
    fn test_resolve_repo_passes_full_ids_through() {
        assert_eq!(
            resolve_repo("distil-whisper/distil-small.en").unwrap(),
            "distil-whisper/distil-small.en"
        );
    }

    #[test]
    fn test_resolve_repo_rejects_unknown_aliases() {
        assert!(matches!(resolve_repo("gigantic"), Err(AppError::ModelLoad(_))));
    }

    #[test]
    fn test_mel_scale_round_trip() {
        for freq in [100.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0] {
            let mel = hz_to_mel(freq);
            let freq_back = mel_to_hz(mel);
            assert!((freq - freq_back).abs() < 0.001, "failed for {} Hz", freq);
        }
    }

    #[test]
    fn test_mel_filter_bank_shape_and_coverage() {
        let n_freqs = m::N_FFT / 2 + 1;
        let filters = mel_filter_bank(80);

        assert_eq!(filters.len(), 80 * n_freqs);
        assert!(filters.iter().all(|v| v.is_finite()));
        for row in 0..80 {
            let sum: f32 = filters[row * n_freqs..(row + 1) * n_freqs].iter().sum();
            assert!(sum > 0.0, "filter row {} is empty", row);
        }
    }

    #[test]
    fn test_repetition_detector() {
        // Three identical trailing tokens plus the same candidate.
        assert!(is_repetitive(&[10, 7, 7, 7], 7));
        // A repeating trigram.
        assert!(is_repetitive(&[1, 2, 3, 1, 2, 3], 9));
        // Healthy sequences pass.
        assert!(!is_repetitive(&[1, 2, 3, 4, 5, 6], 7));
        // Too short to judge.
        assert!(!is_repetitive(&[7, 7], 7));
    }

    #[test]
    fn test_resample_halves_sample_count() {
        let samples: Vec<f32> = (0..32_000).map(|i| (i as f32 / 32_000.0).sin()).collect();
        let resampled = resample_linear(&samples, 32_000, 16_000);

        assert_eq!(resampled.len(), 16_000);
        assert!(resampled.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1f32, -0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16_000, 16_000), samples);
    }
}
