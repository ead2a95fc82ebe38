//! # Model Cache
//!
//! Keyed cache of loaded speech-to-text model handles, shared by every request
//! in the process.
//!
//! ## Guarantees:
//! - **Load-once**: at most one load runs per key; every caller for that key
//!   observes the same handle instance
//! - **No partial states**: acquire, release, and listing all run under the
//!   same lock, so the map is never seen mid-update
//! - **Safe eviction**: releasing a key only forgets the cache entry; requests
//!   already holding the handle keep a usable reference

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

/// One transcription request: audio samples plus generation options.
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    /// Mono samples, normalized to [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Optional language hint, e.g. "en".
    pub language: Option<String>,
    /// Sampling temperature the decoder starts from.
    pub temperature: Option<f64>,
}

impl TranscribeRequest {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            language: None,
            temperature: None,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }
}

/// One time-aligned piece of a transcription.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TranscriptSegment {
    pub id: usize,
    /// Seconds from the start of the submitted audio.
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Complete result of one transcription call.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct TranscriptionOutput {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
}

/// The speech-to-text capability behind a model handle.
///
/// Implementations may mutate internal decoder state, so the call takes
/// `&mut self`; [`ModelHandle`] provides the shared `&self` surface by locking
/// internally.
pub trait SpeechToText: Send {
    fn transcribe(&mut self, request: &TranscribeRequest) -> AppResult<TranscriptionOutput>;
}

/// Builds an engine for a model key.
///
/// Injected into [`ModelCache`] at construction so tests can count loads and
/// additional engine families can slot in without touching the cache.
pub trait ModelLoader: Send + Sync {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, AppResult<Box<dyn SpeechToText>>>;
}

/// Allow a shared loader to be handed to the cache while the caller keeps a
/// reference, e.g. to read counters in tests.
impl<L: ModelLoader> ModelLoader for Arc<L> {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, AppResult<Box<dyn SpeechToText>>> {
        (**self).load(key)
    }
}

/// A loaded model shared between the cache and any number of in-flight
/// requests.
///
/// The engine's decoder state is not safe for concurrent invocation, so the
/// handle serializes transcription calls behind an internal lock. Eviction
/// from the cache does not invalidate outstanding references; the handle lives
/// until the last `Arc` drops.
pub struct ModelHandle {
    key: String,
    loaded_at: DateTime<Utc>,
    engine: StdMutex<Box<dyn SpeechToText>>,
}

impl ModelHandle {
    pub fn new(key: String, engine: Box<dyn SpeechToText>) -> Self {
        Self {
            key,
            loaded_at: Utc::now(),
            engine: StdMutex::new(engine),
        }
    }

    /// The cache key this handle was loaded under.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Run one transcription.
    ///
    /// Blocks while another call holds the engine, so call sites must already
    /// be off the event loop (`spawn_blocking` / `web::block`).
    pub fn transcribe(&self, request: &TranscribeRequest) -> AppResult<TranscriptionOutput> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| AppError::Transcription("model engine lock poisoned".to_string()))?;
        engine.transcribe(request)
    }
}

/// Shared cache mapping model keys to loaded handles.
///
/// ## Concurrency:
/// One async mutex guards the map and is held across the load itself, so
/// concurrent `acquire` calls queue: the first caller for a key performs the
/// load, every later caller finds the cached handle. Loads are rare and slow
/// compared to lookups, so the lost load parallelism is not worth per-key
/// bookkeeping.
pub struct ModelCache {
    loader: Box<dyn ModelLoader>,
    entries: Mutex<HashMap<String, Arc<ModelHandle>>>,
}

impl ModelCache {
    pub fn new(loader: Box<dyn ModelLoader>) -> Self {
        Self {
            loader,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the handle for `key`, loading it first if nothing is cached.
    ///
    /// Every caller for the same key observes the same handle instance, and
    /// the underlying load runs at most once per cached lifetime of the key.
    /// A failed load leaves the cache unchanged.
    pub async fn acquire(&self, key: &str) -> AppResult<Arc<ModelHandle>> {
        let mut entries = self.entries.lock().await;

        if let Some(handle) = entries.get(key) {
            debug!(model = %key, "model cache hit");
            return Ok(Arc::clone(handle));
        }

        info!(model = %key, "model cache miss, loading");
        let started = std::time::Instant::now();
        let engine = self.loader.load(key).await?;
        let handle = Arc::new(ModelHandle::new(key.to_string(), engine));
        entries.insert(key.to_string(), Arc::clone(&handle));
        info!(
            model = %key,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "model loaded"
        );

        Ok(handle)
    }

    /// Forget the handle for `key`. Returns whether an entry was removed.
    ///
    /// Does not wait for in-flight users: anyone already holding the handle
    /// keeps using it, the cache merely stops handing it out.
    pub async fn release(&self, key: &str) -> bool {
        let removed = self.entries.lock().await.remove(key).is_some();
        if removed {
            info!(model = %key, "model released from cache");
        }
        removed
    }

    /// Keys currently cached, in no particular order.
    pub async fn list_keys(&self) -> Vec<String> {
        self.entries.lock().await.keys().cloned().collect()
    }

    /// Snapshot of the cached handles, for the HTTP model listing.
    pub async fn snapshot(&self) -> Vec<Arc<ModelHandle>> {
        self.entries.lock().await.values().cloned().collect()
    }
}

/// Canned speech-to-text engine for tests.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct MockSpeechToText {
    response: String,
    should_fail: bool,
}

#[cfg(test)]
impl MockSpeechToText {
    pub fn new() -> Self {
        Self {
            response: "mock transcription".to_string(),
            should_fail: false,
        }
    }

    /// Configure the mock to return a specific transcript.
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the mock to fail on transcribe.
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }
}

#[cfg(test)]
impl Default for MockSpeechToText {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl SpeechToText for MockSpeechToText {
    fn transcribe(&mut self, request: &TranscribeRequest) -> AppResult<TranscriptionOutput> {
        if self.should_fail {
            return Err(AppError::Transcription(
                "mock transcription failure".to_string(),
            ));
        }
        let duration = request.samples.len() as f64 / request.sample_rate as f64;
        Ok(TranscriptionOutput {
            text: self.response.clone(),
            segments: vec![TranscriptSegment {
                id: 0,
                start: 0.0,
                end: duration,
                text: self.response.clone(),
            }],
        })
    }
}

/// Counting loader for cache tests: hands out [`MockSpeechToText`] engines and
/// records how many loads actually ran.
#[cfg(test)]
pub struct MockLoader {
    loads: std::sync::atomic::AtomicUsize,
    delay: Option<std::time::Duration>,
    should_fail: bool,
}

#[cfg(test)]
impl MockLoader {
    pub fn new() -> Self {
        Self {
            loads: std::sync::atomic::AtomicUsize::new(0),
            delay: None,
            should_fail: false,
        }
    }

    /// Make each load take a while, so tests can overlap acquisitions.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Number of load calls that reached this loader.
    pub fn load_count(&self) -> usize {
        self.loads.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
impl ModelLoader for MockLoader {
    fn load<'a>(&'a self, key: &'a str) -> BoxFuture<'a, AppResult<Box<dyn SpeechToText>>> {
        Box::pin(async move {
            self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.should_fail {
                return Err(AppError::ModelLoad(format!("mock load failure for {}", key)));
            }
            let engine =
                MockSpeechToText::new().with_response(&format!("transcript from {}", key));
            Ok(Box::new(engine) as Box<dyn SpeechToText>)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future;
    use std::time::Duration;

    fn test_cache() -> (Arc<MockLoader>, ModelCache) {
        let loader = Arc::new(MockLoader::new());
        let cache = ModelCache::new(Box::new(Arc::clone(&loader)));
        (loader, cache)
    }

    #[tokio::test]
    async fn test_acquire_loads_once_for_repeated_key() {
        let (loader, cache) = test_cache();

        let first = cache.acquire("base").await.unwrap();
        let second = cache.acquire("base").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_a_single_load() {
        let loader = Arc::new(MockLoader::new().with_delay(Duration::from_millis(20)));
        let cache = ModelCache::new(Box::new(Arc::clone(&loader)));

        let results = future::join_all((0..10).map(|_| cache.acquire("base"))).await;

        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_acquire_loads_each_key_once() {
        let (loader, cache) = test_cache();

        cache.acquire("tiny").await.unwrap();
        cache.acquire("base").await.unwrap();
        cache.acquire("tiny").await.unwrap();

        assert_eq!(loader.load_count(), 2);

        let mut keys = cache.list_keys().await;
        keys.sort();
        assert_eq!(keys, vec!["base".to_string(), "tiny".to_string()]);
    }

    #[tokio::test]
    async fn test_release_reports_presence() {
        let (_loader, cache) = test_cache();
        cache.acquire("base").await.unwrap();

        assert!(cache.release("base").await);
        assert!(!cache.release("base").await);
        assert!(cache.list_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_release_unknown_key_returns_false() {
        let (_loader, cache) = test_cache();
        assert!(!cache.release("never-loaded").await);
        assert!(cache.list_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_after_release_loads_a_fresh_handle() {
        let (loader, cache) = test_cache();

        let first = cache.acquire("base").await.unwrap();
        cache.release("base").await;
        let second = cache.acquire("base").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(loader.load_count(), 2);

        // The evicted handle still works for whoever held it.
        let request = TranscribeRequest::new(vec![0.0; 160], 16_000);
        let output = first.transcribe(&request).unwrap();
        assert_eq!(output.text, "transcript from base");
    }

    #[tokio::test]
    async fn test_failed_load_leaves_cache_unchanged() {
        let loader = Arc::new(MockLoader::new().with_failure());
        let cache = ModelCache::new(Box::new(Arc::clone(&loader)));

        let result = cache.acquire("base").await;

        assert!(matches!(result, Err(AppError::ModelLoad(_))));
        assert!(cache.list_keys().await.is_empty());
    }

    #[test]
    fn test_handle_reports_key_and_load_time() {
        let before = Utc::now();
        let handle = ModelHandle::new("base".to_string(), Box::new(MockSpeechToText::new()));

        assert_eq!(handle.key(), "base");
        assert!(handle.loaded_at() >= before);
        assert!(handle.loaded_at() <= Utc::now());
    }

    #[test]
    fn test_handle_surfaces_engine_failure() {
        let engine = MockSpeechToText::new().with_failure();
        let handle = ModelHandle::new("base".to_string(), Box::new(engine));

        let request = TranscribeRequest::new(vec![0.0; 160], 16_000);
        let result = handle.transcribe(&request);

        assert!(matches!(result, Err(AppError::Transcription(_))));
    }

    #[test]
    fn test_mock_engine_reports_audio_duration() {
        let mut engine = MockSpeechToText::new().with_response("hello");
        let request = TranscribeRequest::new(vec![0.0; 32_000], 16_000);

        let output = engine.transcribe(&request).unwrap();

        assert_eq!(output.text, "hello");
        assert_eq!(output.segments.len(), 1);
        assert!((output.segments[0].end - 2.0).abs() < f64::EPSILON);
    }
}
