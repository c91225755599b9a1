//! Scripted model stub shared by the stage tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::llm_client::{Completion, CompletionRequest, LanguageModel, LlmError};
use crate::retry::RetryPolicy;
use crate::taxonomy::{build_taxonomy, RawRow, Taxonomy};

type Responder = Box<dyn Fn(&CompletionRequest) -> Result<Completion, LlmError> + Send + Sync>;

/// Replays queued results first, then falls back to the responder
pub struct ScriptedModel {
    queue: Mutex<VecDeque<Result<Completion, LlmError>>>,
    fallback: Responder,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedModel {
    pub fn new<F>(fallback: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<Completion, LlmError> + Send + Sync + 'static,
    {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback: Box::new(fallback),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            latency: None,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Every call sleeps this long before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Always answers with the same text
    pub fn constant(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_| Ok(Completion::complete(text.clone())))
    }

    /// Always fails with the same error
    pub fn failing(error: LlmError) -> Self {
        Self::new(move |_| Err(error.clone()))
    }

    pub fn push(&self, result: Result<Completion, LlmError>) -> &Self {
        self.queue.lock().unwrap().push_back(result);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in progress at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// User prompts in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.prompts.lock().unwrap().push(request.user.clone());
        let queued = self.queue.lock().unwrap().pop_front();
        match queued {
            Some(result) => result,
            None => (self.fallback)(request),
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Millisecond backoff so retry paths stay fast in tests
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(
        max_attempts,
        Duration::from_millis(1),
        Duration::from_millis(2),
        2.0,
        Duration::from_secs(5),
    )
}

pub fn temp_db_path(dir: &std::path::Path) -> std::path::PathBuf {
    dir.join(format!("personas-{}.sqlite", uuid::Uuid::new_v4()))
}

/// Taxonomy from `(category, values)` pairs, through the regular converter
pub fn taxonomy(rows: &[(&str, &[&str])]) -> Taxonomy {
    let rows: Vec<RawRow> = rows
        .iter()
        .enumerate()
        .map(|(i, (category, values))| RawRow {
            line: i + 2,
            category: category.to_string(),
            values: values.iter().map(|v| v.to_string()).collect(),
            hint: None,
            synonyms: Vec::new(),
        })
        .collect();
    build_taxonomy(&rows).unwrap().0
}

/// Small zip container (docx / xlsx fixtures), entries stored uncompressed
pub fn write_zip(path: &std::path::Path, entries: &[(&str, &str)]) {
    use std::io::Write;

    let file = std::fs::File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    for (name, contents) in entries {
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}
