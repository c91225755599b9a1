use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "synthpersona.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    /// Any OpenAI-compatible `/chat/completions` endpoint (OpenAI, Ollama, vLLM, LM Studio)
    #[serde(alias = "openai")]
    OpenAi,
    /// Anthropic `/v1/messages`
    Anthropic,
}

impl LlmProvider {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" | "openai_compatible" => Some(LlmProvider::OpenAi),
            "anthropic" => Some(LlmProvider::Anthropic),
            _ => None,
        }
    }
}

impl Default for LlmProvider {
    fn default() -> Self {
        LlmProvider::OpenAi
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_llm_url")]
    pub api_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sampling temperature for persona card generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Sampling temperature for tag proposal (kept low, the output is structured)
    #[serde(default = "default_tag_temperature")]
    pub tag_temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_temperature() -> f32 {
    0.25
}

fn default_tag_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    8000
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            api_url: default_llm_url(),
            model: default_llm_model(),
            api_key: None,
            temperature: default_temperature(),
            tag_temperature: default_tag_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    // Store
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Concurrency for the two model-calling stages
    #[serde(default = "default_workers")]
    pub generate_workers: usize,
    #[serde(default = "default_workers")]
    pub tag_workers: usize,

    /// Maximum taxonomy categories per tag-proposal prompt
    #[serde(default = "default_tag_batch_size")]
    pub tag_batch_size: usize,
}

fn default_database_path() -> String {
    "db/personas.sqlite".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_tag_batch_size() -> usize {
    12
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            database_path: default_database_path(),
            generate_workers: default_workers(),
            tag_workers: default_workers(),
            tag_batch_size: default_tag_batch_size(),
        }
    }
}

impl PipelineConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Candidate config locations, in lookup order
    fn candidate_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from(CONFIG_FILE_NAME),
            Self::get_base_dir().join(CONFIG_FILE_NAME),
        ]
    }

    /// Load config from an explicit path. A missing or invalid explicit file is an error.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config = toml::from_str::<PipelineConfig>(&contents)
            .with_context(|| format!("Failed to parse config {:?}", path))?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config.apply_env())
    }

    /// Load config from synthpersona.toml (working directory, then next to the executable),
    /// falling back to defaults. Environment variables override either source.
    pub fn load() -> Self {
        for path in Self::candidate_paths() {
            if let Ok(contents) = fs::read_to_string(&path) {
                match toml::from_str::<PipelineConfig>(&contents) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config.apply_env();
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::debug!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    fn apply_env(mut self) -> Self {
        if let Ok(raw) = env::var("LLM_PROVIDER") {
            match LlmProvider::parse(&raw) {
                Some(provider) => self.llm.provider = provider,
                None => tracing::warn!("Ignoring unknown LLM_PROVIDER '{}'", raw),
            }
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm.api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm.model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            self.llm.api_key = Some(key);
        } else if self.llm.api_key.is_none() {
            let provider_key = match self.llm.provider {
                LlmProvider::OpenAi => env::var("OPENAI_API_KEY"),
                LlmProvider::Anthropic => env::var("ANTHROPIC_API_KEY"),
            };
            if let Ok(key) = provider_key {
                self.llm.api_key = Some(key);
            }
        }

        if let Ok(raw) = env::var("LLM_TEMPERATURE") {
            if let Ok(temperature) = raw.parse() {
                self.llm.temperature = temperature;
            }
        }

        if let Ok(raw) = env::var("LLM_MAX_TOKENS") {
            if let Ok(tokens) = raw.parse() {
                self.llm.max_tokens = tokens;
            }
        }

        if let Ok(raw) = env::var("LLM_HTTP_TIMEOUT") {
            if let Ok(seconds) = raw.parse::<f64>() {
                self.llm.timeout_secs = seconds.max(1.0) as u64;
            }
        }

        if let Ok(path) = env::var("SYNTHPERSONA_DB_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(raw) = env::var("SYNTHPERSONA_WORKERS") {
            if let Ok(workers) = raw.parse() {
                self.generate_workers = workers;
                self.tag_workers = workers;
            }
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.generate_workers == 0 || self.tag_workers == 0 {
            anyhow::bail!("Worker limits must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.tag_batch_size == 0 {
            anyhow::bail!("tag_batch_size must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            anyhow::bail!("retry.multiplier must be >= 1.0");
        }
        if self.llm.api_url.trim().is_empty() {
            anyhow::bail!("llm.api_url is empty");
        }
        Ok(())
    }
}
