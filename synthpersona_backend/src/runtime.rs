use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::database::PersonaDatabase;
use crate::generator::{GeneratorOptions, PersonaGenerator};
use crate::llm_client::{LanguageModel, LlmClient};
use crate::retry::RetryPolicy;
use crate::tagger::{AutoTagger, TaggerOptions};

/// Shared pieces every stage entry point draws from
pub struct PipelineRuntime {
    pub config: PipelineConfig,
    pub db: Arc<PersonaDatabase>,
    pub model: Arc<dyn LanguageModel>,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
}

pub struct PipelineRuntimeBuilder {
    config: PipelineConfig,
    database_path: Option<PathBuf>,
    model: Option<Arc<dyn LanguageModel>>,
}

impl PipelineRuntimeBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            database_path: None,
            model: None,
        }
    }

    /// Override `database_path` from the config
    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Use this model instead of building the HTTP client
    pub fn with_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn build(self) -> Result<PipelineRuntime> {
        let config = self.config;
        config.validate().context("Invalid pipeline configuration")?;

        let db_path = self
            .database_path
            .unwrap_or_else(|| PathBuf::from(&config.database_path));
        let db = Arc::new(PersonaDatabase::new(&db_path)?);
        db.check_connectivity()
            .with_context(|| format!("Persona store at {:?} is unreachable", db_path))?;

        let model: Arc<dyn LanguageModel> = match self.model {
            Some(model) => model,
            None => Arc::new(LlmClient::from_config(&config.llm)?),
        };

        let retry = RetryPolicy::from_config(
            &config.retry,
            Duration::from_secs(config.llm.timeout_secs.max(1)),
        );

        tracing::info!(
            "Pipeline runtime ready: store {:?}, model {}, {} attempt(s) per call",
            db_path,
            model.describe(),
            retry.max_attempts()
        );

        Ok(PipelineRuntime {
            config,
            db,
            model,
            retry,
            cancel: CancellationToken::new(),
        })
    }
}

impl PipelineRuntime {
    pub fn bootstrap(config: PipelineConfig) -> Result<Self> {
        PipelineRuntimeBuilder::new(config).build()
    }

    pub fn generator(
        &self,
        batch: impl Into<String>,
        card_dir: impl Into<PathBuf>,
        overwrite: bool,
        only_stems: Option<HashSet<String>>,
    ) -> PersonaGenerator {
        PersonaGenerator::new(
            self.model.clone(),
            self.retry.clone(),
            self.db.clone(),
            GeneratorOptions {
                batch: batch.into(),
                card_dir: card_dir.into(),
                overwrite,
                workers: self.config.generate_workers,
                temperature: self.config.llm.temperature,
                max_tokens: self.config.llm.max_tokens,
                only_stems,
            },
        )
    }

    pub fn tagger(&self) -> AutoTagger {
        AutoTagger::new(
            self.model.clone(),
            self.retry.clone(),
            self.db.clone(),
            TaggerOptions {
                batch_size: self.config.tag_batch_size,
                workers: self.config.tag_workers,
                temperature: self.config.llm.tag_temperature,
                max_tokens: self.config.llm.max_tokens,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::derive_persona_id;
    use crate::testing::{temp_db_path, ScriptedModel};
    use std::fs;

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.tag_batch_size = 0;
        let result = PipelineRuntimeBuilder::new(config)
            .with_database_path(temp_db_path(dir.path()))
            .with_model(Arc::new(ScriptedModel::constant("ok")))
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn runtime_wires_generator_to_store() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = PipelineRuntimeBuilder::new(PipelineConfig::default())
            .with_database_path(temp_db_path(dir.path()))
            .with_model(Arc::new(ScriptedModel::constant("# Olga, 41\n\nprofile")))
            .build()
            .unwrap();

        let txt = dir.path().join("txt");
        fs::create_dir(&txt).unwrap();
        fs::write(txt.join("olga.txt"), "transcript").unwrap();

        let report = runtime
            .generator("b1", dir.path().join("cards"), false, None)
            .generate_directory(&txt, &runtime.cancel)
            .await
            .unwrap();
        assert_eq!(report.generated, 1);
        assert!(runtime
            .db
            .persona_exists(&derive_persona_id("b1", "olga"))
            .unwrap());
    }
}
