mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use synthpersona_backend::config::PipelineConfig;
use synthpersona_backend::importer::import_directories;
use synthpersona_backend::ingest::ingest_directory;
use synthpersona_backend::llm_client::LlmClient;
use synthpersona_backend::loader::load_tags;
use synthpersona_backend::report::{FailureManifest, ItemFailure, RunStatus, Stage};
use synthpersona_backend::runtime::{PipelineRuntime, PipelineRuntimeBuilder};
use synthpersona_backend::tagger::TargetSet;
use synthpersona_backend::taxonomy::{convert_source, Taxonomy};

use cli::{AutoTagArgs, Cli, Commands};

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,synthpersona=debug,synthpersona_backend=debug")
        }))
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(status) if status.is_failure() => ExitCode::from(1),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::from(1)
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    match &cli.config {
        Some(path) => PipelineConfig::load_from(path),
        None => Ok(PipelineConfig::load()),
    }
}

fn bootstrap(cli: &Cli, config: PipelineConfig) -> Result<PipelineRuntime> {
    let mut builder = PipelineRuntimeBuilder::new(config);
    if let Some(db) = &cli.db {
        builder = builder.with_database_path(db);
    }
    builder.build().context("failed to bootstrap pipeline runtime")
}

fn print_summary<T: Serialize>(summary: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
    println!("{}", json);
    Ok(())
}

fn write_manifest(path: Option<&Path>, stage: Stage, failures: &[ItemFailure]) -> Result<()> {
    if let Some(path) = path {
        if !failures.is_empty() {
            FailureManifest::new(stage, failures.to_vec()).write(path)?;
            tracing::info!("Wrote failure manifest {:?}", path);
        }
    }
    Ok(())
}

fn async_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}

/// Ctrl-C cancels the run: nothing new starts, in-flight calls finish
fn spawn_ctrl_c(runtime: &PipelineRuntime) {
    let cancel = runtime.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; finishing in-flight work and stopping");
            cancel.cancel();
        }
    });
}

fn run(cli: Cli) -> Result<RunStatus> {
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::ConvertTaxonomy { input, output } => {
            let (taxonomy, report) = convert_source(input)?;
            taxonomy.save(output)?;
            tracing::info!("Wrote taxonomy document {:?}", output);
            print_summary(&report)?;
            Ok(RunStatus::Success)
        }

        Commands::Ingest { in_dir, out_dir } => {
            let report = ingest_directory(in_dir, out_dir)?;
            print_summary(&report)?;
            Ok(report.status)
        }

        Commands::Generate {
            txt_dir,
            out_dir,
            batch,
            overwrite,
            only_from,
        } => {
            let only_stems = match only_from {
                Some(path) => Some(
                    FailureManifest::read(path)?
                        .items()
                        .into_iter()
                        .collect::<HashSet<_>>(),
                ),
                None => None,
            };
            let runtime = bootstrap(&cli, config)?;
            let generator = runtime.generator(batch.clone(), out_dir.clone(), *overwrite, only_stems);
            let report = async_runtime()?.block_on(async {
                spawn_ctrl_c(&runtime);
                generator.generate_directory(txt_dir, &runtime.cancel).await
            })?;
            print_summary(&report)?;
            Ok(report.status)
        }

        Commands::Import {
            dirs,
            policy,
            failures,
        } => {
            let runtime = bootstrap(&cli, config)?;
            let summary = import_directories(&runtime.db, dirs, (*policy).into())?;
            write_manifest(failures.as_deref(), Stage::Import, &summary.issues)?;
            let status = summary.status();
            print_summary(&serde_json::json!({ "summary": summary, "status": status }))?;
            Ok(status)
        }

        Commands::AutoTag(args) => {
            let targets = target_set(args)?;
            let taxonomy = Taxonomy::load(&args.taxonomy)?;
            let runtime = bootstrap(&cli, config)?;
            let tagger = runtime.tagger();
            let report = async_runtime()?.block_on(async {
                spawn_ctrl_c(&runtime);
                tagger
                    .run(&targets, &taxonomy, &args.output, &runtime.cancel)
                    .await
            })?;
            print_summary(&report)?;
            Ok(report.status)
        }

        Commands::LoadTags {
            input,
            taxonomy,
            mode,
            failures,
        } => {
            let taxonomy = Taxonomy::load(taxonomy)?;
            let runtime = bootstrap(&cli, config)?;
            let report = load_tags(&runtime.db, &taxonomy, input, (*mode).into())?;
            write_manifest(failures.as_deref(), Stage::LoadTags, &report.skips)?;
            let status = report.status();
            print_summary(&serde_json::json!({ "report": report, "status": status }))?;
            Ok(status)
        }

        Commands::Preflight => {
            let client = LlmClient::from_config(&config.llm)?;
            let answer = async_runtime()?.block_on(client.preflight())?;
            tracing::info!("Preflight OK ({}): {}", client.model(), answer);
            Ok(RunStatus::Success)
        }
    }
}

fn target_set(args: &AutoTagArgs) -> Result<TargetSet> {
    let mut ids = args.persona_id.clone();
    if let Some(path) = &args.only_from {
        ids.extend(FailureManifest::read(path)?.items());
    }
    if args.all || (ids.is_empty() && args.only_from.is_none()) {
        Ok(TargetSet::All)
    } else {
        Ok(TargetSet::Ids(ids))
    }
}
