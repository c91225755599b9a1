//! Command-line surface: one subcommand per pipeline stage.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use synthpersona_backend::importer::DedupPolicy;
use synthpersona_backend::loader::LoadMode;

/// Synthetic persona pipeline: transcripts → cards → store → tags
#[derive(Parser, Debug)]
#[command(name = "synthpersona")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to synthpersona.toml
    #[arg(short, long, global = true, env = "SYNTHPERSONA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Persona store location (overrides database_path from the config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Convert a raw CSV/TSV/YAML tag table into the taxonomy document
    ConvertTaxonomy {
        /// Raw tabular source
        #[arg(long)]
        input: PathBuf,

        /// Taxonomy YAML to write
        #[arg(long)]
        output: PathBuf,
    },

    /// Normalize raw transcripts into UTF-8 .txt files
    Ingest {
        #[arg(long)]
        in_dir: PathBuf,

        #[arg(long)]
        out_dir: PathBuf,
    },

    /// Generate persona cards from normalized transcripts
    Generate {
        /// Directory of normalized .txt transcripts
        #[arg(long)]
        txt_dir: PathBuf,

        /// Where card files are written
        #[arg(long)]
        out_dir: PathBuf,

        /// Batch/version tag mixed into persona ids
        #[arg(long)]
        batch: String,

        /// Regenerate personas that already exist in the store
        #[arg(long)]
        overwrite: bool,

        /// Only retry the items listed in a previous failure manifest
        #[arg(long)]
        only_from: Option<PathBuf>,
    },

    /// Import card directories into the store, in the given order
    Import {
        #[arg(required = true)]
        dirs: Vec<PathBuf>,

        #[arg(long, value_enum, default_value_t = PolicyArg::SkipExisting)]
        policy: PolicyArg,

        /// Write a failure manifest here when some cards were not imported
        #[arg(long)]
        failures: Option<PathBuf>,
    },

    /// Propose taxonomy tags for personas and export them for review
    AutoTag(AutoTagArgs),

    /// Validate and persist a reviewed tag export
    LoadTags {
        /// JSON export or persona_id,category,value CSV
        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        taxonomy: PathBuf,

        #[arg(long, value_enum, default_value_t = ModeArg::Merge)]
        mode: ModeArg,

        /// Write a failure manifest here when some records were skipped
        #[arg(long)]
        failures: Option<PathBuf>,
    },

    /// Send a tiny prompt to check the model endpoint
    Preflight,
}

#[derive(Args, Debug)]
pub struct AutoTagArgs {
    #[arg(long)]
    pub taxonomy: PathBuf,

    /// Export artifact (JSON); the failure manifest is written next to it
    #[arg(long)]
    pub output: PathBuf,

    /// Tag every persona in the store
    #[arg(long, conflicts_with_all = ["persona_id", "only_from"])]
    pub all: bool,

    /// Tag only these personas (repeatable)
    #[arg(long = "persona-id")]
    pub persona_id: Vec<String>,

    /// Only retry the personas listed in a previous failure manifest
    #[arg(long)]
    pub only_from: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyArg {
    SkipExisting,
    Overwrite,
    ErrorOnConflict,
}

impl From<PolicyArg> for DedupPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::SkipExisting => DedupPolicy::SkipExisting,
            PolicyArg::Overwrite => DedupPolicy::Overwrite,
            PolicyArg::ErrorOnConflict => DedupPolicy::ErrorOnConflict,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Merge,
    Replace,
}

impl From<ModeArg> for LoadMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Merge => LoadMode::Merge,
            ModeArg::Replace => LoadMode::Replace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn import_defaults_to_skip_existing() {
        let cli = Cli::try_parse_from(["synthpersona", "import", "v1", "v2"]).unwrap();
        match cli.command {
            Commands::Import { dirs, policy, .. } => {
                assert_eq!(dirs.len(), 2);
                assert_eq!(DedupPolicy::from(policy), DedupPolicy::SkipExisting);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn auto_tag_accepts_repeated_ids() {
        let cli = Cli::try_parse_from([
            "synthpersona",
            "--db",
            "x.sqlite",
            "auto-tag",
            "--taxonomy",
            "t.yaml",
            "--output",
            "tags.json",
            "--persona-id",
            "p_1",
            "--persona-id",
            "p_2",
        ])
        .unwrap();
        let Commands::AutoTag(args) = cli.command else {
            panic!("expected auto-tag");
        };
        assert_eq!(args.persona_id, vec!["p_1", "p_2"]);
        assert!(!args.all);
        assert_eq!(cli.db, Some(PathBuf::from("x.sqlite")));
    }

    #[test]
    fn all_conflicts_with_explicit_ids() {
        assert!(Cli::try_parse_from([
            "synthpersona",
            "auto-tag",
            "--taxonomy",
            "t.yaml",
            "--output",
            "o.json",
            "--all",
            "--persona-id",
            "p_1",
        ])
        .is_err());
    }

    #[test]
    fn policy_values_are_kebab_case() {
        let cli =
            Cli::try_parse_from(["synthpersona", "import", "v1", "--policy", "error-on-conflict"])
                .unwrap();
        let Commands::Import { policy, .. } = cli.command else {
            panic!("expected import");
        };
        assert_eq!(policy, PolicyArg::ErrorOnConflict);
    }
}
