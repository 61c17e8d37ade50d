//! Compliance-document pipeline CLI.
//!
//! Registers documents into per-case stage directories and drives them through
//! intake, extraction and classification under a planning supervisor. Case state
//! lives under the configured `cases_dir`, so any command can resume a case.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use casework::core::types::Stage;
use casework::exit_codes;
use casework::io::config::{PipelineConfig, load_config, write_config};
use casework::io::metadata::StagedDocumentMetadataManager;
use casework::io::prompt::PromptEngine;
use casework::io::reasoner::{RetryPolicy, reasoner_from_config};
use casework::io::structured::Consultant;
use casework::io::workers::{Extractors, classifier_from_config};
use casework::logging;
use casework::session::{CaseSession, SessionOutcome, SessionRequest};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;

const DEFAULT_REQUEST: &str = "process the submitted documents";

#[derive(Parser)]
#[command(
    name = "casework",
    version,
    about = "Staged compliance-document pipeline with a planning supervisor"
)]
struct Cli {
    /// Pipeline config (TOML). Defaults apply when the file is missing.
    #[arg(long, global = true, default_value = "casework.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register files and/or resume documents, then run the planned pipeline.
    Process {
        /// Case reference; created on first use.
        #[arg(long)]
        case: Option<String>,
        /// File to register (repeatable).
        #[arg(long = "file")]
        files: Vec<PathBuf>,
        /// Free-text request; may name document ids to resume.
        request: Vec<String>,
    },
    /// Print the case summary (documents, status and stage counts).
    Summary {
        #[arg(long)]
        case: String,
    },
    /// List documents that have not reached a terminal status.
    Pending {
        #[arg(long)]
        case: String,
        /// Only documents at this stage.
        #[arg(long)]
        stage: Option<String>,
    },
    /// Write a default config file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Process {
            case,
            files,
            request,
        } => cmd_process(&cli.config, case, files, request),
        Command::Summary { case } => cmd_summary(&cli.config, &case),
        Command::Pending { case, stage } => cmd_pending(&cli.config, &case, stage.as_deref()),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

fn cmd_process(
    config_path: &Path,
    case: Option<String>,
    files: Vec<PathBuf>,
    request: Vec<String>,
) -> Result<i32> {
    let cfg = load_config(config_path)?;
    let reasoner = reasoner_from_config(&cfg.reasoning);
    let prompts = PromptEngine::new();
    let consultant = Consultant::new(reasoner.as_ref(), RetryPolicy::from_config(&cfg.reasoning), &prompts);
    let extractors = Extractors::from_config(&cfg.workers).context("configure extraction workers")?;
    let classifier = classifier_from_config(&cfg.workers).context("configure classification worker")?;
    let mut session = CaseSession::new(&cfg, consultant, &extractors, classifier.as_ref());

    let text = if request.is_empty() {
        DEFAULT_REQUEST.to_string()
    } else {
        request.join(" ")
    };
    let outcome = session.process(&SessionRequest { text, case, files })?;
    match outcome {
        SessionOutcome::Processed(report) => {
            print_json(&report)?;
            Ok(if report.is_clean() {
                exit_codes::OK
            } else {
                exit_codes::INCOMPLETE
            })
        }
        SessionOutcome::NeedsInput {
            question,
            failure,
            trail,
        } => {
            print_json(&json!({ "question": question, "failure": failure, "trail": trail }))?;
            Ok(exit_codes::NEEDS_INPUT)
        }
        SessionOutcome::Unresolved { failure, trail } => {
            print_json(&json!({ "failure": failure, "trail": trail }))?;
            Ok(exit_codes::INVALID)
        }
    }
}

fn metadata_for(config_path: &Path) -> Result<StagedDocumentMetadataManager> {
    let cfg = load_config(config_path)?;
    Ok(StagedDocumentMetadataManager::new(cfg.cases_dir))
}

fn cmd_summary(config_path: &Path, case: &str) -> Result<i32> {
    let metadata = metadata_for(config_path)?;
    let summary = metadata
        .get_case_summary(case)
        .with_context(|| format!("summarize case {case}"))?;
    print_json(&summary)?;
    Ok(exit_codes::OK)
}

fn cmd_pending(config_path: &Path, case: &str, stage: Option<&str>) -> Result<i32> {
    let metadata = metadata_for(config_path)?;
    let documents = match stage {
        Some(raw) => {
            let stage = parse_stage(raw)?;
            metadata
                .get_documents_by_stage(case, stage)?
                .into_iter()
                .filter(|doc| !doc.status.is_terminal())
                .collect()
        }
        None => metadata.get_pending_documents(case)?,
    };
    for doc in documents {
        println!("{}\t{}\t{}", doc.document_id, doc.stage, doc.status.as_str());
    }
    Ok(exit_codes::OK)
}

fn cmd_init_config(config_path: &Path, force: bool) -> Result<i32> {
    if !force && config_path.exists() {
        bail!("{} already exists (use --force to overwrite)", config_path.display());
    }
    write_config(config_path, &PipelineConfig::default())
        .with_context(|| format!("write {}", config_path.display()))?;
    Ok(exit_codes::OK)
}

fn parse_stage(raw: &str) -> Result<Stage> {
    Stage::ALL
        .into_iter()
        .find(|stage| stage.as_str() == raw.trim().to_ascii_lowercase())
        .with_context(|| format!("unknown stage '{raw}'"))
}

/// Serialize `value` to pretty-printed JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_process_with_files_and_request() {
        let cli = Cli::parse_from([
            "casework",
            "process",
            "--case",
            "KYC-1",
            "--file",
            "a.pdf",
            "--file",
            "b.png",
            "register",
            "these",
        ]);
        match cli.command {
            Command::Process {
                case,
                files,
                request,
            } => {
                assert_eq!(case.as_deref(), Some("KYC-1"));
                assert_eq!(files, vec![PathBuf::from("a.pdf"), PathBuf::from("b.png")]);
                assert_eq!(request, vec!["register", "these"]);
            }
            _ => panic!("expected process"),
        }
        assert_eq!(cli.config, PathBuf::from("casework.toml"));
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::parse_from(["casework", "summary", "--case", "KYC-1", "--config", "alt.toml"]);
        assert!(matches!(cli.command, Command::Summary { ref case } if case == "KYC-1"));
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
    }

    #[test]
    fn parse_init_config_force() {
        let cli = Cli::parse_from(["casework", "init-config", "--force"]);
        assert!(matches!(cli.command, Command::InitConfig { force: true }));
    }

    #[test]
    fn parse_stage_accepts_any_case() {
        assert_eq!(parse_stage("Extraction").expect("stage"), Stage::Extraction);
        assert!(parse_stage("archive").is_err());
    }

    #[test]
    fn init_config_refuses_to_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("casework.toml");
        assert_eq!(cmd_init_config(&path, false).expect("init"), exit_codes::OK);
        assert!(cmd_init_config(&path, false).is_err());
        assert_eq!(cmd_init_config(&path, true).expect("force"), exit_codes::OK);
        assert_eq!(load_config(&path).expect("load"), PipelineConfig::default());
    }
}
