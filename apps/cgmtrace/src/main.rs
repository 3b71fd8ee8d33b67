mod cli;

use anyhow::{Context, Result};
use cgmtrace_analysis::{analyze_file, AnalysisSettings, FileAnalysis};
use cgmtrace_config::AppConfig;
use cgmtrace_ingest_core::{
    decode_bytes, EventQuery, EventRecord, EventStore, FsLogSource, IngestReport, Ingestor,
    LoganCipher, MemoryEventStore,
};
use clap::Parser;
use cli::{AnalyzeArgs, Cli, CliCommand, DecodeArgs, ParseArgs};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize)]
struct DecodeSummary {
    path: PathBuf,
    container: bool,
    blocks_attempted: u64,
    blocks_succeeded: u64,
    blocks_failed: u64,
    lines: usize,
    output: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct ParsedFile {
    report: IngestReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<Vec<EventRecord>>,
}

#[derive(Debug, Serialize)]
struct AnalyzedFile {
    report: IngestReport,
    analysis: FileAnalysis,
}

#[derive(Debug, Serialize)]
struct FileFailure {
    file_id: String,
    error: String,
}

#[derive(Debug, Serialize)]
struct BatchOutput<T> {
    files: Vec<T>,
    failures: Vec<FileFailure>,
}

impl<T> BatchOutput<T> {
    fn exit_code(&self) -> ExitCode {
        if self.failures.is_empty() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

#[derive(Debug, Serialize)]
struct ConfigSnapshot {
    config_path: PathBuf,
    config_exists: bool,
    config: AppConfig,
}

fn emit<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let text = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{text}");
    Ok(())
}

fn load_cfg(raw_path: Option<PathBuf>) -> Result<(PathBuf, AppConfig)> {
    let config_path = cgmtrace_config::resolve_config_path(raw_path);
    let cfg = cgmtrace_config::load_config_or_default(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))?;
    Ok((config_path, cfg))
}

fn redacted(cfg: &AppConfig) -> AppConfig {
    let mut cfg = cfg.clone();
    cfg.decoder.key = "<redacted>".to_string();
    cfg.decoder.iv = "<redacted>".to_string();
    cfg
}

async fn cmd_decode(cfg: &AppConfig, args: &DecodeArgs) -> Result<DecodeSummary> {
    let cipher = LoganCipher::from_config(&cfg.decoder).context("invalid decoder key material")?;
    let bytes = tokio::fs::read(&args.path)
        .await
        .with_context(|| format!("failed to read {}", args.path.display()))?;
    let decoded = decode_bytes(&bytes, &cipher);

    let mut text = decoded.lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    match &args.output {
        Some(output) => tokio::fs::write(output, text.as_bytes())
            .await
            .with_context(|| format!("failed to write {}", output.display()))?,
        None => print!("{text}"),
    }

    Ok(DecodeSummary {
        path: args.path.clone(),
        container: decoded.container,
        blocks_attempted: decoded.stats.blocks_attempted,
        blocks_succeeded: decoded.stats.blocks_succeeded,
        blocks_failed: decoded.stats.blocks_failed,
        lines: decoded.lines.len(),
        output: args.output.clone(),
    })
}

async fn ingest_selection(
    cfg: &AppConfig,
    root: &Path,
    files: &[String],
    store: Arc<MemoryEventStore>,
) -> Result<(Vec<IngestReport>, Vec<FileFailure>)> {
    let ingestor = Arc::new(Ingestor::from_config(cfg)?);
    let source = Arc::new(FsLogSource::new(root));
    let results = ingestor
        .ingest_batch(source, store, files.to_vec(), cfg.ingest.max_file_workers)
        .await;

    let mut reports = Vec::new();
    let mut failures = Vec::new();
    for (file_id, result) in results {
        match result {
            Ok(report) => reports.push(report),
            Err(exc) => {
                warn!("{file_id}: {exc:#}");
                failures.push(FileFailure {
                    file_id,
                    error: format!("{exc:#}"),
                });
            }
        }
    }
    Ok((reports, failures))
}

async fn cmd_parse(cfg: &AppConfig, args: &ParseArgs) -> Result<BatchOutput<ParsedFile>> {
    let store = Arc::new(MemoryEventStore::new());
    let (reports, failures) = ingest_selection(
        cfg,
        &args.selection.root,
        &args.selection.files,
        store.clone(),
    )
    .await?;

    let mut files = Vec::with_capacity(reports.len());
    for report in reports {
        let records = if args.records {
            Some(
                store
                    .load_events(&report.file_id, &EventQuery::default())
                    .await
                    .with_context(|| format!("failed to read back {}", report.file_id))?,
            )
        } else {
            None
        };
        files.push(ParsedFile { report, records });
    }
    Ok(BatchOutput { files, failures })
}

async fn cmd_analyze(cfg: &AppConfig, args: &AnalyzeArgs) -> Result<BatchOutput<AnalyzedFile>> {
    let store = Arc::new(MemoryEventStore::new());
    let (reports, failures) = ingest_selection(
        cfg,
        &args.selection.root,
        &args.selection.files,
        store.clone(),
    )
    .await?;

    let settings = Arc::new(AnalysisSettings::from_config(cfg));
    let mut files = Vec::with_capacity(reports.len());
    for report in reports {
        let query = match &args.session {
            Some(session) => EventQuery::for_session(session.clone()),
            None => EventQuery::default(),
        };
        let analysis = analyze_file(store.as_ref(), &report.file_id, query, settings.clone())
            .await
            .with_context(|| format!("failed to analyze {}", report.file_id))?;
        files.push(AnalyzedFile { report, analysis });
    }
    Ok(BatchOutput { files, failures })
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let (config_path, cfg) = load_cfg(cli.config.clone())?;

    match cli.command {
        CliCommand::Decode(args) => {
            let summary = cmd_decode(&cfg, &args).await?;
            info!(
                "{}: {} lines from {} of {} blocks",
                summary.path.display(),
                summary.lines,
                summary.blocks_succeeded,
                summary.blocks_attempted
            );
            if args.output.is_some() {
                emit(&summary, cli.pretty)?;
            }
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Parse(args) => {
            let output = cmd_parse(&cfg, &args).await?;
            emit(&output, cli.pretty)?;
            Ok(output.exit_code())
        }
        CliCommand::Analyze(args) => {
            let output = cmd_analyze(&cfg, &args).await?;
            emit(&output, cli.pretty)?;
            Ok(output.exit_code())
        }
        CliCommand::Config => {
            let snapshot = ConfigSnapshot {
                config_exists: config_path.exists(),
                config_path,
                config: redacted(&cfg),
            };
            emit(&snapshot, cli.pretty)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
