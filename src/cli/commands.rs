//! CLI command definitions for paper-cot-forge.
//!
//! Every command loads the layered [`PipelineConfig`], applies its own flag
//! overrides and prints a summary, in text or as JSON with `--json`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::collaborators::{DocumentSource, FsTextExtractor, JsonlDocumentSource, SourceFilter};
use crate::export::{CorpusCompiler, CorpusFormat, DedupScope};
use crate::llm::{LiteLlmClient, TemplateInvoker};
use crate::pipeline::{
    BatchOrchestrator, BatchResult, OrderBy, PipelineConfig, PipelineReport, RecordId, Stage,
    StageRunner, Status, Subject,
};
use crate::storage::{ArtifactWriter, RecordStore};

/// Default corpus output file.
const DEFAULT_CORPUS_PATH: &str = "./corpus.jsonl";

/// Turns research papers into chain-of-thought training data.
#[derive(Parser, Debug)]
#[command(name = "paper-cot-forge")]
#[command(about = "Turn research papers into chain-of-thought training data")]
#[command(version)]
#[command(
    long_about = "paper-cot-forge moves papers through a fixed sequence of model-driven stages \
(profile, score, extract, critique, refine, assess, voice) and compiles the surviving \
chain-of-thought sets into a JSONL corpus.\n\nExample usage:\n  paper-cot-forge ingest --source papers.jsonl\n  paper-cot-forge pipeline --limit 20 --order-by category-balanced\n  paper-cot-forge compile --output corpus.jsonl"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// YAML configuration file.
    #[arg(short, long, global = true, env = "PAPER_COT_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database file (overrides configuration).
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Artifact root directory (overrides configuration).
    #[arg(long, global = true)]
    pub artifacts: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand, Debug)]
pub enum Commands {
    /// Register candidate documents from a JSONL file.
    Ingest(IngestArgs),

    /// Run a single stage over a batch of eligible records.
    Run(RunArgs),

    /// Take pending documents through every stage.
    Pipeline(PipelineArgs),

    /// Compile finished CoT sets into a training corpus.
    Compile(CompileArgs),

    /// Show record counts per status.
    Status(StatusArgs),

    /// List stored artifacts.
    Artifacts(ArtifactsArgs),
}

/// Arguments for `paper-cot-forge ingest`.
#[derive(Parser, Debug)]
pub struct IngestArgs {
    /// JSONL file with one `{locator, categories, metadata}` object per line.
    #[arg(short, long)]
    pub source: PathBuf,

    /// Only ingest documents tagged with one of these categories (repeatable).
    #[arg(long = "category")]
    pub categories: Vec<String>,

    /// Maximum number of candidates to read.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Output the summary as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `paper-cot-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Stage to run (profile, score_profile, extract, critique, refine,
    /// assess_quality, score_quality, voice, assess_voicing, score_voicing).
    pub stage: Stage,

    /// Maximum records to process (defaults to the configured batch limit).
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Record order: identity, random or category-balanced.
    #[arg(long, default_value = "identity")]
    pub order_by: OrderBy,

    /// Suitability threshold for extraction.
    #[arg(long)]
    pub min_suitability: Option<i64>,

    /// Quality threshold for voicing.
    #[arg(long)]
    pub min_quality: Option<i64>,

    /// Output the summary as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `paper-cot-forge pipeline`.
#[derive(Parser, Debug)]
pub struct PipelineArgs {
    /// Maximum pending documents to take (defaults to the configured batch limit).
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Record order: identity, random or category-balanced.
    #[arg(long, default_value = "identity")]
    pub order_by: OrderBy,

    /// Suitability threshold for extraction.
    #[arg(long)]
    pub min_suitability: Option<i64>,

    /// Quality threshold for voicing.
    #[arg(long)]
    pub min_quality: Option<i64>,

    /// Output the summary as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `paper-cot-forge compile`.
#[derive(Parser, Debug)]
pub struct CompileArgs {
    /// Corpus JSONL file; the YAML mirror is written next to it.
    #[arg(short, long, default_value = DEFAULT_CORPUS_PATH)]
    pub output: PathBuf,

    /// Minimum quality score (defaults to the configured threshold).
    #[arg(long)]
    pub min_quality: Option<i64>,

    /// Minimum voice score (defaults to the configured threshold).
    #[arg(long)]
    pub min_voice: Option<i64>,

    /// Dedup group: document or category.
    #[arg(long)]
    pub dedup_scope: Option<DedupScope>,

    /// CoT sets kept per dedup group.
    #[arg(long)]
    pub max_per_group: Option<usize>,

    /// Output format: record or chat.
    #[arg(long)]
    pub format: Option<CorpusFormat>,

    /// Share of records written to the validation file.
    #[arg(long)]
    pub validation_fraction: Option<f64>,

    /// Output the summary as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `paper-cot-forge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output the counts as JSON.
    #[arg(short, long)]
    pub json: bool,
}

/// Arguments for `paper-cot-forge artifacts`.
#[derive(Parser, Debug)]
pub struct ArtifactsArgs {
    /// Only list artifacts of this record, e.g. `document:1` or `cot_set:4`.
    #[arg(long)]
    pub record: Option<RecordId>,
}

/// Parse CLI arguments and return the Cli struct.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse the command line and run it.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    match cli.command {
        Commands::Ingest(args) => run_ingest_command(config, args).await,
        Commands::Run(args) => run_stage_command(config, args).await,
        Commands::Pipeline(args) => run_pipeline_command(config, args).await,
        Commands::Compile(args) => run_compile_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Artifacts(args) => run_artifacts_command(config, args),
    }
}

/// Defaults, then the YAML file, then environment, then global flags.
fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    load_config_with(cli, |key| std::env::var(key).ok())
}

/// Defaults, then the YAML file, then `lookup` (the environment), then flags.
fn load_config_with<F>(cli: &Cli, lookup: F) -> anyhow::Result<PipelineConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let base = match &cli.config {
        Some(path) => PipelineConfig::from_yaml_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    let mut config = base.apply_env_from(lookup)?;
    if let Some(database) = &cli.database {
        config.database_path = database.clone();
    }
    if let Some(artifacts) = &cli.artifacts {
        config.artifact_root = artifacts.clone();
    }
    Ok(config)
}

async fn open_store(config: &PipelineConfig) -> anyhow::Result<RecordStore> {
    RecordStore::open(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))
}

async fn build_orchestrator(config: PipelineConfig) -> anyhow::Result<BatchOrchestrator> {
    config.validate()?;
    let store = open_store(&config).await?;
    let artifacts = ArtifactWriter::new(&config.artifact_root);

    let mut extractor = FsTextExtractor::new();
    if let Some(root) = &config.document_root {
        extractor = extractor.with_base_dir(root);
    }

    let client = LiteLlmClient::from_env()
        .context("LLM endpoint not configured (set LITELLM_API_BASE)")?;
    let mut invoker = TemplateInvoker::from_dir(&config.template_dir, Arc::new(client))
        .with_context(|| {
            format!("Failed to load templates from {}", config.template_dir.display())
        })?
        .with_temperature(config.temperature);
    if let Some(model) = &config.model {
        invoker = invoker.with_model(model.as_str());
    }
    if let Some(max_tokens) = config.max_tokens {
        invoker = invoker.with_max_tokens(max_tokens);
    }
    if let Some(prompt) = &config.system_prompt {
        invoker = invoker.with_system_prompt(prompt.as_str());
    }

    let runner = StageRunner::new(
        store,
        artifacts,
        Arc::new(extractor),
        Arc::new(invoker),
        &config,
    );
    Ok(BatchOrchestrator::new(runner, config).with_cancel_flag(ctrl_c_flag()))
}

/// Flag set on Ctrl-C; batches stop before their next record.
fn ctrl_c_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = Arc::clone(&flag);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current record");
            handle.store(true, Ordering::SeqCst);
        }
    });
    flag
}

// ============================================================================
// Command handlers
// ============================================================================

async fn run_ingest_command(config: PipelineConfig, args: IngestArgs) -> anyhow::Result<()> {
    let source = JsonlDocumentSource::new(&args.source);
    let filter = SourceFilter {
        categories: args.categories,
        limit: args.limit,
    };
    let candidates = source
        .list_candidate_documents(&filter)
        .await
        .with_context(|| format!("Failed to read {}", args.source.display()))?;

    let store = open_store(&config).await?;
    let report = store.register_documents(&candidates).await?;
    info!(
        source = %args.source.display(),
        inserted = report.inserted,
        duplicates = report.duplicates,
        "Ingest finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n=== Ingest Summary ===");
        println!("Candidates:  {}", candidates.len());
        println!("Inserted:    {}", report.inserted);
        println!("Duplicates:  {}", report.duplicates);
        println!("Rejected:    {}", report.rejected);
    }
    Ok(())
}

async fn run_stage_command(mut config: PipelineConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(min) = args.min_suitability {
        config.min_suitability = min;
    }
    if let Some(min) = args.min_quality {
        config.min_quality = min;
    }
    let limit = args.limit.unwrap_or(config.batch_limit);

    let orchestrator = build_orchestrator(config).await?;
    let result = orchestrator
        .run_stage(args.stage, args.order_by, limit)
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("\n=== Stage Summary ===");
        print_batch(&result);
    }
    Ok(())
}

async fn run_pipeline_command(
    mut config: PipelineConfig,
    args: PipelineArgs,
) -> anyhow::Result<()> {
    if let Some(min) = args.min_suitability {
        config.min_suitability = min;
    }
    if let Some(min) = args.min_quality {
        config.min_quality = min;
    }
    let limit = args.limit.unwrap_or(config.batch_limit);

    let orchestrator = build_orchestrator(config).await?;
    let report = orchestrator.run_pipeline(args.order_by, limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_pipeline(&report);
    }
    Ok(())
}

async fn run_compile_command(mut config: PipelineConfig, args: CompileArgs) -> anyhow::Result<()> {
    if let Some(scope) = args.dedup_scope {
        config.corpus.dedup_scope = scope;
    }
    if let Some(k) = args.max_per_group {
        config.corpus.max_per_group = k;
    }
    if let Some(format) = args.format {
        config.corpus.format = format;
    }
    if let Some(fraction) = args.validation_fraction {
        config.corpus.validation_fraction = fraction;
    }
    let min_quality = args.min_quality.unwrap_or(config.min_quality);
    let min_voice = args.min_voice.unwrap_or(config.min_voice);
    config.validate()?;

    let store = open_store(&config).await?;
    let compiler = CorpusCompiler::new(
        store,
        ArtifactWriter::new(&config.artifact_root),
        config.corpus.clone(),
    );
    let report = compiler.compile(min_quality, min_voice, &args.output).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("\n=== Corpus Summary ===");
        println!("Output:          {}", report.output.display());
        println!("Mirror:          {}", report.mirror.display());
        if let Some(path) = &report.validation_output {
            println!("Validation file: {}", path.display());
        }
        println!("Candidates:      {}", report.candidates);
        println!("Written:         {}", report.written);
        println!("Validation:      {}", report.validation);
        println!("Excluded:        {}", report.excluded);
        println!("  below threshold: {}", report.below_threshold);
        println!("  deduplicated:    {}", report.deduplicated);
        println!("  unreadable:      {}", report.unreadable);
    }
    Ok(())
}

async fn run_status_command(config: PipelineConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = open_store(&config).await?;
    let counts = store.status_counts().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
        return Ok(());
    }

    println!("\n=== Documents ({}) ===", counts.total_documents());
    for status in Status::ALL.iter().filter(|s| s.subject() == Subject::Document) {
        println!("{:<28} {}", status.as_str(), counts.count(*status));
    }
    println!("\n=== CoT Sets ({}) ===", counts.total_cot_sets());
    for status in Status::ALL.iter().filter(|s| s.subject() == Subject::CotSet) {
        println!("{:<28} {}", status.as_str(), counts.count(*status));
    }
    Ok(())
}

fn run_artifacts_command(config: PipelineConfig, args: ArtifactsArgs) -> anyhow::Result<()> {
    let writer = ArtifactWriter::new(&config.artifact_root);
    let references = writer.list(args.record)?;
    for reference in &references {
        println!("{}", reference);
    }
    println!("{} artifact(s)", references.len());
    Ok(())
}

fn print_batch(result: &BatchResult) {
    println!("Stage:      {}", result.stage);
    println!("Order by:   {}", result.order_by);
    println!("Selected:   {}", result.selected);
    println!("Succeeded:  {}", result.succeeded);
    println!("Failed:     {}", result.failed);
    println!("Skipped:    {}", result.skipped);
    if result.cancelled {
        println!("Cancelled:  yes");
    }
}

fn print_pipeline(report: &PipelineReport) {
    println!("\n=== Pipeline Summary ===");
    println!("Order by:             {}", report.order_by);
    println!("Documents processed:  {}", report.documents_processed);
    println!("CoT sets completed:   {}", report.cot_sets_completed);
    println!("Stopped at gate:      {}", report.gated);
    if report.cancelled {
        println!("Cancelled:            yes");
    }
    println!();
    println!(
        "{:<16} {:>8} {:>9} {:>7} {:>8}",
        "stage", "selected", "succeeded", "failed", "skipped"
    );
    for result in &report.stages {
        println!(
            "{:<16} {:>8} {:>9} {:>7} {:>8}",
            result.stage.as_str(),
            result.selected,
            result.succeeded,
            result.failed,
            result.skipped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = Cli::try_parse_from(["paper-cot-forge", "run", "critique"]).expect("should parse");
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.stage, Stage::Critique);
                assert_eq!(args.order_by, OrderBy::Identity);
                assert!(args.limit.is_none());
                assert!(!args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = Cli::try_parse_from([
            "paper-cot-forge",
            "--database",
            "/tmp/p.db",
            "run",
            "score_quality",
            "-n",
            "25",
            "--order-by",
            "category-balanced",
            "--min-quality",
            "3",
            "--json",
        ])
        .expect("should parse");
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/p.db")));
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.stage, Stage::ScoreQuality);
                assert_eq!(args.limit, Some(25));
                assert_eq!(args.order_by, OrderBy::CategoryBalanced);
                assert_eq!(args.min_quality, Some(3));
                assert!(args.json);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_unknown_stage_rejected() {
        assert!(Cli::try_parse_from(["paper-cot-forge", "run", "summarize"]).is_err());
        assert!(
            Cli::try_parse_from(["paper-cot-forge", "pipeline", "--order-by", "alphabetical"])
                .is_err()
        );
    }

    #[test]
    fn test_compile_command_options() {
        let cli = Cli::try_parse_from([
            "paper-cot-forge",
            "compile",
            "-o",
            "out/train.jsonl",
            "--dedup-scope",
            "category",
            "--max-per-group",
            "2",
            "--format",
            "chat",
            "--validation-fraction",
            "0.1",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Compile(args) => {
                assert_eq!(args.output, PathBuf::from("out/train.jsonl"));
                assert_eq!(args.dedup_scope, Some(DedupScope::Category));
                assert_eq!(args.max_per_group, Some(2));
                assert_eq!(args.format, Some(CorpusFormat::Chat));
                assert_eq!(args.validation_fraction, Some(0.1));
                assert!(args.min_quality.is_none());
            }
            _ => panic!("Expected Compile command"),
        }
    }

    #[test]
    fn test_ingest_and_artifacts_commands() {
        let cli = Cli::try_parse_from([
            "paper-cot-forge",
            "ingest",
            "--source",
            "papers.jsonl",
            "--category",
            "cs.CL",
            "--category",
            "cs.LG",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Ingest(args) => {
                assert_eq!(args.source, PathBuf::from("papers.jsonl"));
                assert_eq!(args.categories, vec!["cs.CL", "cs.LG"]);
            }
            _ => panic!("Expected Ingest command"),
        }

        let cli = Cli::try_parse_from(["paper-cot-forge", "artifacts", "--record", "cot_set:4"])
            .expect("should parse");
        match cli.command {
            Commands::Artifacts(args) => assert_eq!(args.record, Some(RecordId::cot_set(4))),
            _ => panic!("Expected Artifacts command"),
        }
    }

    #[test]
    fn test_load_config_layers_flags_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "min_quality: 2\ndatabase_path: /data/from-file.db\n").unwrap();

        let cli = Cli::try_parse_from([
            "paper-cot-forge",
            "--config",
            path.to_str().unwrap(),
            "--database",
            "/data/from-flag.db",
            "status",
        ])
        .unwrap();
        let config = load_config_with(&cli, |_| None).unwrap();
        assert_eq!(config.min_quality, 2);
        assert_eq!(config.database_path, PathBuf::from("/data/from-flag.db"));

        let env = |key: &str| match key {
            "PAPER_COT_MIN_QUALITY" => Some("4".to_string()),
            "PAPER_COT_DATABASE" => Some("/data/from-env.db".to_string()),
            _ => None,
        };
        let config = load_config_with(&cli, env).unwrap();
        assert_eq!(config.min_quality, 4);
        assert_eq!(config.database_path, PathBuf::from("/data/from-flag.db"));
    }
}
