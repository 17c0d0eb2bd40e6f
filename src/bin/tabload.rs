// Demo CLI wiring the full import pipeline end-to-end: analyze a file,
// review the inferred structure and suggested mappings, then run a batch
// import against the in-memory storage while streaming progress.

use tabload::batch::{FieldMapping, LoaderOptions};
use tabload::extraction::ExtractorConfig;
use tabload::service::ImportService;
use tabload::storage::MemoryStorage;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tabload")]
#[command(about = "Adaptive tabular file import with learned field mapping")]
#[command(version)]
struct Args {
    /// Directory holding the learned-pattern database
    #[arg(long, default_value = ".tabload", global = true)]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract a file and print the inferred structure and suggestions
    Analyze {
        /// File to analyze (csv, json, jsonl)
        file: PathBuf,
    },
    /// Import a file end-to-end with an explicit field mapping
    Import {
        /// File to import
        file: PathBuf,

        /// Target entity type (product, customer, order)
        #[arg(short, long)]
        entity: String,

        /// Field mappings as source=target pairs, repeatable
        #[arg(short, long = "map", value_name = "SOURCE=TARGET")]
        mappings: Vec<String>,

        /// Rows per batch
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// Batches processed concurrently
        #[arg(long, default_value_t = 5)]
        concurrency: usize,

        /// Run extraction strategies one at a time instead of racing them
        #[arg(long)]
        sequential: bool,
    },
    /// Print learning-store statistics
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    std::fs::create_dir_all(&args.data_dir)
        .with_context(|| format!("creating {}", args.data_dir.display()))?;

    match args.command {
        Commands::Analyze { file } => analyze(&args.data_dir, &file).await,
        Commands::Import {
            file,
            entity,
            mappings,
            batch_size,
            concurrency,
            sequential,
        } => {
            import(
                &args.data_dir,
                &file,
                &entity,
                &mappings,
                batch_size,
                concurrency,
                sequential,
            )
            .await
        }
        Commands::Stats => stats(&args.data_dir),
    }
}

fn build_service(
    data_dir: &PathBuf,
    loader_options: LoaderOptions,
    extractor_config: ExtractorConfig,
) -> Result<ImportService> {
    let storage = Arc::new(MemoryStorage::new());
    ImportService::new(storage, data_dir, loader_options, extractor_config)
        .context("initializing import service")
}

async fn analyze(data_dir: &PathBuf, file: &PathBuf) -> Result<()> {
    let buffer = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());

    let service = build_service(
        data_dir,
        LoaderOptions::default(),
        ExtractorConfig::default(),
    )?;
    let report = service.analyze(&buffer, None, &filename).await?;

    println!(
        "strategy: {} (confidence {:.0})",
        report.extraction.strategy, report.extraction.confidence
    );
    println!(
        "records: {}  delimiter: {:?}  headers: {}",
        report.extraction.metadata.record_count,
        report.extraction.metadata.delimiter,
        report.extraction.metadata.has_headers
    );
    for issue in &report.extraction.metadata.issues {
        println!("issue: {}", issue);
    }

    println!("\nfields:");
    for field in &report.structure.fields {
        let hint = field
            .semantic_hint
            .as_deref()
            .map(|h| format!(" ({})", h))
            .unwrap_or_default();
        println!(
            "  {:<24} {:?}{}  null {:.0}%  unique {:.0}%{}",
            field.name,
            field.inferred_type,
            hint,
            field.null_percentage,
            field.uniqueness_percentage,
            if field.required { "  required" } else { "" }
        );
        if let Some(suggestions) = report.suggestions.get(&field.name) {
            for s in suggestions {
                println!(
                    "    -> {} ({:.2}, {})",
                    s.target_field, s.confidence, s.match_kind
                );
            }
        }
    }
    println!(
        "\nstructure confidence: {:.2} over {} records",
        report.structure.confidence, report.structure.record_count
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn import(
    data_dir: &PathBuf,
    file: &PathBuf,
    entity: &str,
    raw_mappings: &[String],
    batch_size: usize,
    concurrency: usize,
    sequential: bool,
) -> Result<()> {
    let mapping = parse_mappings(raw_mappings)?;
    let buffer = std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file.display().to_string());

    let service = build_service(
        data_dir,
        LoaderOptions {
            batch_size,
            concurrency,
        },
        ExtractorConfig {
            parallel: !sequential,
            ..ExtractorConfig::default()
        },
    )?;

    let report = service.analyze(&buffer, None, &filename).await?;
    info!(
        records = report.extraction.records.len(),
        strategy = %report.extraction.strategy,
        "extraction selected"
    );

    // Watch our own session the way an external subscriber would.
    let session_id = Uuid::new_v4().to_string();
    let (sub_tx, mut sub_rx) = mpsc::unbounded_channel::<String>();
    service
        .broadcaster()
        .register(&session_id, "cli", sub_tx)?;
    let printer = tokio::spawn(async move {
        while let Some(frame) = sub_rx.recv().await {
            println!("{}", frame);
        }
    });

    let session = service
        .run_import(
            &session_id,
            entity,
            report.extraction.records.clone(),
            mapping.clone(),
        )
        .await?;

    // Feed the confirmed mapping back so future imports get suggestions.
    service.confirm_mapping(
        &mapping,
        report.extraction.confidence / 100.0,
        &report.extraction.strategy,
    )?;

    drop(service);
    let _ = printer.await;

    println!(
        "\nsession {} finished: {:?} ({} ok, {} failed of {})",
        session.id,
        session.status,
        session.successful_records,
        session.failed_records,
        session.total_records
    );
    Ok(())
}

fn stats(data_dir: &PathBuf) -> Result<()> {
    let service = build_service(
        data_dir,
        LoaderOptions::default(),
        ExtractorConfig::default(),
    )?;
    let stats = service.learning().stats()?;
    println!("patterns: {}", stats.pattern_count);
    println!("total usage: {}", stats.total_usage);
    println!("average success rate: {:.2}", stats.average_success_rate);
    for (strategy, count) in &stats.by_strategy {
        println!("  {}: {}", strategy, count);
    }
    Ok(())
}

fn parse_mappings(raw: &[String]) -> Result<Vec<FieldMapping>> {
    if raw.is_empty() {
        bail!("at least one --map SOURCE=TARGET is required");
    }
    raw.iter()
        .map(|pair| match pair.split_once('=') {
            Some((source, target)) if !source.is_empty() && !target.is_empty() => {
                Ok(FieldMapping::new(source, target))
            }
            _ => bail!("invalid mapping {:?}, expected SOURCE=TARGET", pair),
        })
        .collect()
}
