use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use kgraph_core::{
    CanonicalRegistry, ImportPipeline, PipelineConfig, RawTriple, RunContext, Schema,
    SnapshotStore, Storage,
};

#[derive(Parser)]
#[command(
    name = "kgraph",
    about = "Import extracted knowledge graph triples into a normalized, validated store",
    version
)]
struct Cli {
    /// JSONL file with one raw triple per line
    input: PathBuf,
    /// SQLite database holding the graph
    #[arg(long, env = "KG_DB_PATH", default_value = "kgraph.db")]
    db: String,
    /// JSON schema definition replacing the built-in rules
    #[arg(long, env = "KG_SCHEMA_PATH")]
    schema: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    let schema = match &cli.schema {
        Some(path) => Schema::from_path(path)
            .with_context(|| format!("Failed to load schema from {}", path.display()))?,
        None => Schema::builtin(),
    };
    let raw = read_triples(&cli.input)?;

    let storage = Storage::open(&cli.db)
        .await
        .with_context(|| format!("Failed to open {}", cli.db))?;
    let stored = storage.load_snapshot().await?;

    let mut registry = CanonicalRegistry::seeded();
    registry.load_snapshot(stored.registry)?;

    let pipeline = ImportPipeline::from_config(&config);
    let mut ctx = RunContext::new(schema, registry, config);
    let output = pipeline.run(&mut ctx, raw, &stored.triples)?;

    let stats = storage
        .commit_run(&ctx.registry.snapshot(), &output.diff)
        .await
        .context("Failed to commit run")?;
    tracing::info!(
        "Committed {} entities, {} new triples, {} evidence records, {} review items",
        stats.entities,
        stats.inserted,
        stats.evidence_appended,
        stats.flagged
    );

    println!("{}", output.report);
    Ok(())
}

/// One JSON object per line; blank lines are skipped.
fn read_triples(path: &Path) -> Result<Vec<RawTriple>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid triple", path.display(), i + 1))
        })
        .collect()
}
