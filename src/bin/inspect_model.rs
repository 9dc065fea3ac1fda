//! チェックポイント・エクスポート成果物の内容を表示する

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use asl_signs_lib::ml::export::{ExportMetadata, GraphNode, GRAPH_ENTRY};
use asl_signs_lib::model::model_storage::{read_bundle, METADATA_ENTRY, OPTIMIZER_ENTRY};
use asl_signs_lib::model::{load_metadata, print_metadata_info};

/// Print the metadata stored in a checkpoint or export artifact.
#[derive(Parser)]
#[command(name = "inspect_model", version, about)]
struct Cli {
    /// Checkpoint (`train`) or artifact (`export`) to inspect.
    path: PathBuf,
    /// Also list the lowered graph of an export artifact.
    #[arg(long)]
    graph: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut bundle = read_bundle(&cli.path)
        .with_context(|| format!("failed to read {}", cli.path.display()))?;

    if !bundle.contains(GRAPH_ENTRY) {
        let metadata = load_metadata(&cli.path)
            .with_context(|| format!("invalid checkpoint {}", cli.path.display()))?;
        print_metadata_info(&metadata);
        println!(
            "オプティマイザ状態: {}",
            if bundle.contains(OPTIMIZER_ENTRY) { "あり" } else { "なし" }
        );
        return Ok(());
    }

    let metadata: ExportMetadata = serde_json::from_slice(&bundle.take(METADATA_ENTRY)?)
        .context("invalid export metadata")?;
    let graph: Vec<GraphNode> =
        serde_json::from_slice(&bundle.take(GRAPH_ENTRY)?).context("invalid export graph")?;

    println!("\n=== エクスポート成果物 ===");
    println!("ランタイム: {}", metadata.runtime.name);
    println!("精度: {:?}", metadata.precision);
    println!("クラス数: {}", metadata.labels.len());
    println!(
        "入力サイズ: {}x{}",
        metadata.classifier.image_width, metadata.classifier.image_height
    );
    println!("ノード数: {}", graph.len());
    println!("エクスポート日時: {}", metadata.exported_at);
    if cli.graph {
        for node in &graph {
            println!("  {:<24} {}", node.name, node.op.kind());
        }
    }
    println!("==========================");
    Ok(())
}
