use anyhow::{Context, Result};
use clap::Parser;
use loader::config::Config;
use loader::engine::Loader;
use loader::store::PgStore;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "loader", about = "Loads price report CSVs into the warehouse")]
struct Args {
    /// Directory holding the CSV files (and the progress file)
    #[arg(long = "ruta", visible_alias = "dir", default_value = "datos/")]
    ruta: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    loader::init_tracing("loader=info")?;

    let config = Config::from_env()?;

    println!("=== AgroPrecios Loader ===");
    println!("Directory: {}", args.ruta.display());
    println!("Schema: {}", config.schema);
    println!("Chunk size: {}", config.loader_options().chunk_size);

    let store = PgStore::connect(&config).await?;
    store
        .ensure_schema()
        .await
        .context("Failed to prepare database schema")?;

    let mut loader = Loader::new(store, config.loader_options());
    let report = loader.load_directory(&args.ruta).await?;

    let cache = loader.cache().stats();
    println!("\n=== Load Complete ===");
    println!("Files: {}", report.files.len());
    println!("Rows read: {}", report.rows_read());
    println!("Facts inserted: {}", report.facts_inserted());
    let skipped = report.skipped();
    if skipped.is_empty() {
        println!("Rows skipped: 0");
    } else {
        println!("Rows skipped: {} ({})", skipped.total(), skipped);
    }
    println!(
        "Entities cached: {} regions, {} markets, {} subsectors, {} products, {} varieties",
        cache.regions, cache.markets, cache.subsectors, cache.products, cache.varieties
    );

    let failed: Vec<_> = report.failed_files().collect();
    if !failed.is_empty() {
        println!("\nFiles stopped early (re-run to resume):");
        for file in failed {
            println!(
                "  - {} at chunk {}: {}",
                file.file_name,
                file.next_chunk(),
                file.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    Ok(())
}
