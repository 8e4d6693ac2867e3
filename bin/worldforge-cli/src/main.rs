//! Worldforge CLI - Terrain editing from the command line
//!
//! Every editing command goes through the document manager and shuts it
//! down before exiting, so edits are flushed to the document store.

mod project;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use worldforge_common::{
    CELL_SIDE, CELLS_PER_LANDBLOCK, Config, LandblockCells, LandblockKey, TerrainEntry,
    TerrainField, cell_coords, cell_index,
};
use worldforge_docs::{DocumentManager, LayerDocument, TerrainDocument};

use crate::project::{Project, layer_id, terrain_id};

#[derive(Parser, Debug)]
#[command(name = "worldforge")]
#[command(about = "Worldforge terrain editor")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "worldforge.toml")]
    config: String,

    /// Directory holding the document store and asset archive
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Directory holding derived caches
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Log level (overrides the config file)
    #[arg(long)]
    log_level: Option<String>,

    /// Use throwaway in-memory backends with a small flat world
    #[arg(long)]
    in_memory: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Asset archive operations
    Archive {
        #[command(subcommand)]
        action: ArchiveCommands,
    },
    /// Derived terrain cache operations
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },
    /// Terrain document operations
    Terrain {
        #[command(subcommand)]
        action: TerrainCommands,
    },
    /// Layer document operations
    Layer {
        #[command(subcommand)]
        action: LayerCommands,
    },
    /// List stored documents
    Docs,
    /// Write edited terrain back into the asset archive
    Export {
        /// Archive iteration to stamp the records with
        #[arg(short, long)]
        iteration: u32,
    },
}

#[derive(Subcommand, Debug)]
enum ArchiveCommands {
    /// Fill the archive with flat landblocks
    Seed {
        /// Landblocks per side, starting at 0x0000
        #[arg(long, default_value_t = 8)]
        extent: u8,
        /// Height of every vertex
        #[arg(long, default_value_t = 0)]
        height: u8,
    },
    /// Show archive details
    Info,
}

#[derive(Subcommand, Debug)]
enum CacheCommands {
    /// Build the terrain base cache from the archive
    Build {
        /// Discard an existing cache first
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
enum TerrainCommands {
    /// Show one landblock
    Show {
        /// Landblock key (e.g. 0x0102)
        key: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Set fields of one vertex
    Set {
        /// Landblock key (e.g. 0x0102)
        key: String,
        /// Vertex column (0-8)
        x: usize,
        /// Vertex row (0-8)
        y: usize,
        #[arg(long)]
        road: Option<u8>,
        #[arg(long)]
        scenery: Option<u8>,
        #[arg(long = "type")]
        terrain_type: Option<u8>,
        #[arg(long)]
        height: Option<u8>,
    },
}

#[derive(Subcommand, Debug)]
enum LayerCommands {
    /// Set one field of one vertex in a layer
    Set {
        /// Layer name
        layer: String,
        /// Landblock key (e.g. 0x0102)
        key: String,
        /// Vertex column (0-8)
        x: usize,
        /// Vertex row (0-8)
        y: usize,
        /// Field to write: road, scenery, type or height
        #[arg(short, long)]
        field: String,
        /// New value; 0 clears the field
        #[arg(short, long)]
        value: u8,
    },
    /// Show the cells a layer holds for one landblock
    Show {
        /// Layer name
        layer: String,
        /// Landblock key (e.g. 0x0102)
        key: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

fn vertex(x: usize, y: usize) -> Result<usize> {
    if x >= CELL_SIDE || y >= CELL_SIDE {
        bail!("vertex ({x}, {y}) is outside the 9x9 grid");
    }
    Ok(cell_index(x, y))
}

fn entry_json(index: usize, value: u32) -> serde_json::Value {
    let (x, y) = cell_coords(index);
    let entry = TerrainEntry::from_packed(value);
    serde_json::json!({
        "x": x,
        "y": y,
        "road": entry.road,
        "scenery": entry.scenery,
        "type": entry.terrain_type,
        "height": entry.height,
    })
}

fn print_landblock(key: LandblockKey, cells: &LandblockCells, json: bool) -> Result<()> {
    if json {
        let cells: Vec<_> = cells
            .iter()
            .enumerate()
            .map(|(i, v)| entry_json(i, *v))
            .collect();
        let out = serde_json::json!({ "landblock": key.to_string(), "cells": cells });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Landblock {key} (heights, north at top)");
    for y in (0..CELL_SIDE).rev() {
        let row: Vec<String> = (0..CELL_SIDE)
            .map(|x| format!("{:>4}", TerrainEntry::from_packed(cells[cell_index(x, y)]).height))
            .collect();
        println!("{y} {}", row.join(""));
    }
    Ok(())
}

/// Run `work` against a fresh manager, then always shut the manager down
async fn with_manager<F, Fut>(project: &Project, work: F) -> Result<()>
where
    F: FnOnce(Arc<DocumentManager>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let manager = Arc::new(project.manager()?);
    let result = work(Arc::clone(&manager)).await;
    let report = manager.shutdown().await;
    if !report.is_clean() {
        let failed: Vec<_> = report.failed.iter().map(ToString::to_string).collect();
        bail!("failed to save: {}", failed.join(", "));
    }
    result
}

async fn run(args: Args, config: Config) -> Result<()> {
    let project = Project::open(config, args.in_memory)?;

    match args.command {
        Commands::Archive { action } => match action {
            ArchiveCommands::Seed { extent, height } => {
                let count = project.redb_archive()?.seed_flat(extent, height)?;
                if let Some(path) = project.snapshot_path() {
                    if path.exists() {
                        warn!("Terrain base cache is now stale; run `cache build --force`");
                    }
                }
                println!("Seeded {count} landblocks at height {height}");
            }
            ArchiveCommands::Info => {
                let archive = project.redb_archive()?;
                println!("Asset Archive");
                println!("=============");
                println!("Landblocks: {}", archive.len()?);
                println!("Iteration:  {}", archive.iteration()?);
            }
        },
        Commands::Cache { action } => match action {
            CacheCommands::Build { force } => {
                if force {
                    if let Some(path) = project.snapshot_path() {
                        if path.exists() {
                            std::fs::remove_file(&path)
                                .with_context(|| format!("failed to remove {}", path.display()))?;
                        }
                    }
                }
                let archive = project.archive();
                let cache = project.base_cache().get_or_load(archive.as_ref()).await?;
                println!("Terrain base cache: {} landblocks", cache.len());
                if let Some(path) = project.snapshot_path() {
                    println!("Snapshot: {}", path.display());
                }
            }
        },
        Commands::Terrain { action } => match action {
            TerrainCommands::Show { key, json } => {
                let key: LandblockKey = key.parse()?;
                with_manager(&project, |manager| async move {
                    let terrain = manager
                        .get_or_create::<TerrainDocument>(&terrain_id()?)
                        .await?;
                    print_landblock(key, &terrain.get_landblock(key)?, json)
                })
                .await?;
            }
            TerrainCommands::Set {
                key,
                x,
                y,
                road,
                scenery,
                terrain_type,
                height,
            } => {
                let key: LandblockKey = key.parse()?;
                let index = vertex(x, y)?;
                with_manager(&project, |manager| async move {
                    let terrain = manager
                        .get_or_create::<TerrainDocument>(&terrain_id()?)
                        .await?;
                    let current = TerrainEntry::from_packed(terrain.get_cell(key, index)?);
                    let entry = TerrainEntry::new(
                        road.unwrap_or(current.road),
                        scenery.unwrap_or(current.scenery),
                        terrain_type.unwrap_or(current.terrain_type),
                        height.unwrap_or(current.height),
                    );
                    if entry == current {
                        println!("Vertex ({x}, {y}) of {key} unchanged");
                        return Ok(());
                    }
                    let update = terrain.update_cell(key, index, entry.to_packed())?;
                    let touched: Vec<_> = update.landblocks().map(|k| k.to_string()).collect();
                    println!(
                        "Updated {} cells across landblocks {}",
                        update.len(),
                        touched.join(", ")
                    );
                    Ok(())
                })
                .await?;
            }
        },
        Commands::Layer { action } => match action {
            LayerCommands::Set {
                layer,
                key,
                x,
                y,
                field,
                value,
            } => {
                let key: LandblockKey = key.parse()?;
                let index = vertex(x, y)?;
                let field: TerrainField = field.parse()?;
                let id = layer_id(&layer)?;
                with_manager(&project, |manager| async move {
                    let doc = manager.get_or_create::<LayerDocument>(&id).await?;
                    let update = doc.set_field(key, index, field, value)?;
                    println!(
                        "Layer {layer}: wrote {field} on {} cells, {} cells stored",
                        update.len(),
                        doc.cell_count()
                    );
                    Ok(())
                })
                .await?;
            }
            LayerCommands::Show { layer, key, json } => {
                let key: LandblockKey = key.parse()?;
                let id = layer_id(&layer)?;
                with_manager(&project, |manager| async move {
                    let doc = manager.get_or_create::<LayerDocument>(&id).await?;
                    let sparse = doc.sparse_cells(key);
                    if json {
                        let mut cells = Vec::with_capacity(sparse.len());
                        for (&index, &value) in &sparse {
                            let mut cell = entry_json(usize::from(index), value);
                            cell["mask"] = doc.field_mask(key, usize::from(index))?.bits().into();
                            cells.push(cell);
                        }
                        let out = serde_json::json!({
                            "layer": layer,
                            "landblock": key.to_string(),
                            "cells": cells,
                        });
                        println!("{}", serde_json::to_string_pretty(&out)?);
                        return Ok(());
                    }

                    println!(
                        "Layer {layer}, landblock {key}: {} of {CELLS_PER_LANDBLOCK} cells set",
                        sparse.len()
                    );
                    for (&index, &value) in &sparse {
                        let (x, y) = cell_coords(usize::from(index));
                        let entry = TerrainEntry::from_packed(value);
                        let mask = doc.field_mask(key, usize::from(index))?;
                        let fields: Vec<_> = mask.fields().map(|f| f.name()).collect();
                        println!(
                            "  ({x}, {y}) road={} scenery={} type={} height={} authored=[{}]",
                            entry.road,
                            entry.scenery,
                            entry.terrain_type,
                            entry.height,
                            fields.join(",")
                        );
                    }
                    Ok(())
                })
                .await?;
            }
        },
        Commands::Docs => {
            let documents = project.redb_documents()?.list()?;
            println!("{:<32} {:<8} {:>8}", "ID", "KIND", "REVISION");
            for (id, kind, revision) in documents {
                println!("{id:<32} {:<8} {revision:>8}", kind.tag());
            }
        }
        Commands::Export { iteration } => {
            with_manager(&project, |manager| async move {
                let id = terrain_id()?;
                manager.get_or_create::<TerrainDocument>(&id).await?;
                let summary = manager.export(&id, iteration).await?;
                println!(
                    "Exported {} landblocks at iteration {iteration}",
                    summary.landblocks
                );
                Ok(())
            })
            .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config {}", args.config))?;

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(data_dir) = args.data_dir.clone() {
        config.project.data_dir = data_dir;
    }
    if let Some(cache_dir) = args.cache_dir.clone() {
        config.project.cache_dir = cache_dir;
    }
    if let Some(level) = args.log_level.clone() {
        config.logging.level = level;
    }

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Project data in {}, cache in {}",
        config.project.data_dir.display(),
        config.project.cache_dir.display()
    );

    run(args, config).await
}
