//! CLI for featuretiles - serve, purge and sweep cached vector tiles
//!
//! This is a thin wrapper around the featuretiles-core library.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use featuretiles_core::config::TilesConfig;
use featuretiles_core::pipeline::{ServedTile, TileService};
use featuretiles_core::source::GeoJsonFeatureSource;
use featuretiles_core::tile::{TileBounds, TileCoordinate};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "featuretiles",
    about = "Generate and cache vector tiles from GeoJSON collections",
    version
)]
struct Args {
    /// Tile configuration (JSON)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Get one tile, from the cache or freshly generated
    Tile {
        dataset: String,

        /// Tiling scheme id, e.g. WebMercatorQuad
        scheme: String,

        /// Tile address as zoom/row/col
        #[arg(value_name = "Z/ROW/COL")]
        address: String,

        /// Single collection; all enabled collections when omitted
        #[arg(long)]
        collection: Option<String>,

        /// Keep the tile out of the persistent cache
        #[arg(long)]
        temporary: bool,

        /// Write the tile bytes here
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Print a JSON summary instead of text
        #[arg(long)]
        json: bool,
    },

    /// Delete cached tiles of a dataset or collection
    Purge {
        dataset: String,

        #[arg(long)]
        collection: Option<String>,

        #[arg(long)]
        scheme: Option<String>,

        /// CRS84 bounding box as minx,miny,maxx,maxy
        #[arg(long, allow_hyphen_values = true)]
        bbox: Option<String>,
    },

    /// Remove expired temporary tiles
    Sweep,
}

fn parse_address(address: &str) -> Result<(u8, u32, u32)> {
    let parts: Vec<&str> = address.split('/').collect();
    let [z, row, col] = parts.as_slice() else {
        anyhow::bail!("Invalid tile address '{address}', expected zoom/row/col");
    };
    Ok((
        z.parse().with_context(|| format!("Invalid zoom '{z}'"))?,
        row.parse().with_context(|| format!("Invalid row '{row}'"))?,
        col.parse().with_context(|| format!("Invalid col '{col}'"))?,
    ))
}

fn parse_bbox(bbox: &str) -> Result<TileBounds> {
    let values = bbox
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("Invalid bbox '{bbox}'"))?;
    let [min_x, min_y, max_x, max_y] = values.as_slice() else {
        anyhow::bail!("Invalid bbox '{bbox}', expected minx,miny,maxx,maxy");
    };
    let bounds = TileBounds::new(*min_x, *min_y, *max_x, *max_y);
    if !bounds.is_valid() {
        anyhow::bail!("Invalid bbox '{bbox}', min must not exceed max");
    }
    Ok(bounds)
}

fn summary(tile: &ServedTile) -> serde_json::Value {
    serde_json::json!({
        "tile": tile.coord.to_string(),
        "bytes": tile.data.len(),
        "origin": format!("{:?}", tile.origin).to_lowercase(),
        "complete": tile.is_complete,
        "features_read": tile.stats.features_read,
        "features_encoded": tile.stats.features_encoded,
        "features_merged": tile.stats.features_merged,
        "features_failed": tile.stats.features_failed,
    })
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = Arc::new(
        TilesConfig::from_path(&args.config)
            .with_context(|| format!("Failed to load configuration {}", args.config.display()))?,
    );
    let source = Arc::new(
        GeoJsonFeatureSource::from_config(&config).context("Failed to load feature collections")?,
    );
    let service = TileService::new(config, source).context("Failed to start tile service")?;

    match args.command {
        Command::Tile {
            dataset,
            scheme,
            address,
            collection,
            temporary,
            out,
            json,
        } => {
            let (zoom, row, col) = parse_address(&address)?;
            let coord = TileCoordinate::new(dataset, collection.as_deref(), scheme, zoom, row, col)
                .with_temporary(temporary);
            let tile = service
                .get_tile(&coord)
                .with_context(|| format!("Failed to get tile {coord}"))?;

            if let Some(out) = &out {
                std::fs::write(out, &tile.data)
                    .with_context(|| format!("Failed to write {}", out.display()))?;
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&summary(&tile))?);
            } else {
                println!(
                    "✓ {} ({} bytes, {:?}{})",
                    tile.coord,
                    tile.data.len(),
                    tile.origin,
                    if tile.is_complete { "" } else { ", incomplete" }
                );
            }
            if !tile.is_complete {
                log::warn!("some collections were not ready; the tile was not cached");
            }
        }
        Command::Purge {
            dataset,
            collection,
            scheme,
            bbox,
        } => {
            let bbox = bbox.as_deref().map(parse_bbox).transpose()?;
            let deleted = service
                .purge(&dataset, collection.as_deref(), scheme.as_deref(), bbox.as_ref())
                .with_context(|| format!("Failed to purge {dataset}"))?;
            println!("✓ Deleted {deleted} cached tiles");
        }
        Command::Sweep => {
            let removed = service.sweep().context("Failed to sweep scratch area")?;
            println!("✓ Removed {removed} expired temporary tiles");
        }
    }

    Ok(())
}
