use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shared::{
    domain::{SectorId, SectorStatus},
    error::ApiException,
    geo::FeatureCollection,
};
use server_api::{register_user, set_status, AccessPolicy, ApiContext};
use storage::{HistoryLog, SectorStore, Storage};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://./data/sectors.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Seeds or refreshes sectors from a GeoJSON feature collection.
    ImportGeojson { path: PathBuf },
    /// Writes the stored sectors as a GeoJSON feature collection.
    ExportGeojson {
        #[arg(long)]
        out: Option<PathBuf>,
    },
    ListSectors,
    SetStatus { sector_id: String, status: SectorStatus },
    DeleteSector { sector_id: String },
    PurgeHistory,
    /// Creates an account or replaces its password.
    AddUser {
        email: String,
        #[arg(long, env = "SECTOR_USER_PASSWORD")]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;

    match cli.command {
        Command::ImportGeojson { path } => {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let sectors = FeatureCollection::parse(&raw)?.into_sectors()?;
            for sector in &sectors {
                let kind = storage.upsert_sector(sector).await?;
                info!(sector_id = %sector.id, ?kind, "sector imported");
            }
            println!("imported {} sectors", sectors.len());
        }
        Command::ExportGeojson { out } => {
            let sectors = storage.list_sectors().await?;
            let body = serde_json::to_string_pretty(&FeatureCollection::from_sectors(&sectors))?;
            match out {
                Some(path) => {
                    fs::write(&path, body)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("exported {} sectors to {}", sectors.len(), path.display());
                }
                None => println!("{body}"),
            }
        }
        Command::ListSectors => {
            for sector in storage.list_sectors().await? {
                println!("{}\t{}\t{}", sector.id, sector.status.label(), sector.name);
            }
        }
        Command::SetStatus { sector_id, status } => {
            let ctx = ApiContext::from_storage(storage.clone(), AccessPolicy::default());
            let mutation = set_status(&ctx, &SectorId::new(sector_id), status, None)
                .await
                .map_err(ApiException::from)?;
            println!(
                "{} moved from {} to {}",
                mutation.sector.id,
                mutation.entry.previous_status.label(),
                mutation.entry.new_status.label()
            );
        }
        Command::DeleteSector { sector_id } => {
            if storage.delete_sector(&SectorId::new(sector_id.clone())).await? {
                println!("deleted sector {sector_id}");
            } else {
                println!("sector {sector_id} not found");
            }
        }
        Command::PurgeHistory => {
            let purged = storage.purge_history().await?;
            println!("purged {purged} history entries");
        }
        Command::AddUser { email, password } => {
            let ctx = ApiContext::from_storage(storage.clone(), AccessPolicy::default());
            let actor = register_user(&ctx, &email, &password)
                .await
                .map_err(ApiException::from)?;
            println!("stored credentials for {}", actor.email);
        }
    }

    Ok(())
}
