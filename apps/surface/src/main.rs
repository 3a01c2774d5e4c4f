use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    HttpBackend, QuickAction, SurfaceEvent, SurfaceRole, SurfaceSession, SurfaceView, SyncError,
    ToastLevel,
};
use futures::StreamExt;
use shared::domain::{NotificationId, SectorId, SectorStatus};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server_url: String,
    /// Signs in with this email. Without it the surface opens as a citizen.
    #[arg(long, requires = "password")]
    email: Option<String>,
    #[arg(long, env = "SURFACE_PASSWORD", hide_env_values = true)]
    password: Option<String>,
    /// Overrides the role derived from the session.
    #[arg(long, value_enum)]
    role: Option<RoleArg>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Driver,
    Supervisor,
    Citizen,
}

impl From<RoleArg> for SurfaceRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::Driver => SurfaceRole::Driver,
            RoleArg::Supervisor => SurfaceRole::Supervisor,
            RoleArg::Citizen => SurfaceRole::Citizen,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum QuickArg {
    ReportProblem,
    PauseRoute,
    FinishShift,
}

impl From<QuickArg> for QuickAction {
    fn from(value: QuickArg) -> Self {
        match value {
            QuickArg::ReportProblem => QuickAction::ReportProblem,
            QuickArg::PauseRoute => QuickAction::PauseRoute,
            QuickArg::FinishShift => QuickAction::FinishShift,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints the map summary and every live update until Ctrl-C.
    Watch,
    SetStatus {
        sector_id: String,
        status: SectorStatus,
    },
    Quick {
        #[arg(value_enum)]
        action: QuickArg,
        sector_id: String,
    },
    Report {
        kind: String,
        message: String,
        #[arg(long)]
        sector_id: Option<String>,
    },
    DeleteNotifications {
        #[arg(required = true)]
        ids: Vec<i64>,
    },
    PurgeHistory,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut backend = HttpBackend::new(&args.server_url)?;
    let session_role = match (args.email.as_deref(), args.password.as_deref()) {
        (Some(email), Some(password)) => {
            let session = backend.sign_in(email, password).await?;
            info!(actor = %session.actor.email, supervisor = session.supervisor, "signed in");
            if session.supervisor {
                SurfaceRole::Supervisor
            } else {
                SurfaceRole::Driver
            }
        }
        _ => SurfaceRole::Citizen,
    };
    let role = args.role.map(SurfaceRole::from).unwrap_or(session_role);

    let mut surface = SurfaceSession::open(Arc::new(backend), role).await?;
    let outcome = run(&surface, args.command).await;
    surface.teardown().await;
    outcome
}

async fn run(surface: &SurfaceSession, command: Command) -> Result<()> {
    match command {
        Command::Watch => {
            print_view(&surface.view().await);
            let mut updates = surface.updates();
            let shutdown = tokio::signal::ctrl_c();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    _ = &mut shutdown => break,
                    update = updates.next() => match update {
                        Some(Ok(event)) => print_event(&event),
                        Some(Err(lagged)) => warn!(error = %lagged, "surface updates lagged"),
                        None => break,
                    },
                }
            }
        }
        Command::SetStatus { sector_id, status } => {
            surface.select_sector(&SectorId::new(sector_id)).await?;
            let mutation = surface.set_selected_status(status).await?;
            println!(
                "{}: {} -> {}",
                mutation.entry.sector_name,
                mutation.entry.previous_status.label(),
                mutation.entry.new_status.label()
            );
        }
        Command::Quick { action, sector_id } => {
            surface.select_sector(&SectorId::new(sector_id)).await?;
            let mutation = surface.quick_action(action.into()).await?;
            println!(
                "{} is now {}",
                mutation.sector.name,
                mutation.sector.status.label()
            );
        }
        Command::Report {
            kind,
            message,
            sector_id,
        } => {
            if let Some(sector_id) = sector_id {
                surface.select_sector(&SectorId::new(sector_id)).await?;
            }
            let report = surface.report_incident(&kind, &message).await?;
            println!("posted notification {}", report.id.0);
        }
        Command::DeleteNotifications { ids } => {
            surface.refresh_notifications().await?;
            for id in ids {
                if !surface.set_marked(NotificationId(id), true).await {
                    warn!(notification_id = id, "notification is not listed; skipping");
                }
            }
            match surface.delete_marked().await {
                Ok(report) => println!("deleted {} notifications", report.deleted.len()),
                Err(SyncError::PartialBulkFailure(report)) => {
                    bail!(
                        "deleted {} notifications; failed: {:?}",
                        report.deleted.len(),
                        report.failed.iter().map(|id| id.0).collect::<Vec<_>>()
                    );
                }
                Err(err) => return Err(err.into()),
            }
        }
        Command::PurgeHistory => {
            let purged = surface.purge_history().await?;
            println!("purged {purged} history entries");
        }
    }
    Ok(())
}

fn print_view(view: &SurfaceView) {
    let summary = &view.summary;
    println!(
        "pending {} ({:.0}%) | en route {} ({:.0}%) | collected {} ({:.0}%) | total {}",
        summary.pending,
        summary.percentage(SectorStatus::Pending),
        summary.en_route,
        summary.percentage(SectorStatus::EnRoute),
        summary.collected,
        summary.percentage(SectorStatus::Collected),
        summary.total()
    );
    for layer in &view.layers {
        println!(
            "  {:<12} {:<10} {} {}",
            layer.id.as_str(),
            layer.status.label(),
            layer.style.fill_color,
            layer.name
        );
    }
    for row in &view.notifications {
        let mark = if row.marked { "[x]" } else { "[ ]" };
        println!(
            "  {mark} #{} {}: {}",
            row.report.id.0, row.report.kind, row.report.message
        );
    }
    for entry in &view.history {
        println!(
            "  {} {} -> {} by {}",
            entry.sector_name,
            entry.previous_status.label(),
            entry.new_status.label(),
            entry.actor.as_deref().unwrap_or("system")
        );
    }
}

fn print_event(event: &SurfaceEvent) {
    match event {
        SurfaceEvent::Rendered { view, delta } => {
            if !delta.restyled.is_empty() || !delta.removed.is_empty() {
                println!(
                    "changed: {}",
                    serde_json::to_string(&delta.restyled).unwrap_or_default()
                );
            }
            print_view(view);
        }
        SurfaceEvent::Toast { level, message } => {
            let tag = match level {
                ToastLevel::Success => "ok",
                ToastLevel::Info => "info",
                ToastLevel::Error => "error",
            };
            println!("[{tag}] {message}");
        }
    }
}
