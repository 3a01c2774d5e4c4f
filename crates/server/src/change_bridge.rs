use shared::protocol::{SectorChange, ServerEvent};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, warn};

/// Forwards the sector store's change feed onto the server event channel so
/// every connected surface sees every committed status write.
pub(crate) fn spawn_change_bridge(
    mut feed: broadcast::Receiver<SectorChange>,
    events: broadcast::Sender<ServerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(change) => {
                    debug!(sector_id = %change.sector.id, kind = ?change.kind, "forwarding sector change");
                    let _ = events.send(ServerEvent::SectorChanged { change });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "sector change feed lagged; asking surfaces to resync");
                    let _ = events.send(ServerEvent::Resync { skipped });
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
