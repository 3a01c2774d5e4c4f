use server_api::ApiContext;
use shared::protocol::ServerEvent;
use storage::Storage;
use tokio::sync::broadcast;

use crate::session::SessionConfig;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) api: ApiContext,
    pub(crate) storage: Storage,
    pub(crate) sessions: SessionConfig,
    pub(crate) events: broadcast::Sender<ServerEvent>,
}
