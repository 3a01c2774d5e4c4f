use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{HistoryEntry, NotificationId, NotificationReport, Sector, SectorId, SectorStatus},
    error::ApiError,
    protocol::{
        BulkDeleteReport, BulkDeleteRequest, NotificationDraft, PurgeResponse, ServerEvent,
        SessionRequest, SessionResponse, SetStatusRequest, StatusMutation,
    },
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::SyncError;

pub type EventStream = BoxStream<'static, ServerEvent>;

/// Everything a surface needs from the sector service.
#[async_trait]
pub trait SectorBackend: Send + Sync {
    /// Opens the live event stream. The stream ends when the connection closes.
    async fn subscribe(&self) -> Result<EventStream, SyncError>;
    async fn list_sectors(&self) -> Result<Vec<Sector>, SyncError>;
    async fn set_status(
        &self,
        sector_id: &SectorId,
        status: SectorStatus,
    ) -> Result<StatusMutation, SyncError>;
    async fn list_notifications(&self, limit: u32) -> Result<Vec<NotificationReport>, SyncError>;
    async fn post_notification(
        &self,
        draft: NotificationDraft,
    ) -> Result<NotificationReport, SyncError>;
    async fn delete_notifications(
        &self,
        ids: &[NotificationId],
    ) -> Result<BulkDeleteReport, SyncError>;
    async fn list_history(&self, limit: u32) -> Result<Vec<HistoryEntry>, SyncError>;
    async fn purge_history(&self) -> Result<u64, SyncError>;
}

/// [`SectorBackend`] over the server's HTTP routes and `/ws` stream.
pub struct HttpBackend {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl HttpBackend {
    pub fn new(server_url: &str) -> Result<Self, SyncError> {
        let mut base = Url::parse(server_url)
            .map_err(|e| SyncError::invalid_argument(format!("invalid server url: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(SyncError::invalid_argument(
                "server url must start with http:// or https://",
            ));
        }
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            http: Client::new(),
            base,
            token: None,
        })
    }

    /// Opens a server session and keeps its token for later calls.
    pub async fn sign_in(
        &mut self,
        email: &str,
        password: &str,
    ) -> Result<SessionResponse, SyncError> {
        let response = self
            .http
            .post(self.endpoint("session")?)
            .json(&SessionRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        let session: SessionResponse = decode(response).await?;
        self.token = Some(session.token.clone());
        Ok(session)
    }

    fn endpoint(&self, path: &str) -> Result<Url, SyncError> {
        self.base
            .join(path)
            .map_err(|e| SyncError::invalid_argument(format!("invalid endpoint '{path}': {e}")))
    }

    fn ws_url(&self) -> Result<Url, SyncError> {
        let mut url = self.endpoint("ws")?;
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| SyncError::invalid_argument("cannot derive websocket url"))?;
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl SectorBackend for HttpBackend {
    async fn subscribe(&self) -> Result<EventStream, SyncError> {
        let ws_url = self.ws_url()?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SyncError::Transport(format!("failed to connect websocket {ws_url}: {e}")))?;
        debug!(%ws_url, "event stream connected");

        let events = ws_stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => Some(event),
                        Err(err) => {
                            warn!(error = %err, "invalid server event");
                            None
                        }
                    },
                    Ok(_) => None,
                    Err(err) => {
                        warn!(error = %err, "event stream read failed");
                        None
                    }
                })
            });
        Ok(events.boxed())
    }

    async fn list_sectors(&self) -> Result<Vec<Sector>, SyncError> {
        let response = self.http.get(self.endpoint("sectors")?).send().await?;
        decode(response).await
    }

    async fn set_status(
        &self,
        sector_id: &SectorId,
        status: SectorStatus,
    ) -> Result<StatusMutation, SyncError> {
        let mut url = self.endpoint("sectors/")?;
        url.path_segments_mut()
            .map_err(|_| SyncError::invalid_argument("server url cannot hold a path"))?
            .pop_if_empty()
            .push(sector_id.as_str())
            .push("status");
        let response = self
            .authorized(self.http.post(url))
            .json(&SetStatusRequest { status })
            .send()
            .await?;
        decode(response).await
    }

    async fn list_notifications(&self, limit: u32) -> Result<Vec<NotificationReport>, SyncError> {
        let response = self
            .http
            .get(self.endpoint("notifications")?)
            .query(&[("limit", limit)])
            .send()
            .await?;
        decode(response).await
    }

    async fn post_notification(
        &self,
        draft: NotificationDraft,
    ) -> Result<NotificationReport, SyncError> {
        let response = self
            .authorized(self.http.post(self.endpoint("notifications")?))
            .json(&draft)
            .send()
            .await?;
        decode(response).await
    }

    async fn delete_notifications(
        &self,
        ids: &[NotificationId],
    ) -> Result<BulkDeleteReport, SyncError> {
        let response = self
            .authorized(self.http.post(self.endpoint("notifications/delete")?))
            .json(&BulkDeleteRequest { ids: ids.to_vec() })
            .send()
            .await?;
        decode(response).await
    }

    async fn list_history(&self, limit: u32) -> Result<Vec<HistoryEntry>, SyncError> {
        let response = self
            .authorized(self.http.get(self.endpoint("history")?))
            .query(&[("limit", limit)])
            .send()
            .await?;
        decode(response).await
    }

    async fn purge_history(&self) -> Result<u64, SyncError> {
        let response = self
            .authorized(self.http.delete(self.endpoint("history")?))
            .send()
            .await?;
        let body: PurgeResponse = decode(response).await?;
        Ok(body.purged)
    }
}

/// Any 2xx (207 included) decodes as `T`; other statuses decode the
/// server's error body when there is one.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.bytes().await?;
    match serde_json::from_slice::<ApiError>(&body) {
        Ok(err) => Err(SyncError::Api(err)),
        Err(_) => Err(SyncError::Transport(format!("server returned {status}"))),
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
