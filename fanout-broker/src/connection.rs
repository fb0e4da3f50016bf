//! Deadline- and session-guarded access to one broker link.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, warn};

use fanout_core::{LinkId, Price};
use fanout_vault::CredentialVault;

use crate::fleet::{BrokerLink, LinkStatus};
use crate::{
    BrokerAdapter, BrokerError, BrokerPosition, BrokerResult, BrokerSession, ConversionRequest,
    Holding, MarginSnapshot, OrderCommand, OrderPatch, Placement,
};

/// Wait applied before the single transport retry inside a leg.
const TRANSPORT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-adapter call deadlines.
#[derive(Clone, Copy, Debug)]
pub struct AdapterDeadlines {
    /// Order placement / cancellation / modification.
    pub place: Duration,
    /// Positions, holdings, margin, reference prices.
    pub metadata: Duration,
}

impl Default for AdapterDeadlines {
    fn default() -> Self {
        Self {
            place: Duration::from_secs(5),
            metadata: Duration::from_secs(2),
        }
    }
}

/// One authenticated broker link: adapter + session + credential source.
///
/// Every call is bounded by the per-adapter deadline. A `SESSION_EXPIRED`
/// response triggers exactly one silent re-auth (single-flight across
/// concurrent callers) before the failure is surfaced. Transport errors are
/// retried once with a short backoff, still inside the deadline.
pub struct BrokerConnection {
    link: Arc<RwLock<BrokerLink>>,
    adapter: Arc<dyn BrokerAdapter>,
    vault: Arc<CredentialVault>,
    session: Mutex<Option<BrokerSession>>,
    deadlines: AdapterDeadlines,
}

impl BrokerConnection {
    pub fn new(
        link: Arc<RwLock<BrokerLink>>,
        adapter: Arc<dyn BrokerAdapter>,
        vault: Arc<CredentialVault>,
        deadlines: AdapterDeadlines,
    ) -> Self {
        Self {
            link,
            adapter,
            vault,
            session: Mutex::new(None),
            deadlines,
        }
    }

    #[must_use]
    pub fn link_id(&self) -> LinkId {
        self.link.read().id
    }

    #[must_use]
    pub fn kind(&self) -> String {
        self.link.read().kind.clone()
    }

    /// Authenticate using vaulted credentials and cache the session.
    pub async fn login(&self) -> BrokerResult<BrokerSession> {
        let mut guard = self.session.lock().await;
        let fresh = self.authenticate().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Invalidate the cached session and tell the broker, best-effort.
    pub async fn logout(&self) -> BrokerResult<()> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            if let Err(err) = self.adapter.logout(&session).await {
                warn!(link_id = %self.link_id(), error = %err, "broker logout failed");
            }
        }
        self.set_status(LinkStatus::Disconnected);
        Ok(())
    }

    pub async fn place(&self, command: &OrderCommand) -> BrokerResult<Placement> {
        self.guarded(self.deadlines.place, |adapter, session| {
            let command = command.clone();
            async move { adapter.place(&session, &command).await }
        })
        .await
    }

    pub async fn modify(&self, broker_order_id: &str, patch: &OrderPatch) -> BrokerResult<Placement> {
        self.guarded(self.deadlines.place, |adapter, session| {
            let id = broker_order_id.to_string();
            let patch = patch.clone();
            async move { adapter.modify(&session, &id, &patch).await }
        })
        .await
    }

    pub async fn cancel(&self, broker_order_id: &str) -> BrokerResult<()> {
        self.guarded(self.deadlines.place, |adapter, session| {
            let id = broker_order_id.to_string();
            async move { adapter.cancel(&session, &id).await }
        })
        .await
    }

    pub async fn positions(&self) -> BrokerResult<Vec<BrokerPosition>> {
        self.guarded(self.deadlines.metadata, |adapter, session| async move {
            adapter.positions(&session).await
        })
        .await
    }

    pub async fn holdings(&self) -> BrokerResult<Vec<Holding>> {
        self.guarded(self.deadlines.metadata, |adapter, session| async move {
            adapter.holdings(&session).await
        })
        .await
    }

    pub async fn margin(&self) -> BrokerResult<MarginSnapshot> {
        self.guarded(self.deadlines.metadata, |adapter, session| async move {
            adapter.margin(&session).await
        })
        .await
    }

    pub async fn convert_position(&self, request: &ConversionRequest) -> BrokerResult<Value> {
        self.guarded(self.deadlines.place, |adapter, session| {
            let request = request.clone();
            async move { adapter.convert_position(&session, &request).await }
        })
        .await
    }

    pub async fn last_price(&self, symbol: &str) -> BrokerResult<Price> {
        self.guarded(self.deadlines.metadata, |adapter, session| {
            let symbol = symbol.to_string();
            async move { adapter.last_price(&session, &symbol).await }
        })
        .await
    }

    async fn guarded<T, F, Fut>(&self, deadline: Duration, call: F) -> BrokerResult<T>
    where
        F: Fn(Arc<dyn BrokerAdapter>, BrokerSession) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let session = self.ensure_session().await?;
        match self.attempt(deadline, &call, session.clone()).await {
            Err(BrokerError::SessionExpired) => {
                let fresh = self.reauthenticate(&session).await?;
                self.attempt(deadline, &call, fresh).await
            }
            other => other,
        }
    }

    /// One bounded attempt, including the single transport retry.
    async fn attempt<T, F, Fut>(
        &self,
        deadline: Duration,
        call: &F,
        session: BrokerSession,
    ) -> BrokerResult<T>
    where
        F: Fn(Arc<dyn BrokerAdapter>, BrokerSession) -> Fut,
        Fut: Future<Output = BrokerResult<T>>,
    {
        let work = async {
            match call(Arc::clone(&self.adapter), session.clone()).await {
                Err(BrokerError::Transport(first)) => {
                    tokio::time::sleep(TRANSPORT_BACKOFF).await;
                    call(Arc::clone(&self.adapter), session)
                        .await
                        .map_err(|err| match err {
                            BrokerError::Transport(second) => {
                                BrokerError::Transport(format!("{first}; retry failed: {second}"))
                            }
                            other => other,
                        })
                }
                other => other,
            }
        };
        match timeout(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout),
        }
    }

    async fn ensure_session(&self) -> BrokerResult<BrokerSession> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            if !session.is_expired() {
                return Ok(session.clone());
            }
        }
        let fresh = self.authenticate().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    /// Single-flight re-auth: callers that lost the race reuse the session
    /// installed by the winner instead of logging in again.
    async fn reauthenticate(&self, stale: &BrokerSession) -> BrokerResult<BrokerSession> {
        let mut guard = self.session.lock().await;
        if let Some(current) = guard.as_ref() {
            if current.token != stale.token {
                return Ok(current.clone());
            }
        }
        info!(link_id = %self.link_id(), "session expired; attempting silent re-auth");
        let refreshed = match timeout(self.deadlines.metadata, self.adapter.refresh(stale)).await {
            Ok(Ok(session)) => {
                self.set_status(LinkStatus::Connected);
                session
            }
            _ => self.authenticate().await?,
        };
        *guard = Some(refreshed.clone());
        Ok(refreshed)
    }

    async fn authenticate(&self) -> BrokerResult<BrokerSession> {
        let link_id = self.link_id();
        if !self.vault.contains(link_id) {
            self.set_status(LinkStatus::Expired);
            return Err(BrokerError::SessionExpired);
        }
        let secrets = self
            .vault
            .fetch(link_id)
            .map_err(|err| BrokerError::Authentication(err.to_string()))?;
        match timeout(self.deadlines.place, self.adapter.connect(&secrets)).await {
            Ok(Ok(session)) => {
                let mut link = self.link.write();
                link.status = LinkStatus::Connected;
                link.last_login_at = Some(chrono::Utc::now());
                Ok(session)
            }
            Ok(Err(err)) => {
                self.set_status(LinkStatus::Error);
                Err(err)
            }
            Err(_) => {
                self.set_status(LinkStatus::Error);
                Err(BrokerError::Timeout)
            }
        }
    }

    fn set_status(&self, status: LinkStatus) {
        self.link.write().status = status;
    }
}
