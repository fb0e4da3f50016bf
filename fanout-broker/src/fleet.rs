//! Link and account management across every connected broker.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use fanout_core::{AccountId, LinkId, UserId};
use fanout_vault::{CredentialVault, Secrets};

use crate::{
    AdapterDeadlines, AdapterRegistry, BrokerConnection, BrokerError, BrokerResult, MarginSnapshot,
};

/// Connection state of a broker link.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Connected,
    Expired,
    Error,
    Disconnected,
}

/// One user's connection to one broker (credentials live in the vault).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BrokerLink {
    pub id: LinkId,
    pub user_id: UserId,
    pub kind: String,
    pub client_code: String,
    pub status: LinkStatus,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Tradable account under a broker link.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Account {
    pub id: AccountId,
    pub link_id: LinkId,
    pub user_id: UserId,
    pub broker_account_id: String,
    pub margin_available: Decimal,
    pub currency: String,
    pub updated_at: DateTime<Utc>,
}

/// Registry of every connected link, its accounts, and live connections.
pub struct BrokerFleet {
    registry: Arc<AdapterRegistry>,
    vault: Arc<CredentialVault>,
    deadlines: AdapterDeadlines,
    links: RwLock<HashMap<LinkId, Arc<RwLock<BrokerLink>>>>,
    accounts: RwLock<HashMap<AccountId, Account>>,
    connections: RwLock<HashMap<LinkId, Arc<BrokerConnection>>>,
}

impl BrokerFleet {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        vault: Arc<CredentialVault>,
        deadlines: AdapterDeadlines,
    ) -> Self {
        Self {
            registry,
            vault,
            deadlines,
            links: RwLock::new(HashMap::new()),
            accounts: RwLock::new(HashMap::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Broker kinds that can be connected.
    #[must_use]
    pub fn supported_brokers(&self) -> Vec<String> {
        self.registry.supported().to_vec()
    }

    /// Store credentials, authenticate, and register the link with one
    /// default account.
    pub async fn connect(
        &self,
        user_id: UserId,
        kind: &str,
        client_code: &str,
        secrets: &Secrets,
        options: &Value,
    ) -> BrokerResult<BrokerLink> {
        let adapter = self.registry.adapter_for(kind, options)?;
        let link_id = Uuid::new_v4();
        let link = Arc::new(RwLock::new(BrokerLink {
            id: link_id,
            user_id,
            kind: adapter.kind().to_string(),
            client_code: client_code.to_string(),
            status: LinkStatus::Disconnected,
            last_login_at: None,
            created_at: Utc::now(),
        }));
        self.vault.store(link_id, secrets);

        let connection = Arc::new(BrokerConnection::new(
            Arc::clone(&link),
            adapter,
            Arc::clone(&self.vault),
            self.deadlines,
        ));
        if let Err(err) = connection.login().await {
            self.vault.forget(link_id);
            return Err(err);
        }

        self.links.write().insert(link_id, Arc::clone(&link));
        self.connections.write().insert(link_id, connection);
        let account = Account {
            id: Uuid::new_v4(),
            link_id,
            user_id,
            broker_account_id: client_code.to_string(),
            margin_available: Decimal::ZERO,
            currency: "INR".into(),
            updated_at: Utc::now(),
        };
        self.accounts.write().insert(account.id, account);

        let snapshot = link.read().clone();
        info!(link_id = %link_id, kind = %snapshot.kind, "broker link connected");
        Ok(snapshot)
    }

    /// Re-authenticate an existing link from vaulted credentials.
    pub async fn login(&self, link_id: LinkId) -> BrokerResult<BrokerLink> {
        let connection = self.connection(link_id)?;
        connection.login().await?;
        self.link(link_id)
    }

    /// Drop the cached session and mark the link disconnected.
    pub async fn logout(&self, link_id: LinkId) -> BrokerResult<BrokerLink> {
        let connection = self.connection(link_id)?;
        connection.logout().await?;
        self.link(link_id)
    }

    /// Delete a link together with its accounts and vaulted credentials.
    pub async fn remove(&self, link_id: LinkId) -> BrokerResult<()> {
        let connection = self.connection(link_id)?;
        let _ = connection.logout().await;
        self.connections.write().remove(&link_id);
        self.links.write().remove(&link_id);
        self.accounts
            .write()
            .retain(|_, account| account.link_id != link_id);
        self.vault.forget(link_id);
        info!(link_id = %link_id, "broker link removed");
        Ok(())
    }

    pub fn link(&self, link_id: LinkId) -> BrokerResult<BrokerLink> {
        self.links
            .read()
            .get(&link_id)
            .map(|link| link.read().clone())
            .ok_or_else(|| BrokerError::InvalidRequest(format!("unknown broker link {link_id}")))
    }

    #[must_use]
    pub fn links_for(&self, user_id: UserId) -> Vec<BrokerLink> {
        let mut links: Vec<BrokerLink> = self
            .links
            .read()
            .values()
            .map(|link| link.read().clone())
            .filter(|link| link.user_id == user_id)
            .collect();
        links.sort_by_key(|link| link.created_at);
        links
    }

    /// Attach an additional account to a link.
    pub fn add_account(
        &self,
        link_id: LinkId,
        broker_account_id: &str,
        currency: &str,
    ) -> BrokerResult<Account> {
        let link = self.link(link_id)?;
        let account = Account {
            id: Uuid::new_v4(),
            link_id,
            user_id: link.user_id,
            broker_account_id: broker_account_id.to_string(),
            margin_available: Decimal::ZERO,
            currency: currency.to_string(),
            updated_at: Utc::now(),
        };
        self.accounts.write().insert(account.id, account.clone());
        Ok(account)
    }

    pub fn account(&self, account_id: AccountId) -> BrokerResult<Account> {
        self.accounts
            .read()
            .get(&account_id)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidRequest(format!("unknown account {account_id}")))
    }

    #[must_use]
    pub fn accounts_for(&self, link_id: LinkId) -> Vec<Account> {
        self.accounts
            .read()
            .values()
            .filter(|account| account.link_id == link_id)
            .cloned()
            .collect()
    }

    /// Overwrite the cached margin for an account (used by tests and by the
    /// margin refresh below).
    pub fn set_account_margin(&self, account_id: AccountId, available: Decimal) -> BrokerResult<()> {
        let mut accounts = self.accounts.write();
        let account = accounts.get_mut(&account_id).ok_or_else(|| {
            BrokerError::InvalidRequest(format!("unknown account {account_id}"))
        })?;
        account.margin_available = available;
        account.updated_at = Utc::now();
        Ok(())
    }

    /// Pull a fresh margin snapshot from the broker and cache it.
    pub async fn refresh_margin(&self, account_id: AccountId) -> BrokerResult<MarginSnapshot> {
        let account = self.account(account_id)?;
        let connection = self.connection(account.link_id)?;
        let snapshot = connection.margin().await?;
        self.set_account_margin(account_id, snapshot.available)?;
        Ok(snapshot)
    }

    pub fn connection(&self, link_id: LinkId) -> BrokerResult<Arc<BrokerConnection>> {
        self.connections
            .read()
            .get(&link_id)
            .cloned()
            .ok_or_else(|| BrokerError::InvalidRequest(format!("no connection for link {link_id}")))
    }

    /// Resolve the connection that serves an account.
    pub fn connection_for_account(
        &self,
        account_id: AccountId,
    ) -> BrokerResult<(Arc<BrokerConnection>, Account)> {
        let account = self.account(account_id)?;
        let connection = self.connection(account.link_id)?;
        Ok((connection, account))
    }

    /// Place an order through the connection serving an account.
    pub async fn place_for_account(
        &self,
        account_id: AccountId,
        command: &crate::OrderCommand,
    ) -> BrokerResult<crate::Placement> {
        let (connection, _) = self.connection_for_account(account_id)?;
        connection.place(command).await
    }

    /// Cancel a broker order through the connection serving an account.
    pub async fn cancel_for_account(
        &self,
        account_id: AccountId,
        broker_order_id: &str,
    ) -> BrokerResult<()> {
        let (connection, _) = self.connection_for_account(account_id)?;
        connection.cancel(broker_order_id).await
    }
}
