//! Typed audit trail for risk actions.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use fanout_core::UserId;

/// One audited risk decision with the rule name and a counter snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub user_id: UserId,
    pub rule: String,
    pub message: String,
    pub snapshot: Value,
    pub at: DateTime<Utc>,
}

/// Append-only in-memory audit log.
#[derive(Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, user_id: UserId, rule: &str, message: impl Into<String>, snapshot: Value) {
        let entry = AuditEntry {
            id: Uuid::new_v4(),
            user_id,
            rule: rule.to_string(),
            message: message.into(),
            snapshot,
            at: Utc::now(),
        };
        tracing::info!(user_id = %user_id, rule = %rule, message = %entry.message, "rms audit");
        self.entries.write().push(entry);
    }

    #[must_use]
    pub fn for_user(&self, user_id: UserId) -> Vec<AuditEntry> {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
