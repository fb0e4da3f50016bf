//! Webhook ingress: token-authenticated external signals that trigger a
//! bound strategy exactly once per delivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use fanout_core::{ConnectorId, StrategyId, StrategyRunId, UserId};

use crate::StrategyTrigger;

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook token not recognised")]
    UnknownToken,
    #[error("webhook connector is disabled")]
    Disabled,
    #[error("duplicate delivery within the idempotency window")]
    Duplicate { existing: StrategyRunId },
    #[error("payload transform failed: {0}")]
    Transform(String),
    #[error("strategy trigger failed: {0}")]
    Trigger(String),
}

/// Compare two byte strings without leaking the mismatch position.
/// Inputs of different lengths are first collapsed through SHA-256.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let da = Sha256::digest(a);
    let db = Sha256::digest(b);
    let mut diff = 0u8;
    for (x, y) in da.iter().zip(db.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Declarative field mapping from the incoming payload onto strategy
/// parameter overrides. Paths use dot notation (`data.qty`).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TransformSpec {
    #[serde(default)]
    pub mappings: Vec<FieldMap>,
    /// Merged under the mapped fields; mapped fields win.
    #[serde(default)]
    pub defaults: Value,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FieldMap {
    pub from: String,
    pub to: String,
}

impl TransformSpec {
    /// Apply the mapping to a payload, producing parameter overrides.
    pub fn apply(&self, payload: &Value) -> Result<Value, String> {
        let mut target = match &self.defaults {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(format!("transform defaults must be an object, got {other}"));
            }
        };
        for mapping in &self.mappings {
            let value = lookup_path(payload, &mapping.from)
                .ok_or_else(|| format!("payload field '{}' missing", mapping.from))?;
            target.insert(mapping.to.clone(), value.clone());
        }
        Ok(Value::Object(target))
    }
}

fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// A registered inbound connector. The token is the authentication
/// material; comparisons are constant-time.
#[derive(Clone, Debug)]
pub struct WebhookConnector {
    pub id: ConnectorId,
    pub user_id: UserId,
    pub strategy_id: StrategyId,
    pub token: String,
    pub transform: TransformSpec,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of an accepted delivery.
#[derive(Clone, Debug)]
pub struct WebhookOutcome {
    pub connector_id: ConnectorId,
    pub strategy_run_id: StrategyRunId,
}

/// Ingress gateway: authenticates, dedupes, transforms, and triggers.
pub struct WebhookGateway {
    connectors: RwLock<Vec<WebhookConnector>>,
    seen: Mutex<HashMap<(ConnectorId, [u8; 32]), (StrategyRunId, DateTime<Utc>)>>,
    window: Duration,
    trigger: Arc<dyn StrategyTrigger>,
}

impl WebhookGateway {
    /// `window` is the idempotency window for duplicate deliveries.
    pub fn new(trigger: Arc<dyn StrategyTrigger>, window: Duration) -> Self {
        Self {
            connectors: RwLock::new(Vec::new()),
            seen: Mutex::new(HashMap::new()),
            window,
            trigger,
        }
    }

    pub fn register(
        &self,
        user_id: UserId,
        strategy_id: StrategyId,
        token: &str,
        transform: TransformSpec,
    ) -> WebhookConnector {
        let connector = WebhookConnector {
            id: Uuid::new_v4(),
            user_id,
            strategy_id,
            token: token.to_string(),
            transform,
            enabled: true,
            created_at: Utc::now(),
        };
        self.connectors.write().push(connector.clone());
        connector
    }

    pub fn set_enabled(&self, connector_id: ConnectorId, enabled: bool) {
        let mut connectors = self.connectors.write();
        if let Some(connector) = connectors.iter_mut().find(|c| c.id == connector_id) {
            connector.enabled = enabled;
        }
    }

    #[must_use]
    pub fn connectors_for(&self, user_id: UserId) -> Vec<WebhookConnector> {
        self.connectors
            .read()
            .iter()
            .filter(|connector| connector.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Handle one delivery. Returns the created strategy run, or
    /// [`WebhookError::Duplicate`] carrying the run created by the first
    /// delivery of the same payload.
    pub async fn deliver(&self, token: &str, payload: &Value) -> Result<WebhookOutcome, WebhookError> {
        let connector = {
            let connectors = self.connectors.read();
            // Scan every connector so the comparison count does not depend
            // on where (or whether) the token matches.
            let mut matched: Option<WebhookConnector> = None;
            for connector in connectors.iter() {
                if constant_time_eq(connector.token.as_bytes(), token.as_bytes()) {
                    matched = Some(connector.clone());
                }
            }
            matched.ok_or(WebhookError::UnknownToken)?
        };
        if !connector.enabled {
            return Err(WebhookError::Disabled);
        }

        let hash = payload_hash(payload);
        let now = Utc::now();
        {
            let mut seen = self.seen.lock();
            let window = chrono::Duration::from_std(self.window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            seen.retain(|_, (_, at)| now - *at <= window);
            if let Some((existing, _)) = seen.get(&(connector.id, hash)) {
                return Err(WebhookError::Duplicate { existing: *existing });
            }
        }

        let overrides = connector
            .transform
            .apply(payload)
            .map_err(WebhookError::Transform)?;
        let run_id = self
            .trigger
            .trigger(connector.user_id, connector.strategy_id, overrides)
            .await
            .map_err(WebhookError::Trigger)?;

        self.seen
            .lock()
            .insert((connector.id, hash), (run_id, now));
        info!(connector_id = %connector.id, strategy_run_id = %run_id, "webhook delivery accepted");
        Ok(WebhookOutcome {
            connector_id: connector.id,
            strategy_run_id: run_id,
        })
    }
}

fn payload_hash(payload: &Value) -> [u8; 32] {
    let canonical = payload.to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct CountingTrigger {
        runs: Mutex<Vec<(StrategyId, Value)>>,
    }

    impl CountingTrigger {
        fn new() -> Self {
            Self {
                runs: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StrategyTrigger for CountingTrigger {
        async fn trigger(
            &self,
            _user_id: UserId,
            strategy_id: StrategyId,
            context: Value,
        ) -> Result<StrategyRunId, String> {
            self.runs.lock().push((strategy_id, context));
            Ok(Uuid::new_v4())
        }
    }

    fn gateway() -> (WebhookGateway, Arc<CountingTrigger>) {
        let trigger = Arc::new(CountingTrigger::new());
        (
            WebhookGateway::new(trigger.clone(), Duration::from_secs(60)),
            trigger,
        )
    }

    #[test]
    fn constant_time_eq_handles_unequal_lengths() {
        assert!(constant_time_eq(b"token", b"token"));
        assert!(!constant_time_eq(b"token", b"token2"));
        assert!(!constant_time_eq(b"", b"x"));
    }

    #[test]
    fn transform_maps_and_defaults() {
        let spec = TransformSpec {
            mappings: vec![
                FieldMap {
                    from: "signal.qty".into(),
                    to: "lots".into(),
                },
                FieldMap {
                    from: "ticker".into(),
                    to: "symbol".into(),
                },
            ],
            defaults: json!({ "side": "BUY", "lots": 1 }),
        };
        let payload = json!({ "ticker": "NIFTY", "signal": { "qty": 5 } });
        let out = spec.apply(&payload).unwrap();
        assert_eq!(out["lots"], 5, "mapped field wins over default");
        assert_eq!(out["symbol"], "NIFTY");
        assert_eq!(out["side"], "BUY");
    }

    #[test]
    fn transform_reports_missing_fields() {
        let spec = TransformSpec {
            mappings: vec![FieldMap {
                from: "nope".into(),
                to: "lots".into(),
            }],
            defaults: Value::Null,
        };
        assert!(spec.apply(&json!({})).is_err());
    }

    #[tokio::test]
    async fn duplicate_delivery_inside_window_returns_first_run() {
        let (gateway, trigger) = gateway();
        gateway.register(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tok-secret",
            TransformSpec::default(),
        );
        let payload = json!({ "signal": "long" });

        let first = gateway.deliver("tok-secret", &payload).await.unwrap();
        let err = gateway.deliver("tok-secret", &payload).await.unwrap_err();

        match err {
            WebhookError::Duplicate { existing } => {
                assert_eq!(existing, first.strategy_run_id);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(trigger.runs.lock().len(), 1, "exactly one strategy run");
    }

    #[tokio::test]
    async fn different_payloads_are_not_deduped() {
        let (gateway, trigger) = gateway();
        gateway.register(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tok-secret",
            TransformSpec::default(),
        );
        gateway
            .deliver("tok-secret", &json!({ "n": 1 }))
            .await
            .unwrap();
        gateway
            .deliver("tok-secret", &json!({ "n": 2 }))
            .await
            .unwrap();
        assert_eq!(trigger.runs.lock().len(), 2);
    }

    #[tokio::test]
    async fn bad_token_and_disabled_connector_are_rejected() {
        let (gateway, _) = gateway();
        let connector = gateway.register(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "tok-secret",
            TransformSpec::default(),
        );

        assert!(matches!(
            gateway.deliver("wrong", &json!({})).await,
            Err(WebhookError::UnknownToken)
        ));

        gateway.set_enabled(connector.id, false);
        assert!(matches!(
            gateway.deliver("tok-secret", &json!({})).await,
            Err(WebhookError::Disabled)
        ));
    }
}
