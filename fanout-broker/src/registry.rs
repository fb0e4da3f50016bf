//! Maps broker kind names (and their aliases) to adapter factories.
//!
//! The registry is assembled once at startup and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::{BrokerAdapter, BrokerError, BrokerResult};

/// Builds adapter instances for one broker kind.
pub trait AdapterFactory: Send + Sync {
    /// Canonical kind name.
    fn kind(&self) -> &'static str;

    /// Alternative spellings accepted by [`AdapterRegistry::adapter_for`].
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// Construct an adapter; `options` carries broker-specific knobs from
    /// configuration (endpoints, default exchange, ...).
    fn build(&self, options: &Value) -> Arc<dyn BrokerAdapter>;
}

/// Normalize a user-supplied broker name to its registry key.
#[must_use]
pub fn normalize_kind(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace([' ', '-'], "_")
}

/// Read-only map from broker kind to factory.
#[derive(Default)]
pub struct AdapterRegistry {
    by_key: HashMap<String, Arc<dyn AdapterFactory>>,
    kinds: Vec<String>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory under its kind name and all aliases.
    #[must_use]
    pub fn register(mut self, factory: Arc<dyn AdapterFactory>) -> Self {
        let kind = normalize_kind(factory.kind());
        self.kinds.push(kind.clone());
        self.by_key.insert(kind, Arc::clone(&factory));
        for alias in factory.aliases() {
            self.by_key
                .insert(normalize_kind(alias), Arc::clone(&factory));
        }
        self
    }

    /// Instantiate an adapter for a kind or alias.
    pub fn adapter_for(&self, name: &str, options: &Value) -> BrokerResult<Arc<dyn BrokerAdapter>> {
        let key = normalize_kind(name);
        let factory = self.by_key.get(&key).ok_or_else(|| {
            BrokerError::InvalidRequest(format!("broker '{name}' is not registered"))
        })?;
        Ok(factory.build(options))
    }

    /// Canonical kind names in registration order.
    #[must_use]
    pub fn supported(&self) -> &[String] {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BrokerResult, BrokerSession, MarginSnapshot, OrderCommand, Placement};
    use async_trait::async_trait;
    use fanout_core::Price;
    use fanout_vault::Secrets;
    use rust_decimal::Decimal;

    struct NullAdapter;

    #[async_trait]
    impl crate::BrokerAdapter for NullAdapter {
        fn kind(&self) -> &str {
            "null"
        }
        async fn connect(&self, _credentials: &Secrets) -> BrokerResult<BrokerSession> {
            Ok(BrokerSession::new("null"))
        }
        async fn place(
            &self,
            _session: &BrokerSession,
            _command: &OrderCommand,
        ) -> BrokerResult<Placement> {
            Err(crate::BrokerError::Unsupported("place"))
        }
        async fn cancel(&self, _session: &BrokerSession, _id: &str) -> BrokerResult<()> {
            Ok(())
        }
        async fn positions(
            &self,
            _session: &BrokerSession,
        ) -> BrokerResult<Vec<crate::BrokerPosition>> {
            Ok(Vec::new())
        }
        async fn margin(&self, _session: &BrokerSession) -> BrokerResult<MarginSnapshot> {
            Ok(MarginSnapshot {
                available: Decimal::ZERO,
                utilized: Decimal::ZERO,
                currency: "INR".into(),
            })
        }
        async fn last_price(&self, _session: &BrokerSession, _symbol: &str) -> BrokerResult<Price> {
            Ok(Decimal::ONE)
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct NullFactory;

    impl AdapterFactory for NullFactory {
        fn kind(&self) -> &'static str {
            "null_broker"
        }
        fn aliases(&self) -> &'static [&'static str] {
            &["null", "Null Broker"]
        }
        fn build(&self, _options: &serde_json::Value) -> std::sync::Arc<dyn crate::BrokerAdapter> {
            std::sync::Arc::new(NullAdapter)
        }
    }

    #[test]
    fn kinds_and_aliases_resolve_after_normalization() {
        let registry = AdapterRegistry::new().register(Arc::new(NullFactory));
        for name in ["null_broker", "NULL-BROKER", "null", "Null Broker"] {
            assert!(
                registry.adapter_for(name, &serde_json::Value::Null).is_ok(),
                "{name} should resolve"
            );
        }
        assert!(registry
            .adapter_for("unknown", &serde_json::Value::Null)
            .is_err());
    }

    #[test]
    fn supported_lists_canonical_kinds_only() {
        let registry = AdapterRegistry::new().register(Arc::new(NullFactory));
        assert_eq!(registry.supported(), ["null_broker"]);
    }
}
