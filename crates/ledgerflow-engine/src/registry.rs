//! Flow type registry.

use std::sync::Arc;

use dashmap::DashMap;
use ledgerflow_core::CoreError;

use crate::logic::FlowLogic;

/// Flow logic implementations keyed by flow type.
///
/// Responder types that remote nodes may name in a session open must be
/// registered here before the open arrives, or the open is dropped.
#[derive(Default)]
pub struct FlowRegistry {
    entries: DashMap<String, Arc<dyn FlowLogic>>,
}

impl FlowRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        FlowRegistry {
            entries: DashMap::new(),
        }
    }

    /// Registers `logic` under its flow type. Re-registering a type
    /// replaces the previous logic.
    pub fn register(&self, logic: Arc<dyn FlowLogic>) {
        self.entries.insert(logic.flow_type().to_string(), logic);
    }

    /// Looks up the logic registered for a flow type.
    pub fn get(&self, flow_type: &str) -> Result<Arc<dyn FlowLogic>, CoreError> {
        self.entries
            .get(flow_type)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                CoreError::ConfigError(format!("no flow logic registered for {flow_type}"))
            })
    }

    /// True when a flow type is registered.
    pub fn contains(&self, flow_type: &str) -> bool {
        self.entries.contains_key(flow_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::context::FlowContext;
    use crate::logic::{FlowEvent, Transition};

    struct Noop;

    #[async_trait]
    impl FlowLogic for Noop {
        fn flow_type(&self) -> &str {
            "test/noop"
        }

        async fn start(&self, _ctx: &mut FlowContext) -> Result<Transition, CoreError> {
            Ok(Transition::Complete {
                result: Value::Null,
            })
        }

        async fn resume(
            &self,
            _state: Value,
            _event: FlowEvent,
            _ctx: &mut FlowContext,
        ) -> Result<Transition, CoreError> {
            Ok(Transition::Complete {
                result: Value::Null,
            })
        }
    }

    #[test]
    fn lookup_by_flow_type() {
        let registry = FlowRegistry::new();
        assert!(!registry.contains("test/noop"));

        registry.register(Arc::new(Noop));
        assert!(registry.contains("test/noop"));
        assert_eq!(registry.get("test/noop").unwrap().flow_type(), "test/noop");

        let missing = registry.get("test/other").unwrap_err();
        assert!(matches!(missing, CoreError::ConfigError(_)));
    }
}
