use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for everything published on the engine event bus and streamed to
/// SSE clients. The `type` string is the stable event family name
/// (`mission.updated`, `routine.fired`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub properties: Value,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    pub fn property_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(|v| v.as_str())
    }

    pub fn is_family(&self, prefix: &str) -> bool {
        self.event_type.starts_with(prefix)
    }
}
