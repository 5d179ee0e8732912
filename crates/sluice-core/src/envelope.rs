//! JSON message envelope shared by every stage: `{"action": ..., "payload": {...}}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProcessError;

/// Action tags understood by the pipeline stages.
pub mod actions {
    pub const INGEST: &str = "e_ingest";
    pub const EVENT_EXTRACTOR: &str = "e_event_extractor";
    pub const EVENT_RETRIEVER: &str = "e_event_retriever";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Envelope {
    pub fn new(action: &str, payload: Value) -> Self {
        Self {
            action: action.to_string(),
            payload,
        }
    }

    /// Parse an envelope. Anything that is not a JSON object with a string
    /// `action` is a processing failure.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProcessError> {
        let mut envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| ProcessError::InvalidEnvelope(e.to_string()))?;
        if envelope.payload.is_null() {
            envelope.payload = empty_object();
        }
        Ok(envelope)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a String and a Value cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize the payload into a typed request.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProcessError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            ProcessError::InvalidEnvelope(format!("bad payload for {}: {e}", self.action))
        })
    }
}

/// Outcome of routing an envelope through an [`ActionRouter`].
#[derive(Debug, PartialEq)]
pub enum Route<A> {
    Handle(A),
    Unsupported(String),
}

/// Action table for one stage.
#[derive(Debug, Clone)]
pub struct ActionRouter<A> {
    table: Vec<(&'static str, A)>,
}

impl<A: Copy> ActionRouter<A> {
    pub fn new() -> Self {
        Self { table: Vec::new() }
    }

    pub fn with(mut self, action: &'static str, handler: A) -> Self {
        self.table.push((action, handler));
        self
    }

    pub fn route(&self, envelope: &Envelope) -> Route<A> {
        self.table
            .iter()
            .find(|(name, _)| *name == envelope.action)
            .map(|(_, handler)| Route::Handle(*handler))
            .unwrap_or_else(|| Route::Unsupported(envelope.action.clone()))
    }

    pub fn actions(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.table.iter().map(|(name, _)| *name)
    }
}

impl<A: Copy> Default for ActionRouter<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_payload_defaults_to_empty_object() {
        let envelope = Envelope::parse(br#"{"action":"e_ingest"}"#).unwrap();
        assert_eq!(envelope.action, actions::INGEST);
        assert_eq!(envelope.payload, json!({}));

        let envelope = Envelope::parse(br#"{"action":"e_ingest","payload":null}"#).unwrap();
        assert_eq!(envelope.payload, json!({}));
    }

    #[test]
    fn malformed_envelopes_are_rejected() {
        assert!(matches!(
            Envelope::parse(b"not json"),
            Err(ProcessError::InvalidEnvelope(_))
        ));
        assert!(Envelope::parse(br#"{"payload":{}}"#).is_err());
        assert!(Envelope::parse(br#"{"action":7}"#).is_err());
    }

    #[test]
    fn router_dispatches_known_actions_only() {
        #[derive(Debug, Clone, Copy, PartialEq)]
        enum Handler {
            Extract,
            Retrieve,
        }
        let router = ActionRouter::new()
            .with(actions::EVENT_EXTRACTOR, Handler::Extract)
            .with(actions::EVENT_RETRIEVER, Handler::Retrieve);

        let env = Envelope::new(actions::EVENT_RETRIEVER, json!({}));
        assert_eq!(router.route(&env), Route::Handle(Handler::Retrieve));

        let env = Envelope::new("e_unknown", json!({}));
        assert_eq!(router.route(&env), Route::Unsupported("e_unknown".to_string()));
        assert_eq!(router.actions().count(), 2);
    }
}
