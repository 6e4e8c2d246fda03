//! Observer events and the subscription interface.
//!
//! An observer passively watches the UI's network traffic and reports two event
//! shapes. Handlers are invoked synchronously on the observer's thread and must
//! not block.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An operation reference in a submission acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckedOperation {
    pub op_name: String,
}

/// The service accepted a submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAck {
    #[serde(default)]
    pub operations: Vec<AckedOperation>,
}

impl SubmitAck {
    pub fn new<I, S>(op_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operations: op_names
                .into_iter()
                .map(|name| AckedOperation {
                    op_name: name.into(),
                })
                .collect(),
        }
    }

    pub fn op_names(&self) -> Vec<String> {
        self.operations.iter().map(|op| op.op_name.clone()).collect()
    }
}

/// Progress of one operation as reported by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationUpdate {
    pub op_name: String,
    /// Raw service status string, see [`crate::job::OperationState::from_service`].
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_url: Option<String>,
}

/// A batch of operation progress reports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollUpdate {
    #[serde(default)]
    pub operations: Vec<OperationUpdate>,
}

/// Any observer event, tagged for adapters that decode a single stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ObserverEvent {
    SubmitAck(SubmitAck),
    PollUpdate(PollUpdate),
}

/// Receives observer events.
pub trait ObserverHandler: Send + Sync {
    fn on_submit_ack(&self, ack: SubmitAck);

    fn on_poll_update(&self, update: PollUpdate);

    /// Route a tagged event to the matching handler.
    fn dispatch(&self, event: ObserverEvent) {
        match event {
            ObserverEvent::SubmitAck(ack) => self.on_submit_ack(ack),
            ObserverEvent::PollUpdate(update) => self.on_poll_update(update),
        }
    }
}

/// Source of observer events.
pub trait Observer: Send + Sync {
    /// Deliver all future events to `handler`, replacing any previous handler.
    fn register(&self, handler: Arc<dyn ObserverHandler>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_submit_ack() {
        let json = r#"{"operations":[{"opName":"models/veo/operations/abc"},{"opName":"models/veo/operations/def"}]}"#;
        let ack: SubmitAck = serde_json::from_str(json).unwrap();
        assert_eq!(
            ack.op_names(),
            vec!["models/veo/operations/abc", "models/veo/operations/def"]
        );
    }

    #[test]
    fn test_decode_poll_update_without_url() {
        let json = r#"{"operations":[{"opName":"op-1","state":"MEDIA_GENERATION_STATUS_ACTIVE"}]}"#;
        let update: PollUpdate = serde_json::from_str(json).unwrap();
        assert_eq!(update.operations.len(), 1);
        assert!(update.operations[0].artifact_url.is_none());
    }

    #[test]
    fn test_decode_tagged_event() {
        let json = r#"{"type":"pollUpdate","operations":[{"opName":"op-1","state":"SUCCESSFUL","artifactUrl":"https://storage.googleapis.com/a.mp4"}]}"#;
        let event: ObserverEvent = serde_json::from_str(json).unwrap();
        match event {
            ObserverEvent::PollUpdate(update) => {
                assert_eq!(
                    update.operations[0].artifact_url.as_deref(),
                    Some("https://storage.googleapis.com/a.mp4")
                );
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_missing_operations_defaults_empty() {
        let ack: SubmitAck = serde_json::from_str("{}").unwrap();
        assert!(ack.operations.is_empty());
    }
}
