//! UI actuator abstraction.
//!
//! The actuator drives the remote generation UI: typing and submitting texts and
//! scrolling the virtualized result list. It is exclusive; only one component
//! drives it at a time.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by an actuator.
#[derive(Debug, Clone, Error)]
pub enum ActuatorError {
    /// Target element not present or not interactable yet.
    #[error("Element not ready: {0}")]
    NotReady(String),

    /// Element reference went stale between lookup and use.
    #[error("Stale element: {0}")]
    StaleElement(String),

    /// Another element received the click.
    #[error("Click intercepted: {0}")]
    Intercepted(String),

    /// The UI session could not be established or was lost.
    #[error("Session error: {0}")]
    Session(String),

    #[error("Actuator error: {0}")]
    Other(String),
}

impl ActuatorError {
    /// Whether retrying the same action may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ActuatorError::NotReady(_) | ActuatorError::StaleElement(_) | ActuatorError::Intercepted(_)
        )
    }
}

/// One rendered row of the result list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleItem {
    /// Stable index the UI assigns to the row; survives re-rendering.
    pub item_index: u64,
    /// Text rendered in the row, possibly truncated.
    pub text_fragment: String,
    /// Every media URL referenced by the row, in display order.
    pub artifact_urls: Vec<String>,
}

/// Driver for the remote generation UI.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Returns the name of this actuator implementation.
    fn name(&self) -> &str;

    /// Establish the UI session. Failure here is fatal for a run.
    async fn open_session(&self) -> Result<(), ActuatorError>;

    /// Enter `text` and submit it.
    async fn submit(&self, text: &str) -> Result<(), ActuatorError>;

    /// Jump to the end of the result list, returning the scroll position.
    async fn scroll_to_end(&self) -> Result<f64, ActuatorError>;

    /// Current scroll position.
    async fn scroll_position(&self) -> Result<f64, ActuatorError>;

    /// Scroll by `delta` (negative moves toward the start), returning the new position.
    async fn scroll_step(&self, delta: f64) -> Result<f64, ActuatorError>;

    /// Rows currently rendered by the virtualized list, in display order.
    async fn list_visible_items(&self) -> Result<Vec<VisibleItem>, ActuatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ActuatorError::NotReady("prompt box".into()).is_transient());
        assert!(ActuatorError::StaleElement("button".into()).is_transient());
        assert!(ActuatorError::Intercepted("overlay".into()).is_transient());
        assert!(!ActuatorError::Session("closed".into()).is_transient());
        assert!(!ActuatorError::Other("quota".into()).is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = ActuatorError::Intercepted("cookie banner".into());
        assert_eq!(err.to_string(), "Click intercepted: cookie banner");
    }
}
