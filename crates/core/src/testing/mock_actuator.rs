//! Mock actuator for testing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::actuator::{Actuator, ActuatorError, VisibleItem};
use crate::observer::SubmitAck;

use super::MockObserver;

/// Virtual pixel height of one result row.
const ITEM_HEIGHT: f64 = 100.0;

/// A recorded successful submission for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedSubmit {
    /// The submitted text.
    pub text: String,
    /// Operation names acknowledged for it (empty without a linked observer).
    pub op_names: Vec<String>,
    /// When the submission happened.
    pub timestamp: chrono::DateTime<Utc>,
}

/// Mock implementation of the Actuator trait.
///
/// Provides controllable behavior for testing:
/// - Record submitted texts
/// - Script transient or fatal failures
/// - Serve a virtualized result list through a fixed-size window
/// - Acknowledge submissions through a linked [`MockObserver`]
///
/// # Example
///
/// ```rust,ignore
/// let observer = Arc::new(MockObserver::new());
/// let actuator = MockActuator::new().with_observer(observer.clone()).with_window(3);
///
/// actuator.fail_next_submits(vec![ActuatorError::NotReady("prompt".into())]).await;
/// actuator.set_items(vec![fixtures::visible_item(0, "text", &["https://..."])]).await;
/// ```
pub struct MockActuator {
    /// Recorded successful submissions.
    submitted: Arc<RwLock<Vec<RecordedSubmit>>>,
    /// Total submit calls including failed ones.
    submit_calls: Arc<AtomicUsize>,
    /// Errors returned by the next submit calls, in order.
    submit_errors: Arc<RwLock<VecDeque<ActuatorError>>>,
    /// If set, open_session fails with this error.
    session_error: Arc<RwLock<Option<ActuatorError>>>,
    /// If set, the next scroll_to_end fails with this error.
    scroll_error: Arc<RwLock<Option<ActuatorError>>>,
    /// Every item of the result list, oldest first.
    items: Arc<RwLock<Vec<VisibleItem>>>,
    /// Index of the first rendered item.
    top: Arc<RwLock<usize>>,
    /// Number of items rendered at once.
    window: usize,
    /// Operations acknowledged per submission.
    ops_per_submit: usize,
    observer: Option<Arc<MockObserver>>,
}

impl Default for MockActuator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockActuator {
    /// Create a new mock actuator.
    pub fn new() -> Self {
        Self {
            submitted: Arc::new(RwLock::new(Vec::new())),
            submit_calls: Arc::new(AtomicUsize::new(0)),
            submit_errors: Arc::new(RwLock::new(VecDeque::new())),
            session_error: Arc::new(RwLock::new(None)),
            scroll_error: Arc::new(RwLock::new(None)),
            items: Arc::new(RwLock::new(Vec::new())),
            top: Arc::new(RwLock::new(0)),
            window: 4,
            ops_per_submit: 1,
            observer: None,
        }
    }

    /// Render `window` items at a time.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Acknowledge every successful submission through `observer`.
    pub fn with_observer(mut self, observer: Arc<MockObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Acknowledge `count` operations per submission.
    pub fn with_ops_per_submit(mut self, count: usize) -> Self {
        self.ops_per_submit = count.max(1);
        self
    }

    /// Get all recorded successful submissions.
    pub async fn submissions(&self) -> Vec<RecordedSubmit> {
        self.submitted.read().await.clone()
    }

    /// Texts submitted successfully, in order.
    pub async fn submitted_texts(&self) -> Vec<String> {
        self.submitted
            .read()
            .await
            .iter()
            .map(|s| s.text.clone())
            .collect()
    }

    /// Operation names acknowledged for `text`.
    pub async fn op_names_for(&self, text: &str) -> Vec<String> {
        self.submitted
            .read()
            .await
            .iter()
            .find(|s| s.text == text)
            .map(|s| s.op_names.clone())
            .unwrap_or_default()
    }

    /// Number of submit calls, failed ones included.
    pub async fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Fail the next submit calls with these errors, in order.
    pub async fn fail_next_submits(&self, errors: Vec<ActuatorError>) {
        self.submit_errors.write().await.extend(errors);
    }

    /// Make open_session fail.
    pub async fn fail_session(&self, error: ActuatorError) {
        *self.session_error.write().await = Some(error);
    }

    /// Make the next scroll_to_end fail.
    pub async fn fail_scroll(&self, error: ActuatorError) {
        *self.scroll_error.write().await = Some(error);
    }

    /// Replace the result list.
    pub async fn set_items(&self, items: Vec<VisibleItem>) {
        *self.items.write().await = items;
        *self.top.write().await = 0;
    }

    async fn max_top(&self) -> usize {
        self.items.read().await.len().saturating_sub(self.window)
    }
}

#[async_trait]
impl Actuator for MockActuator {
    fn name(&self) -> &str {
        "mock"
    }

    async fn open_session(&self) -> Result<(), ActuatorError> {
        match self.session_error.read().await.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn submit(&self, text: &str) -> Result<(), ActuatorError> {
        let call = self.submit_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(error) = self.submit_errors.write().await.pop_front() {
            return Err(error);
        }

        let op_names: Vec<String> = match &self.observer {
            Some(_) => (1..=self.ops_per_submit)
                .map(|k| format!("op-{}-{}", call, k))
                .collect(),
            None => Vec::new(),
        };

        self.submitted.write().await.push(RecordedSubmit {
            text: text.to_string(),
            op_names: op_names.clone(),
            timestamp: Utc::now(),
        });

        if let Some(observer) = &self.observer {
            observer.emit_ack(SubmitAck::new(op_names));
        }
        Ok(())
    }

    async fn scroll_to_end(&self) -> Result<f64, ActuatorError> {
        if let Some(error) = self.scroll_error.write().await.take() {
            return Err(error);
        }
        let top = self.max_top().await;
        *self.top.write().await = top;
        Ok(top as f64 * ITEM_HEIGHT)
    }

    async fn scroll_position(&self) -> Result<f64, ActuatorError> {
        Ok(*self.top.read().await as f64 * ITEM_HEIGHT)
    }

    async fn scroll_step(&self, delta: f64) -> Result<f64, ActuatorError> {
        let max_top = self.max_top().await;
        let mut top = self.top.write().await;
        let current = *top;
        // One window per step in the direction of `delta`
        let next = if delta < 0.0 {
            current.saturating_sub(self.window)
        } else {
            (current + self.window).min(max_top)
        };
        *top = next;
        Ok(next as f64 * ITEM_HEIGHT)
    }

    async fn list_visible_items(&self) -> Result<Vec<VisibleItem>, ActuatorError> {
        let items = self.items.read().await;
        let top = *self.top.read().await;
        let end = (top + self.window).min(items.len());
        Ok(items.get(top..end).map(<[VisibleItem]>::to_vec).unwrap_or_default())
    }
}
