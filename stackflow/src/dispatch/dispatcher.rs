//! Turns ingest notifications into workflow executions.

use super::dedup::DedupWindow;
use super::event::IngestEvent;
use crate::errors::StackflowError;
use crate::events::{names, EventSink, NoOpEventSink};
use crate::utils::execution_id;
use crate::workflow::{WorkflowDefinition, WorkflowEngine};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Only notifications for this bucket are accepted.
    #[serde(default)]
    pub ingest_bucket: String,
    /// Accepted keys must start with this prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    /// Accepted keys must end with this suffix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_suffix: Option<String>,
    /// How long an event id is remembered.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
    /// Upper bound on remembered event ids.
    #[serde(default = "default_dedup_max_entries")]
    pub dedup_max_entries: usize,
}

fn default_dedup_ttl_secs() -> u64 {
    3600
}

fn default_dedup_max_entries() -> usize {
    10_000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            ingest_bucket: String::new(),
            key_prefix: None,
            key_suffix: None,
            dedup_ttl_secs: default_dedup_ttl_secs(),
            dedup_max_entries: default_dedup_max_entries(),
        }
    }
}

impl DispatcherConfig {
    /// Creates a config for `ingest_bucket`.
    #[must_use]
    pub fn new(ingest_bucket: impl Into<String>) -> Self {
        Self {
            ingest_bucket: ingest_bucket.into(),
            ..Self::default()
        }
    }

    /// Restricts accepted keys to a prefix.
    #[must_use]
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Restricts accepted keys to a suffix.
    #[must_use]
    pub fn with_key_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.key_suffix = Some(suffix.into());
        self
    }

    /// Sets the dedup window.
    #[must_use]
    pub fn with_dedup(mut self, ttl: Duration, max_entries: usize) -> Self {
        self.dedup_ttl_secs = ttl.as_secs();
        self.dedup_max_entries = max_entries;
        self
    }
}

/// Result of dispatching one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatched {
    /// The execution started for the event, or the one a duplicate maps to.
    pub execution_id: String,
    /// The event was already seen; nothing was started.
    pub duplicate: bool,
}

/// Validates ingest events and starts one execution per new event.
pub struct EventDispatcher {
    config: DispatcherConfig,
    dedup: DedupWindow,
    engine: Arc<WorkflowEngine>,
    definition: Arc<WorkflowDefinition>,
    event_sink: Arc<dyn EventSink>,
}

impl EventDispatcher {
    /// Creates a dispatcher that starts `definition` on `engine`.
    #[must_use]
    pub fn new(config: DispatcherConfig, engine: Arc<WorkflowEngine>, definition: Arc<WorkflowDefinition>) -> Self {
        let dedup = DedupWindow::new(Duration::from_secs(config.dedup_ttl_secs), config.dedup_max_entries);
        Self {
            config,
            dedup,
            engine,
            definition,
            event_sink: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// The dispatcher's configuration.
    #[must_use]
    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Handles one object-created event.
    ///
    /// Returns as soon as the execution is registered; the engine drives it
    /// on its own task.
    ///
    /// # Errors
    ///
    /// Returns [`StackflowError::InvalidEvent`] for events outside the
    /// ingest bucket or key filters, or with an empty key or event id.
    pub async fn on_object_created(&self, event: IngestEvent) -> Result<Dispatched, StackflowError> {
        self.validate(&event)?;

        let execution_id = execution_id();
        if let Some(existing) = self.dedup.claim(&event.event_id, &execution_id) {
            tracing::info!(event_id = %event.event_id, execution = %existing, "Dropping duplicate event");
            self.event_sink
                .emit(
                    names::DISPATCH_DUPLICATE,
                    Some(serde_json::json!({ "eventId": event.event_id, "execution": existing })),
                )
                .await;
            return Ok(Dispatched {
                execution_id: existing,
                duplicate: true,
            });
        }

        let started = self
            .engine
            .start_with_id(execution_id, self.definition.clone(), event.execution_input());
        let execution_id = match started {
            Ok(id) => id,
            Err(e) => {
                self.dedup.forget(&event.event_id);
                return Err(e);
            }
        };

        tracing::info!(
            bucket = %event.bucket,
            key = %event.key,
            event_id = %event.event_id,
            execution = %execution_id,
            "Started workflow execution"
        );
        self.event_sink
            .emit(
                names::DISPATCH_STARTED,
                Some(serde_json::json!({
                    "eventId": event.event_id,
                    "execution": execution_id,
                    "key": event.key,
                })),
            )
            .await;

        Ok(Dispatched {
            execution_id,
            duplicate: false,
        })
    }

    /// Dispatches every record of an object-store notification.
    ///
    /// # Errors
    ///
    /// Returns an error only if the notification itself is malformed; each
    /// record's own outcome is in the returned list.
    pub async fn dispatch_notification(
        &self,
        notification: &serde_json::Value,
    ) -> Result<Vec<Result<Dispatched, StackflowError>>, StackflowError> {
        let events = IngestEvent::from_notification(notification)?;
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let outcome = self.on_object_created(event).await;
            if let Err(e) = &outcome {
                tracing::warn!(error = %e, "Rejected notification record");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    fn validate(&self, event: &IngestEvent) -> Result<(), StackflowError> {
        if event.bucket != self.config.ingest_bucket {
            return Err(StackflowError::InvalidEvent(format!(
                "bucket '{}' is not the ingest bucket '{}'",
                event.bucket, self.config.ingest_bucket
            )));
        }
        if event.key.trim().is_empty() {
            return Err(StackflowError::InvalidEvent("object key is empty".to_string()));
        }
        if event.event_id.trim().is_empty() {
            return Err(StackflowError::InvalidEvent("event id is empty".to_string()));
        }
        if let Some(prefix) = &self.config.key_prefix {
            if !event.key.starts_with(prefix.as_str()) {
                return Err(StackflowError::InvalidEvent(format!(
                    "key '{}' does not start with '{prefix}'",
                    event.key
                )));
            }
        }
        if let Some(suffix) = &self.config.key_suffix {
            if !event.key.ends_with(suffix.as_str()) {
                return Err(StackflowError::InvalidEvent(format!(
                    "key '{}' does not end with '{suffix}'",
                    event.key
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("config", &self.config)
            .field("workflow", &self.definition.name())
            .field("remembered", &self.dedup.len())
            .finish_non_exhaustive()
    }
}
