//! Filesystem change events.
//!
//! The catalog publishes one broker message per namespace mutation. The
//! routing key names the kind of change and the body is a flat JSON object.
//! [`EventFilter`] decides which messages matter and turns them into
//! [`ChangeEvent`]s; an [`EventHandler`] consumes them.

use crate::error::{PurgemanError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, warn};

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ObjectAdded,
    ObjectModified,
    ObjectMoved,
    ObjectRemoved,
    CollectionAdded,
    CollectionMoved,
    CollectionRemoved,
}

impl EventKind {
    /// Every kind the filter recognizes.
    pub const ALL: [EventKind; 7] = [
        EventKind::ObjectAdded,
        EventKind::ObjectModified,
        EventKind::ObjectMoved,
        EventKind::ObjectRemoved,
        EventKind::CollectionAdded,
        EventKind::CollectionMoved,
        EventKind::CollectionRemoved,
    ];

    /// Map a broker routing key to an event kind.
    pub fn from_routing_key(key: &str) -> Option<Self> {
        match key {
            "data-object.add" => Some(EventKind::ObjectAdded),
            "data-object.mod" => Some(EventKind::ObjectModified),
            "data-object.mv" => Some(EventKind::ObjectMoved),
            "data-object.rm" => Some(EventKind::ObjectRemoved),
            "collection.add" => Some(EventKind::CollectionAdded),
            "collection.mv" => Some(EventKind::CollectionMoved),
            "collection.rm" => Some(EventKind::CollectionRemoved),
            _ => None,
        }
    }

    /// The routing key this kind is published under.
    pub fn routing_key(&self) -> &'static str {
        match self {
            EventKind::ObjectAdded => "data-object.add",
            EventKind::ObjectModified => "data-object.mod",
            EventKind::ObjectMoved => "data-object.mv",
            EventKind::ObjectRemoved => "data-object.rm",
            EventKind::CollectionAdded => "collection.add",
            EventKind::CollectionMoved => "collection.mv",
            EventKind::CollectionRemoved => "collection.rm",
        }
    }

    /// Whether a message of this kind carries a source and a destination path.
    pub fn is_move(&self) -> bool {
        matches!(self, EventKind::ObjectMoved | EventKind::CollectionMoved)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routing_key())
    }
}

/// A parsed filesystem change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Kind of change.
    pub kind: EventKind,
    /// Affected catalog path. `None` for modifications, which only carry the entity.
    pub path: Option<String>,
    /// Entity UUID.
    pub entity_id: Option<String>,
}

impl ChangeEvent {
    /// Creates an event for a known path.
    pub fn with_path(kind: EventKind, path: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            path: Some(path.into()),
            entity_id: Some(entity_id.into()),
        }
    }

    /// Creates an event that only identifies its entity.
    pub fn with_entity(kind: EventKind, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            path: None,
            entity_id: Some(entity_id.into()),
        }
    }

    /// Path, or an empty string when the event has none.
    pub fn path_str(&self) -> &str {
        self.path.as_deref().unwrap_or("")
    }

    /// Entity UUID, or an empty string.
    pub fn entity_str(&self) -> &str {
        self.entity_id.as_deref().unwrap_or("")
    }
}

/// Downstream consumer of change events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event. Failures are the handler's own business.
    async fn handle(&self, event: ChangeEvent);
}

/// Classifies and decodes raw broker messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFilter;

impl EventFilter {
    /// Creates a new filter.
    pub fn new() -> Self {
        Self
    }

    /// Returns the event kind if the routing key is a filesystem change.
    pub fn accept(&self, routing_key: &str) -> Option<EventKind> {
        EventKind::from_routing_key(routing_key)
    }

    /// Decode an accepted message.
    ///
    /// Returns no events for rejected routing keys. Malformed bodies are
    /// logged and dropped as a whole: a move never yields only one of its paths.
    pub fn filter(&self, routing_key: &str, body: &[u8]) -> Vec<ChangeEvent> {
        let Some(kind) = self.accept(routing_key) else {
            return Vec::new();
        };

        // The broker occasionally mangles bodies with stray carriage returns.
        if body.contains(&b'\r') {
            metrics::counter!("purgeman_events_dropped_total", "reason" => "carriage_return")
                .increment(1);
            warn!(
                routing_key = %routing_key,
                body = %String::from_utf8_lossy(body),
                "Body with carriage return in it"
            );
            return Vec::new();
        }

        match self.decode(kind, body) {
            Ok(events) => events,
            Err(e) => {
                metrics::counter!("purgeman_events_dropped_total", "reason" => "parse")
                    .increment(1);
                error!(
                    routing_key = %routing_key,
                    body = %String::from_utf8_lossy(body),
                    error = %e,
                    "Failed to parse message body"
                );
                Vec::new()
            }
        }
    }

    /// Decode a message body for a known kind.
    pub fn decode(&self, kind: EventKind, body: &[u8]) -> Result<Vec<ChangeEvent>> {
        if body.contains(&b'\r') {
            return Err(PurgemanError::Parse(
                "message body contains a carriage return".to_string(),
            ));
        }

        let value: Value = serde_json::from_slice(body)?;
        let fields = value
            .as_object()
            .ok_or_else(|| PurgemanError::Parse("message body is not an object".to_string()))?;

        let entity = string_field(fields, "entity")?;

        let events = match kind {
            EventKind::ObjectModified => vec![ChangeEvent::with_entity(kind, entity)],
            EventKind::ObjectMoved | EventKind::CollectionMoved => {
                let old_path = string_field(fields, "old-path")?;
                let new_path = string_field(fields, "new-path")?;
                vec![
                    ChangeEvent::with_path(kind, old_path, entity.clone()),
                    ChangeEvent::with_path(kind, new_path, entity),
                ]
            }
            EventKind::ObjectAdded
            | EventKind::ObjectRemoved
            | EventKind::CollectionAdded
            | EventKind::CollectionRemoved => {
                vec![ChangeEvent::with_path(kind, string_field(fields, "path")?, entity)]
            }
        };

        Ok(events)
    }
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Result<String> {
    match fields.get(name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(PurgemanError::Parse(format!(
            "field '{}' is not a string: {}",
            name, other
        ))),
        None => Err(PurgemanError::Parse(format!("missing field '{}'", name))),
    }
}
