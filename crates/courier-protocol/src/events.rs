use std::{collections::BTreeSet, sync::OnceLock};

use serde::{Deserialize, Serialize};

use crate::validate_event_type;

const EVENT_MANIFEST_JSON: &str = include_str!("events/gateway_events_manifest.json");

/// Who an event is addressed to once it leaves the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Connection,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDirection {
    Inbound,
    Outbound,
    Both,
}

impl EventDirection {
    #[must_use]
    pub const fn accepts_inbound(self) -> bool {
        matches!(self, Self::Inbound | Self::Both)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLifecycle {
    #[default]
    Active,
    Deprecated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventManifestEntry {
    pub event_type: String,
    pub schema_version: u16,
    pub scope: EventScope,
    pub direction: EventDirection,
    #[serde(default)]
    pub lifecycle: EventLifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventManifest {
    pub events: Vec<EventManifestEntry>,
}

impl EventManifest {
    #[must_use]
    pub fn entry(&self, event_type: &str) -> Option<&EventManifestEntry> {
        self.events
            .iter()
            .find(|entry| entry.event_type == event_type)
    }

    /// Whether clients may send `event_type` to the server.
    #[must_use]
    pub fn accepts_inbound(&self, event_type: &str) -> bool {
        self.entry(event_type).is_some_and(|entry| {
            entry.lifecycle == EventLifecycle::Active && entry.direction.accepts_inbound()
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventManifestError {
    #[error("invalid manifest json")]
    InvalidJson,
    #[error("event type `{0}` failed identifier validation")]
    InvalidEventType(String),
    #[error("duplicate event type `{0}` in manifest")]
    DuplicateEventType(String),
    #[error("event `{event_type}` has invalid schema version {schema_version}")]
    InvalidSchemaVersion {
        event_type: String,
        schema_version: u16,
    },
    #[error("event `{event_type}` is deprecated and must include a migration note")]
    MissingDeprecatedMigration { event_type: String },
    #[error("event `{event_type}` is active but includes migration note")]
    UnexpectedActiveMigration { event_type: String },
    #[error("connection-scoped event `{event_type}` cannot be sent by clients")]
    InboundConnectionEvent { event_type: String },
}

impl From<serde_json::Error> for EventManifestError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}

/// Parse and validate the machine-readable event manifest.
///
/// # Errors
/// Returns [`EventManifestError`] when JSON is invalid or when manifest
/// invariants fail (identifier format, duplicates, schema version, lifecycle
/// metadata, direction).
pub fn parse_event_manifest(json: &str) -> Result<EventManifest, EventManifestError> {
    let manifest: EventManifest = serde_json::from_str(json)?;
    validate_event_manifest(&manifest)?;
    Ok(manifest)
}

/// Return the embedded protocol event manifest.
///
/// # Panics
/// Panics if the embedded manifest file is invalid. This is a startup-time
/// invariant and should be prevented by tests.
#[must_use]
pub fn event_manifest() -> &'static EventManifest {
    static MANIFEST: OnceLock<EventManifest> = OnceLock::new();
    MANIFEST.get_or_init(|| {
        parse_event_manifest(EVENT_MANIFEST_JSON)
            .expect("event manifest must parse and validate")
    })
}

fn validate_event_manifest(manifest: &EventManifest) -> Result<(), EventManifestError> {
    let mut seen = BTreeSet::new();

    for entry in &manifest.events {
        validate_event_type(&entry.event_type)
            .map_err(|_| EventManifestError::InvalidEventType(entry.event_type.clone()))?;

        if entry.schema_version == 0 {
            return Err(EventManifestError::InvalidSchemaVersion {
                event_type: entry.event_type.clone(),
                schema_version: entry.schema_version,
            });
        }

        if !seen.insert(entry.event_type.clone()) {
            return Err(EventManifestError::DuplicateEventType(
                entry.event_type.clone(),
            ));
        }

        if entry.scope == EventScope::Connection && entry.direction.accepts_inbound() {
            return Err(EventManifestError::InboundConnectionEvent {
                event_type: entry.event_type.clone(),
            });
        }

        match entry.lifecycle {
            EventLifecycle::Active if entry.migration.is_some() => {
                return Err(EventManifestError::UnexpectedActiveMigration {
                    event_type: entry.event_type.clone(),
                });
            }
            EventLifecycle::Deprecated
                if entry
                    .migration
                    .as_ref()
                    .is_none_or(|value| value.trim().is_empty()) =>
            {
                return Err(EventManifestError::MissingDeprecatedMigration {
                    event_type: entry.event_type.clone(),
                });
            }
            EventLifecycle::Active | EventLifecycle::Deprecated => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{event_manifest, parse_event_manifest, EventManifestError, EventScope};
    use crate::{CHAT_MESSAGE_EVENT, ERROR_EVENT, MESSAGE_STATUS_EVENT, READY_EVENT};

    #[test]
    fn embedded_manifest_covers_every_gateway_event() {
        let manifest = event_manifest();
        for event_type in [
            CHAT_MESSAGE_EVENT,
            MESSAGE_STATUS_EVENT,
            ERROR_EVENT,
            READY_EVENT,
        ] {
            assert!(
                manifest.entry(event_type).is_some(),
                "{event_type} missing from manifest"
            );
        }
        assert_eq!(
            manifest.entry(CHAT_MESSAGE_EVENT).map(|entry| entry.scope),
            Some(EventScope::User)
        );
    }

    #[test]
    fn only_user_scoped_events_are_accepted_inbound() {
        let manifest = event_manifest();
        assert!(manifest.accepts_inbound(CHAT_MESSAGE_EVENT));
        assert!(manifest.accepts_inbound(MESSAGE_STATUS_EVENT));
        assert!(!manifest.accepts_inbound(ERROR_EVENT));
        assert!(!manifest.accepts_inbound(READY_EVENT));
        assert!(!manifest.accepts_inbound("typing"));
    }

    #[test]
    fn parse_rejects_deprecated_event_without_migration() {
        let error = parse_event_manifest(
            r#"{"events":[{"event_type":"chat_message","schema_version":1,"scope":"user","direction":"both","lifecycle":"deprecated"}]}"#,
        )
        .expect_err("deprecated event without migration must fail");

        assert_eq!(
            error,
            EventManifestError::MissingDeprecatedMigration {
                event_type: String::from("chat_message"),
            }
        );
    }

    #[test]
    fn parse_rejects_duplicate_event_types() {
        let error = parse_event_manifest(
            r#"{"events":[{"event_type":"chat_message","schema_version":1,"scope":"user","direction":"both"},{"event_type":"chat_message","schema_version":1,"scope":"user","direction":"both"}]}"#,
        )
        .expect_err("duplicate event types must fail");

        assert_eq!(
            error,
            EventManifestError::DuplicateEventType(String::from("chat_message"))
        );
    }

    #[test]
    fn parse_rejects_inbound_connection_events() {
        let error = parse_event_manifest(
            r#"{"events":[{"event_type":"ready","schema_version":1,"scope":"connection","direction":"inbound"}]}"#,
        )
        .expect_err("clients cannot send connection events");

        assert_eq!(
            error,
            EventManifestError::InboundConnectionEvent {
                event_type: String::from("ready"),
            }
        );
    }
}
