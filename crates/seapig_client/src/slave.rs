//! Consumed objects.
//!
//! A slave is a local read-only replica of a coordinator-owned document. It
//! advances only through `object-update` messages and refuses any incremental
//! update that does not build on the version it holds.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventFeed, ObjectEvent, ObjectEventKind};
use parking_lot::Mutex;
use seapig_protocol::{ObjectBody, ObjectUpdate, SlaveVersion};
use serde_json::{Map, Value};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Instant;

/// Options for subscribing to an object.
///
/// `object` and `version` seed a replica with content the caller already
/// holds, so they must be given together.
#[derive(Debug, Clone, Default)]
pub struct SlaveOptions {
    /// Known content.
    pub object: Option<Value>,
    /// Version of the known content.
    pub version: Option<SlaveVersion>,
}

impl SlaveOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the replica with known content at a known version.
    pub fn seeded(object: Value, version: SlaveVersion) -> Self {
        Self {
            object: Some(object),
            version: Some(version),
        }
    }

    /// Sets the known content.
    pub fn with_object(mut self, object: Value) -> Self {
        self.object = Some(object);
        self
    }

    /// Sets the known version.
    pub fn with_version(mut self, version: SlaveVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub(crate) fn validate(&self, pattern: &str) -> SyncResult<()> {
        if self.object.is_some() != self.version.is_some() {
            return Err(SyncError::invalid_subscription(
                pattern,
                "both or none of 'object' and 'version' are needed",
            ));
        }
        Ok(())
    }
}

/// Replica state.
#[derive(Debug)]
struct SlaveObject {
    id: String,
    version: SlaveVersion,
    content: Value,
    initialized: bool,
    valid: bool,
    destroyed: bool,
    received_at: Option<Instant>,
}

impl SlaveObject {
    fn new(id: String, options: SlaveOptions) -> Self {
        let initialized = options.object.is_some();
        Self {
            id,
            version: options.version.unwrap_or(0),
            content: options.object.map(normalize).unwrap_or_else(empty),
            initialized,
            valid: false,
            destroyed: false,
            received_at: None,
        }
    }

    /// Applies an update. Returns whether the serialized content changed.
    fn patch(&mut self, update: &ObjectUpdate) -> SyncResult<bool> {
        let before = serde_json::to_string(&self.content)?;

        let mut next = if update.is_replacement() {
            empty()
        } else if update.version_old == Some(self.version) {
            self.content.clone()
        } else {
            return Err(SyncError::ProtocolViolation {
                id: self.id.clone(),
                local: self.version,
                declared: update.version_old.unwrap_or_default(),
            });
        };

        match &update.body {
            ObjectBody::Value(value) => next = normalize(value.clone()),
            ObjectBody::Patch(patch) => {
                json_patch::patch(&mut next, &patch.0).map_err(|e| SyncError::PatchFailed {
                    id: self.id.clone(),
                    message: e.to_string(),
                })?;
            }
        }

        self.content = next;
        self.version = update.version_new;
        self.initialized = true;
        self.valid = true;
        self.received_at = Some(Instant::now());

        Ok(before != serde_json::to_string(&self.content)?)
    }
}

fn empty() -> Value {
    Value::Object(Map::new())
}

/// A stalled producer publishes `null` or `false`; replicas hold an empty document.
fn normalize(value: Value) -> Value {
    match value {
        Value::Null | Value::Bool(false) => empty(),
        other => other,
    }
}

/// Shared handle to a consumed object.
#[derive(Clone)]
pub struct SlaveHandle {
    state: Arc<Mutex<SlaveObject>>,
    events: Arc<EventFeed<ObjectEvent>>,
}

impl SlaveHandle {
    pub(crate) fn new(
        id: impl Into<String>,
        options: SlaveOptions,
        events: Arc<EventFeed<ObjectEvent>>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SlaveObject::new(id.into(), options))),
            events,
        }
    }

    /// Concrete object id.
    pub fn id(&self) -> String {
        self.state.lock().id.clone()
    }

    /// Version of the held content.
    pub fn version(&self) -> SlaveVersion {
        self.state.lock().version
    }

    /// Copy of the current content.
    pub fn content(&self) -> Value {
        self.state.lock().content.clone()
    }

    /// Runs `f` against the current content without copying it.
    pub fn with_content<R>(&self, f: impl FnOnce(&Value) -> R) -> R {
        f(&self.state.lock().content)
    }

    /// Looks up a value by JSON pointer (`/a/b/0`).
    pub fn get(&self, pointer: &str) -> Option<Value> {
        self.state.lock().content.pointer(pointer).cloned()
    }

    /// True once any value has populated the content.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// True while the content is trustworthy given the connection state.
    pub fn is_valid(&self) -> bool {
        self.state.lock().valid
    }

    /// True once the coordinator destroyed the object.
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// When the last update was accepted.
    pub fn received_at(&self) -> Option<Instant> {
        self.state.lock().received_at
    }

    /// Subscribes to notifications for this object.
    pub fn subscribe(&self) -> Receiver<ObjectEvent> {
        self.events.subscribe()
    }

    /// Applies an `object-update`.
    ///
    /// A declared base version that differs from the local one means updates
    /// were lost; the content is left untouched and the error is fatal.
    pub(crate) fn patch(&self, update: &ObjectUpdate) -> SyncResult<()> {
        let (id, changed) = {
            let mut state = self.state.lock();
            let changed = state.patch(update)?;
            (state.id.clone(), changed)
        };
        self.events
            .emit(ObjectEvent::new(id.clone(), ObjectEventKind::StatusChanged));
        if changed {
            self.events.emit(ObjectEvent::new(id, ObjectEventKind::Changed));
        }
        Ok(())
    }

    /// Marks the content provisionally valid after re-registration.
    pub(crate) fn validate(&self) {
        let id = {
            let mut state = self.state.lock();
            state.valid = state.initialized;
            state.id.clone()
        };
        self.events
            .emit(ObjectEvent::new(id, ObjectEventKind::StatusChanged));
    }

    /// Marks the content untrustworthy after a disconnect.
    pub(crate) fn invalidate(&self) {
        let id = {
            let mut state = self.state.lock();
            state.valid = false;
            state.id.clone()
        };
        self.events
            .emit(ObjectEvent::new(id, ObjectEventKind::StatusChanged));
    }

    pub(crate) fn destroy(&self) {
        let id = {
            let mut state = self.state.lock();
            state.destroyed = true;
            state.id.clone()
        };
        self.events
            .emit(ObjectEvent::new(id.clone(), ObjectEventKind::StatusChanged));
        self.events.emit(ObjectEvent::new(id, ObjectEventKind::Destroyed));
    }
}

impl std::fmt::Debug for SlaveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.state.lock().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seapig_protocol::Patch;
    use serde_json::json;

    fn handle(options: SlaveOptions) -> SlaveHandle {
        SlaveHandle::new("room-1", options, Arc::new(EventFeed::new()))
    }

    fn ops(value: Value) -> Patch {
        serde_json::from_value(value).unwrap()
    }

    fn drain(rx: &Receiver<ObjectEvent>) -> Vec<ObjectEventKind> {
        rx.try_iter().map(|event| event.kind).collect()
    }

    #[test]
    fn options_must_be_paired() {
        assert!(SlaveOptions::new().validate("a").is_ok());
        assert!(SlaveOptions::seeded(json!({}), 3).validate("a").is_ok());
        assert!(matches!(
            SlaveOptions::new().with_object(json!({})).validate("a"),
            Err(SyncError::InvalidSubscription { .. })
        ));
        assert!(matches!(
            SlaveOptions::new().with_version(4).validate("a"),
            Err(SyncError::InvalidSubscription { .. })
        ));
    }

    #[test]
    fn seeded_replica_is_initialized_but_not_valid() {
        let slave = handle(SlaveOptions::seeded(json!({"a": 1}), 5));
        assert!(slave.is_initialized());
        assert!(!slave.is_valid());
        assert_eq!(slave.version(), 5);
        assert_eq!(slave.get("/a"), Some(json!(1)));
    }

    #[test]
    fn full_value_replaces_content() {
        let slave = handle(SlaveOptions::seeded(json!({"old": true}), 2));
        slave
            .patch(&ObjectUpdate::value("room-1", 9, json!({"new": 1})))
            .unwrap();

        assert_eq!(slave.content(), json!({"new": 1}));
        assert_eq!(slave.version(), 9);
        assert!(slave.is_valid());
        assert!(slave.received_at().is_some());
    }

    #[test]
    fn incremental_update_on_matching_version() {
        let slave = handle(SlaveOptions::new());
        slave
            .patch(&ObjectUpdate::value("room-1", 1, json!({"a": 1, "b": 2})))
            .unwrap();
        slave
            .patch(&ObjectUpdate::patch(
                "room-1",
                1,
                2,
                ops(json!([{"op": "replace", "path": "/a", "value": 10}])),
            ))
            .unwrap();

        assert_eq!(slave.content(), json!({"a": 10, "b": 2}));
        assert_eq!(slave.version(), 2);
    }

    #[test]
    fn version_gap_is_a_violation_and_leaves_content() {
        let slave = handle(SlaveOptions::new());
        slave
            .patch(&ObjectUpdate::value("room-1", 4, json!({"a": 1})))
            .unwrap();

        let result = slave.patch(&ObjectUpdate::patch(
            "room-1",
            6,
            7,
            ops(json!([{"op": "add", "path": "/b", "value": 2}])),
        ));

        assert!(matches!(
            result,
            Err(SyncError::ProtocolViolation {
                local: 4,
                declared: 6,
                ..
            })
        ));
        assert_eq!(slave.content(), json!({"a": 1}));
        assert_eq!(slave.version(), 4);
    }

    #[test]
    fn patch_on_version_zero_starts_from_empty() {
        let slave = handle(SlaveOptions::seeded(json!({"stale": 1}), 3));
        slave
            .patch(&ObjectUpdate::patch(
                "room-1",
                0,
                1,
                ops(json!([{"op": "add", "path": "/fresh", "value": true}])),
            ))
            .unwrap();
        assert_eq!(slave.content(), json!({"fresh": true}));
    }

    #[test]
    fn failed_patch_is_reported_and_leaves_content() {
        let slave = handle(SlaveOptions::new());
        slave
            .patch(&ObjectUpdate::value("room-1", 1, json!({"a": 1})))
            .unwrap();

        let result = slave.patch(&ObjectUpdate::patch(
            "room-1",
            1,
            2,
            ops(json!([{"op": "remove", "path": "/missing"}])),
        ));
        assert!(matches!(result, Err(SyncError::PatchFailed { .. })));
        assert_eq!(slave.content(), json!({"a": 1}));
        assert_eq!(slave.version(), 1);
    }

    #[test]
    fn stalled_value_clears_content() {
        let slave = handle(SlaveOptions::seeded(json!({"a": 1}), 1));
        slave
            .patch(&ObjectUpdate::value("room-1", 2, Value::Bool(false)))
            .unwrap();
        assert_eq!(slave.content(), json!({}));
        assert!(slave.is_initialized());
    }

    #[test]
    fn identical_content_only_fires_status() {
        let slave = handle(SlaveOptions::new());
        let rx = slave.subscribe();

        slave
            .patch(&ObjectUpdate::value("room-1", 1, json!({"a": 1})))
            .unwrap();
        assert_eq!(
            drain(&rx),
            vec![ObjectEventKind::StatusChanged, ObjectEventKind::Changed]
        );

        slave
            .patch(&ObjectUpdate::value("room-1", 2, json!({"a": 1})))
            .unwrap();
        assert_eq!(drain(&rx), vec![ObjectEventKind::StatusChanged]);
        assert_eq!(slave.version(), 2);
    }

    #[test]
    fn validity_follows_connection() {
        let slave = handle(SlaveOptions::new());
        slave.validate();
        assert!(!slave.is_valid(), "uninitialized content is never valid");

        slave
            .patch(&ObjectUpdate::value("room-1", 1, json!({})))
            .unwrap();
        slave.invalidate();
        assert!(!slave.is_valid());
        slave.validate();
        assert!(slave.is_valid());
    }

    #[test]
    fn destroy_notifies() {
        let slave = handle(SlaveOptions::new());
        let rx = slave.subscribe();
        slave.destroy();
        assert!(slave.is_destroyed());
        assert_eq!(
            drain(&rx),
            vec![ObjectEventKind::StatusChanged, ObjectEventKind::Destroyed]
        );
    }
}
