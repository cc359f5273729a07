//! Wildcard containers.
//!
//! A subscription whose pattern contains `*` is backed by a container that
//! materializes one concrete object per matching id on first reference.
//! Children are keyed by their exact id; the pattern itself is only used for
//! registration and matching.
//!
//! Slave children live until the coordinator destroys them. Master children
//! are held weakly: once the last [`MasterHandle`] for a child is dropped the
//! child is gone, and the next lookup creates an unrelated fresh instance.

use crate::error::SyncResult;
use crate::events::{EventFeed, ObjectEvent};
use crate::link::Uplink;
use crate::master::{MasterHandle, MasterOptions, Producer, WeakMaster};
use crate::slave::{SlaveHandle, SlaveOptions};
use parking_lot::{Mutex, RwLock};
use seapig_protocol::{MasterVersion, ObjectUpdate, Pattern, SlaveVersion};
use std::collections::{BTreeMap, HashMap};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::debug;

/// Consumer side of a wildcard subscription.
#[derive(Clone)]
pub struct WildcardSlave {
    inner: Arc<WildcardSlaveInner>,
}

struct WildcardSlaveInner {
    pattern: Pattern,
    version: SlaveVersion,
    children: Mutex<BTreeMap<String, SlaveHandle>>,
    events: Arc<EventFeed<ObjectEvent>>,
}

impl WildcardSlave {
    pub(crate) fn new(pattern: Pattern, options: SlaveOptions) -> Self {
        Self {
            inner: Arc::new(WildcardSlaveInner {
                pattern,
                version: options.version.unwrap_or(0),
                children: Mutex::new(BTreeMap::new()),
                events: Arc::new(EventFeed::new()),
            }),
        }
    }

    /// The subscription pattern.
    pub fn pattern(&self) -> &Pattern {
        &self.inner.pattern
    }

    /// Version announced when registering the pattern.
    pub fn version(&self) -> SlaveVersion {
        self.inner.version
    }

    /// Returns the child for a concrete id, if one has been materialized.
    pub fn child(&self, id: &str) -> Option<SlaveHandle> {
        self.inner.children.lock().get(id).cloned()
    }

    /// All materialized children, ordered by id.
    pub fn children(&self) -> Vec<SlaveHandle> {
        self.inner.children.lock().values().cloned().collect()
    }

    /// Ids of all materialized children.
    pub fn ids(&self) -> Vec<String> {
        self.inner.children.lock().keys().cloned().collect()
    }

    /// Number of materialized children.
    pub fn len(&self) -> usize {
        self.inner.children.lock().len()
    }

    /// Returns true if no child has been materialized.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to notifications for every child.
    pub fn subscribe(&self) -> Receiver<ObjectEvent> {
        self.inner.events.subscribe()
    }

    /// Routes an update to the child for its id, creating it if needed.
    pub(crate) fn patch(&self, update: &ObjectUpdate) -> SyncResult<()> {
        let child = {
            let mut children = self.inner.children.lock();
            children
                .entry(update.id.clone())
                .or_insert_with(|| {
                    debug!(
                        pattern = %self.inner.pattern,
                        id = %update.id,
                        "materializing slave child"
                    );
                    SlaveHandle::new(
                        update.id.clone(),
                        SlaveOptions::new(),
                        self.inner.events.clone(),
                    )
                })
                .clone()
        };
        child.patch(update)
    }

    /// Removes and destroys the child for `id`, if present.
    pub(crate) fn destroy(&self, id: &str) {
        let removed = self.inner.children.lock().remove(id);
        if let Some(child) = removed {
            child.destroy();
        }
    }

    pub(crate) fn validate(&self) {
        for child in self.children() {
            child.validate();
        }
    }

    pub(crate) fn invalidate(&self) {
        for child in self.children() {
            child.invalidate();
        }
    }
}

impl std::fmt::Debug for WildcardSlave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WildcardSlave")
            .field("pattern", &self.inner.pattern.as_str())
            .field("children", &self.ids())
            .finish()
    }
}

/// Producer side of a wildcard registration.
#[derive(Clone)]
pub struct WildcardMaster {
    inner: Arc<WildcardMasterInner>,
}

struct WildcardMasterInner {
    pattern: Pattern,
    options: MasterOptions,
    version: MasterVersion,
    children: Mutex<HashMap<String, WeakMaster>>,
    producer: RwLock<Option<Arc<dyn Producer>>>,
    events: Arc<EventFeed<ObjectEvent>>,
    uplink: Uplink,
}

impl WildcardMaster {
    pub(crate) fn new(pattern: Pattern, options: MasterOptions, uplink: Uplink) -> Self {
        Self {
            inner: Arc::new(WildcardMasterInner {
                pattern,
                version: options.version.unwrap_or_else(MasterVersion::now),
                options,
                children: Mutex::new(HashMap::new()),
                producer: RwLock::new(None),
                events: Arc::new(EventFeed::new()),
                uplink,
            }),
        }
    }

    /// The registration pattern.
    pub fn pattern(&self) -> &Pattern {
        &self.inner.pattern
    }

    /// Version announced when registering the pattern.
    pub fn version(&self) -> MasterVersion {
        self.inner.version
    }

    /// Returns the live child for `id`, creating a fresh one if none is held.
    ///
    /// The container keeps no strong reference; the caller's handle is what
    /// keeps the child alive.
    pub fn child(&self, id: &str) -> MasterHandle {
        let mut children = self.inner.children.lock();
        children.retain(|_, weak| weak.is_alive());

        if let Some(existing) = children.get(id).and_then(WeakMaster::upgrade) {
            return existing;
        }

        debug!(pattern = %self.inner.pattern, id, "materializing master child");
        let child = MasterHandle::new(
            id,
            self.inner.options.clone(),
            self.inner.events.clone(),
            self.inner.uplink.clone(),
        );
        children.insert(id.to_owned(), child.downgrade());
        child
    }

    /// All children still referenced somewhere.
    pub fn children(&self) -> Vec<MasterHandle> {
        self.inner
            .children
            .lock()
            .values()
            .filter_map(WeakMaster::upgrade)
            .collect()
    }

    /// Number of children still referenced somewhere.
    pub fn len(&self) -> usize {
        self.inner
            .children
            .lock()
            .values()
            .filter(|weak| weak.is_alive())
            .count()
    }

    /// Returns true if no child is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribes to notifications for every child.
    pub fn subscribe(&self) -> Receiver<ObjectEvent> {
        self.inner.events.subscribe()
    }

    /// Installs the production callback, invoked with the child being produced.
    pub fn on_produce(&self, producer: impl Producer + 'static) -> &Self {
        *self.inner.producer.write() = Some(Arc::new(producer));
        self
    }

    /// Answers an `object-produce` request for a concrete id.
    pub(crate) fn produce(
        &self,
        id: &str,
        version_inferred: Option<&MasterVersion>,
    ) -> SyncResult<()> {
        let child = self.child(id);
        let producer = self.inner.producer.read().clone();
        match producer {
            Some(producer) => producer.produce(&child, version_inferred),
            None => child.produce(version_inferred),
        }
    }

    /// Destroys the child currently held for `id`, if any.
    pub(crate) fn destroy(&self, id: &str) {
        let removed = self.inner.children.lock().remove(id);
        if let Some(child) = removed.as_ref().and_then(WeakMaster::upgrade) {
            child.destroy();
        }
    }

    pub(crate) fn desync(&self) {
        for child in self.children() {
            child.desync();
        }
    }
}

impl std::fmt::Debug for WildcardMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WildcardMaster")
            .field("pattern", &self.inner.pattern.as_str())
            .field("version", &self.inner.version)
            .field("children", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::events::ObjectEventKind;
    use crate::master::MasterSet;
    use crate::transport::{LinkId, MockTransport};
    use seapig_protocol::{ClientMessage, ObjectBody};
    use serde_json::json;

    fn rooms() -> WildcardSlave {
        WildcardSlave::new(Pattern::new("room-*").unwrap(), SlaveOptions::new())
    }

    fn users(uplink: Uplink) -> WildcardMaster {
        WildcardMaster::new(
            Pattern::new("user-*").unwrap(),
            MasterOptions::new(),
            uplink,
        )
    }

    fn uplink() -> (Arc<MockTransport>, Uplink) {
        let transport = Arc::new(MockTransport::new());
        let uplink = Uplink::new(transport.clone(), false);
        uplink.attach(LinkId::first(), &[]).unwrap();
        (transport, uplink)
    }

    #[test]
    fn slave_children_materialize_once() {
        let rooms = rooms();
        rooms
            .patch(&ObjectUpdate::value("room-42", 1, json!({"n": 1})))
            .unwrap();
        let first = rooms.child("room-42").unwrap();

        rooms
            .patch(&ObjectUpdate::value("room-42", 2, json!({"n": 2})))
            .unwrap();
        assert_eq!(rooms.len(), 1);
        assert_eq!(first.content(), json!({"n": 2}));
        assert_eq!(rooms.ids(), vec!["room-42".to_owned()]);
    }

    #[test]
    fn slave_destroy_then_recreate_is_fresh() {
        let rooms = rooms();
        rooms
            .patch(&ObjectUpdate::value("room-42", 5, json!({"old": true})))
            .unwrap();
        let before = rooms.child("room-42").unwrap();

        rooms.destroy("room-42");
        assert!(rooms.is_empty());
        assert!(before.is_destroyed());

        rooms
            .patch(&ObjectUpdate::value("room-42", 1, json!({"new": true})))
            .unwrap();
        let after = rooms.child("room-42").unwrap();
        assert_eq!(after.content(), json!({"new": true}));
        assert_eq!(after.version(), 1);
        assert!(!after.is_destroyed());
    }

    #[test]
    fn slave_destroy_of_unknown_child_is_noop() {
        let rooms = rooms();
        rooms.destroy("room-1");
        assert!(rooms.is_empty());
    }

    #[test]
    fn slave_children_share_container_feed() {
        let rooms = rooms();
        let rx = rooms.subscribe();
        rooms
            .patch(&ObjectUpdate::value("room-1", 1, json!({"a": 1})))
            .unwrap();
        rooms
            .patch(&ObjectUpdate::value("room-2", 1, json!({"a": 1})))
            .unwrap();

        let changed: Vec<String> = rx
            .try_iter()
            .filter(|event| event.kind == ObjectEventKind::Changed)
            .map(|event| event.id)
            .collect();
        assert_eq!(changed, vec!["room-1".to_owned(), "room-2".to_owned()]);
    }

    #[test]
    fn slave_validity_propagates_to_children() {
        let rooms = rooms();
        rooms
            .patch(&ObjectUpdate::value("room-1", 1, json!({})))
            .unwrap();
        rooms.invalidate();
        assert!(!rooms.child("room-1").unwrap().is_valid());
        rooms.validate();
        assert!(rooms.child("room-1").unwrap().is_valid());
    }

    #[test]
    fn master_child_is_reused_while_held() {
        let (_transport, uplink) = uplink();
        let users = users(uplink);

        let first = users.child("user-1");
        first.set(MasterSet::object(json!({"name": "ada"}))).unwrap();
        let again = users.child("user-1");
        assert_eq!(again.content(), json!({"name": "ada"}));
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn master_child_is_collected_when_released() {
        let (_transport, uplink) = uplink();
        let users = users(uplink);

        let child = users.child("user-1");
        child.set(MasterSet::object(json!({"name": "ada"}))).unwrap();
        drop(child);
        assert!(users.is_empty());

        let fresh = users.child("user-1");
        assert!(!fresh.is_initialized());
        assert_eq!(fresh.content(), json!({}));
    }

    #[test]
    fn master_produce_uses_container_producer() {
        let (transport, uplink) = uplink();
        let users = users(uplink);
        users.on_produce(|child: &MasterHandle, _: Option<&MasterVersion>| {
            child.set(MasterSet::object(json!({ "id": child.id() })))
        });

        users.produce("user-7", None).unwrap();

        match transport.take_sent().as_slice() {
            [ClientMessage::ObjectPatch(upload)] => {
                assert_eq!(upload.id, "user-7");
                assert_eq!(upload.body, ObjectBody::Value(json!({"id": "user-7"})));
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }

    #[test]
    fn master_produce_without_producer_reuploads_child() {
        let (transport, uplink) = uplink();
        let seeded = WildcardMaster::new(
            Pattern::new("cfg-*").unwrap(),
            MasterOptions::new().with_object(json!({"default": true})),
            uplink.clone(),
        );
        seeded.produce("cfg-a", None).unwrap();
        assert_eq!(transport.take_sent().len(), 1);

        let empty = WildcardMaster::new(
            Pattern::new("tmp-*").unwrap(),
            MasterOptions::new(),
            uplink,
        );
        assert!(matches!(
            empty.produce("tmp-a", None),
            Err(SyncError::MisconfiguredProducer { .. })
        ));
    }

    #[test]
    fn master_destroy_targets_message_id() {
        let (_transport, uplink) = uplink();
        let users = users(uplink);
        let one = users.child("user-1");
        let two = users.child("user-2");

        users.destroy("user-2");
        assert!(two.is_destroyed());
        assert!(!one.is_destroyed());
        assert_eq!(users.len(), 1);

        users.destroy("user-9");
        assert_eq!(users.len(), 1);
    }
}
