//! Produced objects.
//!
//! A master is authoritative for its content. Every publish assigns a new
//! [`MasterVersion`] and uploads either the full content or a JSON Patch
//! against the shadow, the content last handed to the coordinator.

use crate::error::{SyncError, SyncResult};
use crate::events::{EventFeed, ObjectEvent, ObjectEventKind};
use crate::link::Uplink;
use parking_lot::{Mutex, RwLock};
use seapig_protocol::{ClientMessage, MasterVersion, ObjectBody, ObjectPatch};
use serde_json::{Map, Value};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Options for registering a produced object.
#[derive(Debug, Clone, Default)]
pub struct MasterOptions {
    /// Initial content. Without it the master needs a [`Producer`].
    pub object: Option<Value>,
    /// Initial version. Defaults to [`MasterVersion::now`].
    pub version: Option<MasterVersion>,
}

impl MasterOptions {
    /// Creates empty options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the initial content.
    pub fn with_object(mut self, object: Value) -> Self {
        self.object = Some(object);
        self
    }

    /// Sets the initial version.
    pub fn with_version(mut self, version: MasterVersion) -> Self {
        self.version = Some(version);
        self
    }
}

/// Arguments to [`MasterHandle::set`].
#[derive(Debug, Clone, Default)]
pub struct MasterSet {
    /// Replacement content. `null` or `false` stalls the object.
    pub object: Option<Value>,
    /// Stall the object without touching its content.
    pub stall: bool,
    /// Version to adopt.
    pub version: Option<MasterVersion>,
}

impl MasterSet {
    /// Replaces the content.
    pub fn object(object: Value) -> Self {
        Self {
            object: Some(object),
            ..Self::default()
        }
    }

    /// Marks the object as existing but valueless.
    pub fn stall() -> Self {
        Self {
            stall: true,
            ..Self::default()
        }
    }

    /// Adopts a caller-chosen version.
    pub fn with_version(mut self, version: MasterVersion) -> Self {
        self.version = Some(version);
        self
    }
}

/// Arguments to [`MasterHandle::bump`].
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterBump {
    /// Version to adopt instead of advancing the sequence.
    pub version: Option<MasterVersion>,
}

impl MasterBump {
    /// Advances the sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts a caller-chosen version.
    pub fn with_version(version: MasterVersion) -> Self {
        Self {
            version: Some(version),
        }
    }
}

/// A publish request for a produced object, applied on the client's task.
#[derive(Debug, Clone)]
pub enum Publish {
    /// See [`MasterHandle::set`].
    Set(MasterSet),
    /// See [`MasterHandle::bump`].
    Bump(MasterBump),
}

/// Supplies content when the coordinator asks for it.
///
/// Implementations typically compute fresh content and publish it with
/// [`MasterHandle::set`] or [`MasterHandle::update_content`] plus
/// [`MasterHandle::bump`].
pub trait Producer: Send + Sync {
    /// Called for an `object-produce` request.
    fn produce(
        &self,
        master: &MasterHandle,
        version_inferred: Option<&MasterVersion>,
    ) -> SyncResult<()>;
}

impl<F> Producer for F
where
    F: Fn(&MasterHandle, Option<&MasterVersion>) -> SyncResult<()> + Send + Sync,
{
    fn produce(
        &self,
        master: &MasterHandle,
        version_inferred: Option<&MasterVersion>,
    ) -> SyncResult<()> {
        self(master, version_inferred)
    }
}

/// Chooses between a full value and a patch for one publish.
///
/// `previous` is the version and shadow the coordinator is known to hold, or
/// `None` when there is no trustworthy baseline. A stalled object always
/// publishes `false`. Otherwise a patch is used only when its encoding is
/// strictly shorter than the encoded content.
pub fn upload_plan(
    id: &str,
    previous: Option<(MasterVersion, &Value)>,
    version_new: MasterVersion,
    content: &Value,
    stalled: bool,
) -> SyncResult<ObjectPatch> {
    let full = |value: Value| ObjectPatch {
        id: id.to_owned(),
        version_new,
        version_old: None,
        body: ObjectBody::Value(value),
    };

    if stalled {
        return Ok(full(Value::Bool(false)));
    }
    let Some((version_old, shadow)) = previous else {
        return Ok(full(content.clone()));
    };

    let diff = json_patch::diff(shadow, content);
    let patch_len = serde_json::to_string(&diff)?.len();
    let value_len = serde_json::to_string(content)?.len();
    if patch_len < value_len {
        Ok(ObjectPatch {
            id: id.to_owned(),
            version_new,
            version_old: Some(version_old),
            body: ObjectBody::Patch(diff),
        })
    } else {
        Ok(full(content.clone()))
    }
}

#[derive(Debug)]
struct MasterObject {
    id: String,
    version: MasterVersion,
    content: Value,
    shadow: Value,
    stalled: bool,
    initialized: bool,
    destroyed: bool,
    /// The coordinator holds `shadow` at `version`.
    synced: bool,
}

impl MasterObject {
    fn new(id: String, options: MasterOptions) -> Self {
        let initialized = options.object.is_some();
        let content = options
            .object
            .unwrap_or_else(|| Value::Object(Map::new()));
        Self {
            id,
            version: options.version.unwrap_or_else(MasterVersion::now),
            shadow: content.clone(),
            content,
            stalled: false,
            initialized,
            destroyed: false,
            synced: false,
        }
    }
}

pub(crate) struct MasterShared {
    state: Mutex<MasterObject>,
    events: Arc<EventFeed<ObjectEvent>>,
    producer: RwLock<Option<Arc<dyn Producer>>>,
    uplink: Uplink,
}

/// Shared handle to a produced object.
#[derive(Clone)]
pub struct MasterHandle {
    inner: Arc<MasterShared>,
}

impl MasterHandle {
    pub(crate) fn new(
        id: impl Into<String>,
        options: MasterOptions,
        events: Arc<EventFeed<ObjectEvent>>,
        uplink: Uplink,
    ) -> Self {
        Self {
            inner: Arc::new(MasterShared {
                state: Mutex::new(MasterObject::new(id.into(), options)),
                events,
                producer: RwLock::new(None),
                uplink,
            }),
        }
    }

    /// Concrete object id.
    pub fn id(&self) -> String {
        self.inner.state.lock().id.clone()
    }

    /// Current version.
    pub fn version(&self) -> MasterVersion {
        self.inner.state.lock().version
    }

    /// Copy of the current content.
    pub fn content(&self) -> Value {
        self.inner.state.lock().content.clone()
    }

    /// Copy of the content last published.
    pub fn shadow(&self) -> Value {
        self.inner.state.lock().shadow.clone()
    }

    /// True while the object exists but has no value.
    pub fn is_stalled(&self) -> bool {
        self.inner.state.lock().stalled
    }

    /// True once content has been supplied.
    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().initialized
    }

    /// True once the coordinator destroyed the object.
    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Subscribes to notifications for this object.
    pub fn subscribe(&self) -> Receiver<ObjectEvent> {
        self.inner.events.subscribe()
    }

    /// Installs the production callback.
    pub fn on_produce(&self, producer: impl Producer + 'static) -> &Self {
        *self.inner.producer.write() = Some(Arc::new(producer));
        self
    }

    /// Mutates the content in place without publishing. Follow with
    /// [`bump`](Self::bump).
    pub fn update_content<R>(&self, f: impl FnOnce(&mut Value) -> R) -> R {
        f(&mut self.inner.state.lock().content)
    }

    /// Hard-resets the object and publishes a full value.
    pub fn set(&self, options: MasterSet) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        if let Some(version) = options.version {
            state.version = version;
        }
        match options.object {
            Some(Value::Null) | Some(Value::Bool(false)) => state.stalled = true,
            Some(object) => {
                state.stalled = false;
                state.content = object;
            }
            None if options.stall => state.stalled = true,
            None => {}
        }
        state.shadow = state.content.clone();
        state.initialized = true;

        let upload = upload_plan(&state.id, None, state.version, &state.shadow, state.stalled)?;
        self.publish(&mut state, upload)
    }

    /// Publishes the current content under a new version.
    pub fn bump(&self, options: MasterBump) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        let version_old = state.version;
        let content = state.content.clone();
        let shadow_old = std::mem::replace(&mut state.shadow, content);
        state.version = options.version.unwrap_or_else(|| version_old.next());
        state.initialized = true;

        let previous = state.synced.then_some((version_old, &shadow_old));
        let upload = upload_plan(
            &state.id,
            previous,
            state.version,
            &state.shadow,
            state.stalled,
        )?;
        self.publish(&mut state, upload)
    }

    /// Applies a queued publish request.
    pub fn apply(&self, publish: Publish) -> SyncResult<()> {
        match publish {
            Publish::Set(options) => self.set(options),
            Publish::Bump(options) => self.bump(options),
        }
    }

    /// Answers an `object-produce` request.
    pub(crate) fn produce(&self, version_inferred: Option<&MasterVersion>) -> SyncResult<()> {
        let producer = self.inner.producer.read().clone();
        match producer {
            Some(producer) => producer.produce(self, version_inferred),
            None => self.reupload(),
        }
    }

    /// Re-sends the shadow as a full value.
    pub(crate) fn reupload(&self) -> SyncResult<()> {
        let mut state = self.inner.state.lock();
        if !state.initialized {
            return Err(SyncError::MisconfiguredProducer {
                id: state.id.clone(),
            });
        }
        let upload = upload_plan(&state.id, None, state.version, &state.shadow, state.stalled)?;
        self.publish(&mut state, upload)
    }

    pub(crate) fn destroy(&self) {
        let id = {
            let mut state = self.inner.state.lock();
            state.destroyed = true;
            state.id.clone()
        };
        self.inner
            .events
            .emit(ObjectEvent::new(id.clone(), ObjectEventKind::StatusChanged));
        self.inner
            .events
            .emit(ObjectEvent::new(id, ObjectEventKind::Destroyed));
    }

    /// Forgets what the coordinator holds, so the next bump uploads a full value.
    pub(crate) fn desync(&self) {
        self.inner.state.lock().synced = false;
    }

    pub(crate) fn downgrade(&self) -> WeakMaster {
        WeakMaster(Arc::downgrade(&self.inner))
    }

    fn publish(&self, state: &mut MasterObject, upload: ObjectPatch) -> SyncResult<()> {
        let kind = if upload.body.is_value() { "value" } else { "patch" };
        state.synced = false;
        let sent = self.inner.uplink.send(&ClientMessage::ObjectPatch(upload))?;
        debug!(id = %state.id, version = %state.version, kind, sent, "published master");
        state.synced = sent;
        Ok(())
    }
}

impl std::fmt::Debug for MasterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.state.lock().fmt(f)
    }
}

/// A master reference that does not keep the object alive.
#[derive(Clone)]
pub(crate) struct WeakMaster(Weak<MasterShared>);

impl WeakMaster {
    pub(crate) fn upgrade(&self) -> Option<MasterHandle> {
        self.0.upgrade().map(|inner| MasterHandle { inner })
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LinkId, MockTransport};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn connected() -> (Arc<MockTransport>, Uplink) {
        let transport = Arc::new(MockTransport::new());
        let uplink = Uplink::new(transport.clone(), false);
        uplink.attach(LinkId::first(), &[]).unwrap();
        (transport, uplink)
    }

    fn master(uplink: &Uplink, options: MasterOptions) -> MasterHandle {
        MasterHandle::new("stats", options, Arc::new(EventFeed::new()), uplink.clone())
    }

    fn uploads(transport: &MockTransport) -> Vec<ObjectPatch> {
        transport
            .take_sent()
            .into_iter()
            .filter_map(|message| match message {
                ClientMessage::ObjectPatch(upload) => Some(upload),
                _ => None,
            })
            .collect()
    }

    fn alphabet() -> Value {
        let map: Map<String, Value> = ('a'..='z')
            .enumerate()
            .map(|(i, c)| (c.to_string(), json!(i + 1)))
            .collect();
        Value::Object(map)
    }

    #[test]
    fn plan_without_baseline_is_full() {
        let version = MasterVersion::new(1, 0);
        let upload = upload_plan("a", None, version, &json!({"x": 1}), false).unwrap();
        assert_eq!(upload.body, ObjectBody::Value(json!({"x": 1})));
        assert_eq!(upload.version_old, None);
    }

    #[test]
    fn plan_for_stalled_is_false() {
        let shadow = json!({"x": 1});
        let upload = upload_plan(
            "a",
            Some((MasterVersion::new(1, 0), &shadow)),
            MasterVersion::new(1, 1),
            &shadow,
            true,
        )
        .unwrap();
        assert_eq!(upload.body, ObjectBody::Value(Value::Bool(false)));
    }

    #[test]
    fn plan_prefers_small_patch() {
        let shadow = alphabet();
        let mut content = alphabet();
        content["m"] = json!(1300);

        let upload = upload_plan(
            "a",
            Some((MasterVersion::new(1, 0), &shadow)),
            MasterVersion::new(1, 1),
            &content,
            false,
        )
        .unwrap();
        assert!(!upload.body.is_value());
        assert_eq!(upload.version_old, Some(MasterVersion::new(1, 0)));

        let mut rebuilt = shadow.clone();
        if let ObjectBody::Patch(patch) = &upload.body {
            json_patch::patch(&mut rebuilt, &patch.0).unwrap();
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn plan_prefers_value_for_rewrites() {
        let shadow = alphabet();
        let content = json!({"completely": ["different"]});
        let upload = upload_plan(
            "a",
            Some((MasterVersion::new(1, 0), &shadow)),
            MasterVersion::new(1, 1),
            &content,
            false,
        )
        .unwrap();
        assert_eq!(upload.body, ObjectBody::Value(content));
    }

    #[test]
    fn set_uploads_full_value() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new());
        let version = MasterVersion::new(7, 3);

        stats
            .set(MasterSet::object(json!({"users": 4})).with_version(version))
            .unwrap();

        let sent = uploads(&transport);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].version_new, version);
        assert_eq!(sent[0].body, ObjectBody::Value(json!({"users": 4})));
        assert!(stats.is_initialized());
        assert_eq!(stats.shadow(), json!({"users": 4}));
    }

    #[test]
    fn bump_diffs_against_shadow() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new());
        stats.set(MasterSet::object(alphabet())).unwrap();
        let base = stats.version();
        transport.take_sent();

        stats.update_content(|content| content["q"] = json!(99));
        stats.bump(MasterBump::new()).unwrap();

        let sent = uploads(&transport);
        assert_eq!(sent[0].version_old, Some(base));
        assert_eq!(sent[0].version_new, base.next());
        assert!(!sent[0].body.is_value());
        assert_eq!(stats.shadow()["q"], json!(99));
    }

    #[test]
    fn bump_after_dropped_upload_sends_value() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new());
        stats.set(MasterSet::object(alphabet())).unwrap();

        uplink.release();
        stats.update_content(|content| content["a"] = json!(0));
        stats.bump(MasterBump::new()).unwrap();
        uplink.attach(LinkId::first().next(), &[]).unwrap();
        transport.take_sent();

        stats.update_content(|content| content["b"] = json!(0));
        stats.bump(MasterBump::new()).unwrap();
        let sent = uploads(&transport);
        assert!(sent[0].body.is_value());
        assert_eq!(sent[0].version_old, None);
    }

    #[test]
    fn bump_after_failed_send_sends_value() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new());
        stats.set(MasterSet::object(alphabet())).unwrap();

        transport.set_fail_send(true);
        stats.update_content(|content| content["a"] = json!(0));
        assert!(stats.bump(MasterBump::new()).is_err());
        transport.set_fail_send(false);
        transport.take_sent();

        stats.update_content(|content| content["b"] = json!(0));
        stats.bump(MasterBump::new()).unwrap();
        let sent = uploads(&transport);
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.is_value());
        assert_eq!(sent[0].version_old, None);
        assert_eq!(sent[0].body, ObjectBody::Value(stats.content()));
    }

    #[test]
    fn apply_routes_publish_requests() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new());

        stats.apply(Publish::Set(MasterSet::object(alphabet()))).unwrap();
        stats.update_content(|content| content["z"] = json!(0));
        stats.apply(Publish::Bump(MasterBump::new())).unwrap();

        let sent = uploads(&transport);
        assert_eq!(sent.len(), 2);
        assert!(sent[0].body.is_value());
        assert!(!sent[1].body.is_value());
    }

    #[test]
    fn stalled_master_publishes_false() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new().with_object(json!({"a": 1})));

        stats.set(MasterSet::stall()).unwrap();
        assert!(stats.is_stalled());
        stats.bump(MasterBump::new()).unwrap();

        let sent = uploads(&transport);
        assert_eq!(sent.len(), 2);
        for upload in sent {
            assert_eq!(upload.body, ObjectBody::Value(Value::Bool(false)));
        }

        stats.set(MasterSet::object(json!({"a": 2}))).unwrap();
        assert!(!stats.is_stalled());
    }

    #[test]
    fn set_false_stalls() {
        let (_transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new().with_object(json!({"a": 1})));
        stats.set(MasterSet::object(Value::Bool(false))).unwrap();
        assert!(stats.is_stalled());
        assert_eq!(stats.content(), json!({"a": 1}));
    }

    #[test]
    fn produce_reuploads_snapshot() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new().with_object(json!({"a": 1})));
        let version = stats.version();

        stats.produce(None).unwrap();

        let sent = uploads(&transport);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].version_new, version);
        assert_eq!(sent[0].body, ObjectBody::Value(json!({"a": 1})));
    }

    #[test]
    fn produce_without_value_or_producer_fails() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new());
        assert!(matches!(
            stats.produce(None),
            Err(SyncError::MisconfiguredProducer { .. })
        ));
        assert!(transport.sent_frames().is_empty());
    }

    #[test]
    fn produce_calls_producer() {
        let (transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        stats.on_produce(move |master: &MasterHandle, inferred: Option<&MasterVersion>| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert_eq!(inferred, Some(&MasterVersion::new(5, 5)));
            master.set(MasterSet::object(json!({"fresh": true})))
        });

        stats.produce(Some(&MasterVersion::new(5, 5))).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            uploads(&transport)[0].body,
            ObjectBody::Value(json!({"fresh": true}))
        );
    }

    #[test]
    fn weak_reference_dies_with_handle() {
        let (_transport, uplink) = connected();
        let stats = master(&uplink, MasterOptions::new());
        let weak = stats.downgrade();
        assert!(weak.is_alive());
        assert!(weak.upgrade().is_some());
        drop(stats);
        assert!(!weak.is_alive());
        assert!(weak.upgrade().is_none());
    }

    fn scores() -> impl Strategy<Value = Value> {
        prop::collection::btree_map("[a-e]", -50i64..50, 0..6)
            .prop_map(|scores| json!({ "scores": scores }))
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn planned_upload_rebuilds_content(shadow in scores(), content in scores()) {
            let upload = upload_plan(
                "a",
                Some((MasterVersion::new(1, 0), &shadow)),
                MasterVersion::new(1, 1),
                &content,
                false,
            )
            .unwrap();

            let rebuilt = match upload.body {
                ObjectBody::Value(value) => {
                    prop_assert_eq!(upload.version_old, None);
                    value
                }
                ObjectBody::Patch(patch) => {
                    prop_assert_eq!(upload.version_old, Some(MasterVersion::new(1, 0)));
                    let mut doc = shadow.clone();
                    json_patch::patch(&mut doc, &patch.0).unwrap();
                    doc
                }
            };
            prop_assert_eq!(rebuilt, content);
        }
    }
}
