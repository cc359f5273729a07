//! Subscription registry.
//!
//! Maps registration patterns to the objects behind them. Registrations keep
//! their insertion order; re-registering a pattern replaces the entry in
//! place.

use crate::error::SyncResult;
use crate::events::EventFeed;
use crate::link::Uplink;
use crate::master::{MasterHandle, MasterOptions};
use crate::slave::{SlaveHandle, SlaveOptions};
use crate::wildcard::{WildcardMaster, WildcardSlave};
use seapig_protocol::{MasterVersion, ObjectUpdate, Pattern, SlaveVersion};
use std::sync::Arc;

/// A consumer registration.
#[derive(Debug, Clone)]
pub enum SlaveEntry {
    /// A single concrete object.
    Plain(SlaveHandle),
    /// A wildcard container.
    Wildcard(WildcardSlave),
}

impl SlaveEntry {
    /// Version announced when registering.
    pub fn version(&self) -> SlaveVersion {
        match self {
            SlaveEntry::Plain(slave) => slave.version(),
            SlaveEntry::Wildcard(container) => container.version(),
        }
    }

    /// Returns the plain handle, if this is not a wildcard registration.
    pub fn as_plain(&self) -> Option<&SlaveHandle> {
        match self {
            SlaveEntry::Plain(slave) => Some(slave),
            SlaveEntry::Wildcard(_) => None,
        }
    }

    /// Returns the container, if this is a wildcard registration.
    pub fn as_wildcard(&self) -> Option<&WildcardSlave> {
        match self {
            SlaveEntry::Wildcard(container) => Some(container),
            SlaveEntry::Plain(_) => None,
        }
    }

    fn patch(&self, update: &ObjectUpdate) -> SyncResult<()> {
        match self {
            SlaveEntry::Plain(slave) => slave.patch(update),
            SlaveEntry::Wildcard(container) => container.patch(update),
        }
    }

    fn destroy(&self, id: &str) {
        match self {
            SlaveEntry::Plain(slave) => slave.destroy(),
            SlaveEntry::Wildcard(container) => container.destroy(id),
        }
    }

    pub(crate) fn validate(&self) {
        match self {
            SlaveEntry::Plain(slave) => slave.validate(),
            SlaveEntry::Wildcard(container) => container.validate(),
        }
    }

    pub(crate) fn invalidate(&self) {
        match self {
            SlaveEntry::Plain(slave) => slave.invalidate(),
            SlaveEntry::Wildcard(container) => container.invalidate(),
        }
    }
}

/// A producer registration.
#[derive(Debug, Clone)]
pub enum MasterEntry {
    /// A single concrete object.
    Plain(MasterHandle),
    /// A wildcard container.
    Wildcard(WildcardMaster),
}

impl MasterEntry {
    /// Version announced when registering.
    pub fn version(&self) -> MasterVersion {
        match self {
            MasterEntry::Plain(master) => master.version(),
            MasterEntry::Wildcard(container) => container.version(),
        }
    }

    /// Returns the plain handle, if this is not a wildcard registration.
    pub fn as_plain(&self) -> Option<&MasterHandle> {
        match self {
            MasterEntry::Plain(master) => Some(master),
            MasterEntry::Wildcard(_) => None,
        }
    }

    /// Returns the container, if this is a wildcard registration.
    pub fn as_wildcard(&self) -> Option<&WildcardMaster> {
        match self {
            MasterEntry::Wildcard(container) => Some(container),
            MasterEntry::Plain(_) => None,
        }
    }

    fn produce(&self, id: &str, version_inferred: Option<&MasterVersion>) -> SyncResult<()> {
        match self {
            MasterEntry::Plain(master) => master.produce(version_inferred),
            MasterEntry::Wildcard(container) => container.produce(id, version_inferred),
        }
    }

    fn destroy(&self, id: &str) {
        match self {
            MasterEntry::Plain(master) => master.destroy(),
            MasterEntry::Wildcard(container) => container.destroy(id),
        }
    }

    pub(crate) fn desync(&self) {
        match self {
            MasterEntry::Plain(master) => master.desync(),
            MasterEntry::Wildcard(container) => container.desync(),
        }
    }
}

#[derive(Debug)]
struct Registration<E> {
    pattern: Pattern,
    entry: E,
}

fn upsert<E>(list: &mut Vec<Registration<E>>, pattern: Pattern, entry: E) {
    match list.iter_mut().find(|r| r.pattern == pattern) {
        Some(existing) => existing.entry = entry,
        None => list.push(Registration { pattern, entry }),
    }
}

fn take<E>(list: &mut Vec<Registration<E>>, pattern: &str) -> Option<E> {
    let index = list.iter().position(|r| r.pattern.as_str() == pattern)?;
    Some(list.remove(index).entry)
}

/// Pattern-keyed consumer and producer registrations.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    slaves: Vec<Registration<SlaveEntry>>,
    masters: Vec<Registration<MasterEntry>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer, replacing any previous one for the same pattern.
    pub(crate) fn slave(&mut self, pattern: &str, options: SlaveOptions) -> SyncResult<SlaveEntry> {
        options.validate(pattern)?;
        let pattern = Pattern::new(pattern)?;
        let entry = if pattern.is_wildcard() {
            SlaveEntry::Wildcard(WildcardSlave::new(pattern.clone(), options))
        } else {
            SlaveEntry::Plain(SlaveHandle::new(
                pattern.as_str(),
                options,
                Arc::new(EventFeed::new()),
            ))
        };
        upsert(&mut self.slaves, pattern, entry.clone());
        Ok(entry)
    }

    /// Registers a producer, replacing any previous one for the same pattern.
    pub(crate) fn master(
        &mut self,
        pattern: &str,
        options: MasterOptions,
        uplink: &Uplink,
    ) -> SyncResult<MasterEntry> {
        let pattern = Pattern::new(pattern)?;
        let entry = if pattern.is_wildcard() {
            MasterEntry::Wildcard(WildcardMaster::new(pattern.clone(), options, uplink.clone()))
        } else {
            MasterEntry::Plain(MasterHandle::new(
                pattern.as_str(),
                options,
                Arc::new(EventFeed::new()),
                uplink.clone(),
            ))
        };
        upsert(&mut self.masters, pattern, entry.clone());
        Ok(entry)
    }

    /// Removes both registrations for `pattern`.
    pub(crate) fn unlink(&mut self, pattern: &str) -> (Option<SlaveEntry>, Option<MasterEntry>) {
        (take(&mut self.slaves, pattern), take(&mut self.masters, pattern))
    }

    pub(crate) fn slave_entry(&self, pattern: &str) -> Option<&SlaveEntry> {
        self.slaves
            .iter()
            .find(|r| r.pattern.as_str() == pattern)
            .map(|r| &r.entry)
    }

    pub(crate) fn master_entry(&self, pattern: &str) -> Option<&MasterEntry> {
        self.masters
            .iter()
            .find(|r| r.pattern.as_str() == pattern)
            .map(|r| &r.entry)
    }

    pub(crate) fn slaves(&self) -> impl Iterator<Item = (&Pattern, &SlaveEntry)> {
        self.slaves.iter().map(|r| (&r.pattern, &r.entry))
    }

    pub(crate) fn masters(&self) -> impl Iterator<Item = (&Pattern, &MasterEntry)> {
        self.masters.iter().map(|r| (&r.pattern, &r.entry))
    }

    /// Delivers an update to every matching consumer. Returns how many matched.
    pub(crate) fn update(&self, update: &ObjectUpdate) -> SyncResult<usize> {
        let mut matched = 0;
        for registration in self.slaves.iter().filter(|r| r.pattern.matches(&update.id)) {
            registration.entry.patch(update)?;
            matched += 1;
        }
        Ok(matched)
    }

    /// Delivers a destroy to every matching consumer and producer.
    pub(crate) fn destroy(&self, id: &str) -> usize {
        let mut matched = 0;
        for registration in self.slaves.iter().filter(|r| r.pattern.matches(id)) {
            registration.entry.destroy(id);
            matched += 1;
        }
        for registration in self.masters.iter().filter(|r| r.pattern.matches(id)) {
            registration.entry.destroy(id);
            matched += 1;
        }
        matched
    }

    /// The object the first matching producer publishes under `id`.
    pub(crate) fn publisher(&self, id: &str) -> Option<MasterHandle> {
        let registration = self.masters.iter().find(|r| r.pattern.matches(id))?;
        Some(match &registration.entry {
            MasterEntry::Plain(master) => master.clone(),
            MasterEntry::Wildcard(container) => container.child(id),
        })
    }

    /// Hands a produce request to the first matching producer.
    ///
    /// Returns `Ok(false)` when no producer matches.
    pub(crate) fn produce(
        &self,
        id: &str,
        version_inferred: Option<&MasterVersion>,
    ) -> SyncResult<bool> {
        let Some(registration) = self.masters.iter().find(|r| r.pattern.matches(id)) else {
            return Ok(false);
        };
        registration.entry.produce(id, version_inferred)?;
        Ok(true)
    }
}
