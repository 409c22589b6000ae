use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use aihub_plugin_interface::CapabilityType;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::{CapabilityEntry, CapabilityEvent, CapabilityEventKind, CapabilityRegistry, RefreshSummary};
use crate::error::RegistryError;
use crate::plugin::registry::PluginRegistry;

type Snapshot = Arc<HashMap<String, CapabilityEntry>>;

/// Single-process [`CapabilityRegistry`].
///
/// Reads clone an `Arc` of the current snapshot and never wait on writers.
/// Writers are serialized, build a new map, swap it in, then notify.
pub struct InMemoryCapabilityRegistry {
    source: Arc<dyn PluginRegistry>,
    snapshot: RwLock<Snapshot>,
    writer: tokio::sync::Mutex<()>,
    subscribers: Mutex<Vec<mpsc::Sender<CapabilityEvent>>>,
    sequence: AtomicU64,
    event_buffer: usize,
}

impl InMemoryCapabilityRegistry {
    /// `source` is consulted by [`refresh`](CapabilityRegistry::refresh);
    /// `event_buffer` bounds each subscriber's queue.
    pub fn new(source: Arc<dyn PluginRegistry>, event_buffer: usize) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            writer: tokio::sync::Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
            sequence: AtomicU64::new(0),
            event_buffer: event_buffer.max(1),
        }
    }

    fn current(&self) -> Snapshot {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn swap(&self, next: HashMap<String, CapabilityEntry>) {
        let next = Arc::new(next);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Deliver events in order to every live subscriber.
    ///
    /// Called with the writer lock held so concurrent mutations cannot
    /// interleave their notifications. Never waits on a receiver: a
    /// subscriber whose queue is full is dropped and sees its channel close
    /// once drained.
    fn publish(&self, kinds: Vec<CapabilityEventKind>) {
        if kinds.is_empty() {
            return;
        }
        let mut subs = match self.subscribers.lock() {
            Ok(subs) => subs,
            Err(poisoned) => poisoned.into_inner(),
        };

        for kind in kinds {
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(sequence, capability = %kind.capability(), "Publishing capability event");
            let event = CapabilityEvent { sequence, kind };
            subs.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(sequence, "Capability subscriber lagging, dropping it");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
        }
    }
}

#[async_trait]
impl CapabilityRegistry for InMemoryCapabilityRegistry {
    async fn register(&self, entry: CapabilityEntry) -> Result<(), RegistryError> {
        let _writer = self.writer.lock().await;
        let current = self.current();

        let kind = match current.get(&entry.name) {
            Some(existing) if existing.plugin_id != entry.plugin_id => {
                return Err(RegistryError::Conflict {
                    name: entry.name,
                    owner: existing.plugin_id.clone(),
                });
            }
            Some(existing) if existing.same_metadata(&entry) && existing.available == entry.available => {
                return Ok(());
            }
            Some(_) => CapabilityEventKind::Updated(entry.clone()),
            None => CapabilityEventKind::Registered(entry.clone()),
        };

        let mut next = (*current).clone();
        next.insert(entry.name.clone(), entry);
        self.swap(next);
        self.publish(vec![kind]);
        Ok(())
    }

    async fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let _writer = self.writer.lock().await;
        let current = self.current();

        let Some(existing) = current.get(name) else {
            debug!(capability = %name, "Unregister of absent capability ignored");
            return Ok(());
        };
        let kind = CapabilityEventKind::Unregistered {
            name: name.to_string(),
            plugin_id: existing.plugin_id.clone(),
        };

        let mut next = (*current).clone();
        next.remove(name);
        self.swap(next);
        self.publish(vec![kind]);
        Ok(())
    }

    async fn set_available(&self, name: &str, available: bool) -> Result<(), RegistryError> {
        let _writer = self.writer.lock().await;
        let current = self.current();

        match current.get(name) {
            Some(existing) if existing.available != available => {}
            _ => return Ok(()),
        }

        let mut next = (*current).clone();
        if let Some(entry) = next.get_mut(name) {
            entry.available = available;
        }
        self.swap(next);
        self.publish(vec![CapabilityEventKind::AvailabilityChanged {
            name: name.to_string(),
            available,
        }]);
        Ok(())
    }

    async fn refresh(&self) -> Result<RefreshSummary, RegistryError> {
        let _writer = self.writer.lock().await;
        let current = self.current();
        let records = self.source.find_by_enabled(true)?;

        let mut next: HashMap<String, CapabilityEntry> = HashMap::new();
        for record in &records {
            for mut entry in CapabilityEntry::for_record(record) {
                if let Some(owner) = next.get(&entry.name) {
                    warn!(
                        capability = %entry.name,
                        plugin = %record.plugin_id,
                        owner = %owner.plugin_id,
                        "Capability declared by two enabled plugins, keeping the first"
                    );
                    continue;
                }
                if let Some(old) = current.get(&entry.name)
                    && old.plugin_id == entry.plugin_id
                {
                    entry.available = old.available;
                }
                next.insert(entry.name.clone(), entry);
            }
        }

        // Ordered diff so subscribers see a deterministic sequence.
        let mut summary = RefreshSummary {
            total: next.len(),
            ..RefreshSummary::default()
        };
        let mut events = BTreeMap::new();
        for (name, entry) in &next {
            match current.get(name) {
                None => {
                    summary.registered += 1;
                    events.insert(name.clone(), CapabilityEventKind::Registered(entry.clone()));
                }
                Some(old) if !old.same_metadata(entry) => {
                    summary.updated += 1;
                    events.insert(name.clone(), CapabilityEventKind::Updated(entry.clone()));
                }
                Some(_) => {}
            }
        }
        for (name, old) in current.iter() {
            if !next.contains_key(name) {
                summary.unregistered += 1;
                events.insert(
                    name.clone(),
                    CapabilityEventKind::Unregistered {
                        name: name.clone(),
                        plugin_id: old.plugin_id.clone(),
                    },
                );
            }
        }

        self.swap(next);
        self.publish(events.into_values().collect());

        info!(
            registered = summary.registered,
            updated = summary.updated,
            unregistered = summary.unregistered,
            total = summary.total,
            "Capability registry refreshed"
        );
        Ok(summary)
    }

    fn get_by_name(&self, name: &str) -> Option<CapabilityEntry> {
        self.current().get(name).cloned()
    }

    fn get_by_type(&self, kind: CapabilityType) -> Vec<CapabilityEntry> {
        sorted(self.current().values().filter(|e| e.kind == kind))
    }

    fn get_by_plugin(&self, plugin_id: &str) -> Vec<CapabilityEntry> {
        sorted(self.current().values().filter(|e| e.plugin_id == plugin_id))
    }

    fn get_all(&self) -> Vec<CapabilityEntry> {
        sorted(self.current().values())
    }

    fn subscribe(&self) -> mpsc::Receiver<CapabilityEvent> {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }
}

fn sorted<'a>(entries: impl Iterator<Item = &'a CapabilityEntry>) -> Vec<CapabilityEntry> {
    let mut out: Vec<_> = entries.cloned().collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}
