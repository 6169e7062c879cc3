//! The actor directory: every live actor, indexed by id, plus the name registry.
//!
//! Ids are allocated from a generational [`Arena`], so a stale id never resolves to whichever
//! actor later reuses its slot. The whole directory sits behind a single lock in the
//! [`ActorSystem`](crate::system::ActorSystem). Cross-actor bookkeeping (links, monitors and
//! parent pointers) is therefore updated atomically with the removal of a terminated actor.

use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::stream::AbortHandle;
use tokio::sync::watch;

use crate::{
    actor::{ActorId, Behaviour, MonitorRef},
    error::{ActorStopReason, SystemError},
    mailbox::{MailboxSender, SignalMailbox},
    supervision::ChildSpec,
};

/// A generational slot map handing out [`ActorId`]s.
pub(crate) struct Arena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
    limit: usize,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Arena::with_limit(u32::MAX as usize)
    }

    /// An arena that allocates at most `limit` slots.
    pub(crate) fn with_limit(limit: usize) -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
            limit: limit.min(u32::MAX as usize),
        }
    }

    /// Stores `value`, returning `None` once every slot is live or retired.
    pub(crate) fn insert(&mut self, value: T) -> Option<ActorId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            self.len += 1;
            return Some(ActorId::new(index, slot.generation));
        }

        if self.slots.len() >= self.limit {
            return None;
        }
        let index = u32::try_from(self.slots.len()).ok()?;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        self.len += 1;
        Some(ActorId::new(index, 0))
    }

    pub(crate) fn get(&self, id: ActorId) -> Option<&T> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.value.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: ActorId) -> Option<&mut T> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.value.as_mut())
    }

    pub(crate) fn remove(&mut self, id: ActorId) -> Option<T> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let value = slot.value.take()?;
        self.len -= 1;
        // A slot that has exhausted its generations is retired
        if let Some(generation) = slot.generation.checked_add(1) {
            slot.generation = generation;
            self.free.push(id.index());
        }
        Some(value)
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ActorId, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value
                .as_ref()
                .map(|value| (ActorId::new(index as u32, slot.generation), value))
        })
    }
}

/// Everything the runtime knows about a live actor.
pub(crate) struct ActorEntry {
    pub(crate) name: &'static str,
    pub(crate) sequence: u64,
    /// The typed `MailboxSender<B>`, downcast when sending calls and casts.
    pub(crate) mailbox: Box<dyn Any + Send + Sync>,
    pub(crate) signals: Box<dyn SignalMailbox>,
    pub(crate) spec: ChildSpec,
    pub(crate) links: HashSet<ActorId>,
    /// Monitors watching this actor, by monitor ref, with the watching actor.
    pub(crate) monitored_by: HashMap<MonitorRef, ActorId>,
    /// Monitors this actor holds on others.
    pub(crate) monitoring: HashSet<MonitorRef>,
    pub(crate) parent: Option<ActorId>,
    pub(crate) stopped: watch::Receiver<Option<ActorStopReason>>,
    pub(crate) abort: AbortHandle,
}

impl ActorEntry {
    pub(crate) fn mailbox<B: Behaviour>(&self) -> Option<&MailboxSender<B>> {
        self.mailbox.downcast_ref()
    }
}

/// Live actors and registered names.
pub(crate) struct ActorRegistry {
    actors: Arena<ActorEntry>,
    names: HashMap<Arc<str>, ActorId>,
    total_spawned: u64,
}

impl ActorRegistry {
    pub(crate) fn new() -> Self {
        ActorRegistry::with_arena(Arena::new())
    }

    #[cfg(test)]
    pub(crate) fn with_limit(limit: usize) -> Self {
        ActorRegistry::with_arena(Arena::with_limit(limit))
    }

    fn with_arena(actors: Arena<ActorEntry>) -> Self {
        ActorRegistry {
            actors,
            names: HashMap::new(),
            total_spawned: 0,
        }
    }

    pub(crate) fn next_sequence(&self) -> u64 {
        self.total_spawned
    }

    pub(crate) fn insert(&mut self, entry: ActorEntry) -> Result<ActorId, SystemError> {
        let id = self
            .actors
            .insert(entry)
            .ok_or(SystemError::IdSpaceExhausted)?;
        self.total_spawned += 1;
        Ok(id)
    }

    pub(crate) fn get(&self, id: ActorId) -> Option<&ActorEntry> {
        self.actors.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: ActorId) -> Option<&mut ActorEntry> {
        self.actors.get_mut(id)
    }

    pub(crate) fn contains(&self, id: ActorId) -> bool {
        self.actors.get(id).is_some()
    }

    /// Removes an actor, releasing every name bound to it.
    pub(crate) fn remove(&mut self, id: ActorId) -> Option<ActorEntry> {
        let entry = self.actors.remove(id)?;
        self.names.retain(|_, bound| *bound != id);
        Some(entry)
    }

    /// Binds `name` to `id`, returning the id it was previously bound to.
    pub(crate) fn register(&mut self, name: Arc<str>, id: ActorId) -> Option<ActorId> {
        self.names.insert(name, id).filter(|previous| *previous != id)
    }

    pub(crate) fn unregister(&mut self, name: &str) -> Option<ActorId> {
        self.names.remove(name)
    }

    pub(crate) fn whereis(&self, name: &str) -> Option<ActorId> {
        self.names.get(name).copied()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = (&str, ActorId)> + '_ {
        self.names.iter().map(|(name, id)| (name.as_ref(), *id))
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = (ActorId, &ActorEntry)> + '_ {
        self.actors.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.actors.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.actors.len() == 0
    }

    pub(crate) fn total_spawned(&self) -> u64 {
        self.total_spawned
    }

    pub(crate) fn registered_names(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn queued_messages(&self) -> usize {
        self.actors
            .iter()
            .map(|(_, entry)| entry.signals.queued())
            .sum()
    }
}
