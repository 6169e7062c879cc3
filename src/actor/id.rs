use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for an actor within an [`ActorSystem`](crate::system::ActorSystem).
///
/// `ActorId` is handed out by a generational arena. The `index` names a slot in the system's
/// directory, and the `generation` distinguishes successive occupants of that slot. A slot whose
/// generation would overflow is retired, so an id is never handed to a second actor for the
/// lifetime of the system.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActorId {
    index: u32,
    generation: u32,
}

impl ActorId {
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        ActorId { index, generation }
    }

    /// Returns the directory slot this id points at.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Returns the generation of the slot at the time this id was allocated.
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({}:{})", self.index, self.generation)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({:?}:{:?})", self.index, self.generation)
    }
}

/// A handle to a monitor installed with [`ActorSystem::monitor`](crate::system::ActorSystem::monitor).
///
/// The same handle is delivered back in [`Info::Down`](crate::message::Info::Down) when the
/// monitored actor terminates, and can be passed to
/// [`ActorSystem::demonitor`](crate::system::ActorSystem::demonitor) to remove the monitor early.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonitorRef {
    seq: u64,
    target: ActorId,
}

impl MonitorRef {
    pub(crate) const fn new(seq: u64, target: ActorId) -> Self {
        MonitorRef { seq, target }
    }

    /// The actor being monitored.
    pub fn target(&self) -> ActorId {
        self.target
    }
}

impl fmt::Display for MonitorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MonitorRef({} -> {})", self.seq, self.target)
    }
}

impl fmt::Debug for MonitorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MonitorRef({:?}, {:?})", self.seq, self.target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_index_and_generation() {
        assert_eq!(ActorId::new(3, 7).to_string(), "ActorId(3:7)");
    }

    #[test]
    fn ids_with_same_index_differ_by_generation() {
        let first = ActorId::new(0, 0);
        let second = ActorId::new(0, 1);
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn serializes_as_struct() -> Result<(), serde_json::Error> {
        let id = ActorId::new(4, 2);
        let json = serde_json::to_string(&id)?;
        assert_eq!(json, r#"{"index":4,"generation":2}"#);
        assert_eq!(serde_json::from_str::<ActorId>(&json)?, id);
        Ok(())
    }
}
