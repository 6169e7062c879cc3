//! Runtime events published by an [`ActorSystem`](crate::system::ActorSystem).
//!
//! Events are sent on a Tokio broadcast channel. A subscriber that falls more than
//! [`event_capacity`](crate::config::SystemConfig::event_capacity) events behind skips the
//! oldest ones.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{actor::ActorId, error::ActorStopReason, error::SendError};

/// Something that happened inside the actor system.
#[derive(Clone, Debug)]
pub enum SystemEvent {
    /// An actor was spawned.
    ActorSpawned {
        /// The new actor.
        id: ActorId,
        /// Its behaviour name.
        name: &'static str,
    },
    /// An actor stopped and was removed from the directory.
    ActorStopped {
        /// The stopped actor.
        id: ActorId,
        /// Its behaviour name.
        name: &'static str,
        /// Why it stopped.
        reason: ActorStopReason,
    },
    /// A name was bound to an actor.
    ActorRegistered {
        /// The name.
        name: Arc<str>,
        /// The actor it now resolves to.
        id: ActorId,
    },
    /// A call failed.
    CallFailed {
        /// The failure.
        error: SendError,
    },
    /// A cast could not be enqueued.
    CastFailed {
        /// The failure.
        error: SendError,
    },
    /// An existing actor was placed under a supervisor.
    SupervisorAttached {
        /// The supervisor.
        supervisor: ActorId,
        /// The child.
        child: ActorId,
    },
    /// A supervisor replaced a child.
    ChildRestarted {
        /// The supervisor.
        supervisor: ActorId,
        /// The id of the child that stopped.
        old: ActorId,
        /// The id of its replacement.
        new: ActorId,
    },
    /// A supervisor exceeded its restart intensity and is stopping.
    SupervisorEscalated {
        /// The supervisor.
        supervisor: ActorId,
        /// Restarts counted within the window.
        restarts: usize,
    },
    /// A periodic metrics snapshot.
    Metrics(MetricsSnapshot),
}

/// Point-in-time counters for an actor system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Actors spawned since the system was created.
    pub total_spawned: u64,
    /// Actors currently alive.
    pub active: usize,
    /// Names currently bound.
    pub registered_names: usize,
    /// Calls and casts waiting in mailboxes.
    pub queued_messages: usize,
    /// Calls enqueued.
    pub calls: u64,
    /// Casts enqueued.
    pub casts: u64,
    /// Calls that timed out.
    pub call_timeouts: u64,
    /// Replies produced after their caller had gone.
    pub orphaned_replies: u64,
    /// Children restarted by supervisors.
    pub restarts: u64,
    /// Resource usage of the host process, sampled by the metrics ticker.
    ///
    /// Snapshots taken with [`ActorSystem::metrics`](crate::system::ActorSystem::metrics) leave
    /// this empty.
    pub process: Option<ProcessUsage>,
}

/// Memory and CPU usage of the process running the actor system.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// CPU usage since the previous sample, as a percentage of one core.
    pub cpu_percent: f32,
}
