#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod actor;
pub mod config;
pub mod error;
pub mod event;
pub mod mailbox;
pub mod message;
pub mod pool;
pub mod pubsub;
mod registry;
pub mod request;
pub mod supervision;
pub mod system;

pub use actor::{ActorId, ActorRef, Behaviour, Context};
pub use system::ActorSystem;

/// Commonly used types, for glob importing.
pub mod prelude {
    pub use crate::actor::{ActorId, ActorRef, Behaviour, Context, Recovery, SpawnOptions};
    pub use crate::config::SystemConfig;
    pub use crate::error::{ActorStopReason, BehaviourError, SendError, SystemError};
    pub use crate::mailbox::MailboxConfig;
    pub use crate::message::{Envelope, Info};
    pub use crate::pool::ActorPool;
    pub use crate::pubsub::{PubSub, Published};
    pub use crate::supervision::{ChildSpec, RestartStrategy, Supervisor, SupervisorSpec};
    pub use crate::system::ActorSystem;
}
