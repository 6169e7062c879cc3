//! Defines error handling constructs for kestrel.
//!
//! Every failure a caller can observe carries an [`ErrorKind`] and the [`ActorId`] it concerns.
//! Failures raised inside an actor are wrapped in a [`BehaviourError`], which is cheap to clone so
//! the same failure can be handed to a waiting caller, the actor's `on_error` hook and the
//! supervisor that eventually observes the exit.

use std::{
    any::Any,
    error, fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;

use crate::{actor::ActorId, message::CorrelationId};

/// A dyn boxed error.
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// The closed set of failure categories surfaced by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The target actor does not exist, or has already stopped.
    ActorNotFound,
    /// The target's bounded mailbox is at capacity.
    MailboxFull,
    /// No reply arrived within the call timeout.
    CallTimeout,
    /// The actor's handler returned an error or panicked.
    BehaviourError,
    /// A supervisor exceeded its restart intensity.
    SupervisionLimitExceeded,
    /// The actor dropped the call without replying, usually because it stopped.
    NoReply,
}

/// Error that can occur when sending a message to an actor.
#[derive(Clone, Debug, Error)]
pub enum SendError {
    /// The actor does not exist, or stopped before the message could be queued.
    #[error("actor {0} not found")]
    ActorNotFound(ActorId),
    /// The actor's mailbox is full.
    #[error("mailbox of actor {0} is full")]
    MailboxFull(ActorId),
    /// Timed out waiting for a reply.
    #[error("call {correlation_id} to actor {id} timed out after {timeout:?}")]
    CallTimeout {
        /// The actor that was called.
        id: ActorId,
        /// The correlation id of the abandoned call.
        correlation_id: CorrelationId,
        /// The timeout that elapsed.
        timeout: Duration,
    },
    /// The actor failed while handling the call.
    #[error("actor {id} failed handling the call: {error}")]
    Behaviour {
        /// The actor that failed.
        id: ActorId,
        /// The underlying failure.
        error: BehaviourError,
    },
    /// The actor stopped without replying to the call.
    #[error("actor {0} stopped before replying")]
    NoReply(ActorId),
}

impl SendError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SendError::ActorNotFound(_) => ErrorKind::ActorNotFound,
            SendError::MailboxFull(_) => ErrorKind::MailboxFull,
            SendError::CallTimeout { .. } => ErrorKind::CallTimeout,
            SendError::Behaviour { .. } => ErrorKind::BehaviourError,
            SendError::NoReply(_) => ErrorKind::NoReply,
        }
    }

    /// Returns the id of the actor the message was addressed to.
    pub fn actor_id(&self) -> ActorId {
        match self {
            SendError::ActorNotFound(id)
            | SendError::MailboxFull(id)
            | SendError::NoReply(id)
            | SendError::CallTimeout { id, .. }
            | SendError::Behaviour { id, .. } => *id,
        }
    }

    /// Returns the behaviour failure, if the actor failed handling the message.
    pub fn behaviour_error(&self) -> Option<&BehaviourError> {
        match self {
            SendError::Behaviour { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Errors returned by directory, link and supervision operations on the
/// [`ActorSystem`](crate::system::ActorSystem).
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SystemError {
    /// The actor does not exist.
    #[error("actor {0} not found")]
    ActorNotFound(ActorId),
    /// A name resolved to an actor of a different behaviour type.
    #[error("actor {id} is not a `{expected}`")]
    BadActorType {
        /// The actor the name resolved to.
        id: ActorId,
        /// The behaviour type the caller asked for.
        expected: &'static str,
    },
    /// The child is already supervised by another supervisor.
    #[error("actor {child} is already supervised by {supervisor}")]
    AlreadySupervised {
        /// The child.
        child: ActorId,
        /// Its existing supervisor.
        supervisor: ActorId,
    },
    /// An actor was asked to link to, monitor or supervise itself.
    #[error("actor {0} cannot reference itself")]
    SelfReference(ActorId),
    /// A pool was created or resized to zero members.
    #[error("actor pool size must be at least 1")]
    InvalidPoolSize,
    /// Every actor id is in use or retired.
    #[error("actor id space exhausted")]
    IdSpaceExhausted,
}

/// Errors returned by the [`PubSub`](crate::pubsub::PubSub) bus.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BusError {
    /// A glob pattern failed to compile.
    #[error("invalid topic pattern `{pattern}`: {reason}")]
    InvalidPattern {
        /// The pattern as provided.
        pattern: String,
        /// Why it failed to compile.
        reason: &'static str,
    },
}

/// Reason for an actor being stopped.
#[derive(Clone)]
pub enum ActorStopReason {
    /// Actor stopped normally.
    Normal,
    /// Actor was stopped by its supervisor or by a system shutdown.
    Shutdown,
    /// Actor was killed.
    Killed,
    /// A handler or hook returned an error, or panicked, and the actor did not recover.
    Failed(BehaviourError),
    /// A linked actor died abnormally and this actor was not trapping exits.
    LinkDied {
        /// Actor ID.
        id: ActorId,
        /// Actor died reason.
        reason: Box<ActorStopReason>,
    },
    /// The actor was a supervisor whose children failed too often.
    SupervisionLimitExceeded {
        /// Restarts seen within the window, including the one that tripped the limit.
        restarts: usize,
        /// The sliding window length.
        period: Duration,
    },
    /// An application defined reason.
    Custom(Arc<str>),
}

impl ActorStopReason {
    /// Creates a [`ActorStopReason::Custom`] reason.
    pub fn custom(reason: impl Into<Arc<str>>) -> Self {
        ActorStopReason::Custom(reason.into())
    }

    /// Whether this reason counts as a failure.
    ///
    /// Only [`Normal`](ActorStopReason::Normal) and [`Shutdown`](ActorStopReason::Shutdown) are
    /// considered normal. Abnormal exits propagate across links and trigger supervisor restarts.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, ActorStopReason::Normal | ActorStopReason::Shutdown)
    }

    /// Returns the error category for reasons that represent one.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ActorStopReason::Failed(_) => Some(ErrorKind::BehaviourError),
            ActorStopReason::SupervisionLimitExceeded { .. } => {
                Some(ErrorKind::SupervisionLimitExceeded)
            }
            _ => None,
        }
    }
}

impl fmt::Debug for ActorStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorStopReason::Normal => write!(f, "Normal"),
            ActorStopReason::Shutdown => write!(f, "Shutdown"),
            ActorStopReason::Killed => write!(f, "Killed"),
            ActorStopReason::Failed(err) => f.debug_tuple("Failed").field(err).finish(),
            ActorStopReason::LinkDied { id, reason } => f
                .debug_struct("LinkDied")
                .field("id", id)
                .field("reason", &reason)
                .finish(),
            ActorStopReason::SupervisionLimitExceeded { restarts, period } => f
                .debug_struct("SupervisionLimitExceeded")
                .field("restarts", restarts)
                .field("period", period)
                .finish(),
            ActorStopReason::Custom(reason) => f.debug_tuple("Custom").field(reason).finish(),
        }
    }
}

impl fmt::Display for ActorStopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorStopReason::Normal => write!(f, "actor stopped normally"),
            ActorStopReason::Shutdown => write!(f, "actor was shut down"),
            ActorStopReason::Killed => write!(f, "actor was killed"),
            ActorStopReason::Failed(err) => write!(f, "actor failed: {err}"),
            ActorStopReason::LinkDied { id, reason: _ } => {
                write!(f, "link {id} died")
            }
            ActorStopReason::SupervisionLimitExceeded { restarts, period } => {
                write!(f, "{restarts} restarts within {period:?} exceeded the supervision limit")
            }
            ActorStopReason::Custom(reason) => write!(f, "{reason}"),
        }
    }
}

/// A shared failure raised by an actor, either a returned error or a panic payload.
#[derive(Clone)]
pub struct BehaviourError(Arc<Repr>);

enum Repr {
    Error(BoxError),
    Panic(Mutex<Box<dyn Any + Send>>),
}

impl BehaviourError {
    /// Wraps an error returned by a behaviour.
    pub fn new<E>(err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        BehaviourError(Arc::new(Repr::Error(Box::new(err))))
    }

    /// Wraps an already boxed error.
    pub fn new_boxed(err: BoxError) -> Self {
        BehaviourError(Arc::new(Repr::Error(err)))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        BehaviourError(Arc::new(Repr::Panic(Mutex::new(payload))))
    }

    /// Whether the failure was a panic.
    pub fn is_panic(&self) -> bool {
        matches!(*self.0, Repr::Panic(_))
    }

    /// Returns a reference to the returned error if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: error::Error + 'static,
    {
        match &*self.0 {
            Repr::Error(err) => err.downcast_ref::<E>(),
            Repr::Panic(_) => None,
        }
    }

    /// Returns the panic message, if the failure was a panic with a string payload.
    pub fn panic_message(&self) -> Option<String> {
        match &*self.0 {
            Repr::Error(_) => None,
            Repr::Panic(payload) => {
                // Types are strings if panicked with the `std::panic!` macro
                let payload = payload.lock().unwrap_or_else(PoisonError::into_inner);
                payload
                    .downcast_ref::<&'static str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
            }
        }
    }
}

impl fmt::Debug for BehaviourError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            Repr::Error(err) => f.debug_tuple("BehaviourError").field(err).finish(),
            Repr::Panic(_) => f
                .debug_tuple("BehaviourError")
                .field(&format_args!("{self}"))
                .finish(),
        }
    }
}

impl fmt::Display for BehaviourError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            Repr::Error(err) => fmt::Display::fmt(err, f),
            Repr::Panic(_) => match self.panic_message() {
                Some(msg) => write!(f, "panicked: {msg}"),
                None => write!(f, "panicked"),
            },
        }
    }
}

impl error::Error for BehaviourError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &*self.0 {
            Repr::Error(err) => Some(err.as_ref()),
            Repr::Panic(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic;

    use super::*;

    #[derive(Debug, Error, PartialEq)]
    #[error("bad input {0}")]
    struct BadInput(u32);

    #[test]
    fn abnormal_reasons() {
        assert!(!ActorStopReason::Normal.is_abnormal());
        assert!(!ActorStopReason::Shutdown.is_abnormal());
        assert!(ActorStopReason::Killed.is_abnormal());
        assert!(ActorStopReason::custom("boom").is_abnormal());
        assert!(ActorStopReason::Failed(BehaviourError::new(BadInput(1))).is_abnormal());
    }

    #[test]
    fn behaviour_error_downcasts_returned_errors() {
        let err = BehaviourError::new(BadInput(7));
        assert!(!err.is_panic());
        assert_eq!(err.downcast_ref::<BadInput>(), Some(&BadInput(7)));
        assert_eq!(err.to_string(), "bad input 7");

        let cloned = err.clone();
        assert_eq!(cloned.downcast_ref::<BadInput>(), Some(&BadInput(7)));
    }

    #[test]
    fn behaviour_error_reads_panic_payloads() {
        let payload = panic::catch_unwind(|| panic!("exploded")).unwrap_err();
        let err = BehaviourError::from_panic(payload);
        assert!(err.is_panic());
        assert_eq!(err.panic_message().as_deref(), Some("exploded"));
        assert_eq!(err.to_string(), "panicked: exploded");
        assert!(err.downcast_ref::<BadInput>().is_none());
    }

    #[test]
    fn send_error_exposes_kind_and_actor() {
        let id = ActorId::new(2, 0);
        let err = SendError::CallTimeout {
            id,
            correlation_id: CorrelationId::new(9),
            timeout: Duration::from_millis(5),
        };
        assert_eq!(err.kind(), ErrorKind::CallTimeout);
        assert_eq!(err.actor_id(), id);
        assert_eq!(SendError::MailboxFull(id).kind(), ErrorKind::MailboxFull);
    }
}
