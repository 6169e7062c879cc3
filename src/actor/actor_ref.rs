use std::{cmp, fmt, hash, marker::PhantomData};

use super::ActorId;

/// A typed handle to an actor.
///
/// An `ActorRef` is only an [`ActorId`] plus the actor's behaviour type. It does not keep the
/// actor alive, and it is resolved through the directory on each send. Sending to a stopped actor
/// therefore fails with [`SendError::ActorNotFound`](crate::error::SendError::ActorNotFound),
/// even if the slot has since been reused by another actor.
pub struct ActorRef<B> {
    id: ActorId,
    phantom: PhantomData<fn() -> B>,
}

impl<B> ActorRef<B> {
    pub(crate) const fn new(id: ActorId) -> Self {
        ActorRef {
            id,
            phantom: PhantomData,
        }
    }

    /// Returns the id of the actor.
    pub fn id(&self) -> ActorId {
        self.id
    }
}

impl<B> Clone for ActorRef<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for ActorRef<B> {}

impl<B> PartialEq for ActorRef<B> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<B> Eq for ActorRef<B> {}

impl<B> PartialOrd for ActorRef<B> {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<B> Ord for ActorRef<B> {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<B> hash::Hash for ActorRef<B> {
    fn hash<H: hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<B> fmt::Debug for ActorRef<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("id", &self.id)
            .field("behaviour", &std::any::type_name::<B>())
            .finish()
    }
}

impl<B> fmt::Display for ActorRef<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

impl<B> From<ActorRef<B>> for ActorId {
    fn from(actor_ref: ActorRef<B>) -> Self {
        actor_ref.id
    }
}

impl<B> From<&ActorRef<B>> for ActorId {
    fn from(actor_ref: &ActorRef<B>) -> Self {
        actor_ref.id
    }
}
