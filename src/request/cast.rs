use std::future::{self, IntoFuture};

use crate::{
    actor::{current_actor_id, ActorRef, Behaviour},
    error::SendError,
    event::SystemEvent,
    message::Envelope,
    system::ActorSystem,
};

/// A request to send a message to an actor without any reply.
#[must_use = "request won't be sent without awaiting, or calling a send method"]
pub struct CastRequest<'a, B: Behaviour> {
    system: &'a ActorSystem,
    actor_ref: ActorRef<B>,
    msg: B::Msg,
}

impl<'a, B: Behaviour> CastRequest<'a, B> {
    pub(crate) fn new(system: &'a ActorSystem, actor_ref: ActorRef<B>, msg: B::Msg) -> Self {
        CastRequest {
            system,
            actor_ref,
            msg,
        }
    }

    /// Enqueues the message.
    ///
    /// Succeeds once the message is in the mailbox, which says nothing about whether the actor
    /// will handle it successfully.
    pub fn send(self) -> Result<(), SendError> {
        let CastRequest {
            system,
            actor_ref,
            msg,
        } = self;
        let id = actor_ref.id();

        let res = system
            .mailbox::<B>(id)
            .ok_or(SendError::ActorNotFound(id))
            .and_then(|mailbox| {
                mailbox
                    .try_send_message(Envelope::cast(msg, current_actor_id()), None)
                    .map_err(|err| err.into_send_error(id))
            });

        match &res {
            Ok(()) => system.record_cast(),
            Err(err) => system.emit(SystemEvent::CastFailed { error: err.clone() }),
        }
        res
    }
}

impl<B: Behaviour> IntoFuture for CastRequest<'_, B> {
    type Output = Result<(), SendError>;
    type IntoFuture = future::Ready<Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        future::ready(self.send())
    }
}

impl<B: Behaviour> std::fmt::Debug for CastRequest<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CastRequest")
            .field("actor_ref", &self.actor_ref)
            .finish()
    }
}
