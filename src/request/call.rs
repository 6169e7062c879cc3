use std::{future::IntoFuture, time::Duration};

use futures::{future::BoxFuture, FutureExt};
use tokio::{sync::oneshot, time};
use tracing::warn;

use crate::{
    actor::{current_actor_id, ActorId, ActorRef, Behaviour},
    error::{BehaviourError, SendError},
    event::SystemEvent,
    message::{CorrelationId, Envelope},
    system::ActorSystem,
};

/// A request to send a message to an actor, waiting for a reply.
#[must_use = "request won't be sent without awaiting, or calling a send method"]
pub struct CallRequest<'a, B: Behaviour> {
    system: &'a ActorSystem,
    actor_ref: ActorRef<B>,
    msg: B::Msg,
    timeout: Option<Duration>,
}

impl<'a, B: Behaviour> CallRequest<'a, B> {
    pub(crate) fn new(system: &'a ActorSystem, actor_ref: ActorRef<B>, msg: B::Msg) -> Self {
        CallRequest {
            system,
            actor_ref,
            msg,
            timeout: None,
        }
    }

    /// Sets the reply timeout, overriding the system's
    /// [`call_timeout`](crate::config::SystemConfig::call_timeout).
    ///
    /// A zero timeout still gives an already available reply a chance to be received.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Enqueues the call without waiting for the reply.
    pub fn enqueue(self) -> Result<PendingCall<'a, B>, SendError> {
        let CallRequest {
            system,
            actor_ref,
            msg,
            timeout,
        } = self;
        let id = actor_ref.id();
        let timeout = timeout.unwrap_or(system.config().call_timeout);

        let res: Result<PendingCall<'a, B>, SendError> = (|| {
            let mailbox = system
                .mailbox::<B>(id)
                .ok_or(SendError::ActorNotFound(id))?;
            let from = current_actor_id();
            if from == Some(id) {
                warn!(%id, "actor is calling itself, the call will time out");
            }

            let correlation_id = system.next_correlation_id();
            let (reply_tx, reply_rx) = oneshot::channel();
            mailbox
                .try_send_message(Envelope::call(msg, from, correlation_id), Some(reply_tx))
                .map_err(|err| err.into_send_error(id))?;
            system.record_call();

            Ok(PendingCall {
                system,
                id,
                correlation_id,
                timeout,
                reply_rx,
            })
        })();

        if let Err(err) = &res {
            system.emit(SystemEvent::CallFailed { error: err.clone() });
        }
        res
    }

    /// Sends the call and waits for the reply.
    pub async fn send(self) -> Result<B::Reply, SendError> {
        self.enqueue()?.recv().await
    }
}

impl<'a, B: Behaviour> IntoFuture for CallRequest<'a, B> {
    type Output = Result<B::Reply, SendError>;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.send().boxed()
    }
}

impl<B: Behaviour> std::fmt::Debug for CallRequest<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRequest")
            .field("actor_ref", &self.actor_ref)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A call that has been enqueued and whose reply has not yet been awaited.
///
/// The reply timeout starts when this is awaited.
#[must_use = "reply won't be received without awaiting"]
pub struct PendingCall<'a, B: Behaviour> {
    system: &'a ActorSystem,
    id: ActorId,
    correlation_id: CorrelationId,
    timeout: Duration,
    reply_rx: oneshot::Receiver<Result<B::Reply, BehaviourError>>,
}

impl<'a, B: Behaviour> PendingCall<'a, B> {
    /// The correlation id of the call.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Waits for the reply.
    pub async fn recv(self) -> Result<B::Reply, SendError> {
        let PendingCall {
            system,
            id,
            correlation_id,
            timeout,
            reply_rx,
        } = self;

        let res = match time::timeout(timeout, reply_rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(error))) => Err(SendError::Behaviour { id, error }),
            Ok(Err(_)) => Err(SendError::NoReply(id)), // The reply slot was dropped
            Err(_) => {
                system.record_call_timeout();
                Err(SendError::CallTimeout {
                    id,
                    correlation_id,
                    timeout,
                })
            }
        };

        if let Err(err) = &res {
            system.emit(SystemEvent::CallFailed { error: err.clone() });
        }
        res
    }
}

impl<'a, B: Behaviour> IntoFuture for PendingCall<'a, B> {
    type Output = Result<B::Reply, SendError>;
    type IntoFuture = BoxFuture<'a, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        self.recv().boxed()
    }
}

impl<B: Behaviour> std::fmt::Debug for PendingCall<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("correlation_id", &self.correlation_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}
