//! Core functionality for defining and running actors.
//!
//! An actor is a [`Behaviour`] paired with the state its [`init`](Behaviour::init) hook returns.
//! Each actor runs within its own Tokio task and processes its mailbox one envelope at a time, so
//! handlers have exclusive access to the state without locking.
//!
//! Failures are contained: an error returned from a handler, or a panic inside it, is reported to
//! the waiting caller (if any) and then handed to [`on_error`](Behaviour::on_error), which decides
//! whether the actor resumes, restarts in place, or stops and leaves recovery to its supervisor.
//!
//! # Lifecycle Hooks
//! - [`init`]: Called when the actor starts. Messages sent meanwhile are queued.
//! - [`receive`]: Called for each call and cast.
//! - [`handle_info`]: Called for exit signals from trapped links and monitor notifications.
//! - [`on_error`]: Called when a handler returns an error or panics.
//! - [`terminate`]: Called once before the actor is removed from the system.
//!
//! [`init`]: Behaviour::init
//! [`receive`]: Behaviour::receive
//! [`handle_info`]: Behaviour::handle_info
//! [`on_error`]: Behaviour::on_error
//! [`terminate`]: Behaviour::terminate

mod actor_ref;
mod id;
mod kind;
mod spawn;

use std::{any, future::Future};

use tokio::task_local;

use crate::{
    error::{ActorStopReason, BehaviourError, SystemError},
    message::{CorrelationId, Envelope, Info},
    supervision::{ChildSpec, SupervisorRecord, SupervisorSpec, SupervisorStatus},
    system::ActorSystem,
};

pub use actor_ref::*;
pub use id::*;
pub use spawn::SpawnOptions;

pub(crate) use kind::PendingReplies;
pub(crate) use spawn::{spawn_actor, Parent};

task_local! {
    pub(crate) static CURRENT_ACTOR_ID: ActorId;
}

/// Returns the id of the actor whose task is currently running, if any.
pub fn current_actor_id() -> Option<ActorId> {
    CURRENT_ACTOR_ID.try_with(|id| *id).ok()
}

/// What an actor should do after a handler failed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Recovery {
    /// Keep the current state and carry on with the next message.
    Resume,
    /// Stop with [`ActorStopReason::Failed`], leaving recovery to the supervisor.
    #[default]
    Stop,
    /// Discard the state and run [`Behaviour::init`] again, keeping the same id and mailbox.
    Restart,
}

/// The typed description of an actor.
///
/// A behaviour is shared between restarts of the same actor, and between every member of an
/// [`ActorPool`](crate::pool::ActorPool), so it holds configuration while per-actor data lives in
/// [`Self::State`].
///
/// # Example
///
/// ```
/// use std::convert::Infallible;
///
/// use kestrel::actor::{Behaviour, Context};
/// use kestrel::message::Envelope;
///
/// struct Counter;
///
/// enum CounterMsg {
///     Incr(u64),
///     Get,
/// }
///
/// impl Behaviour for Counter {
///     type State = u64;
///     type Msg = CounterMsg;
///     type Reply = u64;
///     type Error = Infallible;
///
///     async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<u64, Infallible> {
///         Ok(0)
///     }
///
///     async fn receive(
///         &self,
///         _ctx: &mut Context<'_, Self>,
///         count: &mut u64,
///         msg: Envelope<CounterMsg>,
///     ) -> Result<Option<u64>, Infallible> {
///         match msg.into_payload() {
///             CounterMsg::Incr(n) => {
///                 *count += n;
///                 Ok(None)
///             }
///             CounterMsg::Get => Ok(Some(*count)),
///         }
///     }
/// }
/// ```
pub trait Behaviour: Send + Sync + Sized + 'static {
    /// The per-actor state created by [`init`](Behaviour::init).
    type State: Send + 'static;
    /// The message type accepted by calls and casts.
    type Msg: Send + 'static;
    /// The reply type of calls.
    type Reply: Send + 'static;
    /// The error type returned by hooks.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The name of the actor, which can be useful for logging or debugging.
    ///
    /// # Default Implementation
    /// By default, this returns the type name of the behaviour.
    #[inline]
    fn name(&self) -> &'static str {
        any::type_name::<Self>()
    }

    /// The supervision strategy used when this actor supervises children.
    ///
    /// Takes precedence over the system default, but not over
    /// [`SpawnOptions::supervisor`].
    #[inline]
    fn supervisor_spec(&self) -> Option<SupervisorSpec> {
        None
    }

    /// Called when the actor starts, before it processes any messages.
    ///
    /// Calls and casts sent while `init` is running are queued and handled afterwards, in order.
    /// If `init` fails the actor stops with [`ActorStopReason::Failed`] without calling
    /// [`terminate`](Behaviour::terminate).
    fn init(
        &self,
        ctx: &mut Context<'_, Self>,
    ) -> impl Future<Output = Result<Self::State, Self::Error>> + Send;

    /// Called for each call and cast.
    ///
    /// For a call, returning `Ok(Some(reply))` replies immediately. Returning `Ok(None)` defers
    /// the reply: stash [`Envelope::correlation_id`] and answer later with [`Context::reply`].
    /// Replies returned for casts are discarded.
    fn receive(
        &self,
        ctx: &mut Context<'_, Self>,
        state: &mut Self::State,
        msg: Envelope<Self::Msg>,
    ) -> impl Future<Output = Result<Option<Self::Reply>, Self::Error>> + Send;

    /// Called for runtime notifications.
    ///
    /// Receives [`Info::Exit`] when trapping exits and a linked actor stops, and [`Info::Down`]
    /// when a monitored actor stops.
    #[allow(unused_variables)]
    #[inline]
    fn handle_info(
        &self,
        ctx: &mut Context<'_, Self>,
        state: &mut Self::State,
        info: Info,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }

    /// Called when a handler returns an error or panics.
    ///
    /// The failing caller has already received the error when this runs. An error or panic inside
    /// this hook stops the actor.
    ///
    /// # Default Implementation
    /// Returns [`Recovery::Stop`].
    #[allow(unused_variables)]
    #[inline]
    fn on_error(
        &self,
        ctx: &mut Context<'_, Self>,
        state: &mut Self::State,
        err: &BehaviourError,
    ) -> impl Future<Output = Result<Recovery, Self::Error>> + Send {
        async { Ok(Recovery::Stop) }
    }

    /// Called once before the actor is removed from the system.
    ///
    /// Supervised children have already been shut down when this runs.
    #[allow(unused_variables)]
    #[inline]
    fn terminate(
        &self,
        reason: &ActorStopReason,
        state: Self::State,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Provides access to the runtime from within a [`Behaviour`] hook.
pub struct Context<'a, B: Behaviour> {
    id: ActorId,
    system: &'a ActorSystem,
    pending: &'a mut PendingReplies<B::Reply>,
    supervision: &'a mut Option<SupervisorRecord>,
    supervisor_spec: SupervisorSpec,
    stop: &'a mut Option<ActorStopReason>,
}

impl<'a, B: Behaviour> Context<'a, B> {
    pub(crate) fn new(
        id: ActorId,
        system: &'a ActorSystem,
        pending: &'a mut PendingReplies<B::Reply>,
        supervision: &'a mut Option<SupervisorRecord>,
        supervisor_spec: SupervisorSpec,
        stop: &'a mut Option<ActorStopReason>,
    ) -> Self {
        Context {
            id,
            system,
            pending,
            supervision,
            supervisor_spec,
            stop,
        }
    }

    /// The id of this actor.
    pub fn id(&self) -> ActorId {
        self.id
    }

    /// A typed reference to this actor.
    pub fn actor_ref(&self) -> ActorRef<B> {
        ActorRef::new(self.id)
    }

    /// The system this actor runs in.
    pub fn system(&self) -> &'a ActorSystem {
        self.system
    }

    /// Answers a deferred call.
    ///
    /// Returns `false` if there is no caller waiting on `correlation_id`, because it was already
    /// answered, timed out, or was never issued to this actor. Such replies are dropped and counted
    /// as orphaned.
    pub fn reply(&mut self, correlation_id: CorrelationId, reply: B::Reply) -> bool {
        self.pending
            .deliver(self.system, self.id, correlation_id, Ok(reply))
    }

    /// Stops the actor normally once the current hook returns.
    pub fn stop(&mut self) {
        self.stop_with_reason(ActorStopReason::Normal);
    }

    /// Stops the actor with `reason` once the current hook returns.
    pub fn stop_with_reason(&mut self, reason: ActorStopReason) {
        *self.stop = Some(reason);
    }

    /// Spawns `spec` as a supervised child of this actor.
    ///
    /// The child is visible in [`children`](Context::children) as soon as this returns.
    pub fn start_child(&mut self, spec: ChildSpec) -> Result<ActorId, SystemError> {
        let child = spec.spawn(self.system, Parent::Direct(self.id))?;
        let supervisor_spec = self.supervisor_spec;
        self.supervision
            .get_or_insert_with(|| SupervisorRecord::new(supervisor_spec))
            .attach(child, spec);
        Ok(child)
    }

    /// The ids of this actor's supervised children, in the order they were added.
    pub fn children(&self) -> Vec<ActorId> {
        self.supervision
            .as_ref()
            .map(|record| record.children().collect())
            .unwrap_or_default()
    }

    /// The supervision status, if this actor supervises anything.
    pub fn supervisor_status(&self) -> Option<SupervisorStatus> {
        self.supervision.as_ref().map(SupervisorRecord::status)
    }
}

impl<B: Behaviour> std::fmt::Debug for Context<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("pending_replies", &self.pending.len())
            .field("children", &self.children())
            .finish()
    }
}
