//! Erlang-style supervision.
//!
//! Any actor can supervise children, either by spawning them through
//! [`Context::start_child`](crate::actor::Context::start_child) or by adopting existing actors
//! with [`ActorSystem::supervise`](crate::system::ActorSystem::supervise). When a child exits
//! abnormally, the supervisor applies its [`RestartStrategy`]:
//!
//! - [`OneForOne`](RestartStrategy::OneForOne) restarts only the failed child.
//! - [`OneForAll`](RestartStrategy::OneForAll) stops and restarts every child.
//! - [`RestForOne`](RestartStrategy::RestForOne) stops and restarts the failed child and every
//!   child added after it.
//!
//! Siblings are stopped in reverse addition order, then every affected child is respawned in
//! addition order. Restarted children get a fresh [`ActorId`]; a name given at spawn time is bound
//! to the replacement.
//!
//! Restarts are counted in a sliding window. Once more than
//! [`max_restarts`](RestartIntensity::max_restarts) happen within
//! [`period`](RestartIntensity::period), the supervisor shuts down its remaining children and
//! stops itself with [`ActorStopReason::SupervisionLimitExceeded`], escalating the failure to its
//! own supervisor.
//!
//! The [`Supervisor`] behaviour packages this as a standalone actor with static children.

use std::{collections::VecDeque, fmt, ops::ControlFlow, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, trace, warn};

use crate::{
    actor::{spawn_actor, ActorId, Behaviour, Context, Parent, Recovery, SpawnOptions},
    error::{ActorStopReason, BehaviourError, SystemError},
    event::SystemEvent,
    message::Envelope,
    system::ActorSystem,
};

/// Which children a supervisor restarts when one of them fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartStrategy {
    /// Restart only the failed child.
    #[default]
    OneForOne,
    /// Restart every child.
    OneForAll,
    /// Restart the failed child and the children added after it.
    RestForOne,
}

/// How many restarts a supervisor tolerates within a sliding window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartIntensity {
    /// Restarts allowed within the window.
    pub max_restarts: u32,
    /// The window length.
    #[serde(rename = "period_secs", with = "crate::config::secs")]
    pub period: Duration,
}

impl RestartIntensity {
    /// Creates a new restart intensity.
    pub const fn new(max_restarts: u32, period: Duration) -> Self {
        RestartIntensity {
            max_restarts,
            period,
        }
    }
}

impl Default for RestartIntensity {
    fn default() -> Self {
        RestartIntensity::new(3, Duration::from_secs(5))
    }
}

/// A restart strategy together with its intensity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSpec {
    /// Which children to restart.
    pub strategy: RestartStrategy,
    /// How often restarts are tolerated.
    pub intensity: RestartIntensity,
}

impl SupervisorSpec {
    /// Creates a spec with the default intensity.
    pub fn new(strategy: RestartStrategy) -> Self {
        SupervisorSpec {
            strategy,
            intensity: RestartIntensity::default(),
        }
    }

    /// Sets the restart intensity.
    pub fn with_intensity(mut self, max_restarts: u32, period: Duration) -> Self {
        self.intensity = RestartIntensity::new(max_restarts, period);
        self
    }
}

/// The state of a supervisor's restart machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SupervisorStatus {
    /// Watching children.
    Running,
    /// Restarting children after a failure.
    Restarting,
    /// The restart intensity was exceeded and the failure is being escalated.
    Escalating,
    /// All children have been shut down.
    Stopped,
}

type SpawnFn = dyn Fn(&ActorSystem, Parent) -> Result<ActorId, SystemError> + Send + Sync;

/// Describes how to spawn, and later respawn, a child.
#[derive(Clone)]
pub struct ChildSpec {
    name: &'static str,
    spawn: Arc<SpawnFn>,
}

impl ChildSpec {
    /// A child spawned from `behaviour` with default options.
    pub fn new<B: Behaviour>(behaviour: B) -> Self {
        ChildSpec::with_options(behaviour, SpawnOptions::default())
    }

    /// A child spawned from `behaviour` with `options`.
    pub fn with_options<B: Behaviour>(behaviour: B, options: SpawnOptions) -> Self {
        ChildSpec::from_shared(Arc::new(behaviour), options)
    }

    pub(crate) fn from_shared<B: Behaviour>(behaviour: Arc<B>, options: SpawnOptions) -> Self {
        let name = behaviour.name();
        ChildSpec {
            name,
            spawn: Arc::new(move |system, parent| {
                spawn_actor(system, behaviour.clone(), options.clone(), parent)
                    .map(|actor_ref| actor_ref.id())
            }),
        }
    }

    /// The behaviour name of the child.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn spawn(
        &self,
        system: &ActorSystem,
        parent: Parent,
    ) -> Result<ActorId, SystemError> {
        (self.spawn)(system, parent)
    }
}

impl fmt::Debug for ChildSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSpec").field("name", &self.name).finish()
    }
}

struct Child {
    id: ActorId,
    spec: ChildSpec,
}

/// Restart timestamps within a sliding [`RestartIntensity`] window.
#[derive(Debug, Default)]
pub(crate) struct RestartWindow {
    restarts: VecDeque<Instant>,
}

impl RestartWindow {
    /// Records a restart at `now`, returning `true` if `intensity` has been exceeded.
    pub(crate) fn record(&mut self, intensity: RestartIntensity, now: Instant) -> bool {
        while let Some(oldest) = self.restarts.front() {
            if now.duration_since(*oldest) >= intensity.period {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.push_back(now);
        self.restarts.len() > intensity.max_restarts as usize
    }

    pub(crate) fn len(&self) -> usize {
        self.restarts.len()
    }
}

/// The supervision state kept by the engine for an actor with children.
pub(crate) struct SupervisorRecord {
    spec: SupervisorSpec,
    status: SupervisorStatus,
    children: Vec<Child>,
    restarts: RestartWindow,
}

impl SupervisorRecord {
    pub(crate) fn new(spec: SupervisorSpec) -> Self {
        SupervisorRecord {
            spec,
            status: SupervisorStatus::Running,
            children: Vec::new(),
            restarts: RestartWindow::default(),
        }
    }

    pub(crate) fn status(&self) -> SupervisorStatus {
        self.status
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.children.iter().map(|child| child.id)
    }

    pub(crate) fn attach(&mut self, id: ActorId, spec: ChildSpec) {
        if self.children.iter().any(|child| child.id == id) {
            return;
        }
        if self.status == SupervisorStatus::Stopped {
            self.status = SupervisorStatus::Running;
        }
        self.children.push(Child { id, spec });
    }

    fn transition(&mut self, supervisor: ActorId, status: SupervisorStatus) {
        if self.status != status {
            trace!(%supervisor, from = ?self.status, to = ?status, "supervisor status changed");
            self.status = status;
        }
    }

    /// Records a restart, returning `true` if the intensity has been exceeded.
    fn record_restart(&mut self, now: Instant) -> bool {
        self.restarts.record(self.spec.intensity, now)
    }

    pub(crate) async fn on_child_exit(
        &mut self,
        system: &ActorSystem,
        supervisor: ActorId,
        child: ActorId,
        reason: ActorStopReason,
    ) -> ControlFlow<ActorStopReason> {
        let Some(idx) = self.children.iter().position(|c| c.id == child) else {
            // Stale exit from a child that was already replaced or detached
            return ControlFlow::Continue(());
        };

        if !reason.is_abnormal() {
            trace!(%supervisor, %child, %reason, "child exited");
            self.children.remove(idx);
            return ControlFlow::Continue(());
        }

        if self.record_restart(Instant::now()) {
            let restarts = self.restarts.len();
            warn!(%supervisor, %child, %reason, restarts, "restart intensity exceeded, escalating");
            self.transition(supervisor, SupervisorStatus::Escalating);
            self.children.remove(idx);
            system.emit(SystemEvent::SupervisorEscalated {
                supervisor,
                restarts,
            });
            self.shutdown_children(system, supervisor).await;
            return ControlFlow::Break(ActorStopReason::SupervisionLimitExceeded {
                restarts,
                period: self.spec.intensity.period,
            });
        }

        self.transition(supervisor, SupervisorStatus::Restarting);
        let affected = match self.spec.strategy {
            RestartStrategy::OneForOne => idx..idx + 1,
            RestartStrategy::OneForAll => 0..self.children.len(),
            RestartStrategy::RestForOne => idx..self.children.len(),
        };

        for i in affected.clone().rev() {
            if i != idx {
                let sibling = self.children[i].id;
                system.detach_child(sibling, supervisor);
                system.stop_id(sibling, ActorStopReason::Shutdown).await;
            }
        }

        for i in affected {
            let old = self.children[i].id;
            let new = match self.children[i].spec.spawn(system, Parent::Direct(supervisor)) {
                Ok(new) => new,
                Err(err) => {
                    error!(%supervisor, %old, %err, "failed to restart child");
                    self.children.remove(i);
                    self.shutdown_children(system, supervisor).await;
                    return ControlFlow::Break(ActorStopReason::Failed(BehaviourError::new(err)));
                }
            };
            self.children[i].id = new;
            trace!(%supervisor, %old, %new, "child restarted");
            system.record_restart(supervisor, old, new);
        }

        self.transition(supervisor, SupervisorStatus::Running);
        ControlFlow::Continue(())
    }

    /// Stops every child in reverse addition order.
    pub(crate) async fn shutdown_children(&mut self, system: &ActorSystem, supervisor: ActorId) {
        while let Some(child) = self.children.pop() {
            system.detach_child(child.id, supervisor);
            system.stop_id(child.id, ActorStopReason::Shutdown).await;
        }
        self.transition(supervisor, SupervisorStatus::Stopped);
    }
}

/// A standalone supervisor actor.
///
/// Children given to [`Supervisor::child`] are spawned in `init`, so when the supervisor itself is
/// restarted it rebuilds its whole subtree.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use kestrel::supervision::{RestartStrategy, Supervisor, SupervisorMsg, SupervisorReply, SupervisorSpec};
/// use kestrel::system::ActorSystem;
///
/// # tokio_test::block_on(async {
/// let system = ActorSystem::new();
/// let supervisor = system.spawn(
///     Supervisor::new(SupervisorSpec::new(RestartStrategy::OneForAll).with_intensity(5, Duration::from_secs(10))),
/// );
/// let reply = system.call(&supervisor, SupervisorMsg::WhichChildren).await?;
/// assert!(matches!(reply, SupervisorReply::Children(children) if children.is_empty()));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # });
/// ```
#[derive(Debug, Default)]
pub struct Supervisor {
    spec: SupervisorSpec,
    children: Vec<ChildSpec>,
}

impl Supervisor {
    /// Creates a supervisor with no static children.
    pub fn new(spec: SupervisorSpec) -> Self {
        Supervisor {
            spec,
            children: Vec::new(),
        }
    }

    /// Adds a static child.
    pub fn child(mut self, spec: ChildSpec) -> Self {
        self.children.push(spec);
        self
    }
}

/// Messages understood by [`Supervisor`].
#[derive(Debug)]
pub enum SupervisorMsg {
    /// Spawns and supervises a new child.
    StartChild(ChildSpec),
    /// Lists the current children.
    WhichChildren,
}

/// Replies sent by [`Supervisor`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SupervisorReply {
    /// The id of a newly started child.
    Started(ActorId),
    /// The current children, in addition order.
    Children(Vec<ActorId>),
}

impl Behaviour for Supervisor {
    type State = ();
    type Msg = SupervisorMsg;
    type Reply = SupervisorReply;
    type Error = SystemError;

    fn name(&self) -> &'static str {
        "Supervisor"
    }

    fn supervisor_spec(&self) -> Option<SupervisorSpec> {
        Some(self.spec)
    }

    async fn init(&self, ctx: &mut Context<'_, Self>) -> Result<(), SystemError> {
        for spec in &self.children {
            ctx.start_child(spec.clone())?;
        }
        Ok(())
    }

    async fn receive(
        &self,
        ctx: &mut Context<'_, Self>,
        _state: &mut (),
        msg: Envelope<SupervisorMsg>,
    ) -> Result<Option<SupervisorReply>, SystemError> {
        let reply = match msg.into_payload() {
            SupervisorMsg::StartChild(spec) => SupervisorReply::Started(ctx.start_child(spec)?),
            SupervisorMsg::WhichChildren => SupervisorReply::Children(ctx.children()),
        };
        Ok(Some(reply))
    }

    /// A child that fails to start is reported to the caller and the supervisor keeps running.
    async fn on_error(
        &self,
        _ctx: &mut Context<'_, Self>,
        _state: &mut (),
        _err: &BehaviourError,
    ) -> Result<Recovery, SystemError> {
        Ok(Recovery::Resume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_window_slides() {
        let mut record = SupervisorRecord::new(
            SupervisorSpec::new(RestartStrategy::OneForOne).with_intensity(2, Duration::from_secs(10)),
        );
        let start = Instant::now();
        assert!(!record.record_restart(start));
        assert!(!record.record_restart(start + Duration::from_secs(1)));
        assert!(record.record_restart(start + Duration::from_secs(2)));

        // the first two restarts have left the window
        assert!(!record.record_restart(start + Duration::from_millis(11_500)));
        assert_eq!(record.restarts.len(), 2);
    }

    #[test]
    fn zero_intensity_escalates_on_first_failure() {
        let mut record = SupervisorRecord::new(
            SupervisorSpec::new(RestartStrategy::OneForAll).with_intensity(0, Duration::from_secs(1)),
        );
        assert!(record.record_restart(Instant::now()));
    }

    #[test]
    fn strategies_serialize_in_kebab_case() -> Result<(), serde_json::Error> {
        assert_eq!(
            serde_json::to_string(&RestartStrategy::OneForAll)?,
            r#""one-for-all""#
        );
        assert_eq!(
            serde_json::from_str::<RestartStrategy>(r#""rest-for-one""#)?,
            RestartStrategy::RestForOne
        );
        Ok(())
    }
}
