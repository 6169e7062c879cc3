use std::sync::Arc;

use futures::stream::{AbortHandle, AbortRegistration, Abortable};
use tokio::sync::watch;
use tracing::{debug, error, trace};

use crate::{
    actor::{kind::ActorInstance, ActorId, ActorRef, Behaviour, CURRENT_ACTOR_ID},
    error::{ActorStopReason, SystemError},
    event::SystemEvent,
    mailbox::{self, MailboxConfig, MailboxReceiver, SystemSignal},
    registry::ActorEntry,
    supervision::{ChildSpec, SupervisorSpec},
    system::ActorSystem,
};

/// Options for spawning an actor.
///
/// # Example
///
/// ```
/// use kestrel::actor::SpawnOptions;
/// use kestrel::mailbox::MailboxConfig;
///
/// let options = SpawnOptions::new()
///     .name("worker1")
///     .mailbox(MailboxConfig::Bounded(16))
///     .trap_exit(true);
/// ```
#[derive(Clone, Debug, Default)]
pub struct SpawnOptions {
    pub(crate) mailbox: Option<MailboxConfig>,
    pub(crate) name: Option<Arc<str>>,
    pub(crate) trap_exit: bool,
    pub(crate) supervisor: Option<SupervisorSpec>,
}

impl SpawnOptions {
    /// Creates options with every setting left at the system default.
    pub fn new() -> Self {
        SpawnOptions::default()
    }

    /// Overrides the mailbox configured on the system.
    pub fn mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    /// Registers the actor under `name` as soon as it is spawned.
    ///
    /// When a supervisor restarts the actor, the name is bound to the replacement.
    pub fn name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Delivers exit signals from linked actors as [`Info::Exit`](crate::message::Info::Exit)
    /// instead of stopping the actor.
    pub fn trap_exit(mut self, trap_exit: bool) -> Self {
        self.trap_exit = trap_exit;
        self
    }

    /// The supervision strategy the actor applies to its children.
    pub fn supervisor(mut self, spec: SupervisorSpec) -> Self {
        self.supervisor = Some(spec);
        self
    }

    /// Returns the configured name.
    pub fn registered_name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Who, if anyone, supervises a newly spawned actor.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Parent {
    None,
    /// The supervisor learns about the child through a `Supervise` signal.
    Notify(ActorId),
    /// The supervisor attaches the child to its record itself.
    Direct(ActorId),
}

impl Parent {
    fn id(&self) -> Option<ActorId> {
        match self {
            Parent::None => None,
            Parent::Notify(id) | Parent::Direct(id) => Some(*id),
        }
    }
}

/// Spawns an actor in a Tokio task, returning immediately.
///
/// The returned ref is valid while `init` is still running; messages sent meanwhile are queued.
pub(crate) fn spawn_actor<B: Behaviour>(
    system: &ActorSystem,
    behaviour: Arc<B>,
    options: SpawnOptions,
    parent: Parent,
) -> Result<ActorRef<B>, SystemError> {
    let mailbox_config = options.mailbox.unwrap_or(system.config().mailbox);
    let (mailbox_tx, mailbox_rx) = mailbox::channel::<B>(mailbox_config);
    let (abort_handle, abort_registration) = AbortHandle::new_pair();
    let (stopped_tx, stopped_rx) = watch::channel(None);
    let spec = ChildSpec::from_shared(behaviour.clone(), options.clone());
    let name = behaviour.name();

    let (id, previous) = {
        let mut registry = system.registry_mut();
        let mut parent_id = parent.id();
        if let Some(supervisor) = parent_id {
            if !registry.contains(supervisor) {
                parent_id = None;
            }
        }

        let entry = ActorEntry {
            name,
            sequence: registry.next_sequence(),
            mailbox: Box::new(mailbox_tx.clone()),
            signals: Box::new(mailbox_tx),
            spec: spec.clone(),
            links: Default::default(),
            monitored_by: Default::default(),
            monitoring: Default::default(),
            parent: parent_id,
            stopped: stopped_rx,
            abort: abort_handle,
        };
        let id = registry.insert(entry)?;

        if let (Parent::Notify(supervisor), Some(_)) = (parent, parent_id) {
            if let Some(entry) = registry.get(supervisor) {
                entry
                    .signals
                    .signal(SystemSignal::Supervise { child: id, spec });
            }
        }

        let previous = options
            .name
            .as_ref()
            .map(|registered| registry.register(registered.clone(), id));
        (id, previous)
    };

    trace!(%id, %name, "actor spawned");
    system.emit(SystemEvent::ActorSpawned { id, name });
    if let Some(registered) = &options.name {
        if let Some(Some(previous)) = previous {
            debug!(name = %registered, %previous, %id, "overwrote registered name");
        }
        system.emit(SystemEvent::ActorRegistered {
            name: registered.clone(),
            id,
        });
    }

    let supervisor_spec = options
        .supervisor
        .or_else(|| behaviour.supervisor_spec())
        .unwrap_or(system.config().supervisor);
    let lifecycle = run_actor_lifecycle(
        system.clone(),
        id,
        behaviour,
        supervisor_spec,
        options.trap_exit,
        mailbox_rx,
        abort_registration,
        stopped_tx,
    );

    #[cfg(not(tokio_unstable))]
    {
        tokio::spawn(CURRENT_ACTOR_ID.scope(id, lifecycle));
    }

    #[cfg(tokio_unstable)]
    {
        if let Err(err) = tokio::task::Builder::new()
            .name(name)
            .spawn(CURRENT_ACTOR_ID.scope(id, lifecycle))
        {
            error!(%id, %name, %err, "failed to spawn actor task");
        }
    }

    Ok(ActorRef::new(id))
}

#[allow(clippy::too_many_arguments)]
async fn run_actor_lifecycle<B: Behaviour>(
    system: ActorSystem,
    id: ActorId,
    behaviour: Arc<B>,
    supervisor_spec: SupervisorSpec,
    trap_exit: bool,
    mut mailbox_rx: MailboxReceiver<B>,
    abort_registration: AbortRegistration,
    stopped_tx: watch::Sender<Option<ActorStopReason>>,
) {
    let name = behaviour.name();
    trace!(%id, %name, "actor starting");

    let mut instance = None;
    let res = Abortable::new(
        async {
            let (started, requested_stop) =
                ActorInstance::start(id, system.clone(), behaviour, supervisor_spec, trap_exit)
                    .await?;
            let instance = instance.insert(started);
            match requested_stop {
                Some(reason) => Ok::<_, ActorStopReason>(reason),
                None => Ok(instance.run(&mut mailbox_rx).await),
            }
        },
        abort_registration,
    )
    .await;
    let reason = match res {
        Ok(Ok(reason)) | Ok(Err(reason)) => reason,
        Err(_) => ActorStopReason::Killed,
    };

    // An actor whose init failed, or was killed during init, has no state to terminate
    if let Some(instance) = instance.take() {
        instance.terminate(&reason).await;
    }

    // Anything still queued is dropped, resolving waiting callers with `NoReply`
    mailbox_rx.close();
    system.release(id, &reason);
    log_actor_stop_reason(id, name, &reason);
    system.emit(SystemEvent::ActorStopped {
        id,
        name,
        reason: reason.clone(),
    });
    stopped_tx.send_replace(Some(reason));
}

#[inline]
fn log_actor_stop_reason(id: ActorId, name: &str, reason: &ActorStopReason) {
    match reason {
        reason @ ActorStopReason::Normal
        | reason @ ActorStopReason::Shutdown
        | reason @ ActorStopReason::Killed
        | reason @ ActorStopReason::LinkDied { .. }
        | reason @ ActorStopReason::Custom(_) => {
            trace!(%id, %name, %reason, "actor stopped");
        }
        reason @ ActorStopReason::Failed(_)
        | reason @ ActorStopReason::SupervisionLimitExceeded { .. } => {
            error!(%id, %name, %reason, "actor stopped")
        }
    }
}
