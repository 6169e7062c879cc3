//! The actor system: spawning, messaging, the name registry, links, monitors and shutdown.
//!
//! An [`ActorSystem`] is a cheaply cloneable handle. Every clone refers to the same directory of
//! actors, the same configuration and the same event channel.
//!
//! # Example
//!
//! ```
//! use std::convert::Infallible;
//!
//! use kestrel::prelude::*;
//!
//! struct Echo;
//!
//! impl Behaviour for Echo {
//!     type State = ();
//!     type Msg = String;
//!     type Reply = String;
//!     type Error = Infallible;
//!
//!     async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<(), Infallible> {
//!         Ok(())
//!     }
//!
//!     async fn receive(
//!         &self,
//!         _ctx: &mut Context<'_, Self>,
//!         _state: &mut (),
//!         msg: Envelope<String>,
//!     ) -> Result<Option<String>, Infallible> {
//!         Ok(Some(msg.into_payload()))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let system = ActorSystem::new();
//! let echo = system.spawn_with(Echo, SpawnOptions::new().name("echo"));
//! assert_eq!(system.call(&echo, "ping".to_string()).await?, "ping");
//! assert_eq!(system.whereis::<Echo>("echo")?, Some(echo));
//! system.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    time::Duration,
};

use futures::stream::{AbortHandle, Abortable};
use itertools::Itertools;
use sysinfo::{Pid, System};
use tokio::{
    runtime::Handle,
    sync::{broadcast, watch},
    time::{self, MissedTickBehavior},
};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use crate::{
    actor::{current_actor_id, spawn_actor, ActorId, ActorRef, Behaviour, MonitorRef, Parent, SpawnOptions},
    config::SystemConfig,
    error::{ActorStopReason, SystemError},
    event::{MetricsSnapshot, ProcessUsage, SystemEvent},
    mailbox::{MailboxSender, SystemSignal},
    message::CorrelationId,
    pool::ActorPool,
    pubsub::PubSub,
    registry::ActorRegistry,
    request::{CallRequest, CastRequest},
};

/// A handle to a running actor system.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    config: SystemConfig,
    registry: RwLock<ActorRegistry>,
    events: broadcast::Sender<SystemEvent>,
    correlation_ids: AtomicU64,
    monitor_refs: AtomicU64,
    stats: Stats,
    ticker: Mutex<Option<AbortHandle>>,
}

#[derive(Default)]
struct Stats {
    calls: AtomicU64,
    casts: AtomicU64,
    call_timeouts: AtomicU64,
    orphaned_replies: AtomicU64,
    restarts: AtomicU64,
}

impl ActorSystem {
    /// Creates a system with the default configuration.
    ///
    /// The metrics ticker is only started when called from within a Tokio runtime.
    pub fn new() -> Self {
        ActorSystem::with_config(SystemConfig::default())
    }

    /// Creates a system with `config`.
    pub fn with_config(config: SystemConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let metrics_interval = config.metrics_interval;
        let system = ActorSystem {
            inner: Arc::new(SystemInner {
                config,
                registry: RwLock::new(ActorRegistry::new()),
                events,
                correlation_ids: AtomicU64::new(0),
                monitor_refs: AtomicU64::new(0),
                stats: Stats::default(),
                ticker: Mutex::new(None),
            }),
        };

        if let Some(period) = metrics_interval.filter(|period| !period.is_zero()) {
            if Handle::try_current().is_ok() {
                let handle = spawn_metrics_ticker(Arc::downgrade(&system.inner), period);
                *system.lock_ticker() = Some(handle);
            }
        }

        system
    }

    /// The configuration the system was created with.
    pub fn config(&self) -> &SystemConfig {
        &self.inner.config
    }

    /// Spawns an actor with default options.
    ///
    /// # Panics
    ///
    /// Panics if the actor id space is exhausted. See [`try_spawn_with`](Self::try_spawn_with).
    pub fn spawn<B: Behaviour>(&self, behaviour: B) -> ActorRef<B> {
        self.spawn_with(behaviour, SpawnOptions::default())
    }

    /// Spawns an actor with `options`.
    ///
    /// The returned ref is usable immediately. Messages sent before `init` completes are queued.
    ///
    /// # Panics
    ///
    /// Panics if the actor id space is exhausted. See [`try_spawn_with`](Self::try_spawn_with).
    pub fn spawn_with<B: Behaviour>(&self, behaviour: B, options: SpawnOptions) -> ActorRef<B> {
        match self.try_spawn_with(behaviour, options) {
            Ok(actor_ref) => actor_ref,
            Err(err) => panic!("failed to spawn actor: {err}"),
        }
    }

    /// Spawns an actor with `options`, failing with [`SystemError::IdSpaceExhausted`] once every
    /// actor id is live or retired.
    pub fn try_spawn_with<B: Behaviour>(
        &self,
        behaviour: B,
        options: SpawnOptions,
    ) -> Result<ActorRef<B>, SystemError> {
        spawn_actor(self, Arc::new(behaviour), options, Parent::None)
    }

    /// Spawns an actor as a supervised child of `supervisor`.
    pub fn spawn_supervised<B: Behaviour>(
        &self,
        supervisor: impl Into<ActorId>,
        behaviour: B,
        options: SpawnOptions,
    ) -> Result<ActorRef<B>, SystemError> {
        let supervisor = supervisor.into();
        if !self.is_alive(supervisor) {
            return Err(SystemError::ActorNotFound(supervisor));
        }
        spawn_actor(
            self,
            Arc::new(behaviour),
            options,
            Parent::Notify(supervisor),
        )
    }

    /// Builds a call to `actor_ref`.
    ///
    /// The returned request is sent by awaiting it.
    pub fn call<'a, B: Behaviour>(
        &'a self,
        actor_ref: &ActorRef<B>,
        msg: B::Msg,
    ) -> CallRequest<'a, B> {
        CallRequest::new(self, *actor_ref, msg)
    }

    /// Builds a cast to `actor_ref`.
    ///
    /// The returned request is sent by calling [`CastRequest::send`] or awaiting it.
    pub fn cast<'a, B: Behaviour>(
        &'a self,
        actor_ref: &ActorRef<B>,
        msg: B::Msg,
    ) -> CastRequest<'a, B> {
        CastRequest::new(self, *actor_ref, msg)
    }

    /// Creates a pool of `size` actors sharing `behaviour`.
    pub fn create_pool<B: Behaviour>(
        &self,
        behaviour: B,
        size: usize,
        options: SpawnOptions,
    ) -> Result<ActorPool<B>, SystemError> {
        ActorPool::new(self.clone(), Arc::new(behaviour), size, options)
    }

    /// Creates a pub/sub bus whose subscribers use the configured
    /// [`subscriber_capacity`](SystemConfig::subscriber_capacity).
    pub fn pubsub<T: Clone + Send + 'static>(&self) -> PubSub<T> {
        PubSub::with_capacity(self.inner.config.subscriber_capacity)
    }

    /// Binds `name` to `id`, replacing and returning any previous binding.
    pub fn register(
        &self,
        name: impl Into<Arc<str>>,
        id: impl Into<ActorId>,
    ) -> Result<Option<ActorId>, SystemError> {
        let name = name.into();
        let id = id.into();
        let previous = {
            let mut registry = self.registry_mut();
            if !registry.contains(id) {
                return Err(SystemError::ActorNotFound(id));
            }
            registry.register(name.clone(), id)
        };

        if let Some(previous) = previous {
            debug!(%name, %previous, %id, "overwrote registered name");
        }
        self.emit(SystemEvent::ActorRegistered { name, id });
        Ok(previous)
    }

    /// Removes a name binding, returning the id it resolved to.
    pub fn unregister(&self, name: &str) -> Option<ActorId> {
        self.registry_mut().unregister(name)
    }

    /// Looks up a typed ref by name.
    ///
    /// Absence is not an error. A name bound to an actor of a different behaviour type is
    /// reported as [`SystemError::BadActorType`].
    pub fn whereis<B: Behaviour>(&self, name: &str) -> Result<Option<ActorRef<B>>, SystemError> {
        let registry = self.registry();
        let Some(id) = registry.whereis(name) else {
            return Ok(None);
        };
        match registry.get(id) {
            Some(entry) if entry.mailbox::<B>().is_some() => Ok(Some(ActorRef::new(id))),
            Some(_) => Err(SystemError::BadActorType {
                id,
                expected: std::any::type_name::<B>(),
            }),
            None => Ok(None),
        }
    }

    /// Looks up an id by name.
    pub fn whereis_id(&self, name: &str) -> Option<ActorId> {
        self.registry().whereis(name)
    }

    /// The bound names, sorted.
    pub fn registered_names(&self) -> Vec<String> {
        self.registry()
            .names()
            .map(|(name, _)| name.to_string())
            .sorted()
            .collect()
    }

    /// Links two actors.
    ///
    /// When either terminates abnormally, the other receives an exit signal.
    pub fn link(&self, a: impl Into<ActorId>, b: impl Into<ActorId>) -> Result<(), SystemError> {
        let (a, b) = (a.into(), b.into());
        if a == b {
            return Err(SystemError::SelfReference(a));
        }

        let mut registry = self.registry_mut();
        if !registry.contains(b) {
            return Err(SystemError::ActorNotFound(b));
        }
        registry
            .get_mut(a)
            .ok_or(SystemError::ActorNotFound(a))?
            .links
            .insert(b);
        if let Some(entry) = registry.get_mut(b) {
            entry.links.insert(a);
        }
        trace!(%a, %b, "actors linked");
        Ok(())
    }

    /// Removes a link. Returns `false` if the actors were not linked.
    pub fn unlink(&self, a: impl Into<ActorId>, b: impl Into<ActorId>) -> bool {
        let (a, b) = (a.into(), b.into());
        let mut registry = self.registry_mut();
        let removed = registry
            .get_mut(a)
            .map(|entry| entry.links.remove(&b))
            .unwrap_or(false);
        if let Some(entry) = registry.get_mut(b) {
            entry.links.remove(&a);
        }
        removed
    }

    /// Makes `watcher` receive [`Info::Down`](crate::message::Info::Down) when `target` stops.
    pub fn monitor(
        &self,
        watcher: impl Into<ActorId>,
        target: impl Into<ActorId>,
    ) -> Result<MonitorRef, SystemError> {
        let (watcher, target) = (watcher.into(), target.into());
        if watcher == target {
            return Err(SystemError::SelfReference(watcher));
        }

        let mut registry = self.registry_mut();
        if !registry.contains(watcher) {
            return Err(SystemError::ActorNotFound(watcher));
        }
        let monitor = MonitorRef::new(
            self.inner.monitor_refs.fetch_add(1, Ordering::Relaxed),
            target,
        );
        registry
            .get_mut(target)
            .ok_or(SystemError::ActorNotFound(target))?
            .monitored_by
            .insert(monitor, watcher);
        if let Some(entry) = registry.get_mut(watcher) {
            entry.monitoring.insert(monitor);
        }
        trace!(%watcher, %target, "monitor installed");
        Ok(monitor)
    }

    /// Removes a monitor. Returns `false` if it already fired or was removed.
    pub fn demonitor(&self, monitor: MonitorRef) -> bool {
        let mut registry = self.registry_mut();
        let Some(watcher) = registry
            .get_mut(monitor.target())
            .and_then(|entry| entry.monitored_by.remove(&monitor))
        else {
            return false;
        };
        if let Some(entry) = registry.get_mut(watcher) {
            entry.monitoring.remove(&monitor);
        }
        true
    }

    /// Places an existing actor under `supervisor`.
    ///
    /// The supervisor respawns the child from the behaviour and options it was originally
    /// spawned with.
    pub fn supervise(
        &self,
        supervisor: impl Into<ActorId>,
        child: impl Into<ActorId>,
    ) -> Result<(), SystemError> {
        let (supervisor, child) = (supervisor.into(), child.into());
        if supervisor == child {
            return Err(SystemError::SelfReference(child));
        }

        {
            let mut registry = self.registry_mut();
            let entry = registry.get(child).ok_or(SystemError::ActorNotFound(child))?;
            match entry.parent {
                Some(existing) if existing == supervisor => return Ok(()),
                Some(existing) => {
                    return Err(SystemError::AlreadySupervised {
                        child,
                        supervisor: existing,
                    })
                }
                None => {}
            }
            let spec = entry.spec.clone();

            registry
                .get(supervisor)
                .ok_or(SystemError::ActorNotFound(supervisor))?
                .signals
                .signal(SystemSignal::Supervise { child, spec });
            if let Some(entry) = registry.get_mut(child) {
                entry.parent = Some(supervisor);
            }
        }

        trace!(%supervisor, %child, "child attached to supervisor");
        self.emit(SystemEvent::SupervisorAttached { supervisor, child });
        Ok(())
    }

    /// Asks an actor to stop normally and waits for it to terminate.
    ///
    /// The stop request is queued behind messages already in the mailbox. Returns `false` if the
    /// actor was not running.
    pub async fn stop(&self, id: impl Into<ActorId>) -> bool {
        self.stop_id(id.into(), ActorStopReason::Normal).await
    }

    /// Asks an actor to stop with `reason` and waits for it to terminate.
    pub async fn stop_with_reason(&self, id: impl Into<ActorId>, reason: ActorStopReason) -> bool {
        self.stop_id(id.into(), reason).await
    }

    /// Aborts an actor immediately, without processing the rest of its mailbox.
    ///
    /// The actor stops with [`ActorStopReason::Killed`]. Returns `false` if it was not running.
    pub fn kill(&self, id: impl Into<ActorId>) -> bool {
        match self.registry().get(id.into()) {
            Some(entry) => {
                entry.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Waits until an actor has terminated and been removed from the directory.
    pub async fn wait_for_stop(&self, id: impl Into<ActorId>) {
        let stopped = self.registry().get(id.into()).map(|entry| entry.stopped.clone());
        if let Some(mut stopped) = stopped {
            let _ = stopped.wait_for(Option::is_some).await;
        }
    }

    /// A receiver that is set to the actor's stop reason once it has been released.
    ///
    /// Returns `None` if the actor is already gone.
    pub(crate) fn stop_watch(&self, id: ActorId) -> Option<watch::Receiver<Option<ActorStopReason>>> {
        self.registry().get(id).map(|entry| entry.stopped.clone())
    }

    /// Whether the actor is still in the directory.
    pub fn is_alive(&self, id: impl Into<ActorId>) -> bool {
        self.registry().contains(id.into())
    }

    /// The number of live actors.
    pub fn actor_count(&self) -> usize {
        self.registry().len()
    }

    /// Stops every actor and the metrics ticker.
    ///
    /// Unsupervised actors are stopped with [`ActorStopReason::Shutdown`] one at a time, most
    /// recently spawned first. Supervisors shut their own children down, so whole subtrees stop in
    /// reverse order. This repeats until the directory is empty.
    pub async fn shutdown(&self) {
        if let Some(ticker) = self.lock_ticker().take() {
            ticker.abort();
        }

        loop {
            let roots: Vec<ActorId> = {
                let registry = self.registry();
                if registry.is_empty() {
                    break;
                }
                let mut roots: Vec<_> = registry
                    .entries()
                    .filter(|(_, entry)| {
                        entry
                            .parent
                            .map_or(true, |parent| !registry.contains(parent))
                    })
                    .collect();
                if roots.is_empty() {
                    roots = registry.entries().collect();
                }
                roots
                    .into_iter()
                    .sorted_by_key(|(_, entry)| std::cmp::Reverse(entry.sequence))
                    .map(|(id, _)| id)
                    .collect()
            };

            for id in roots {
                self.stop_id(id, ActorStopReason::Shutdown).await;
            }
        }
        trace!("actor system shut down");
    }

    /// Returns a stream of system events.
    pub fn events(&self) -> BroadcastStream<SystemEvent> {
        BroadcastStream::new(self.inner.events.subscribe())
    }

    /// Returns a receiver of system events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SystemEvent> {
        self.inner.events.subscribe()
    }

    /// Returns the current counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        let (total_spawned, active, registered_names, queued_messages) = {
            let registry = self.registry();
            (
                registry.total_spawned(),
                registry.len(),
                registry.registered_names(),
                registry.queued_messages(),
            )
        };
        let stats = &self.inner.stats;
        MetricsSnapshot {
            total_spawned,
            active,
            registered_names,
            queued_messages,
            calls: stats.calls.load(Ordering::Relaxed),
            casts: stats.casts.load(Ordering::Relaxed),
            call_timeouts: stats.call_timeouts.load(Ordering::Relaxed),
            orphaned_replies: stats.orphaned_replies.load(Ordering::Relaxed),
            restarts: stats.restarts.load(Ordering::Relaxed),
            process: None,
        }
    }

    pub(crate) fn registry(&self) -> RwLockReadGuard<'_, ActorRegistry> {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn registry_mut(&self) -> RwLockWriteGuard<'_, ActorRegistry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_ticker(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.inner
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn mailbox<B: Behaviour>(&self, id: ActorId) -> Option<MailboxSender<B>> {
        self.registry()
            .get(id)
            .and_then(|entry| entry.mailbox::<B>())
            .cloned()
    }

    pub(crate) fn next_correlation_id(&self) -> CorrelationId {
        CorrelationId::new(self.inner.correlation_ids.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn emit(&self, event: SystemEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn record_call(&self) {
        self.inner.stats.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cast(&self) {
        self.inner.stats.casts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_timeout(&self) {
        self.inner.stats.call_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_orphaned_reply(&self, id: ActorId, correlation_id: CorrelationId) {
        debug!(%id, %correlation_id, "dropping reply with no caller waiting");
        self.inner
            .stats
            .orphaned_replies
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self, supervisor: ActorId, old: ActorId, new: ActorId) {
        self.inner.stats.restarts.fetch_add(1, Ordering::Relaxed);
        self.emit(SystemEvent::ChildRestarted {
            supervisor,
            old,
            new,
        });
    }

    /// Clears the parent pointer of `child` so its exit is not reported to `supervisor`.
    pub(crate) fn detach_child(&self, child: ActorId, supervisor: ActorId) {
        if let Some(entry) = self.registry_mut().get_mut(child) {
            if entry.parent == Some(supervisor) {
                entry.parent = None;
            }
        }
    }

    pub(crate) async fn stop_id(&self, id: ActorId, reason: ActorStopReason) -> bool {
        let stopped = {
            let registry = self.registry();
            let Some(entry) = registry.get(id) else {
                return false;
            };
            entry.signals.signal(SystemSignal::Stop(reason));
            entry.stopped.clone()
        };

        // An actor stopping itself can't wait for its own termination
        if current_actor_id() != Some(id) {
            let mut stopped = stopped;
            let _ = stopped.wait_for(Option::is_some).await;
        }
        true
    }

    /// Removes a terminated actor, notifying its links, monitors and supervisor.
    pub(crate) fn release(&self, id: ActorId, reason: &ActorStopReason) {
        let mut registry = self.registry_mut();
        let Some(entry) = registry.remove(id) else {
            return;
        };

        for peer in &entry.links {
            if let Some(peer_entry) = registry.get_mut(*peer) {
                peer_entry.links.remove(&id);
                peer_entry.signals.signal(SystemSignal::Exit {
                    from: id,
                    reason: reason.clone(),
                });
            }
        }

        for (monitor, watcher) in &entry.monitored_by {
            if let Some(watcher_entry) = registry.get_mut(*watcher) {
                watcher_entry.monitoring.remove(monitor);
                watcher_entry.signals.signal(SystemSignal::Down {
                    monitor: *monitor,
                    id,
                    reason: reason.clone(),
                });
            }
        }

        for monitor in &entry.monitoring {
            if let Some(target_entry) = registry.get_mut(monitor.target()) {
                target_entry.monitored_by.remove(monitor);
            }
        }

        if let Some(parent) = entry.parent {
            if let Some(parent_entry) = registry.get(parent) {
                parent_entry.signals.signal(SystemSignal::ChildExit {
                    child: id,
                    reason: reason.clone(),
                });
            }
        }
    }
}

impl Default for ActorSystem {
    fn default() -> Self {
        ActorSystem::new()
    }
}

impl fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSystem")
            .field("actors", &self.actor_count())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn spawn_metrics_ticker(inner: Weak<SystemInner>, period: Duration) -> AbortHandle {
    let (handle, registration) = AbortHandle::new_pair();
    tokio::spawn(Abortable::new(
        async move {
            let mut sampler = ProcessSampler::new();
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let system = ActorSystem { inner };
                let mut snapshot = system.metrics();
                snapshot.process = sampler.sample();
                system.emit(SystemEvent::Metrics(snapshot));
            }
        },
        registration,
    ));
    handle
}

/// Samples the current process between metrics ticks.
///
/// CPU usage is computed from the difference between two refreshes, so the sampler is kept for
/// the lifetime of the ticker.
struct ProcessSampler {
    system: System,
    pid: Option<Pid>,
}

impl ProcessSampler {
    fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                debug!("process metrics unavailable: {err}");
                None
            }
        };
        let mut system = System::new();
        if let Some(pid) = pid {
            system.refresh_process(pid);
        }
        ProcessSampler { system, pid }
    }

    fn sample(&mut self) -> Option<ProcessUsage> {
        let pid = self.pid?;
        if !self.system.refresh_process(pid) {
            return None;
        }
        let process = self.system.process(pid)?;
        Some(ProcessUsage {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}
