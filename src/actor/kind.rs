use std::{
    any::Any, collections::HashMap, error, mem, ops::ControlFlow, panic::AssertUnwindSafe,
    sync::Arc,
};

use futures::FutureExt;
use tracing::{debug, error, trace};

use crate::{
    actor::{ActorId, Behaviour, Context, Recovery},
    error::{ActorStopReason, BehaviourError},
    mailbox::{MailboxReceiver, ReplySender, Signal, SystemSignal},
    message::{CorrelationId, Envelope, Info},
    supervision::{SupervisorRecord, SupervisorSpec},
    system::ActorSystem,
};

/// Reply slots of calls an actor has received but not yet answered.
pub(crate) struct PendingReplies<R> {
    waiting: HashMap<CorrelationId, ReplySender<R>>,
}

impl<R> PendingReplies<R> {
    pub(crate) fn new() -> Self {
        PendingReplies {
            waiting: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, correlation_id: CorrelationId, tx: ReplySender<R>) {
        // Callers that timed out have dropped their receivers
        self.waiting.retain(|_, tx| !tx.is_closed());
        self.waiting.insert(correlation_id, tx);
    }

    /// Answers a call, counting the reply as orphaned if no caller is left to receive it.
    pub(crate) fn deliver(
        &mut self,
        system: &ActorSystem,
        id: ActorId,
        correlation_id: CorrelationId,
        reply: Result<R, BehaviourError>,
    ) -> bool {
        let delivered = match self.waiting.remove(&correlation_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        };
        if !delivered {
            system.record_orphaned_reply(id, correlation_id);
        }
        delivered
    }

    fn reject(&mut self, correlation_id: CorrelationId, err: BehaviourError) {
        if let Some(tx) = self.waiting.remove(&correlation_id) {
            let _ = tx.send(Err(err));
        }
    }

    pub(crate) fn clear(&mut self) {
        self.waiting.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.len()
    }
}

fn flatten_hook<T, E>(res: Result<Result<T, E>, Box<dyn Any + Send>>) -> Result<T, BehaviourError>
where
    E: error::Error + Send + Sync + 'static,
{
    match res {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(BehaviourError::new(err)), // The hook returned an error
        Err(payload) => Err(BehaviourError::from_panic(payload)), // The hook panicked
    }
}

fn requested_stop(stop: Option<ActorStopReason>) -> ControlFlow<ActorStopReason> {
    match stop {
        Some(reason) => ControlFlow::Break(reason),
        None => ControlFlow::Continue(()),
    }
}

/// A running actor: its behaviour, its state and the bookkeeping the engine keeps on its behalf.
pub(crate) struct ActorInstance<B: Behaviour> {
    id: ActorId,
    system: ActorSystem,
    behaviour: Arc<B>,
    state: B::State,
    pending: PendingReplies<B::Reply>,
    supervision: Option<SupervisorRecord>,
    supervisor_spec: SupervisorSpec,
    trap_exit: bool,
}

impl<B: Behaviour> ActorInstance<B> {
    /// Runs `init`, returning the running instance and any stop it requested.
    pub(crate) async fn start(
        id: ActorId,
        system: ActorSystem,
        behaviour: Arc<B>,
        supervisor_spec: SupervisorSpec,
        trap_exit: bool,
    ) -> Result<(Self, Option<ActorStopReason>), ActorStopReason> {
        let mut pending = PendingReplies::new();
        let mut supervision = None;
        let mut stop = None;
        let res = {
            let mut ctx = Context::new(
                id,
                &system,
                &mut pending,
                &mut supervision,
                supervisor_spec,
                &mut stop,
            );
            AssertUnwindSafe(behaviour.init(&mut ctx))
                .catch_unwind()
                .await
        };

        match flatten_hook(res) {
            Ok(state) => Ok((
                ActorInstance {
                    id,
                    system,
                    behaviour,
                    state,
                    pending,
                    supervision,
                    supervisor_spec,
                    trap_exit,
                },
                stop,
            )),
            Err(err) => {
                if let Some(record) = &mut supervision {
                    record.shutdown_children(&system, id).await;
                }
                Err(ActorStopReason::Failed(err))
            }
        }
    }

    /// Processes the mailbox until the actor stops.
    pub(crate) async fn run(&mut self, mailbox_rx: &mut MailboxReceiver<B>) -> ActorStopReason {
        loop {
            let Some(signal) = mailbox_rx.recv().await else {
                return ActorStopReason::Normal;
            };
            trace!(id = %self.id, kind = %signal.kind(), "processing signal");
            let flow = match signal {
                Signal::Message { envelope, reply } => self.handle_message(envelope, reply).await,
                Signal::System(signal) => self.handle_system(signal).await,
            };
            if let ControlFlow::Break(reason) = flow {
                return reason;
            }
        }
    }

    async fn handle_message(
        &mut self,
        envelope: Envelope<B::Msg>,
        reply: Option<ReplySender<B::Reply>>,
    ) -> ControlFlow<ActorStopReason> {
        let correlation_id = envelope.correlation_id();
        if let (Some(correlation_id), Some(tx)) = (correlation_id, reply) {
            self.pending.insert(correlation_id, tx);
        }

        let mut stop = None;
        let res = {
            let mut ctx = Context::new(
                self.id,
                &self.system,
                &mut self.pending,
                &mut self.supervision,
                self.supervisor_spec,
                &mut stop,
            );
            AssertUnwindSafe(self.behaviour.receive(&mut ctx, &mut self.state, envelope))
                .catch_unwind()
                .await
        };

        match flatten_hook(res) {
            Ok(Some(reply)) => match correlation_id {
                Some(correlation_id) => {
                    self.pending
                        .deliver(&self.system, self.id, correlation_id, Ok(reply));
                }
                None => trace!(id = %self.id, "discarding reply to a cast"),
            },
            Ok(None) => {}
            Err(err) => return self.handle_failure(err, correlation_id).await,
        }

        requested_stop(stop)
    }

    async fn handle_info(&mut self, info: Info) -> ControlFlow<ActorStopReason> {
        let mut stop = None;
        let res = {
            let mut ctx = Context::new(
                self.id,
                &self.system,
                &mut self.pending,
                &mut self.supervision,
                self.supervisor_spec,
                &mut stop,
            );
            AssertUnwindSafe(self.behaviour.handle_info(&mut ctx, &mut self.state, info))
                .catch_unwind()
                .await
        };

        match flatten_hook(res) {
            Ok(()) => requested_stop(stop),
            Err(err) => self.handle_failure(err, None).await,
        }
    }

    async fn handle_failure(
        &mut self,
        err: BehaviourError,
        correlation_id: Option<CorrelationId>,
    ) -> ControlFlow<ActorStopReason> {
        if let Some(correlation_id) = correlation_id {
            self.pending.reject(correlation_id, err.clone());
        }

        let mut stop = None;
        let res = {
            let mut ctx = Context::new(
                self.id,
                &self.system,
                &mut self.pending,
                &mut self.supervision,
                self.supervisor_spec,
                &mut stop,
            );
            AssertUnwindSafe(self.behaviour.on_error(&mut ctx, &mut self.state, &err))
                .catch_unwind()
                .await
        };

        match flatten_hook(res) {
            Ok(Recovery::Resume) => {
                debug!(id = %self.id, %err, "actor resumed after failure");
                requested_stop(stop)
            }
            Ok(Recovery::Stop) => ControlFlow::Break(ActorStopReason::Failed(err)),
            Ok(Recovery::Restart) => self.restart(err).await,
            // A failure inside `on_error` is fatal
            Err(fatal) => ControlFlow::Break(ActorStopReason::Failed(fatal)),
        }
    }

    async fn restart(&mut self, cause: BehaviourError) -> ControlFlow<ActorStopReason> {
        debug!(id = %self.id, %cause, "restarting actor in place");
        self.pending.clear();
        if let Some(record) = &mut self.supervision {
            record.shutdown_children(&self.system, self.id).await;
        }

        let mut stop = None;
        let res = {
            let mut ctx = Context::new(
                self.id,
                &self.system,
                &mut self.pending,
                &mut self.supervision,
                self.supervisor_spec,
                &mut stop,
            );
            AssertUnwindSafe(self.behaviour.init(&mut ctx))
                .catch_unwind()
                .await
        };

        match flatten_hook(res) {
            Ok(state) => {
                drop(mem::replace(&mut self.state, state));
                requested_stop(stop)
            }
            Err(err) => ControlFlow::Break(ActorStopReason::Failed(err)),
        }
    }

    async fn handle_system(&mut self, signal: SystemSignal) -> ControlFlow<ActorStopReason> {
        match signal {
            SystemSignal::Stop(reason) => ControlFlow::Break(reason),
            SystemSignal::Exit { from, reason } => {
                if self.trap_exit {
                    self.handle_info(Info::Exit { from, reason }).await
                } else if reason.is_abnormal() {
                    ControlFlow::Break(ActorStopReason::LinkDied {
                        id: from,
                        reason: Box::new(reason),
                    })
                } else {
                    ControlFlow::Continue(())
                }
            }
            SystemSignal::Down {
                monitor,
                id,
                reason,
            } => {
                self.handle_info(Info::Down {
                    monitor,
                    id,
                    reason,
                })
                .await
            }
            SystemSignal::Supervise { child, spec } => {
                let supervisor_spec = self.supervisor_spec;
                self.supervision
                    .get_or_insert_with(|| SupervisorRecord::new(supervisor_spec))
                    .attach(child, spec);
                ControlFlow::Continue(())
            }
            SystemSignal::ChildExit { child, reason } => match &mut self.supervision {
                Some(record) => {
                    record
                        .on_child_exit(&self.system, self.id, child, reason)
                        .await
                }
                None => ControlFlow::Continue(()),
            },
        }
    }

    /// Shuts supervised children down, then runs `terminate`.
    pub(crate) async fn terminate(self, reason: &ActorStopReason) {
        let ActorInstance {
            id,
            system,
            behaviour,
            state,
            mut pending,
            mut supervision,
            ..
        } = self;

        if let Some(record) = &mut supervision {
            record.shutdown_children(&system, id).await;
        }
        // Dropping the reply slots resolves waiting callers with `NoReply`
        pending.clear();

        let res = AssertUnwindSafe(behaviour.terminate(reason, state))
            .catch_unwind()
            .await;
        if let Err(payload) = res {
            let err = BehaviourError::from_panic(payload);
            error!(%id, name = behaviour.name(), %err, "actor panicked in terminate");
        }
    }
}
