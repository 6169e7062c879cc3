//! A multi-producer, single-consumer queue for sending messages and signals to an actor.
//!
//! An actor mailbox stores pending messages and signals for an actor to process sequentially, in
//! the order they were enqueued. Bounded mailboxes reject new calls and casts with
//! [`SendError::MailboxFull`](crate::error::SendError::MailboxFull) once they hold `capacity`
//! messages, instead of making the sender wait. Runtime signals (stop requests, exit signals,
//! monitor notifications) always bypass the limit.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{
    actor::{ActorId, Behaviour, MonitorRef},
    error::{ActorStopReason, BehaviourError, SendError},
    message::{Envelope, MessageKind},
    supervision::ChildSpec,
};

/// The default capacity of bounded mailboxes.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Configures how many messages an actor's mailbox may hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailboxConfig {
    /// At most this many calls and casts may be queued.
    Bounded(usize),
    /// No limit.
    Unbounded,
}

impl MailboxConfig {
    /// Returns the capacity, or `None` if unbounded.
    pub fn capacity(&self) -> Option<usize> {
        match self {
            MailboxConfig::Bounded(capacity) => Some(*capacity),
            MailboxConfig::Unbounded => None,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        MailboxConfig::Bounded(DEFAULT_MAILBOX_CAPACITY)
    }
}

pub(crate) type ReplySender<R> = oneshot::Sender<Result<R, BehaviourError>>;

/// A queued item for an actor to process.
pub(crate) enum Signal<B: Behaviour> {
    Message {
        envelope: Envelope<B::Msg>,
        reply: Option<ReplySender<B::Reply>>,
    },
    System(SystemSignal),
}

impl<B: Behaviour> Signal<B> {
    pub(crate) fn kind(&self) -> MessageKind {
        match self {
            Signal::Message { envelope, .. } => envelope.kind(),
            Signal::System(signal) => signal.kind(),
        }
    }
}

/// A runtime signal, independent of the actor's message type.
pub(crate) enum SystemSignal {
    Stop(ActorStopReason),
    Exit {
        from: ActorId,
        reason: ActorStopReason,
    },
    Down {
        monitor: MonitorRef,
        id: ActorId,
        reason: ActorStopReason,
    },
    Supervise {
        child: ActorId,
        spec: ChildSpec,
    },
    ChildExit {
        child: ActorId,
        reason: ActorStopReason,
    },
}

impl SystemSignal {
    pub(crate) fn kind(&self) -> MessageKind {
        match self {
            SystemSignal::Stop(_) => MessageKind::Stop,
            SystemSignal::Exit { .. } => MessageKind::Link,
            SystemSignal::Down { .. } => MessageKind::Monitor,
            SystemSignal::Supervise { .. } | SystemSignal::ChildExit { .. } => MessageKind::Info,
        }
    }
}

pub(crate) enum MailboxTrySendError {
    Full,
    Closed,
}

impl MailboxTrySendError {
    pub(crate) fn into_send_error(self, id: ActorId) -> SendError {
        match self {
            MailboxTrySendError::Full => SendError::MailboxFull(id),
            MailboxTrySendError::Closed => SendError::ActorNotFound(id),
        }
    }
}

pub(crate) fn channel<B: Behaviour>(config: MailboxConfig) -> (MailboxSender<B>, MailboxReceiver<B>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queued = Arc::new(AtomicUsize::new(0));
    (
        MailboxSender {
            tx,
            queued: queued.clone(),
            capacity: config.capacity(),
        },
        MailboxReceiver { rx, queued },
    )
}

/// The sending half of an actor's mailbox.
pub(crate) struct MailboxSender<B: Behaviour> {
    tx: mpsc::UnboundedSender<Signal<B>>,
    queued: Arc<AtomicUsize>,
    capacity: Option<usize>,
}

impl<B: Behaviour> MailboxSender<B> {
    /// Enqueues a call or cast, failing fast when the mailbox is at capacity.
    pub(crate) fn try_send_message(
        &self,
        envelope: Envelope<B::Msg>,
        reply: Option<ReplySender<B::Reply>>,
    ) -> Result<(), MailboxTrySendError> {
        if self.tx.is_closed() {
            return Err(MailboxTrySendError::Closed);
        }

        match self.capacity {
            Some(capacity) => {
                self.queued
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                        (queued < capacity).then_some(queued + 1)
                    })
                    .map_err(|_| MailboxTrySendError::Full)?;
            }
            None => {
                self.queued.fetch_add(1, Ordering::AcqRel);
            }
        }

        self.tx
            .send(Signal::Message { envelope, reply })
            .map_err(|_| {
                self.queued.fetch_sub(1, Ordering::AcqRel);
                MailboxTrySendError::Closed
            })
    }

    pub(crate) fn send_system(&self, signal: SystemSignal) -> bool {
        self.tx.send(Signal::System(signal)).is_ok()
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl<B: Behaviour> Clone for MailboxSender<B> {
    fn clone(&self) -> Self {
        MailboxSender {
            tx: self.tx.clone(),
            queued: self.queued.clone(),
            capacity: self.capacity,
        }
    }
}

/// The receiving half of an actor's mailbox.
pub(crate) struct MailboxReceiver<B: Behaviour> {
    rx: mpsc::UnboundedReceiver<Signal<B>>,
    queued: Arc<AtomicUsize>,
}

impl<B: Behaviour> MailboxReceiver<B> {
    pub(crate) async fn recv(&mut self) -> Option<Signal<B>> {
        let signal = self.rx.recv().await?;
        if matches!(signal, Signal::Message { .. }) {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
        Some(signal)
    }

    /// Closes the mailbox, dropping anything still queued.
    ///
    /// Dropping queued calls drops their reply senders, so waiting callers observe
    /// [`SendError::NoReply`].
    pub(crate) fn close(&mut self) {
        self.rx.close();
        while let Ok(signal) = self.rx.try_recv() {
            if matches!(signal, Signal::Message { .. }) {
                self.queued.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

/// Type-erased access to an actor's mailbox for runtime signals.
pub(crate) trait SignalMailbox: Send + Sync + 'static {
    fn signal(&self, signal: SystemSignal) -> bool;

    fn queued(&self) -> usize;
}

impl<B: Behaviour> SignalMailbox for MailboxSender<B> {
    fn signal(&self, signal: SystemSignal) -> bool {
        self.send_system(signal)
    }

    fn queued(&self) -> usize {
        MailboxSender::queued(self)
    }
}
