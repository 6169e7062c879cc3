//! Messaging infrastructure for actors.
//!
//! Every message an actor receives sits in an [`Envelope`], which records how it was sent
//! ([`MessageKind`]), who sent it, when it was created and, for calls, the [`CorrelationId`] that
//! pairs it with the caller's reply slot.
//!
//! Runtime notifications such as exit signals from links and monitor `DOWN`s are delivered to
//! [`Behaviour::handle_info`](crate::actor::Behaviour::handle_info) as [`Info`] values.

use std::{fmt, time::SystemTime};

use serde::{Deserialize, Serialize};

use crate::{
    actor::{ActorId, MonitorRef},
    error::ActorStopReason,
};

/// The closed set of message kinds an actor can be sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// A request that expects a reply.
    Call,
    /// A fire-and-forget message.
    Cast,
    /// A runtime notification such as a monitor `DOWN`.
    Info,
    /// A request for the actor to stop.
    Stop,
    /// An exit signal travelling over a link.
    Link,
    /// A monitor notification.
    Monitor,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            MessageKind::Call => "call",
            MessageKind::Cast => "cast",
            MessageKind::Info => "info",
            MessageKind::Stop => "stop",
            MessageKind::Link => "link",
            MessageKind::Monitor => "monitor",
        };
        f.write_str(kind)
    }
}

/// Pairs a call with its reply.
///
/// Correlation ids are unique for the lifetime of an [`ActorSystem`](crate::system::ActorSystem).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub(crate) const fn new(id: u64) -> Self {
        CorrelationId(id)
    }

    /// Returns the raw id.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CorrelationId({})", self.0)
    }
}

/// A message together with its delivery metadata.
#[derive(Clone, Debug)]
pub struct Envelope<M> {
    kind: MessageKind,
    payload: M,
    from: Option<ActorId>,
    correlation_id: Option<CorrelationId>,
    timestamp: SystemTime,
}

impl<M> Envelope<M> {
    pub(crate) fn call(payload: M, from: Option<ActorId>, correlation_id: CorrelationId) -> Self {
        Envelope {
            kind: MessageKind::Call,
            payload,
            from,
            correlation_id: Some(correlation_id),
            timestamp: SystemTime::now(),
        }
    }

    pub(crate) fn cast(payload: M, from: Option<ActorId>) -> Self {
        Envelope {
            kind: MessageKind::Cast,
            payload,
            from,
            correlation_id: None,
            timestamp: SystemTime::now(),
        }
    }

    /// How the message was sent.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Borrows the payload.
    pub fn payload(&self) -> &M {
        &self.payload
    }

    /// Consumes the envelope, returning the payload.
    pub fn into_payload(self) -> M {
        self.payload
    }

    /// The sending actor, when the message was sent from inside an actor.
    pub fn from(&self) -> Option<ActorId> {
        self.from
    }

    /// The correlation id of a call. Always `None` for casts.
    ///
    /// Handlers that defer their reply hold on to this and later pass it to
    /// [`Context::reply`](crate::actor::Context::reply).
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    /// When the envelope was created.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Whether the sender is waiting for a reply.
    pub fn is_call(&self) -> bool {
        self.kind == MessageKind::Call
    }

    /// Maps the payload, keeping the metadata.
    pub fn map<N>(self, f: impl FnOnce(M) -> N) -> Envelope<N> {
        Envelope {
            kind: self.kind,
            payload: f(self.payload),
            from: self.from,
            correlation_id: self.correlation_id,
            timestamp: self.timestamp,
        }
    }
}

/// A runtime notification delivered to
/// [`Behaviour::handle_info`](crate::actor::Behaviour::handle_info).
#[derive(Clone, Debug)]
pub enum Info {
    /// A linked actor exited. Only delivered to actors trapping exits.
    Exit {
        /// The linked actor.
        from: ActorId,
        /// Why it exited.
        reason: ActorStopReason,
    },
    /// A monitored actor terminated.
    Down {
        /// The monitor that fired.
        monitor: MonitorRef,
        /// The actor that terminated.
        id: ActorId,
        /// Why it terminated.
        reason: ActorStopReason,
    },
}

impl Info {
    /// The message kind this notification travels as.
    pub fn kind(&self) -> MessageKind {
        match self {
            Info::Exit { .. } => MessageKind::Link,
            Info::Down { .. } => MessageKind::Monitor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_envelopes_carry_correlation_ids() {
        let from = ActorId::new(1, 0);
        let envelope = Envelope::call("ping", Some(from), CorrelationId::new(42));
        assert_eq!(envelope.kind(), MessageKind::Call);
        assert!(envelope.is_call());
        assert_eq!(envelope.from(), Some(from));
        assert_eq!(envelope.correlation_id(), Some(CorrelationId::new(42)));
        assert_eq!(envelope.into_payload(), "ping");
    }

    #[test]
    fn cast_envelopes_have_no_correlation_id() {
        let envelope = Envelope::cast(5u32, None).map(|n| n * 2);
        assert_eq!(envelope.kind(), MessageKind::Cast);
        assert_eq!(envelope.correlation_id(), None);
        assert_eq!(*envelope.payload(), 10);
    }

    #[test]
    fn kinds_serialize_in_snake_case() -> Result<(), serde_json::Error> {
        assert_eq!(serde_json::to_string(&MessageKind::Monitor)?, r#""monitor""#);
        assert_eq!(MessageKind::Call.to_string(), "call");
        Ok(())
    }
}
