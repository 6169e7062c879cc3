//! Types for sending calls and casts to actors.
//!
//! Requests are built by [`ActorSystem::call`](crate::system::ActorSystem::call) and
//! [`ActorSystem::cast`](crate::system::ActorSystem::cast), and are sent by awaiting them or by
//! calling one of their send methods.
//!
//! - A [`CallRequest`] enqueues a [`Call`](crate::message::MessageKind::Call) and waits for the
//!   reply, racing it against a timeout. It can also be split with [`CallRequest::enqueue`], which
//!   enqueues immediately and returns a [`PendingCall`] to await later.
//! - A [`CastRequest`] enqueues a [`Cast`](crate::message::MessageKind::Cast) and returns as soon
//!   as it is in the mailbox.
//!
//! Neither blocks on a full mailbox: a bounded mailbox at capacity fails the request with
//! [`SendError::MailboxFull`](crate::error::SendError::MailboxFull).

mod call;
mod cast;

pub use call::{CallRequest, PendingCall};
pub use cast::CastRequest;
