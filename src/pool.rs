//! A pool of actors sharing one behaviour, with round-robin dispatch.
//!
//! A pool spawns `size` actors from the same [`Behaviour`] and keeps them in a flat list.
//! [`call`](ActorPool::call) and [`cast`](ActorPool::cast) pick the next member in turn, while
//! [`broadcast`](ActorPool::broadcast) sends to every member at once.
//!
//! # Example
//!
//! ```
//! use std::convert::Infallible;
//!
//! use kestrel::prelude::*;
//!
//! struct Worker;
//!
//! impl Behaviour for Worker {
//!     type State = ();
//!     type Msg = u64;
//!     type Reply = u64;
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
//!         msg: Envelope<u64>,
//!     ) -> Result<Option<u64>, Infallible> {
//!         Ok(Some(msg.into_payload() * 2))
//!     }
//! }
//!
//! # tokio_test::block_on(async {
//! let system = ActorSystem::new();
//! let pool = system.create_pool(Worker, 4, SpawnOptions::new())?;
//! assert_eq!(pool.call(21).await?, 42);
//!
//! let doubled = pool.map(1..=3).await;
//! assert_eq!(doubled.into_iter().collect::<Result<Vec<_>, _>>()?, vec![2, 4, 6]);
//! pool.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{
    fmt,
    future::IntoFuture,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    time::Duration,
};

use futures::future::join_all;
use itertools::repeat_n;
use tokio::time::Instant;
use tracing::{error, trace, warn};

use crate::{
    actor::{spawn_actor, ActorRef, Behaviour, Parent, SpawnOptions},
    error::{ActorStopReason, SendError, SystemError},
    supervision::{RestartIntensity, RestartWindow},
    system::ActorSystem,
};

/// A group of actors spawned from one behaviour.
///
/// A pool always has at least one member. A member that stops for any reason other than
/// [`ActorStopReason::Shutdown`] is replaced by a fresh actor in the same position. Replacements
/// are limited by the restart intensity of the member options, or of the system configuration;
/// past it, stopped members are left in place.
pub struct ActorPool<B: Behaviour> {
    inner: Arc<PoolInner<B>>,
}

struct PoolInner<B: Behaviour> {
    system: ActorSystem,
    behaviour: Arc<B>,
    options: SpawnOptions,
    members: RwLock<Vec<ActorRef<B>>>,
    next: AtomicUsize,
    intensity: RestartIntensity,
    replacements: Mutex<RestartWindow>,
}

impl<B: Behaviour> ActorPool<B> {
    pub(crate) fn new(
        system: ActorSystem,
        behaviour: Arc<B>,
        size: usize,
        mut options: SpawnOptions,
    ) -> Result<Self, SystemError> {
        if size == 0 {
            return Err(SystemError::InvalidPoolSize);
        }
        // Members can't share a registered name
        options.name = None;

        let members = (0..size)
            .map(|_| spawn_actor(&system, behaviour.clone(), options.clone(), Parent::None))
            .collect::<Result<Vec<_>, _>>()?;
        trace!(name = %behaviour.name(), size, "actor pool created");

        let intensity = options
            .supervisor
            .or_else(|| behaviour.supervisor_spec())
            .unwrap_or(system.config().supervisor)
            .intensity;
        let inner = Arc::new(PoolInner {
            system,
            behaviour,
            options,
            members: RwLock::new(members.clone()),
            next: AtomicUsize::new(0),
            intensity,
            replacements: Mutex::new(RestartWindow::default()),
        });
        for member in members {
            inner.watch(member);
        }
        Ok(ActorPool { inner })
    }

    /// The number of members.
    pub fn size(&self) -> usize {
        self.inner.read_members().len()
    }

    /// The members, in dispatch order.
    pub fn members(&self) -> Vec<ActorRef<B>> {
        self.inner.read_members().clone()
    }

    /// Returns the member that will receive the next call or cast.
    pub fn next_member(&self) -> ActorRef<B> {
        let members = self.inner.read_members();
        let idx = self.inner.next.fetch_add(1, Ordering::Relaxed) % members.len();
        members[idx]
    }

    /// Calls the next member.
    pub async fn call(&self, msg: B::Msg) -> Result<B::Reply, SendError> {
        let member = self.next_member();
        self.inner.system.call(&member, msg).await
    }

    /// Calls the next member with a custom timeout.
    pub async fn call_timeout(&self, msg: B::Msg, timeout: Duration) -> Result<B::Reply, SendError> {
        let member = self.next_member();
        self.inner.system.call(&member, msg).timeout(timeout).await
    }

    /// Casts to the next member.
    pub fn cast(&self, msg: B::Msg) -> Result<(), SendError> {
        let member = self.next_member();
        self.inner.system.cast(&member, msg).send()
    }

    /// Casts a copy of `msg` to every member.
    ///
    /// Resolves once every cast has been enqueued, with one result per member in dispatch order.
    pub async fn broadcast(&self, msg: B::Msg) -> Vec<Result<(), SendError>>
    where
        B::Msg: Clone,
    {
        let members = self.members();
        join_all(
            members
                .iter()
                .zip(repeat_n(msg, members.len())) // Avoids unnecessary clone of msg on last iteration
                .map(|(member, msg)| self.inner.system.cast(member, msg).into_future()),
        )
        .await
    }

    /// Calls members concurrently, one message each in round-robin order.
    ///
    /// The results are in the order of `msgs`.
    pub async fn map<I>(&self, msgs: I) -> Vec<Result<B::Reply, SendError>>
    where
        I: IntoIterator<Item = B::Msg>,
    {
        let calls: Vec<_> = msgs
            .into_iter()
            .map(|msg| (self.next_member(), msg))
            .collect();
        join_all(
            calls
                .into_iter()
                .map(|(member, msg)| async move { self.inner.system.call(&member, msg).await }),
        )
        .await
    }

    /// Grows or shrinks the pool to `size` members.
    ///
    /// Growing spawns new members from the pool's behaviour. Shrinking stops the trailing members,
    /// which process what is already in their mailboxes before stopping. Messages are not
    /// rebalanced.
    pub async fn resize(&self, size: usize) -> Result<(), SystemError> {
        if size == 0 {
            return Err(SystemError::InvalidPoolSize);
        }

        let (added, removed) = {
            let mut members = self.inner.write_members();
            let current = members.len();
            if size > current {
                let mut added = Vec::with_capacity(size - current);
                for _ in current..size {
                    let member = self.inner.spawn_member()?;
                    members.push(member);
                    added.push(member);
                }
                (added, Vec::new())
            } else {
                (Vec::new(), members.split_off(size))
            }
        };

        for member in added {
            self.inner.watch(member);
        }
        for member in removed.into_iter().rev() {
            self.inner
                .system
                .stop_with_reason(member, ActorStopReason::Shutdown)
                .await;
        }
        trace!(name = %self.inner.behaviour.name(), size, "actor pool resized");
        Ok(())
    }

    /// Stops every member, last first.
    pub async fn shutdown(self) {
        let members = std::mem::take(&mut *self.inner.write_members());
        for member in members.into_iter().rev() {
            self.inner
                .system
                .stop_with_reason(member, ActorStopReason::Shutdown)
                .await;
        }
    }
}

impl<B: Behaviour> PoolInner<B> {
    fn spawn_member(&self) -> Result<ActorRef<B>, SystemError> {
        spawn_actor(
            &self.system,
            self.behaviour.clone(),
            self.options.clone(),
            Parent::None,
        )
    }

    /// Replaces `member` once it stops, unless it was shut down or has left the pool.
    fn watch(self: &Arc<Self>, member: ActorRef<B>) {
        let stopped = self.system.stop_watch(member.id());
        let pool = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Some(mut stopped) = stopped {
                let shutdown = matches!(
                    stopped.wait_for(Option::is_some).await.as_deref(),
                    Ok(Some(ActorStopReason::Shutdown))
                );
                if shutdown {
                    return;
                }
            }
            replace_member(pool, member);
        });
    }

    fn read_members(&self) -> RwLockReadGuard<'_, Vec<ActorRef<B>>> {
        self.members.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_members(&self) -> RwLockWriteGuard<'_, Vec<ActorRef<B>>> {
        self.members.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn replace_member<B: Behaviour>(pool: Weak<PoolInner<B>>, stopped: ActorRef<B>) {
    let Some(pool) = pool.upgrade() else {
        return;
    };
    let replacement = {
        let mut members = pool.write_members();
        let Some(slot) = members.iter().position(|member| *member == stopped) else {
            return;
        };
        let exceeded = pool
            .replacements
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(pool.intensity, Instant::now());
        if exceeded {
            warn!(name = %pool.behaviour.name(), %stopped, "pool member restart intensity exceeded");
            return;
        }
        match pool.spawn_member() {
            Ok(replacement) => {
                members[slot] = replacement;
                replacement
            }
            Err(err) => {
                error!(name = %pool.behaviour.name(), %stopped, %err, "failed to replace pool member");
                return;
            }
        }
    };
    trace!(name = %pool.behaviour.name(), %stopped, %replacement, "pool member replaced");
    pool.watch(replacement);
}

impl<B: Behaviour> fmt::Debug for ActorPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorPool")
            .field("name", &self.inner.behaviour.name())
            .field("members", &*self.inner.read_members())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use tokio::time;

    use super::*;
    use crate::{
        actor::Context,
        message::Envelope,
        supervision::{RestartStrategy, SupervisorSpec},
    };

    struct Tally;

    impl Behaviour for Tally {
        type State = u32;
        type Msg = ();
        type Reply = u32;
        type Error = Infallible;

        async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<u32, Infallible> {
            Ok(0)
        }

        async fn receive(
            &self,
            _ctx: &mut Context<'_, Self>,
            count: &mut u32,
            _msg: Envelope<()>,
        ) -> Result<Option<u32>, Infallible> {
            *count += 1;
            Ok(Some(*count))
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("flaked")]
    struct Flaked;

    /// Fails on `true`.
    struct Flaky;

    impl Behaviour for Flaky {
        type State = ();
        type Msg = bool;
        type Reply = ();
        type Error = Flaked;

        async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<(), Flaked> {
            Ok(())
        }

        async fn receive(
            &self,
            _ctx: &mut Context<'_, Self>,
            _state: &mut (),
            msg: Envelope<bool>,
        ) -> Result<Option<()>, Flaked> {
            if msg.into_payload() {
                Err(Flaked)
            } else {
                Ok(Some(()))
            }
        }
    }

    async fn wait_until_replaced<B: Behaviour>(pool: &ActorPool<B>, member: ActorRef<B>) {
        time::timeout(Duration::from_secs(1), async {
            while pool.members().contains(&member) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("member was not replaced");
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn rejects_empty_pools() {
        let system = ActorSystem::new();
        assert_eq!(
            system.create_pool(Tally, 0, SpawnOptions::new()).err(),
            Some(SystemError::InvalidPoolSize)
        );
    }

    #[tokio::test]
    async fn round_robin_wraps_around() -> Result<(), Box<dyn std::error::Error>> {
        let system = ActorSystem::new();
        let pool = system.create_pool(Tally, 2, SpawnOptions::new())?;
        let members = pool.members();

        assert_eq!(pool.next_member(), members[0]);
        assert_eq!(pool.next_member(), members[1]);
        assert_eq!(pool.next_member(), members[0]);
        Ok(())
    }

    #[tokio::test]
    async fn resize_grows_and_shrinks() -> Result<(), Box<dyn std::error::Error>> {
        let system = ActorSystem::new();
        let pool = system.create_pool(Tally, 2, SpawnOptions::new().name("ignored"))?;
        assert_eq!(system.whereis_id("ignored"), None);

        pool.resize(5).await?;
        assert_eq!(pool.size(), 5);
        assert_eq!(system.actor_count(), 5);

        let trailing = pool.members()[1..].to_vec();
        pool.resize(1).await?;
        assert_eq!(pool.size(), 1);
        assert!(trailing.iter().all(|member| !system.is_alive(*member)));

        assert_eq!(pool.resize(0).await, Err(SystemError::InvalidPoolSize));
        pool.shutdown().await;
        assert_eq!(system.actor_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn stopped_members_are_replaced_unless_shut_down() -> Result<(), Box<dyn std::error::Error>> {
        let system = ActorSystem::new();
        let pool = system.create_pool(Tally, 2, SpawnOptions::new())?;
        let members = pool.members();

        system.stop(members[0]).await;
        wait_until_replaced(&pool, members[0]).await;
        let replacement = pool.members()[0];
        assert_ne!(replacement, members[0]);
        assert_eq!(system.call(&replacement, ()).await?, 1);

        system
            .stop_with_reason(members[1], ActorStopReason::Shutdown)
            .await;
        settle().await;
        assert_eq!(pool.members(), vec![replacement, members[1]]);
        assert_eq!(system.actor_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn replacements_respect_the_restart_intensity() -> Result<(), Box<dyn std::error::Error>> {
        let system = ActorSystem::new();
        let spec = SupervisorSpec::new(RestartStrategy::OneForOne).with_intensity(1, Duration::from_secs(60));
        let pool = system.create_pool(Flaky, 1, SpawnOptions::new().supervisor(spec))?;

        let first = pool.next_member();
        assert!(pool.call(true).await.is_err());
        wait_until_replaced(&pool, first).await;
        pool.call(false).await?;

        let second = pool.next_member();
        assert!(pool.call(true).await.is_err());
        system.wait_for_stop(second).await;
        settle().await;
        assert_eq!(pool.members(), vec![second]);
        assert_eq!(system.actor_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn shrunk_and_shut_down_members_stay_stopped() -> Result<(), Box<dyn std::error::Error>> {
        let system = ActorSystem::new();
        let pool = system.create_pool(Flaky, 3, SpawnOptions::new())?;
        pool.resize(1).await?;
        settle().await;
        assert_eq!(system.actor_count(), 1);

        pool.shutdown().await;
        settle().await;
        assert_eq!(system.actor_count(), 0);
        Ok(())
    }
}
