use std::{convert::Infallible, sync::Arc, time::Duration};

use kestrel::{error::ErrorKind, event::SystemEvent, prelude::*};
use tokio::sync::Notify;

struct Echo;

impl Behaviour for Echo {
    type State = ();
    type Msg = String;
    type Reply = String;
    type Error = Infallible;

    async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<(), Infallible> {
        Ok(())
    }

    async fn receive(
        &self,
        _ctx: &mut Context<'_, Self>,
        _state: &mut (),
        msg: Envelope<String>,
    ) -> Result<Option<String>, Infallible> {
        Ok(Some(msg.into_payload()))
    }
}

enum RecorderMsg {
    Push(u32),
    Dump,
}

/// Records pushed values once its gate has been opened.
struct Recorder {
    gate: Option<Arc<Notify>>,
}

impl Behaviour for Recorder {
    type State = Vec<u32>;
    type Msg = RecorderMsg;
    type Reply = Vec<u32>;
    type Error = Infallible;

    async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<Vec<u32>, Infallible> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(Vec::new())
    }

    async fn receive(
        &self,
        _ctx: &mut Context<'_, Self>,
        seen: &mut Vec<u32>,
        msg: Envelope<RecorderMsg>,
    ) -> Result<Option<Vec<u32>>, Infallible> {
        match msg.into_payload() {
            RecorderMsg::Push(n) => {
                seen.push(n);
                Ok(None)
            }
            RecorderMsg::Dump => Ok(Some(seen.clone())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("refusing to start")]
struct Refuse;

struct FailingInit;

impl Behaviour for FailingInit {
    type State = ();
    type Msg = ();
    type Reply = ();
    type Error = Refuse;

    async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<(), Refuse> {
        Err(Refuse)
    }

    async fn receive(
        &self,
        _ctx: &mut Context<'_, Self>,
        _state: &mut (),
        _msg: Envelope<()>,
    ) -> Result<Option<()>, Refuse> {
        Ok(Some(()))
    }
}

#[tokio::test]
async fn echo_replies_with_the_same_payload() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let echo = system.spawn(Echo);

    let reply = system
        .call(&echo, "ping".to_string())
        .timeout(Duration::from_millis(1000))
        .await?;
    assert_eq!(reply, "ping");
    Ok(())
}

#[tokio::test]
async fn whereis_resolves_to_the_spawned_actor() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let echo = system.spawn(Echo);
    system.register("worker1", echo)?;

    let found = system.whereis::<Echo>("worker1")?;
    assert_eq!(found.map(|r| r.id()), Some(echo.id()));
    Ok(())
}

#[tokio::test]
async fn stopped_actors_are_unreachable() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let echo = system.spawn_with(Echo, SpawnOptions::new().name("echo"));
    assert!(system.stop(echo).await);

    assert_eq!(system.whereis::<Echo>("echo")?, None);
    let err = system.call(&echo, "ping".to_string()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActorNotFound);
    assert_eq!(err.actor_id(), echo.id());

    let err = system.cast(&echo, "ping".to_string()).send().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActorNotFound);

    // The slot is reused under a new generation
    let next = system.spawn(Echo);
    assert_ne!(next.id(), echo.id());
    assert!(system.call(&echo, "ping".to_string()).await.is_err());
    assert_eq!(system.call(&next, "pong".to_string()).await?, "pong");
    Ok(())
}

#[tokio::test]
async fn messages_sent_during_init_are_queued() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let gate = Arc::new(Notify::new());
    let recorder = system.spawn_with(
        Recorder {
            gate: Some(gate.clone()),
        },
        SpawnOptions::new().mailbox(MailboxConfig::Bounded(3)),
    );

    system.cast(&recorder, RecorderMsg::Push(1)).send()?;
    system.cast(&recorder, RecorderMsg::Push(2)).send()?;
    let dump = system.call(&recorder, RecorderMsg::Dump).enqueue()?;

    let err = system.cast(&recorder, RecorderMsg::Push(3)).send().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MailboxFull);

    gate.notify_one();
    assert_eq!(dump.await?, vec![1, 2]);
    Ok(())
}

#[tokio::test]
async fn messages_are_processed_in_arrival_order() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let recorder = system.spawn_with(
        Recorder { gate: None },
        SpawnOptions::new().mailbox(MailboxConfig::Unbounded),
    );

    for n in 0..500 {
        system.cast(&recorder, RecorderMsg::Push(n)).send()?;
    }
    let seen = system.call(&recorder, RecorderMsg::Dump).await?;
    assert_eq!(seen, (0..500).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn failed_init_stops_the_actor() {
    let system = ActorSystem::new();
    let mut events = system.subscribe_events();
    let actor = system.spawn(FailingInit);
    system.wait_for_stop(actor).await;
    assert!(!system.is_alive(actor));

    loop {
        match events.recv().await {
            Ok(SystemEvent::ActorStopped { id, reason, .. }) if id == actor.id() => {
                assert!(matches!(reason, ActorStopReason::Failed(err) if err.to_string() == "refusing to start"));
                break;
            }
            Ok(_) => {}
            Err(err) => panic!("event channel closed: {err}"),
        }
    }
}

#[tokio::test]
async fn kill_interrupts_a_blocked_init() {
    let system = ActorSystem::new();
    let mut events = system.subscribe_events();
    let recorder = system.spawn(Recorder {
        gate: Some(Arc::new(Notify::new())),
    });
    tokio::task::yield_now().await;

    assert!(system.kill(recorder));
    system.wait_for_stop(recorder).await;
    assert!(!system.is_alive(recorder));

    loop {
        if let Ok(SystemEvent::ActorStopped { id, reason, .. }) = events.recv().await {
            if id == recorder.id() {
                assert!(matches!(reason, ActorStopReason::Killed));
                break;
            }
        }
    }
}

#[tokio::test]
async fn shutdown_stops_everything() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    for _ in 0..5 {
        system.spawn(Echo);
    }
    let supervisor = system.spawn(
        Supervisor::new(SupervisorSpec::default())
            .child(ChildSpec::new(Echo))
            .child(ChildSpec::new(Echo)),
    );
    system.call(&supervisor, kestrel::supervision::SupervisorMsg::WhichChildren).await?;
    assert_eq!(system.actor_count(), 8);

    system.shutdown().await;
    assert_eq!(system.actor_count(), 0);
    assert!(!system.is_alive(supervisor));
    Ok(())
}
