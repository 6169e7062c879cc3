use std::time::{Duration, Instant};

use kestrel::{
    error::ErrorKind,
    event::SystemEvent,
    message::{CorrelationId, MessageKind},
    prelude::*,
};

#[derive(Debug, thiserror::Error)]
#[error("boom")]
struct Boom;

enum DeferredMsg {
    Ask,
    Answer(u32),
    Ping,
}

/// Answers `Ask` calls only when an `Answer` cast arrives.
struct Deferred;

impl Behaviour for Deferred {
    type State = Option<CorrelationId>;
    type Msg = DeferredMsg;
    type Reply = u32;
    type Error = Boom;

    async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<Option<CorrelationId>, Boom> {
        Ok(None)
    }

    async fn receive(
        &self,
        ctx: &mut Context<'_, Self>,
        waiting: &mut Option<CorrelationId>,
        msg: Envelope<DeferredMsg>,
    ) -> Result<Option<u32>, Boom> {
        match msg.kind() {
            MessageKind::Call | MessageKind::Cast => {}
            kind => panic!("unexpected message kind {kind}"),
        }
        let correlation_id = msg.correlation_id();
        match msg.into_payload() {
            DeferredMsg::Ask => {
                *waiting = correlation_id;
                Ok(None)
            }
            DeferredMsg::Answer(n) => {
                if let Some(correlation_id) = waiting.take() {
                    ctx.reply(correlation_id, n);
                }
                Ok(None)
            }
            DeferredMsg::Ping => Ok(Some(0)),
        }
    }
}

enum CounterMsg {
    Incr,
    Fail,
    Panic,
    Get,
}

/// A counter that applies `recovery` when a handler fails.
struct Counter {
    recovery: Recovery,
}

impl Behaviour for Counter {
    type State = u32;
    type Msg = CounterMsg;
    type Reply = u32;
    type Error = Boom;

    async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<u32, Boom> {
        Ok(0)
    }

    async fn receive(
        &self,
        _ctx: &mut Context<'_, Self>,
        count: &mut u32,
        msg: Envelope<CounterMsg>,
    ) -> Result<Option<u32>, Boom> {
        match msg.into_payload() {
            CounterMsg::Incr => *count += 1,
            CounterMsg::Fail => return Err(Boom),
            CounterMsg::Panic => panic!("boom"),
            CounterMsg::Get => {}
        }
        Ok(Some(*count))
    }

    async fn on_error(
        &self,
        _ctx: &mut Context<'_, Self>,
        _count: &mut u32,
        _err: &BehaviourError,
    ) -> Result<Recovery, Boom> {
        Ok(self.recovery)
    }
}

#[tokio::test]
async fn zero_timeout_call_times_out_promptly() {
    let system = ActorSystem::new();
    let actor = system.spawn(Deferred);

    let start = Instant::now();
    let err = system
        .call(&actor, DeferredMsg::Ask)
        .timeout(Duration::ZERO)
        .await
        .unwrap_err();
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(err.kind(), ErrorKind::CallTimeout);
    assert!(matches!(err, SendError::CallTimeout { id, .. } if id == actor.id()));
    assert_eq!(system.metrics().call_timeouts, 1);
}

#[tokio::test]
async fn deferred_replies_reach_the_caller() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let actor = system.spawn(Deferred);

    let pending = system.call(&actor, DeferredMsg::Ask).enqueue()?;
    system.cast(&actor, DeferredMsg::Answer(7)).send()?;
    assert_eq!(pending.await?, 7);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn late_replies_are_counted_as_orphaned() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let actor = system.spawn(Deferred);

    let err = system
        .call(&actor, DeferredMsg::Ask)
        .timeout(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CallTimeout);

    system.cast(&actor, DeferredMsg::Answer(1)).send()?;
    system.call(&actor, DeferredMsg::Ping).await?;
    assert_eq!(system.metrics().orphaned_replies, 1);
    assert!(system.is_alive(actor));
    Ok(())
}

#[tokio::test]
async fn stopping_with_an_unanswered_call_resolves_no_reply() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let actor = system.spawn(Deferred);

    let pending = system.call(&actor, DeferredMsg::Ask).enqueue()?;
    system.stop(actor).await;
    let err = pending.await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoReply);
    Ok(())
}

#[tokio::test]
async fn handler_errors_are_returned_to_the_caller() {
    let system = ActorSystem::new();
    let mut events = system.subscribe_events();
    let actor = system.spawn(Counter {
        recovery: Recovery::Stop,
    });

    let err = system.call(&actor, CounterMsg::Fail).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BehaviourError);
    let behaviour_error = err.behaviour_error().cloned();
    assert!(behaviour_error.is_some_and(|err| err.downcast_ref::<Boom>().is_some()));

    system.wait_for_stop(actor).await;
    assert!(!system.is_alive(actor));

    let mut saw_call_failed = false;
    loop {
        match events.recv().await {
            Ok(SystemEvent::CallFailed { error }) => {
                assert_eq!(error.kind(), ErrorKind::BehaviourError);
                saw_call_failed = true;
            }
            Ok(SystemEvent::ActorStopped { id, reason, .. }) if id == actor.id() => {
                assert_eq!(reason.error_kind(), Some(ErrorKind::BehaviourError));
                break;
            }
            Ok(_) => {}
            Err(err) => panic!("event channel closed: {err}"),
        }
    }
    assert!(saw_call_failed);
}

#[tokio::test]
async fn panics_are_contained() {
    let system = ActorSystem::new();
    let actor = system.spawn(Counter {
        recovery: Recovery::Resume,
    });

    let err = system.call(&actor, CounterMsg::Panic).await.unwrap_err();
    let behaviour_error = err.behaviour_error().cloned();
    assert!(behaviour_error.as_ref().is_some_and(BehaviourError::is_panic));
    assert_eq!(
        behaviour_error.and_then(|err| err.panic_message()),
        Some("boom".to_string())
    );
    assert!(system.is_alive(actor));
}

#[tokio::test]
async fn resume_keeps_state() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let actor = system.spawn(Counter {
        recovery: Recovery::Resume,
    });

    system.call(&actor, CounterMsg::Incr).await?;
    system.call(&actor, CounterMsg::Incr).await?;
    assert!(system.call(&actor, CounterMsg::Fail).await.is_err());
    assert_eq!(system.call(&actor, CounterMsg::Get).await?, 2);
    Ok(())
}

#[tokio::test]
async fn restart_resets_state_in_place() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let actor = system.spawn(Counter {
        recovery: Recovery::Restart,
    });

    system.call(&actor, CounterMsg::Incr).await?;
    assert!(system.call(&actor, CounterMsg::Fail).await.is_err());
    assert_eq!(system.call(&actor, CounterMsg::Get).await?, 0);
    assert!(system.is_alive(actor));
    Ok(())
}

#[tokio::test]
async fn failed_casts_are_reported() {
    let system = ActorSystem::new();
    let mut events = system.subscribe_events();
    let actor = system.spawn(Deferred);
    system.stop(actor).await;

    let err = system.cast(&actor, DeferredMsg::Ping).send().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ActorNotFound);

    loop {
        if let Ok(SystemEvent::CastFailed { error }) = events.recv().await {
            assert_eq!(error.actor_id(), actor.id());
            break;
        }
    }
}
