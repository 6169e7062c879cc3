use std::time::Duration;

use kestrel::prelude::*;

#[derive(Debug, thiserror::Error)]
#[error("tally failed")]
struct TallyFailed;

#[derive(Clone)]
enum TallyMsg {
    Hit,
    Count,
    Double(u64),
    Hang,
    Fail,
}

/// Counts the hits it receives.
struct Tally;

impl Behaviour for Tally {
    type State = u64;
    type Msg = TallyMsg;
    type Reply = u64;
    type Error = TallyFailed;

    async fn init(&self, _ctx: &mut Context<'_, Self>) -> Result<u64, TallyFailed> {
        Ok(0)
    }

    async fn receive(
        &self,
        _ctx: &mut Context<'_, Self>,
        hits: &mut u64,
        msg: Envelope<TallyMsg>,
    ) -> Result<Option<u64>, TallyFailed> {
        match msg.into_payload() {
            TallyMsg::Hit => {
                *hits += 1;
                Ok(Some(*hits))
            }
            TallyMsg::Count => Ok(Some(*hits)),
            TallyMsg::Double(n) => Ok(Some(n * 2)),
            TallyMsg::Hang => Ok(None),
            TallyMsg::Fail => Err(TallyFailed),
        }
    }
}

async fn counts(system: &ActorSystem, pool: &ActorPool<Tally>) -> Result<Vec<u64>, SendError> {
    let mut counts = Vec::new();
    for member in pool.members() {
        counts.push(system.call(&member, TallyMsg::Count).await?);
    }
    Ok(counts)
}

#[tokio::test]
async fn calls_are_distributed_round_robin() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let pool = system.create_pool(Tally, 4, SpawnOptions::new())?;

    for _ in 0..12 {
        pool.call(TallyMsg::Hit).await?;
    }
    assert_eq!(counts(&system, &pool).await?, vec![3, 3, 3, 3]);
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_every_member() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let pool = system.create_pool(Tally, 3, SpawnOptions::new())?;

    let results = pool.broadcast(TallyMsg::Hit).await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(Result::is_ok));
    pool.cast(TallyMsg::Hit)?;

    assert_eq!(counts(&system, &pool).await?, vec![2, 1, 1]);
    Ok(())
}

#[tokio::test]
async fn map_preserves_input_order() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let pool = system.create_pool(Tally, 3, SpawnOptions::new())?;

    let results = pool.map((1..=10).map(TallyMsg::Double)).await;
    let doubled = results.into_iter().collect::<Result<Vec<_>, _>>()?;
    assert_eq!(doubled, (1..=10).map(|n| n * 2).collect::<Vec<_>>());
    Ok(())
}

#[tokio::test]
async fn resize_spawns_and_stops_members() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let pool = system.create_pool(Tally, 2, SpawnOptions::new())?;
    pool.broadcast(TallyMsg::Hit).await;

    pool.resize(4).await?;
    assert_eq!(counts(&system, &pool).await?, vec![1, 1, 0, 0]);

    let removed = pool.members()[3];
    pool.resize(3).await?;
    assert!(!system.is_alive(removed));
    assert_eq!(pool.size(), 3);
    assert_eq!(system.actor_count(), 3);

    pool.shutdown().await;
    assert_eq!(system.actor_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn call_timeout_applies_to_pool_calls() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let pool = system.create_pool(Tally, 1, SpawnOptions::new())?;

    let err = pool
        .call_timeout(TallyMsg::Hang, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::CallTimeout { timeout, .. } if timeout == Duration::from_millis(100)));
    Ok(())
}

#[tokio::test]
async fn failed_members_are_replaced_in_place() -> Result<(), Box<dyn std::error::Error>> {
    let system = ActorSystem::new();
    let pool = system.create_pool(Tally, 2, SpawnOptions::new())?;
    let failed = pool.members()[0];

    assert!(pool.call(TallyMsg::Fail).await.is_err());
    system.wait_for_stop(failed).await;
    tokio::time::timeout(Duration::from_secs(1), async {
        while pool.members().contains(&failed) {
            tokio::task::yield_now().await;
        }
    })
    .await?;

    let mut hits = Vec::new();
    for _ in 0..4 {
        hits.push(pool.call(TallyMsg::Hit).await?);
    }
    assert_eq!(hits, vec![1, 1, 2, 2]);
    assert_eq!(pool.size(), 2);
    assert_eq!(system.actor_count(), 2);
    Ok(())
}
