//! End-to-end tests of the stage layer: linking, resolution, routing, and
//! value promotion across links.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use troupe::{
    ActorAddress, ActorCtx, ActorId, ContextKind, FabricError, Role, Stage, StageConfig,
    StageId, Step, Value,
};

const TICK: Duration = Duration::from_millis(500);

/// A role that forwards everything it receives to a test-side queue.
struct Probe {
    tx: mpsc::UnboundedSender<Value>,
}

#[async_trait]
impl Role for Probe {
    async fn step(&mut self, _ctx: &ActorCtx, message: Value) -> Result<Step, FabricError> {
        let _ = self.tx.send(message);
        Ok(Step::Receive)
    }
}

fn probe() -> (Probe, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Probe { tx }, rx)
}

fn address_value(address: ActorAddress) -> Value {
    Value::record([
        ("actor", Value::text(address.actor.to_string())),
        ("stage", Value::text(address.stage.to_string())),
    ])
}

fn address_from(value: &Value) -> Option<ActorAddress> {
    Some(ActorAddress::new(
        ActorId::parse(value.get("actor")?.as_text()?).ok()?,
        StageId::parse(value.get("stage")?.as_text()?).ok()?,
    ))
}

/// A role answering `{from, a, b}` with `{sum}` sent back to `from`.
struct Adder;

#[async_trait]
impl Role for Adder {
    async fn step(&mut self, ctx: &ActorCtx, message: Value) -> Result<Step, FabricError> {
        let a = message.get("a").and_then(Value::as_int).unwrap_or(0);
        let b = message.get("b").and_then(Value::as_int).unwrap_or(0);
        if let Some(from) = message.get("from").and_then(address_from) {
            ctx.stage()
                .send(from, Value::record([("sum", Value::Int(a + b))]))
                .await?;
        }
        Ok(Step::Receive)
    }
}

#[tokio::test]
async fn test_resolve_and_call_actor_on_dedicated_child() {
    let parent = Stage::spawn(StageConfig::default(), ContextKind::Main);

    parent
        .dedicated(|child| async move {
            child.register("add", Adder).await.unwrap();
            child.ready().await.unwrap();
        })
        .await
        .unwrap();

    let (probe, mut replies) = probe();
    let probe_ref = parent.spawn(probe).await.unwrap();

    let adder = parent.actor("add").await.unwrap();
    adder
        .send(Value::record([
            ("from", address_value(probe_ref.address())),
            ("a", Value::Int(2)),
            ("b", Value::Int(3)),
        ]))
        .await
        .unwrap();

    let reply = timeout(TICK, replies.recv()).await.unwrap().unwrap();
    assert_eq!(reply.get("sum").and_then(Value::as_int), Some(5));

    // Resolving again by id hits the cache and yields the same address.
    let again = parent.actor(adder.address().actor).await.unwrap();
    assert_eq!(again.address(), adder.address());

    // After eviction the id resolves again over the link, because the child
    // still hosts the actor.
    parent.forget(adder.address().actor).unwrap();
    let resolved = parent.actor(adder.address().actor).await.unwrap();
    assert_eq!(resolved.address(), adder.address());
}

/// A role that calls a callable carried inside the message.
struct Invoker;

#[async_trait]
impl Role for Invoker {
    async fn step(&mut self, _ctx: &ActorCtx, mut message: Value) -> Result<Step, FabricError> {
        let n = message.get("n").and_then(Value::as_int).unwrap_or(0);
        if let Some(callback) = message.take("callback").and_then(Value::into_func) {
            callback(vec![Value::Int(n * 2)]).await?;
        }
        Ok(Step::Receive)
    }
}

#[tokio::test]
async fn test_callable_crosses_links_as_proxy() {
    let parent = Stage::spawn(StageConfig::default(), ContextKind::Main);

    parent
        .dedicated(|child| async move {
            child.register("invoker", Invoker).await.unwrap();
            child.ready().await.unwrap();
        })
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = Value::func(move |args| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(args.into_iter().next().unwrap_or(Value::Null));
            Ok(Value::Null)
        })
    });

    let invoker = parent.actor("invoker").await.unwrap();
    invoker
        .send(Value::record([
            ("n", Value::Int(21)),
            ("callback", callback),
        ]))
        .await
        .unwrap();

    // The callable executes on the parent side even though the child
    // invoked it.
    let result = timeout(TICK, rx.recv()).await.unwrap().unwrap();
    assert_eq!(result, Value::Int(42));
}

#[tokio::test]
async fn test_ready_notification_is_sent_once() {
    let parent = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let child = Stage::spawn(StageConfig::default(), ContextKind::Dedicated);

    let (near, far) = troupe::Channel::pair();
    let (adopted_by_parent, adopted_by_child) = tokio::join!(
        parent.adopt_link(near, troupe::LinkRole::Child),
        child.adopt_link(far, troupe::LinkRole::Parent),
    );
    let child_id = adopted_by_parent.unwrap();
    assert_eq!(adopted_by_child.unwrap(), parent.id());

    child.ready().await.unwrap();
    child.ready().await.unwrap();

    // Exactly one notification arrives.
    timeout(TICK, parent.await_ready(child_id))
        .await
        .unwrap()
        .unwrap();
    assert!(timeout(Duration::from_millis(200), parent.await_ready(child_id))
        .await
        .is_err());
}

#[tokio::test]
async fn test_pending_lookup_does_not_block_ready_wait() {
    let parent = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let child = Stage::spawn(StageConfig::default(), ContextKind::Dedicated);

    let (near, far) = troupe::Channel::pair();
    let (adopted, _) = tokio::join!(
        parent.adopt_link(near, troupe::LinkRole::Child),
        child.adopt_link(far, troupe::LinkRole::Parent),
    );
    let child_id = adopted.unwrap();

    // Nobody registers this alias, so the lookup stays pending forever on
    // the parent's internal mailbox.
    let hanging = {
        let parent = parent.clone();
        tokio::spawn(async move { parent.actor("never-registered").await })
    };
    tokio::task::yield_now().await;

    // The readiness wait shares that mailbox and must still resolve.
    child.ready().await.unwrap();
    timeout(TICK, parent.await_ready(child_id))
        .await
        .expect("ready wait starved behind a pending lookup")
        .unwrap();

    hanging.abort();
}

#[tokio::test]
async fn test_send_to_missing_local_actor_is_recoverable() {
    let stage = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let missing = ActorAddress::new(ActorId::generate(), stage.id());
    match stage.send(missing, Value::Null).await {
        Err(FabricError::UnknownActor(actor)) => assert_eq!(actor, missing.actor),
        other => panic!("unexpected result: {:?}", other),
    }
    // The stage keeps working afterwards.
    let (probe, mut rx) = probe();
    let probe_ref = stage.spawn(probe).await.unwrap();
    stage.send(probe_ref.address(), Value::Int(1)).await.unwrap();
    assert_eq!(
        timeout(TICK, rx.recv()).await.unwrap().unwrap(),
        Value::Int(1)
    );
}

#[tokio::test]
async fn test_datagram_travels_a_chain_by_flooding() {
    // a — b — c, with the target actor on c. Stage a has no link to c, so
    // the datagram floods through b.
    let a = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let b = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let c = Stage::spawn(StageConfig::default(), ContextKind::Main);

    let (ab, ba) = troupe::Channel::pair();
    let (r1, r2) = tokio::join!(
        a.adopt_link(ab, troupe::LinkRole::Child),
        b.adopt_link(ba, troupe::LinkRole::Parent),
    );
    r1.unwrap();
    r2.unwrap();
    let (bc, cb) = troupe::Channel::pair();
    let (r3, r4) = tokio::join!(
        b.adopt_link(bc, troupe::LinkRole::Child),
        c.adopt_link(cb, troupe::LinkRole::Parent),
    );
    r3.unwrap();
    r4.unwrap();

    let (probe, mut rx) = probe();
    let target = c.spawn(probe).await.unwrap();

    a.send(target.address(), Value::text("through the chain"))
        .await
        .unwrap();
    assert_eq!(
        timeout(TICK, rx.recv()).await.unwrap().unwrap(),
        Value::text("through the chain")
    );
}

#[tokio::test]
async fn test_flood_in_a_cycle_does_not_storm() {
    // A full triangle: every stage linked to both others.
    let a = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let b = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let c = Stage::spawn(StageConfig::default(), ContextKind::Main);

    for (left, right) in [(&a, &b), (&b, &c), (&c, &a)] {
        let (near, far) = troupe::Channel::pair();
        let (r1, r2) = tokio::join!(
            left.adopt_link(near, troupe::LinkRole::Child),
            right.adopt_link(far, troupe::LinkRole::Parent),
        );
        r1.unwrap();
        r2.unwrap();
    }

    // Nobody hosts this stage; the datagram floods the triangle and must
    // die out at the seen-set instead of circulating.
    let nowhere = ActorAddress::new(ActorId::generate(), StageId::generate());
    a.send(nowhere, Value::text("lost")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    // All three stages are still responsive.
    for stage in [&a, &b, &c] {
        let (probe, mut rx) = probe();
        let probe_ref = stage.spawn(probe).await.unwrap();
        stage.send(probe_ref.address(), Value::Int(7)).await.unwrap();
        assert_eq!(
            timeout(TICK, rx.recv()).await.unwrap().unwrap(),
            Value::Int(7)
        );
    }
}

#[tokio::test]
async fn test_shared_context_resolves_for_every_connector() {
    let first = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let second = Stage::spawn(StageConfig::default(), ContextKind::Main);

    let boot = |stage: troupe::StageHandle| async move {
        stage.register("add", Adder).await.unwrap();
        stage.ready().await.unwrap();
    };

    first.shared("shared-adder", boot).await.unwrap();
    second
        .shared("shared-adder", |stage| async move {
            stage.register("add", Adder).await.unwrap();
            stage.ready().await.unwrap();
        })
        .await
        .unwrap();

    let from_first = first.actor("add").await.unwrap();
    let from_second = second.actor("add").await.unwrap();
    // Both connectors resolved the same actor on the same shared stage.
    assert_eq!(from_first.address(), from_second.address());

    let (probe, mut rx) = probe();
    let probe_ref = second.spawn(probe).await.unwrap();
    from_second
        .send(Value::record([
            ("from", address_value(probe_ref.address())),
            ("a", Value::Int(20)),
            ("b", Value::Int(22)),
        ]))
        .await
        .unwrap();
    let reply = timeout(TICK, rx.recv()).await.unwrap().unwrap();
    assert_eq!(reply.get("sum").and_then(Value::as_int), Some(42));
}

#[tokio::test]
async fn test_live_stage_is_a_singleton() {
    let one = troupe::live();
    let two = troupe::live();
    assert_eq!(one.id(), two.id());
    assert_eq!(one.context_kind(), ContextKind::Main);
}

/// A role using selective receive: sums numbers until it sees "stop", then
/// reports the total to whoever asked.
struct Tally {
    total: i64,
}

#[async_trait]
impl Role for Tally {
    async fn boot(&mut self, _ctx: &ActorCtx) -> Result<Step, FabricError> {
        Ok(Step::matching(|v| {
            v.as_int().is_some() || v.get("report").is_some()
        }))
    }

    async fn step(&mut self, ctx: &ActorCtx, message: Value) -> Result<Step, FabricError> {
        if let Some(n) = message.as_int() {
            self.total += n;
            return Ok(Step::matching(|v| {
                v.as_int().is_some() || v.get("report").is_some()
            }));
        }
        if let Some(from) = message.get("report").and_then(address_from) {
            ctx.stage().send(from, Value::Int(self.total)).await?;
            return Ok(Step::Done);
        }
        Ok(Step::Receive)
    }
}

#[tokio::test]
async fn test_actor_selective_receive_skips_noise() {
    let stage = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let (probe, mut rx) = probe();
    let probe_ref = stage.spawn(probe).await.unwrap();

    let tally = stage.spawn(Tally { total: 0 }).await.unwrap();
    tally.send(Value::text("noise")).await.unwrap();
    tally.send(Value::Int(40)).await.unwrap();
    tally.send(Value::text("more noise")).await.unwrap();
    tally.send(Value::Int(2)).await.unwrap();
    tally
        .send(Value::record([("report", address_value(probe_ref.address()))]))
        .await
        .unwrap();

    assert_eq!(
        timeout(TICK, rx.recv()).await.unwrap().unwrap(),
        Value::Int(42)
    );
}

#[tokio::test]
async fn test_shutdown_stops_actors_and_links() {
    let stage = Stage::spawn(StageConfig::default(), ContextKind::Main);
    let (probe, _rx) = probe();
    let actor = stage.spawn(probe).await.unwrap();

    assert_eq!(
        stage.actor_status(actor.address().actor).await.unwrap(),
        troupe::ActorStatus::Running
    );

    stage.shutdown().await.unwrap();

    assert!(matches!(
        stage.send(actor.address(), Value::Null).await,
        Err(FabricError::StageStopped)
    ));
}
