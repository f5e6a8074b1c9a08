//! Delivery semantics of the mediator, driven through a `TickQueue`.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{json, Value};

use corekit::{Core, ModuleObject, TickQueue, TokioScheduler};
use mediator::{payload, Envelope, MediatorHandle};

struct Fixture {
    core: Core,
    queue: Arc<TickQueue>,
}

impl Fixture {
    fn new(debug: bool) -> Self {
        let core = Core::with_debug_mode(debug);
        let queue = Arc::new(TickQueue::new());
        mediator::install(&core, queue.clone()).expect("install mediator");
        Self { core, queue }
    }

    fn handle(&self) -> Arc<MediatorHandle> {
        self.core
            .tools()
            .request(mediator::TOOL_NAME)
            .and_then(|t| t.downcast::<MediatorHandle>())
            .expect("mediator handle")
    }
}

type Seen = Arc<Mutex<Vec<(String, Value)>>>;

fn recorder(seen: &Seen, who: &str) -> impl Fn(&Envelope) -> Result<()> + Send + Sync + 'static {
    let seen = seen.clone();
    let who = who.to_string();
    move |env: &Envelope| {
        seen.lock().push((who.clone(), env.data()));
        Ok(())
    }
}

#[test]
fn delivery_is_deferred_to_the_next_tick() -> Result<()> {
    let fx = Fixture::new(false);
    let h = fx.handle();
    let seen: Seen = Arc::default();
    h.subscribe("t", recorder(&seen, "h"));

    h.publish("t", json!({ "v": 1 }), false);
    assert!(seen.lock().is_empty());
    assert_eq!(fx.queue.pending(), 1);

    fx.queue.run_until_idle()?;
    assert_eq!(*seen.lock(), vec![("h".to_string(), json!({ "v": 1 }))]);
    Ok(())
}

#[test]
fn each_recipient_gets_an_isolated_copy() -> Result<()> {
    let fx = Fixture::new(false);
    let (h1, h2) = (fx.handle(), fx.handle());
    let seen: Seen = Arc::default();

    h1.subscribe("t", |env: &Envelope| {
        env.update(|data| data["v"] = json!(100));
        Ok(())
    });
    h2.subscribe("t", recorder(&seen, "h2"));

    let original = payload(json!({ "v": 1 }));
    h1.publish_payload("t", &original, false);
    fx.queue.run_until_idle()?;

    assert_eq!(*seen.lock(), vec![("h2".to_string(), json!({ "v": 1 }))]);
    assert_eq!(*original.lock(), json!({ "v": 1 }));
    Ok(())
}

#[test]
fn skip_copy_shares_the_payload() -> Result<()> {
    let fx = Fixture::new(false);
    let (h1, h2) = (fx.handle(), fx.handle());
    let seen: Seen = Arc::default();

    h1.subscribe("t", |env: &Envelope| {
        env.update(|data| data["v"] = json!(100));
        Ok(())
    });
    h2.subscribe("t", recorder(&seen, "h2"));

    let original = payload(json!({ "v": 1 }));
    h1.publish_payload("t", &original, true);
    fx.queue.run_until_idle()?;

    assert_eq!(*seen.lock(), vec![("h2".to_string(), json!({ "v": 100 }))]);
    assert_eq!(*original.lock(), json!({ "v": 100 }));
    Ok(())
}

#[test]
fn unsubscribe_before_dispatch_cancels_delivery() -> Result<()> {
    let fx = Fixture::new(false);
    let (h, other) = (fx.handle(), fx.handle());
    let seen: Seen = Arc::default();
    h.subscribe("t", recorder(&seen, "h"));
    other.subscribe("t", recorder(&seen, "other"));

    other.publish("t", json!(1), false);
    h.unsubscribe("t");
    fx.queue.run_until_idle()?;

    assert_eq!(*seen.lock(), vec![("other".to_string(), json!(1))]);
    Ok(())
}

#[test]
fn resubscribing_before_dispatch_skips_the_stale_handler() -> Result<()> {
    let fx = Fixture::new(false);
    let h = fx.handle();
    let seen: Seen = Arc::default();
    h.subscribe("t", recorder(&seen, "old"));

    h.publish("t", json!(1), false);
    h.unsubscribe("t");
    h.subscribe("t", recorder(&seen, "new"));
    fx.queue.run_until_idle()?;
    assert!(seen.lock().is_empty());

    h.publish("t", json!(2), false);
    fx.queue.run_until_idle()?;
    assert_eq!(*seen.lock(), vec![("new".to_string(), json!(2))]);
    Ok(())
}

#[test]
fn subscribing_twice_is_a_no_op() -> Result<()> {
    let fx = Fixture::new(false);
    let h = fx.handle();
    let seen: Seen = Arc::default();
    h.subscribe("t", recorder(&seen, "first"));
    h.subscribe(["t", "u"], recorder(&seen, "second"));

    assert_eq!(h.topics(), vec!["t".to_string(), "u".to_string()]);
    h.publish("t", json!("x"), false);
    fx.queue.run_until_idle()?;

    assert_eq!(*seen.lock(), vec![("first".to_string(), json!("x"))]);
    Ok(())
}

#[test]
fn unsubscribe_all_clears_every_topic() {
    let fx = Fixture::new(false);
    let h = fx.handle();
    h.subscribe(["a", "b", "c"], |_: &Envelope| Ok(()));
    h.unsubscribe("b");
    assert_eq!(h.topics(), vec!["a".to_string(), "c".to_string()]);

    h.unsubscribe_all();
    assert!(h.topics().is_empty());
    assert_eq!(h.bus().subscriber_count("a"), 0);
    assert!(h.bus().topics().is_empty());
}

#[test]
fn publish_without_subscribers_schedules_nothing() {
    let fx = Fixture::new(false);
    fx.handle().publish("nobody", json!(null), false);
    assert_eq!(fx.queue.pending(), 0);
}

#[test]
fn recipients_run_in_subscriber_order_and_publishes_stay_fifo() -> Result<()> {
    let fx = Fixture::new(false);
    let handles: Vec<_> = (0..3).map(|_| fx.handle()).collect();
    let seen: Seen = Arc::default();
    for (i, h) in handles.iter().enumerate().rev() {
        h.subscribe(["t1", "t2"], recorder(&seen, &format!("h{i}")));
    }

    handles[0].publish("t1", json!(1), false);
    handles[0].publish("t2", json!(2), false);
    fx.queue.run_until_idle()?;

    let order: Vec<_> = seen.lock().iter().map(|(w, v)| format!("{w}:{v}")).collect();
    assert_eq!(order, ["h0:1", "h1:1", "h2:1", "h0:2", "h1:2", "h2:2"]);
    Ok(())
}

#[test]
fn handlers_may_use_the_bus_during_delivery() -> Result<()> {
    let fx = Fixture::new(false);
    let (a, b) = (fx.handle(), fx.handle());
    let seen: Seen = Arc::default();

    // a unsubscribes b and re-publishes on another topic.
    let b_for_a = b.clone();
    let a_pub = a.clone();
    a.subscribe("ping", move |_: &Envelope| {
        b_for_a.unsubscribe("ping");
        a_pub.publish("pong", json!("from a"), false);
        Ok(())
    });
    b.subscribe("ping", recorder(&seen, "b"));
    b.subscribe("pong", recorder(&seen, "b"));

    a.publish("ping", json!(0), false);
    assert_eq!(fx.queue.tick()?, 1);
    assert!(seen.lock().is_empty());

    assert_eq!(fx.queue.tick()?, 1);
    assert_eq!(*seen.lock(), vec![("b".to_string(), json!("from a"))]);
    Ok(())
}

#[test]
fn handler_errors_are_isolated_outside_debug_mode() -> Result<()> {
    let fx = Fixture::new(false);
    let (bad, good) = (fx.handle(), fx.handle());
    let seen: Seen = Arc::default();
    bad.subscribe("t", |_: &Envelope| anyhow::bail!("handler broke"));
    good.subscribe("t", recorder(&seen, "good"));

    bad.publish("t", json!(1), false);
    fx.queue.run_until_idle()?;
    assert_eq!(seen.lock().len(), 1);
    Ok(())
}

#[test]
fn handler_errors_surface_in_debug_mode() {
    let fx = Fixture::new(true);
    let (bad, good) = (fx.handle(), fx.handle());
    let seen: Seen = Arc::default();
    bad.subscribe("t", |_: &Envelope| anyhow::bail!("handler broke"));
    good.subscribe("t", recorder(&seen, "good"));

    bad.publish("t", json!(1), false);
    let err = fx.queue.tick().unwrap_err();
    assert!(format!("{err:#}").contains("handler broke"));
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn panicking_handlers_do_not_stop_delivery() -> Result<()> {
    for debug in [false, true] {
        let fx = Fixture::new(debug);
        let (bad, good) = (fx.handle(), fx.handle());
        let seen: Seen = Arc::default();
        bad.subscribe("t", |_: &Envelope| -> Result<()> { panic!("handler blew up") });
        good.subscribe("t", recorder(&seen, "good"));

        bad.publish("t", json!(1), false);
        let outcome = fx.queue.tick();
        assert_eq!(outcome.is_err(), debug);
        assert_eq!(seen.lock().len(), 1);

        bad.publish("t", json!(2), false);
        let _ = fx.queue.run_until_idle();
        assert_eq!(seen.lock().len(), 2);
    }
    Ok(())
}

#[test]
fn context_handlers_stop_when_the_context_is_gone() -> Result<()> {
    let fx = Fixture::new(false);
    let h = fx.handle();
    let ctx = Arc::new(Mutex::new(0u32));
    h.subscribe_with_context("t", &ctx, |ctx, _| {
        *ctx.lock() += 1;
        Ok(())
    });

    h.publish("t", json!(null), false);
    fx.queue.run_until_idle()?;
    assert_eq!(*ctx.lock(), 1);

    let weak = Arc::downgrade(&ctx);
    drop(ctx);
    h.publish("t", json!(null), false);
    fx.queue.run_until_idle()?;
    assert!(weak.upgrade().is_none());
    Ok(())
}

#[test]
fn modules_talk_through_the_mediator() -> Result<()> {
    let fx = Fixture::new(false);
    let reg = fx.core.registry();

    reg.define("listener", &["mediator"], |tools| {
        let bus = tools
            .get::<MediatorHandle>(0)
            .ok_or_else(|| anyhow::anyhow!("mediator missing"))?;
        Ok(ModuleObject::new()
            .field("heard", json!([]))
            .method("onStart", move |this, _| {
                bus.subscribe_with_context("greet", this, |this, env| {
                    let msg = env.get("msg").unwrap_or(Value::Null);
                    this.update("heard", |heard| {
                        if let Some(list) = heard.as_array_mut() {
                            list.push(msg);
                        }
                    });
                    Ok(())
                });
                Ok(Value::Null)
            }))
    })?;
    reg.define("speaker", &["mediator"], |tools| {
        let bus = tools
            .get::<MediatorHandle>(0)
            .ok_or_else(|| anyhow::anyhow!("mediator missing"))?;
        Ok(ModuleObject::new().method("onStart", move |_, args| {
            bus.publish("greet", args[0].clone(), false);
            Ok(Value::Null)
        }))
    })?;

    reg.start("listener", Value::Null)?;
    reg.start("speaker", json!({ "msg": "hello" }))?;
    fx.queue.run_until_idle()?;

    let listener = reg.get_instance("listener", None)?.expect("listener");
    assert_eq!(listener.instance().get("heard"), Some(json!(["hello"])));
    Ok(())
}

#[tokio::test]
async fn tokio_scheduler_delivers_in_publish_order() -> Result<()> {
    let core = Core::new();
    let sched = Arc::new(TokioScheduler::new());
    mediator::install(&core, sched.clone())?;
    let h = core
        .tools()
        .request(mediator::TOOL_NAME)
        .and_then(|t| t.downcast::<MediatorHandle>())
        .expect("mediator handle");

    let seen: Seen = Arc::default();
    h.subscribe("n", recorder(&seen, "h"));
    for i in 0..20 {
        h.publish("n", json!(i), false);
    }
    sched.flush().await;

    let values: Vec<Value> = seen.lock().iter().map(|(_, v)| v.clone()).collect();
    assert_eq!(values, (0..20).map(|i| json!(i)).collect::<Vec<_>>());
    sched.shutdown().await;
    Ok(())
}
