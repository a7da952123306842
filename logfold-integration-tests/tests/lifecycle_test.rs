//! Stopping, restarting, and halting on fatal errors.

#![allow(clippy::uninlined_format_args)]

mod common;

use async_trait::async_trait;
use common::{counter_added, names, user_added, users_engine, User, Users};
use logfold::prelude::*;
use logfold_memory::{InMemoryLog, InMemoryLogConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;

/// Counts events; the first projection announces itself and then stalls.
struct SlowFirst {
    started: Arc<Notify>,
}

#[async_trait]
impl EventHandler<u64> for SlowFirst {
    async fn project(&self, ctx: &EventContext<'_, u64>) -> HandlerResult<Option<u64>> {
        if ctx.position == Some(Position::ZERO) {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok(Some(ctx.state + 1))
    }
}

async fn slow_engine() -> (Engine<u64>, Arc<Notify>) {
    let started = Arc::new(Notify::new());
    let engine = Engine::builder(InMemoryLog::ephemeral(), 0_u64)
        .register(
            "Counted",
            SlowFirst {
                started: Arc::clone(&started),
            },
        )
        .expect("Counted should register")
        .build()
        .await
        .expect("engine should start");
    (engine, started)
}

#[tokio::test]
async fn stop_finishes_the_current_record_and_fails_the_rest() {
    // Given: a record whose projection is under way and one queued behind it
    let (engine, started) = slow_engine().await;
    let first = engine.enqueue("Counted", &()).await.expect("appended");
    let second = engine.enqueue("Counted", &()).await.expect("appended");
    started.notified().await;

    // When: the engine is stopped
    engine.stop().await;

    // Then: the running projection completes and the queued one fails
    assert!(first.wait().await.is_ok());
    assert!(matches!(second.wait().await, Err(EngineError::Stopped)));
    assert_eq!(engine.state(), 1);
    assert!(!engine.is_running());
    assert!(engine.fatal_error().is_none());

    let err = engine
        .submit("Counted", &())
        .await
        .expect_err("stopped engines accept nothing");
    assert!(matches!(err, EngineError::Stopped));
}

#[tokio::test]
async fn stopping_twice_is_harmless() {
    let (_log, engine) = users_engine().await;
    engine.stop().await;
    engine.stop().await;
    assert!(!engine.is_running());
    assert!(matches!(engine.wait_for_halt().await, EngineError::Stopped));
}

#[tokio::test]
async fn positions_reached_before_stopping_stay_reached() {
    let (_log, engine) = users_engine().await;
    engine
        .submit("UserAdded", &User::named("John Doe"))
        .await
        .expect("submission should be projected");
    engine.stop().await;

    for _ in 0..50 {
        engine
            .wait_for_position(Position::new(1))
            .await
            .expect("position 1 was reached before the stop");
    }
    assert!(matches!(
        engine.wait_for_position(Position::new(2)).await,
        Err(EngineError::Stopped)
    ));
}

#[tokio::test]
async fn restart_racing_a_stop_runs_after_it() {
    let (_log, engine) = users_engine().await;

    let ((), restarted) = tokio::join!(engine.stop(), engine.restart(None));
    restarted.expect("restart should succeed");

    // The restart is the last word, so its loop is live and projecting.
    assert!(engine.is_running());
    assert!(engine.fatal_error().is_none());
    let event = engine
        .submit("UserAdded", &User::named("John Doe"))
        .await
        .expect("restarted engines keep projecting");
    assert_eq!(event.position, Some(Position::ZERO));
    engine.stop().await;
}

#[tokio::test]
async fn restart_discards_an_ephemeral_log() {
    let (old_log, engine) = users_engine().await;
    for name in ["John Doe", "John Moe"] {
        engine
            .submit("UserAdded", &User::named(name))
            .await
            .expect("submission should be projected");
    }
    let old_handle = engine.log_handle();

    engine.restart(None).await.expect("restart should succeed");

    assert_eq!(engine.position(), Position::ZERO);
    assert_eq!(engine.state(), Users::default());
    assert_ne!(engine.log_handle(), old_handle);
    assert_eq!(old_log.len(), 2);

    let event = engine
        .submit("UserAdded", &User::named("John Norum"))
        .await
        .expect("restarted engines keep projecting");
    assert_eq!(event.position, Some(Position::ZERO));
    assert_eq!(names(&engine.state()), vec!["John Norum"]);
    assert_eq!(engine.registered_types().len(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn restart_can_start_from_a_new_state() {
    let engine = Engine::builder(InMemoryLog::ephemeral(), 0_i64)
        .register("Added", counter_added())
        .expect("Added should register")
        .build()
        .await
        .expect("engine should start");
    engine.submit("Added", &4).await.expect("4 should project");

    engine.restart(Some(100)).await.expect("restart should succeed");
    assert_eq!(engine.state(), 100);
    assert_eq!(engine.initial_state(), 0);

    engine.submit("Added", &1).await.expect("1 should project");
    assert_eq!(engine.state(), 101);
    engine.stop().await;
}

#[tokio::test]
async fn restart_is_refused_for_named_logs() {
    let handle = LogHandle::try_new("restart-refused.log").expect("valid handle");
    let engine = Engine::start(InMemoryLog::open(handle), Users::default())
        .await
        .expect("engine should start");
    engine
        .register("UserAdded", user_added())
        .expect("UserAdded should register");
    engine
        .submit("UserAdded", &User::named("John Doe"))
        .await
        .expect("submission should be projected");

    let err = engine.restart(None).await.expect_err("named logs are kept");

    assert!(matches!(err, EngineError::UnsupportedOperation(_)));
    assert!(engine.is_running());
    assert_eq!(names(&engine.state()), vec!["John Doe"]);
    engine.stop().await;
}

#[tokio::test]
async fn restart_fails_submissions_pending_on_the_old_log() {
    let (engine, started) = slow_engine().await;
    let first = engine.enqueue("Counted", &()).await.expect("appended");
    let second = engine.enqueue("Counted", &()).await.expect("appended");
    started.notified().await;

    engine.restart(None).await.expect("restart should succeed");

    assert!(first.wait().await.is_ok());
    assert!(matches!(second.wait().await, Err(EngineError::Restarted)));
    assert_eq!(engine.state(), 0);
    assert!(engine.is_running());
    engine.stop().await;
}

#[tokio::test]
async fn restart_waits_for_in_flight_appends() {
    let config = InMemoryLogConfig::default()
        .with_write_latency(Duration::from_millis(30), Duration::from_millis(30));
    let log = InMemoryLog::ephemeral_with(config);
    let engine = Engine::builder(log.clone(), Users::default())
        .register("UserAdded", user_added())
        .expect("UserAdded should register")
        .build()
        .await
        .expect("engine should start");

    let submitter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.enqueue("UserAdded", &User::named("John Doe")).await })
    };
    while log.is_drained() {
        tokio::task::yield_now().await;
    }

    engine.restart(None).await.expect("restart should succeed");

    // The slow append landed in the discarded log, never in the fresh one.
    assert_eq!(log.len(), 1);
    let pending = submitter
        .await
        .expect("task should not panic")
        .expect("append should succeed");
    assert!(matches!(pending.wait().await, Err(EngineError::Restarted)));
    assert_eq!(engine.position(), Position::ZERO);
    assert_eq!(engine.state(), Users::default());
    engine.stop().await;
}

/// Wraps a log and silently drops the record at one position.
#[derive(Debug)]
struct GappyLog {
    inner: Arc<InMemoryLog>,
    gap: Position,
}

#[derive(Debug)]
struct GappySubscription {
    inner: Box<dyn LogSubscription>,
    gap: Position,
}

#[async_trait]
impl DurableLog for GappyLog {
    fn handle(&self) -> &LogHandle {
        self.inner.handle()
    }

    fn is_ephemeral(&self) -> bool {
        false
    }

    async fn append(&self, record: EventRecord) -> LogResult<AppendMetadata> {
        self.inner.append(record).await
    }

    async fn subscribe(&self, from: Position) -> LogResult<Box<dyn LogSubscription>> {
        Ok(Box::new(GappySubscription {
            inner: self.inner.subscribe(from).await?,
            gap: self.gap,
        }))
    }

    fn is_drained(&self) -> bool {
        self.inner.is_drained()
    }

    async fn drained(&self) {
        self.inner.drained().await;
    }

    async fn fresh(&self) -> LogResult<Arc<dyn DurableLog>> {
        Err(LogError::Unsupported("fresh".to_string()))
    }
}

#[async_trait]
impl LogSubscription for GappySubscription {
    async fn next(&mut self) -> Option<LogResult<Delivery>> {
        loop {
            let delivery = self.inner.next().await?;
            match delivery {
                Ok(delivery) if delivery.position == self.gap => continue,
                other => return Some(other),
            }
        }
    }

    fn pause(&mut self) {
        self.inner.pause();
    }

    fn resume(&mut self) {
        self.inner.resume();
    }

    fn is_paused(&self) -> bool {
        self.inner.is_paused()
    }

    fn unsubscribe(&mut self) {
        self.inner.unsubscribe();
    }

    fn cursor(&self) -> Position {
        self.inner.cursor()
    }
}

#[tokio::test]
async fn out_of_order_delivery_halts_the_engine() {
    // Given: a log that never delivers position 1
    let log = Arc::new(GappyLog {
        inner: InMemoryLog::ephemeral(),
        gap: Position::new(1),
    });
    let engine = Engine::builder(log, 0_i64)
        .register("Added", counter_added())
        .expect("Added should register")
        .build()
        .await
        .expect("engine should start");

    engine.submit("Added", &1).await.expect("1 should project");
    let skipped = engine.enqueue("Added", &2).await.expect("appended");

    // When: position 2 arrives while 1 is still expected
    let err = engine
        .submit("Added", &3)
        .await
        .expect_err("the gap is fatal");

    // Then: the loop halts and everything pending fails with the same error
    match &err {
        EngineError::OrderingViolation {
            expected,
            delivered,
        } => {
            assert_eq!(*expected, Position::new(1));
            assert_eq!(*delivered, Position::new(2));
        }
        other => panic!("Expected OrderingViolation, got {other:?}"),
    }
    assert!(err.to_string().starts_with("Major internal error"));
    assert!(matches!(
        skipped.wait().await,
        Err(EngineError::OrderingViolation { .. })
    ));
    assert!(!engine.is_running());
    assert!(engine
        .fatal_error()
        .is_some_and(|reason| reason.is_fatal()));
    assert_eq!(engine.state(), 1);

    let err = engine
        .submit("Added", &4)
        .await
        .expect_err("halted engines accept nothing");
    assert!(err.is_fatal());
}

#[tokio::test]
async fn closing_the_log_halts_the_engine() {
    let (log, engine) = users_engine().await;
    engine
        .submit("UserAdded", &User::named("John Doe"))
        .await
        .expect("submission should be projected");

    log.close();
    let reason = engine.wait_for_halt().await;

    assert!(matches!(reason, EngineError::Log(LogError::Closed)));
    assert!(!engine.is_running());
    assert_eq!(names(&engine.state()), vec!["John Doe"]);
}

#[tokio::test]
async fn dropping_every_handle_ends_the_loop() {
    let (_log, engine) = users_engine().await;
    let mut signals = engine.signals();

    drop(engine);

    // The signal channel lives as long as the loop does.
    let closed = tokio::time::timeout(Duration::from_secs(1), signals.recv())
        .await
        .expect("loop should end once the engine is dropped");
    assert!(matches!(closed, Err(RecvError::Closed)));
}
