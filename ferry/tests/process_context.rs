//! Process-backend contexts against the real `ferry-worker` binary.

use std::time::{Duration, Instant};

use ferry::task::diagnostic::{Abort, Echo, Fail, Identify, Identity, Relay, Sleep};
use ferry::{
    CancellationToken, ContextConfig, ContextError, ContextFactory, ContextState, TaskEnvelope,
};

fn factory() -> ContextFactory {
    ContextFactory::process()
        .with_config(ContextConfig::default().with_worker_bin(env!("CARGO_BIN_EXE_ferry-worker")))
}

fn never() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn join_returns_entry_value() {
    let factory = factory();
    for value in [
        serde_json::json!(7),
        serde_json::json!("across the process boundary"),
        serde_json::json!({"list": [1, 2, {"deep": true}], "none": null}),
        serde_json::Value::Null,
    ] {
        let context = factory.create(&Echo::new(value.clone())).unwrap();
        context.start().await.unwrap();
        assert_eq!(context.join(&never()).await.unwrap(), value);
    }
}

#[tokio::test]
async fn runs_in_another_process() {
    let context = factory().create(&Identify::default()).unwrap();
    context.start().await.unwrap();
    let pid = context.pid().unwrap();
    let identity: Identity = serde_json::from_value(context.join(&never()).await.unwrap()).unwrap();
    assert_eq!(identity.pid, pid);
    assert_ne!(identity.pid, std::process::id());
}

#[tokio::test]
async fn failure_message_survives() {
    let context = factory().create(&Fail::new("Test message")).unwrap();
    context.start().await.unwrap();
    let err = context.join(&never()).await.unwrap_err();
    assert!(err.to_string().contains("Test message"), "{err}");
}

#[tokio::test]
async fn unknown_entry_reports_failure_and_exits_non_zero() {
    let context = factory().create_envelope(TaskEnvelope {
        name: "no::such::task".to_string(),
        payload: serde_json::Value::Null,
    });
    context.start().await.unwrap();
    match context.join(&never()).await.unwrap_err() {
        ContextError::Failed(failure) => {
            assert_eq!(failure.kind, ferry::task::UNRESOLVABLE_KIND);
            assert!(failure.message.contains("no::such::task"), "{}", failure.message);
        }
        other => panic!("expected an unresolvable failure, got {other}"),
    }

    let status = tokio::time::timeout(Duration::from_secs(5), context.termination())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status, "exit status: 1");
}

#[tokio::test]
async fn kill_is_prompt() {
    let context = factory().create(&Sleep::new(Duration::from_secs(60))).unwrap();
    context.start().await.unwrap();

    let started = Instant::now();
    context.kill();
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(!context.is_running());

    let deadline = Instant::now() + Duration::from_secs(5);
    while context.is_alive() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!context.is_alive());
}

#[tokio::test]
async fn abort_is_a_crash() {
    let context = factory().create(&Abort::default()).unwrap();
    context.start().await.unwrap();
    let err = context.join(&never()).await.unwrap_err();
    assert!(matches!(err, ContextError::Crashed { .. }), "{err}");
    assert_eq!(context.state(), ContextState::Crashed);
}

#[cfg(unix)]
#[tokio::test]
async fn signal_terminates_the_process() {
    use nix::sys::signal::Signal;

    let context = factory().create(&Sleep::new(Duration::from_secs(60))).unwrap();
    context.start().await.unwrap();
    context.signal(Signal::SIGTERM).unwrap();

    let err = context.join(&never()).await.unwrap_err();
    match err {
        ContextError::Crashed { reason } => assert!(reason.contains("signal"), "{reason}"),
        other => panic!("expected a crash, got {other}"),
    }
}

#[tokio::test]
async fn messages_flow_both_ways() {
    let context = factory().create(&Relay { limit: Some(3) }).unwrap();
    context.start().await.unwrap();
    for i in 0..3 {
        context.send(&i).await.unwrap();
        assert_eq!(context.receive::<i32>(&never()).await.unwrap(), i);
    }
    assert_eq!(context.join(&never()).await.unwrap(), serde_json::json!(3));
}

#[tokio::test]
async fn channel_after_exit_stopped_responding() {
    let context = factory().create(&Echo::new(1)).unwrap();
    context.start().await.unwrap();
    context.join(&never()).await.unwrap();

    let err = context.send(&"late").await.unwrap_err();
    assert!(err.to_string().contains("stopped responding"), "{err}");
}

#[tokio::test]
async fn cancelled_join_then_join_again() {
    let context = factory().create(&Sleep::new(Duration::from_millis(300))).unwrap();
    context.start().await.unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });
    assert!(matches!(context.join(&cancel).await, Err(ContextError::Cancelled)));
    assert!(context.is_running());
    assert_eq!(context.join(&never()).await.unwrap(), serde_json::json!(300));
}

#[tokio::test]
async fn unserializable_value_does_not_break_channel() {
    struct LiveHandle;
    impl serde::Serialize for LiveHandle {
        fn serialize<S: serde::Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("cannot serialize a live handle"))
        }
    }

    let context = factory().create(&Relay { limit: Some(1) }).unwrap();
    context.start().await.unwrap();
    assert!(matches!(context.send(&LiveHandle).await, Err(ContextError::Serialization(_))));
    context.send(&"still fine").await.unwrap();
    assert_eq!(context.receive::<String>(&never()).await.unwrap(), "still fine");
}

#[tokio::test]
async fn double_start_and_early_join_are_status_errors() {
    let context = factory().create(&Echo::new(1)).unwrap();
    assert!(matches!(context.join(&never()).await, Err(ContextError::Status(_))));
    context.start().await.unwrap();
    assert!(matches!(context.start().await, Err(ContextError::Status(_))));
    context.join(&never()).await.unwrap();
}
