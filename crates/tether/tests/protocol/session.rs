use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tether::{Error, ExecOptions, Instance, Progress, Session};
use tokio::sync::Mutex;

use super::common::{in_process, options};

fn session() -> (Session, Arc<Mutex<Instance>>) {
    let instance = Arc::new(Mutex::new(Instance::new(in_process())));
    (Session::new(Arc::clone(&instance)), instance)
}

async fn run_value(session: &mut Session, code: &str) -> Result<serde_json::Value> {
    let progress = session.run(code, &ExecOptions::new()).await?;
    let Progress::Complete(outcome) = progress else {
        panic!("expected completion, got {progress:?}");
    };
    if let Some(error) = outcome.error {
        panic!("unexpected guest error: {}", error.message);
    }
    Ok(outcome.value)
}

async fn run_error(session: &mut Session, code: &str) -> Result<tether::ErrorDescriptor> {
    let progress = session.run(code, &ExecOptions::new()).await?;
    let Progress::Complete(outcome) = progress else {
        panic!("expected completion, got {progress:?}");
    };
    outcome.error.context("expected a guest error")
}

#[tokio::test]
async fn p3_bindings_persist_across_runs() -> Result<()> {
    let (mut session, _instance) = session();

    run_value(&mut session, "x = 42").await?;
    run_value(&mut session, "y = x * 2").await?;
    let value = run_value(&mut session, "x + y").await?;
    assert_eq!(value, json!(126));

    session.clear_state();
    let error = run_error(&mut session, "x").await?;
    assert_eq!(error.exc_type, "NameError");
    Ok(())
}

#[tokio::test]
async fn p4_failed_runs_roll_back_to_the_last_commit() -> Result<()> {
    let (mut session, _instance) = session();

    run_value(&mut session, "x = 10").await?;
    let error = run_error(&mut session, "1/0").await?;
    assert_eq!(error.exc_type, "ZeroDivisionError");

    let value = run_value(&mut session, "x").await?;
    assert_eq!(value, json!(10));
    Ok(())
}

#[tokio::test]
async fn private_names_never_persist() -> Result<()> {
    let (mut session, _instance) = session();

    run_value(&mut session, "x = 1\n_hidden = 2").await?;
    assert!(session.state().contains_key("x"));
    assert!(!session.state().contains_key("_hidden"));

    let error = run_error(&mut session, "_hidden").await?;
    assert_eq!(error.exc_type, "NameError");
    Ok(())
}

#[tokio::test]
async fn non_representable_values_are_dropped_not_fatal() -> Result<()> {
    let (mut session, _instance) = session();

    run_value(&mut session, "x = 1\ny = opaque()").await?;
    assert_eq!(session.state().get("x"), Some(&json!(1)));
    assert!(!session.state().contains_key("y"), "opaque binding must be dropped");

    let error = run_error(&mut session, "y").await?;
    assert_eq!(error.exc_type, "NameError");
    Ok(())
}

#[tokio::test]
async fn caller_host_calls_surface_through_the_session() -> Result<()> {
    let (mut session, _instance) = session();

    let progress = session
        .run("data = fetch('u')\ndata", &options(&["fetch"]))
        .await?;
    let Progress::Pending(call) = progress else {
        panic!("expected the caller's host call to surface, got {progress:?}");
    };
    assert_eq!(call.function_name, "fetch", "hidden hooks must never leak");

    let Progress::Complete(outcome) = session.resume(json!("payload")).await? else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!("payload"));
    assert_eq!(session.state().get("data"), Some(&json!("payload")));
    Ok(())
}

#[tokio::test]
async fn injected_host_call_error_rolls_state_back() -> Result<()> {
    let (mut session, _instance) = session();

    run_value(&mut session, "kept = 1").await?;
    let progress = session
        .run("data = fetch('u')\ndata", &options(&["fetch"]))
        .await?;
    assert!(matches!(progress, Progress::Pending(_)));

    let Progress::Complete(outcome) = session.resume_with_error("backend down").await? else {
        panic!("expected completion");
    };
    let error = outcome.error.context("expected a guest error")?;
    assert_eq!(error.exc_type, "RuntimeError");

    assert_eq!(session.state().len(), 1, "failed run must not commit");
    assert_eq!(session.state().get("kept"), Some(&json!(1)));
    Ok(())
}

#[tokio::test]
async fn consecutive_runs_reuse_one_instance() -> Result<()> {
    let (mut session, instance) = session();

    run_value(&mut session, "x = 2").await?;
    let value = run_value(&mut session, "x * 3").await?;
    assert_eq!(value, json!(6));
    assert_eq!(
        instance.lock().await.lifecycle(),
        tether::Lifecycle::Idle,
        "each session run leaves the wrapped instance idle"
    );
    Ok(())
}

#[tokio::test]
async fn dispose_clears_state_but_not_the_shared_instance() -> Result<()> {
    let (mut session, instance) = session();

    run_value(&mut session, "x = 5").await?;
    session.dispose();
    assert!(session.state().is_empty());

    let result = session.run("1", &ExecOptions::new()).await;
    assert!(matches!(
        result,
        Err(Error::InvalidState {
            state: "disposed",
            ..
        })
    ));

    // Shared ownership: the wrapped instance is still usable directly.
    let outcome = instance
        .lock()
        .await
        .run("1 + 1", &ExecOptions::new())
        .await?;
    assert_eq!(outcome.value, json!(2));
    Ok(())
}

#[tokio::test]
async fn clear_state_only_touches_the_map() -> Result<()> {
    let (mut session, _instance) = session();

    run_value(&mut session, "x = 1").await?;
    session.clear_state();
    assert!(session.state().is_empty());

    // The session still runs fine afterwards.
    let value = run_value(&mut session, "7").await?;
    assert_eq!(value, json!(7));
    Ok(())
}

#[tokio::test]
async fn state_survives_runs_that_touch_host_calls_and_prints() -> Result<()> {
    let (mut session, _instance) = session();

    run_value(&mut session, "x = 2").await?;
    let progress = session
        .run("print(x)\ny = fetch(x)\ny", &options(&["fetch"]))
        .await?;
    let Progress::Pending(call) = progress else {
        panic!("expected pending");
    };
    assert_eq!(call.args, vec![json!(2)]);

    let Progress::Complete(outcome) = session.resume(json!(9)).await? else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!(9));
    assert_eq!(outcome.print_output.as_deref(), Some("2\n"));
    assert_eq!(session.state().get("y"), Some(&json!(9)));
    Ok(())
}
