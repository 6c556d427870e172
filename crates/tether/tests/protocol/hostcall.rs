use anyhow::{Context, Result};
use serde_json::json;
use tether::{Instance, Progress};

use super::common::{in_process, options};

#[tokio::test]
async fn p6_fetch_round_trip() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let progress = instance
        .start("fetch(\"https://example.com\")", &options(&["fetch"]))
        .await
        .context("failed to start fetch program")?;

    let Progress::Pending(call) = progress else {
        panic!("expected a pending host call, got {progress:?}");
    };
    assert_eq!(call.function_name, "fetch");
    assert_eq!(call.args, vec![json!("https://example.com")]);
    assert!(call.kwargs.is_none());
    assert!(!call.method_call);

    let progress = instance.resume(json!("response body")).await?;
    let Progress::Complete(outcome) = progress else {
        panic!("expected completion, got {progress:?}");
    };
    assert_eq!(outcome.value, json!("response body"));
    Ok(())
}

#[tokio::test]
async fn pending_call_accessor_matches_the_returned_call() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(call) = instance
        .start("fetch('u')", &options(&["fetch"]))
        .await?
    else {
        panic!("expected pending");
    };
    let mirrored = instance.pending_call().context("accessor should mirror the pause")?;
    assert_eq!(mirrored.function_name, call.function_name);
    assert_eq!(mirrored.call_id, call.call_id);
    instance.dispose().await;
    Ok(())
}

#[tokio::test]
async fn sequential_calls_get_monotonic_ids() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(first) = instance
        .start("a = ext_fn(1)\nb = ext_fn(2)\na + b", &options(&["ext_fn"]))
        .await?
    else {
        panic!("expected first pending");
    };

    let Progress::Pending(second) = instance.resume(json!(100)).await? else {
        panic!("expected second pending");
    };
    assert!(
        second.call_id > first.call_id,
        "call ids must increase: {} then {}",
        first.call_id,
        second.call_id
    );

    let Progress::Complete(outcome) = instance.resume(json!(200)).await? else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!(300));
    Ok(())
}

#[tokio::test]
async fn kwargs_travel_with_the_call() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(call) = instance
        .start("ext_fn(1, key='val')", &options(&["ext_fn"]))
        .await?
    else {
        panic!("expected pending");
    };
    assert_eq!(call.args, vec![json!(1)]);
    let kwargs = call.kwargs.context("expected keyword arguments")?;
    assert_eq!(kwargs.get("key"), Some(&json!("val")));
    instance.dispose().await;
    Ok(())
}

#[tokio::test]
async fn method_call_syntax_is_flagged() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(call) = instance
        .start("api.fetch('u')", &options(&["fetch"]))
        .await?
    else {
        panic!("expected pending");
    };
    assert_eq!(call.function_name, "fetch");
    assert!(call.method_call);
    instance.dispose().await;
    Ok(())
}

#[tokio::test]
async fn resume_with_error_surfaces_as_guest_failure() -> Result<()> {
    let mut instance = Instance::new(in_process());
    instance
        .start("result = ext_fn(1)\nresult", &options(&["ext_fn"]))
        .await?;

    let Progress::Complete(outcome) = instance
        .resume_with_error("something went wrong")
        .await?
    else {
        panic!("expected completion");
    };
    let error = outcome.error.context("expected a guest error")?;
    assert_eq!(error.exc_type, "RuntimeError");
    assert!(error.message.contains("something went wrong"));
    Ok(())
}

#[tokio::test]
async fn print_output_accumulates_across_steps() -> Result<()> {
    let mut instance = Instance::new(in_process());
    instance
        .start(
            "print('before')\na = ext_fn(1)\nprint('after')\na + 10",
            &options(&["ext_fn"]),
        )
        .await?;
    let Progress::Complete(outcome) = instance.resume(json!(5)).await? else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!(15));
    assert_eq!(outcome.print_output.as_deref(), Some("before\nafter\n"));
    Ok(())
}

#[tokio::test]
async fn no_print_output_means_none() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let outcome = instance.run("2 + 2", &tether::ExecOptions::new()).await?;
    assert!(outcome.print_output.is_none());
    Ok(())
}
