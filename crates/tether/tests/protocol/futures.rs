use std::collections::HashMap;

use anyhow::{Context, Result};
use serde_json::json;
use tether::{Error, Instance, Progress};

use super::common::{in_process, options};

#[tokio::test]
async fn single_call_deferred_and_resolved() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(call) = instance
        .start("fetch('x')", &options(&["fetch"]))
        .await?
    else {
        panic!("expected pending");
    };

    let Progress::ResolveFutures(ids) = instance.resume_as_future().await? else {
        panic!("expected resolve-futures");
    };
    assert_eq!(ids, vec![call.call_id]);
    assert_eq!(instance.pending_future_ids(), Some(ids.as_slice()));

    let results = HashMap::from([(call.call_id, json!("response_x"))]);
    let Progress::Complete(outcome) = instance
        .resolve_futures(results, HashMap::new())
        .await?
    else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!("response_x"));
    Ok(())
}

#[tokio::test]
async fn gather_style_batch_resolution() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(first) = instance
        .start("a = foo('x')\nb = bar('y')\na + b", &options(&["foo", "bar"]))
        .await?
    else {
        panic!("expected first pending");
    };
    let Progress::Pending(second) = instance.resume_as_future().await? else {
        panic!("expected second pending");
    };
    let Progress::ResolveFutures(ids) = instance.resume_as_future().await? else {
        panic!("expected resolve-futures");
    };
    assert_eq!(ids.len(), 2);

    let results = HashMap::from([(first.call_id, json!(10)), (second.call_id, json!(32))]);
    let Progress::Complete(outcome) = instance
        .resolve_futures(results, HashMap::new())
        .await?
    else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!(42));
    Ok(())
}

#[tokio::test]
async fn mixed_success_and_error_resolution() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(first) = instance
        .start("a = foo('x')\nb = bar('y')\na + b", &options(&["foo", "bar"]))
        .await?
    else {
        panic!("expected first pending");
    };
    let Progress::Pending(second) = instance.resume_as_future().await? else {
        panic!("expected second pending");
    };
    instance.resume_as_future().await?;

    let results = HashMap::from([(first.call_id, json!(10))]);
    let errors = HashMap::from([(second.call_id, "bar failed".to_owned())]);
    let Progress::Complete(outcome) = instance.resolve_futures(results, errors).await? else {
        panic!("expected completion");
    };
    let error = outcome.error.context("expected a guest error")?;
    assert_eq!(error.exc_type, "RuntimeError");
    assert!(error.message.contains("bar failed"));
    Ok(())
}

#[tokio::test]
async fn partial_resolution_keeps_the_rest_pending() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(first) = instance
        .start("a = foo('x')\nb = bar('y')\na + b", &options(&["foo", "bar"]))
        .await?
    else {
        panic!("expected first pending");
    };
    let Progress::Pending(second) = instance.resume_as_future().await? else {
        panic!("expected second pending");
    };
    instance.resume_as_future().await?;

    let results = HashMap::from([(first.call_id, json!(1))]);
    let Progress::ResolveFutures(remaining) = instance
        .resolve_futures(results, HashMap::new())
        .await?
    else {
        panic!("expected the remaining future to stay pending");
    };
    assert_eq!(remaining, vec![second.call_id]);

    let results = HashMap::from([(second.call_id, json!(2))]);
    let Progress::Complete(outcome) = instance
        .resolve_futures(results, HashMap::new())
        .await?
    else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!(3));
    Ok(())
}

#[tokio::test]
async fn unknown_call_id_is_a_caller_error() -> Result<()> {
    let mut instance = Instance::new(in_process());
    let Progress::Pending(call) = instance
        .start("fetch('x')", &options(&["fetch"]))
        .await?
    else {
        panic!("expected pending");
    };
    instance.resume_as_future().await?;

    let bogus = call.call_id + 99;
    let results = HashMap::from([(bogus, json!(1))]);
    let result = instance.resolve_futures(results, HashMap::new()).await;
    assert!(matches!(result, Err(Error::UnknownCallId(id)) if id == bogus));

    // The rejection happened before the transport; resolution still works.
    let results = HashMap::from([(call.call_id, json!("ok"))]);
    let Progress::Complete(outcome) = instance
        .resolve_futures(results, HashMap::new())
        .await?
    else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!("ok"));
    Ok(())
}

#[tokio::test]
async fn resume_is_rejected_while_awaiting_futures() -> Result<()> {
    let mut instance = Instance::new(in_process());
    instance.start("fetch('x')", &options(&["fetch"])).await?;
    instance.resume_as_future().await?;

    let result = instance.resume(json!(1)).await;
    assert!(matches!(
        result,
        Err(Error::InvalidState {
            state: "awaiting futures resolution",
            ..
        })
    ));
    instance.dispose().await;
    Ok(())
}

#[tokio::test]
async fn resolve_futures_is_rejected_while_awaiting_a_host_call() -> Result<()> {
    let mut instance = Instance::new(in_process());
    instance.start("fetch('x')", &options(&["fetch"])).await?;

    let result = instance
        .resolve_futures(HashMap::new(), HashMap::new())
        .await;
    assert!(matches!(
        result,
        Err(Error::InvalidState {
            state: "awaiting a host call",
            ..
        })
    ));
    instance.dispose().await;
    Ok(())
}
