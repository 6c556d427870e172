use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tether::transport::Transport;
use tether::{ExecOptions, Instance, Progress, Session};
use tokio::sync::Mutex;

use super::common::{in_process, options};

#[tokio::test]
async fn p5_independent_instances_never_share_bindings() -> Result<()> {
    let transport = in_process();
    let mut first = Instance::new(Arc::clone(&transport) as Arc<dyn Transport>);
    let mut second = Instance::new(Arc::clone(&transport) as Arc<dyn Transport>);

    let first_options = ExecOptions::new();
    let second_options = ExecOptions::new();
    let (left, right) = tokio::join!(
        first.run("x = 1\nx", &first_options),
        second.run("y = 2\ny", &second_options),
    );
    assert_eq!(left?.value, json!(1));
    assert_eq!(right?.value, json!(2));

    // Neither execution can see the other's namespace.
    let outcome = second.run("x", &ExecOptions::new()).await?;
    let error = outcome.error.context("expected a name error")?;
    assert_eq!(error.exc_type, "NameError");
    Ok(())
}

#[tokio::test]
async fn paused_instances_resume_independently() -> Result<()> {
    let transport = in_process();
    let mut first = Instance::new(Arc::clone(&transport) as Arc<dyn Transport>);
    let mut second = Instance::new(Arc::clone(&transport) as Arc<dyn Transport>);

    let Progress::Pending(call_a) = first
        .start("a = ext_fn('first')\na", &options(&["ext_fn"]))
        .await?
    else {
        panic!("expected first pending");
    };
    let Progress::Pending(call_b) = second
        .start("b = ext_fn('second')\nb", &options(&["ext_fn"]))
        .await?
    else {
        panic!("expected second pending");
    };
    assert_eq!(call_a.args, vec![json!("first")]);
    assert_eq!(call_b.args, vec![json!("second")]);

    // Resume out of creation order.
    let Progress::Complete(outcome_b) = second.resume(json!("B")).await? else {
        panic!("expected completion");
    };
    let Progress::Complete(outcome_a) = first.resume(json!("A")).await? else {
        panic!("expected completion");
    };
    assert_eq!(outcome_a.value, json!("A"));
    assert_eq!(outcome_b.value, json!("B"));
    Ok(())
}

#[tokio::test]
async fn sessions_on_one_transport_keep_separate_namespaces() -> Result<()> {
    let transport = in_process();
    let first_instance = Arc::new(Mutex::new(Instance::new(
        Arc::clone(&transport) as Arc<dyn Transport>
    )));
    let second_instance = Arc::new(Mutex::new(Instance::new(
        Arc::clone(&transport) as Arc<dyn Transport>
    )));
    let mut first = Session::new(first_instance);
    let mut second = Session::new(second_instance);

    first.run("x = 1", &ExecOptions::new()).await?;
    second.run("x = 2", &ExecOptions::new()).await?;

    let Progress::Complete(outcome) = first.run("x", &ExecOptions::new()).await? else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!(1));
    let Progress::Complete(outcome) = second.run("x", &ExecOptions::new()).await? else {
        panic!("expected completion");
    };
    assert_eq!(outcome.value, json!(2));
    Ok(())
}

#[tokio::test]
async fn many_instances_run_concurrently() -> Result<()> {
    let transport = in_process();
    let mut tasks = tokio::task::JoinSet::new();
    for index in 0..8_i64 {
        let transport = Arc::clone(&transport);
        tasks.spawn(async move {
            let mut instance = Instance::new(transport as Arc<dyn Transport>);
            let code = format!("v = {index}\nv * 10");
            let outcome = instance.run(code, &ExecOptions::new()).await?;
            Ok::<_, tether::Error>((index, outcome.value))
        });
    }
    while let Some(joined) = tasks.join_next().await {
        let (index, value) = joined??;
        assert_eq!(value, json!(index * 10));
    }
    Ok(())
}
