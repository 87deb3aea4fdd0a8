//! Integration tests driving the keying stages through the pipeline
//! orchestrator.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{write_pattern, write_solid, Behaviour, FakeCompositor, Fixture};
use keyforge::{KeyColor, KeyingActivity};
use kf_av::StillImageDecoder;
use kf_pipeline::{
    Activity, ActivityContext, ActivityKind, ActivityOutput, FnActivity, PipelineOrchestrator,
};

fn notify_handler(fail: bool, calls: Arc<AtomicUsize>) -> Box<dyn Activity> {
    Box::new(FnActivity::handler("Notify", move || {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err(kf_core::Error::pipeline("Notify", "webhook unreachable"))
            } else {
                Ok(ActivityOutput::summary("sent"))
            }
        }
    }))
}

#[tokio::test]
async fn handler_failures_do_not_fail_a_keyed_pipeline() {
    let fx = Fixture::new();
    let config = fx.config();
    let forensics = fx.forensics(
        &config,
        FakeCompositor::new(Behaviour::KeyMatch(KeyColor::GREEN)),
    );
    let calls = Arc::new(AtomicUsize::new(0));

    let pipeline = PipelineOrchestrator::new(vec![
        Box::new(KeyingActivity::new(
            forensics,
            &fx.input,
            &fx.output,
            config.keying.params(),
        )),
        notify_handler(true, calls.clone()),
    ]);

    let result = pipeline.execute(&ActivityContext::new()).await;
    assert!(result.success, "{:?}", result.error);
    assert!(result.core_failures.is_empty());
    assert_eq!(result.results.len(), 2);
    assert!(!result.results[1].success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn black_output_is_a_core_failure() {
    let fx = Fixture::new();
    let config = fx.config();
    let forensics = fx.forensics(&config, FakeCompositor::new(Behaviour::AlwaysBlack));
    let calls = Arc::new(AtomicUsize::new(0));

    let pipeline = PipelineOrchestrator::new(vec![
        Box::new(KeyingActivity::new(
            forensics,
            &fx.input,
            &fx.output,
            config.keying.params(),
        )),
        notify_handler(false, calls.clone()),
    ]);

    let result = pipeline.execute(&ActivityContext::new()).await;
    assert!(!result.success);
    assert_eq!(result.core_failures.len(), 1);
    assert_eq!(result.core_failures[0].kind, ActivityKind::CoreFunction);
    assert!(result.core_failures[0]
        .error
        .as_deref()
        .unwrap()
        .contains("black output"));
    // Later stages still ran.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn attached_gate_persists_the_keyed_artifact() {
    let fx = Fixture::new();
    let config = fx.config();
    let forensics = fx.forensics(&config, FakeCompositor::new(Behaviour::AlwaysContent));
    let gate = Arc::new(fx.gate(&config, Arc::new(StillImageDecoder::default())));

    let pipeline = PipelineOrchestrator::new(vec![Box::new(KeyingActivity::new(
        forensics,
        &fx.input,
        &fx.output,
        config.keying.params(),
    ))])
    .with_gate(Arc::new(gate.bind(&fx.final_path, config.gate.threshold)));

    let result = pipeline.execute(&ActivityContext::new()).await;
    assert!(result.success, "{:?}", result.error);
    let gate_result = result.gate.unwrap();
    assert!(gate_result.passed);
    assert!(gate_result.bootstrapped);
    assert!(fx.final_path.exists());
}

#[tokio::test]
async fn failing_gate_fails_the_pipeline_and_keeps_final() {
    let fx = Fixture::new();
    let config = fx.config();
    let forensics = fx.forensics(&config, FakeCompositor::new(Behaviour::AlwaysContent));
    let gate = Arc::new(fx.gate(&config, Arc::new(StillImageDecoder::default())));

    let reference = fx.path("white.png");
    write_solid(&reference, [255, 255, 255]);
    gate.establish_baseline(&reference, "golden").await.unwrap();

    let pipeline = PipelineOrchestrator::new(vec![Box::new(KeyingActivity::new(
        forensics,
        &fx.input,
        &fx.output,
        config.keying.params(),
    ))])
    .with_gate(Arc::new(gate.bind(&fx.final_path, config.gate.threshold)));

    let result = pipeline.execute(&ActivityContext::new()).await;
    assert!(!result.success);
    assert!(result.core_failures.is_empty());
    assert!(!result.gate.unwrap().passed);
    assert!(!fx.final_path.exists());
}

#[tokio::test]
async fn gate_sees_the_last_core_artifact() {
    let fx = Fixture::new();
    let config = fx.config();
    let gate = Arc::new(fx.gate(&config, Arc::new(StillImageDecoder::default())));

    let first = fx.path("first.png");
    let second = fx.path("second.png");
    write_pattern(&first);
    write_pattern(&second);

    let (a, b) = (first.clone(), second.clone());
    let pipeline = PipelineOrchestrator::new(vec![
        Box::new(FnActivity::core("Stage One", move || {
            let a = a.clone();
            async move { Ok(ActivityOutput::artifact(a, "first")) }
        })),
        Box::new(FnActivity::core("Stage Two", move || {
            let b = b.clone();
            async move { Ok(ActivityOutput::artifact(b, "second")) }
        })),
    ])
    .with_gate(Arc::new(gate.bind(&fx.final_path, config.gate.threshold)));

    let result = pipeline.execute(&ActivityContext::new()).await;
    assert!(result.success, "{:?}", result.error);
    assert_eq!(
        gate.baseline().unwrap().path,
        config.gate.baseline_dir.join("golden.png")
    );
    assert_eq!(std::fs::read(&fx.final_path).unwrap(), std::fs::read(&second).unwrap());
}
