//! End-to-end tests for the orchestrator, exercised against the crate's
//! own fakes (`FakeDriver`, `FakeScriptEngine`, `RecordingObserver`)
//! rather than mocks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;

use flow_orchestrator_core::driver::fakes::FakeDriver;
use flow_orchestrator_core::driver::ViewHierarchy;
use flow_orchestrator_core::error::FlowError;
use flow_orchestrator_core::metadata::fakes::{ObservedEvent, RecordingObserver};
use flow_orchestrator_core::protocol::{
    CommandEnvelope, CommandKind, Condition, Direction, ElementSelector,
};
use flow_orchestrator_core::script_engine::fakes::FakeScriptEngine;
use flow_orchestrator_core::script_engine::ScriptEngine;
use flow_orchestrator_core::Orchestrator;

/// Tapping an optional, absent element warns instead of failing the flow.
#[tokio::test]
async fn optional_missing_element_warns_and_flow_succeeds() {
    let driver = std::sync::Arc::new(FakeDriver::new(ViewHierarchy::default()));
    let engine = std::sync::Arc::new(FakeScriptEngine::default());
    let observer = std::sync::Arc::new(RecordingObserver::default());
    let orchestrator = Orchestrator::new(driver, engine, observer.clone());

    let tap = CommandEnvelope::new(CommandKind::TapOnElement {
        selector: ElementSelector {
            optional: true,
            ..ElementSelector::by_text("Foo")
        },
        retry_if_no_change: false,
        wait_until_visible: false,
        long_press: false,
        app_id: None,
        tap_repeat: None,
        wait_to_settle_timeout_ms: None,
    })
    .optional(true);

    let ok = orchestrator.run_flow(&[tap]).await.unwrap();
    assert!(ok);

    let events = observer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ObservedEvent::FlowStart,
            ObservedEvent::Start(0),
            ObservedEvent::Warned(0),
        ]
    );
}

/// A condition that times out before becoming visible fails the flow.
#[tokio::test]
async fn assert_condition_failure_fails_flow() {
    let driver = std::sync::Arc::new(FakeDriver::new(ViewHierarchy::default()));
    let engine = std::sync::Arc::new(FakeScriptEngine::default());
    let observer = std::sync::Arc::new(RecordingObserver::default());
    let orchestrator = Orchestrator::new(driver, engine, observer.clone());

    let assertion = CommandEnvelope::new(CommandKind::AssertCondition {
        condition: Condition {
            visible: Some(ElementSelector::by_text("X")),
            ..Default::default()
        },
        timeout_ms: Some(100),
    });

    let ok = orchestrator.run_flow(&[assertion]).await.unwrap();
    assert!(!ok);

    let events = observer.events.lock().unwrap().clone();
    assert_eq!(
        events,
        vec![
            ObservedEvent::FlowStart,
            ObservedEvent::Start(0),
            ObservedEvent::Failed(0),
        ]
    );
    let last_error = observer.last_error.lock().unwrap().clone().unwrap();
    assert!(last_error.contains("assertion failed"));
}

/// `repeat { times: "3" }` runs its child three times and resets its
/// metadata before every iteration after the first.
#[tokio::test]
async fn repeat_with_count_runs_three_times_and_resets_children() {
    let driver = std::sync::Arc::new(FakeDriver::new(ViewHierarchy::default()));
    let engine = std::sync::Arc::new(FakeScriptEngine::default());
    let observer = std::sync::Arc::new(RecordingObserver::default());
    let orchestrator = Orchestrator::new(driver, engine, observer.clone());

    let press_key = CommandEnvelope::new(CommandKind::PressKey {
        code: "K".to_string(),
    });
    let repeat = CommandEnvelope::new(CommandKind::Repeat {
        times: Some("3".to_string()),
        commands: vec![press_key],
    });
    let repeat_id = repeat.id;

    let ok = orchestrator.run_flow(&[repeat]).await.unwrap();
    assert!(ok);

    assert_eq!(orchestrator.metadata_snapshot(repeat_id).number_of_runs, 3);
    let reset_count = observer
        .events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| **e == ObservedEvent::Reset)
        .count();
    assert_eq!(reset_count, 2);
}

/// A sub-flow's variable bindings are isolated from its parent: shadowing
/// `A` inside the sub-flow doesn't leak back out once it returns.
#[tokio::test]
async fn subflow_env_isolation() {
    let driver = std::sync::Arc::new(FakeDriver::new(ViewHierarchy::default()));
    let engine = std::sync::Arc::new(FakeScriptEngine::default());
    let observer = std::sync::Arc::new(RecordingObserver::default());
    let orchestrator = Orchestrator::new(driver.clone(), engine, observer);

    let parent_define = CommandEnvelope::new(CommandKind::DefineVariables {
        variables: HashMap::from([("A".to_string(), "1".to_string())]),
    });
    let sub_define = CommandEnvelope::new(CommandKind::DefineVariables {
        variables: HashMap::from([("A".to_string(), "2".to_string())]),
    });
    let sub_read = CommandEnvelope::new(CommandKind::InputText {
        text: "${A}".to_string(),
    });
    let run_flow = CommandEnvelope::new(CommandKind::RunFlow {
        commands: vec![sub_define, sub_read],
        config: None,
    });
    let parent_read = CommandEnvelope::new(CommandKind::InputText {
        text: "${A}".to_string(),
    });

    let ok = orchestrator
        .run_flow(&[parent_define, run_flow, parent_read])
        .await
        .unwrap();
    assert!(ok);

    assert_eq!(driver.inputs(), vec!["2".to_string(), "1".to_string()]);
}

/// Scrolling toward an element that never appears swipes repeatedly, then
/// fails with a debug hint naming the knobs that control the search.
#[tokio::test]
async fn scroll_until_visible_times_out_with_debug_hint() {
    let driver = std::sync::Arc::new(FakeDriver::new(ViewHierarchy::default()));
    let engine = std::sync::Arc::new(FakeScriptEngine::default());
    let observer = std::sync::Arc::new(RecordingObserver::default());
    let orchestrator = Orchestrator::new(driver.clone(), engine, observer.clone());

    let scroll = CommandEnvelope::new(CommandKind::ScrollUntilVisible {
        selector: ElementSelector::by_text("Never"),
        direction: Direction::Down,
        scroll_duration_ms: 30,
        visibility_percentage: 50,
        center_element: false,
        wait_to_settle_timeout_ms: None,
        timeout_ms: Some(150),
    });

    let ok = orchestrator.run_flow(&[scroll]).await.unwrap();
    assert!(!ok);

    assert!(driver.swipe_count() >= 2);
    let last_error = observer.last_error.lock().unwrap().clone().unwrap();
    assert!(last_error.contains("timeout"));
    assert!(last_error.contains("speed"));
    assert!(last_error.contains("visibilityPercentage"));
    assert!(last_error.contains("centerElement"));
}

/// `retry` re-runs a failing child up to its attempt cap; a condition that
/// only starts passing on the second attempt still lets the flow succeed.
#[tokio::test]
async fn retry_succeeds_on_second_attempt() {
    let driver = std::sync::Arc::new(FakeDriver::new(ViewHierarchy::default()));
    let engine = std::sync::Arc::new(FlakyScriptEngine::default());
    let observer = std::sync::Arc::new(RecordingObserver::default());
    let orchestrator = Orchestrator::new(driver, engine, observer);

    let assertion = CommandEnvelope::new(CommandKind::AssertCondition {
        condition: Condition {
            script_expression: Some("FLAKY".to_string()),
            ..Default::default()
        },
        timeout_ms: None,
    });
    let retry = CommandEnvelope::new(CommandKind::Retry {
        max_retries: Some(2),
        commands: vec![assertion],
    });
    let retry_id = retry.id;

    let ok = orchestrator.run_flow(&[retry]).await.unwrap();
    assert!(ok);

    let insight = orchestrator.metadata_snapshot(retry_id).insight.unwrap();
    assert_eq!(insight.level, flow_orchestrator_core::protocol::InsightLevel::Warning);
}

/// Script engine whose `evaluate_script("FLAKY", …)` returns `"false"` the
/// first time and `"true"` thereafter; everything else delegates to a
/// plain [`FakeScriptEngine`]. Models a condition that only starts passing
/// after the first `retry` attempt.
#[derive(Default)]
struct FlakyScriptEngine {
    inner: FakeScriptEngine,
    flaky_calls: AtomicUsize,
}

impl ScriptEngine for FlakyScriptEngine {
    fn put_env(&self, name: &str, value: &str) {
        self.inner.put_env(name, value);
    }

    fn enter_scope(&self) {
        self.inner.enter_scope();
    }

    fn leave_scope(&self) {
        self.inner.leave_scope();
    }

    fn enter_env_scope(&self) {
        self.inner.enter_env_scope();
    }

    fn leave_env_scope(&self) {
        self.inner.leave_env_scope();
    }

    fn evaluate_script(
        &self,
        source: &str,
        env: Option<&HashMap<String, String>>,
        source_name: Option<&str>,
        run_in_sub_scope: bool,
    ) -> Result<String, FlowError> {
        if source.trim() == "FLAKY" {
            let n = self.flaky_calls.fetch_add(1, Ordering::SeqCst);
            return Ok(if n == 0 { "false".to_string() } else { "true".to_string() });
        }
        self.inner
            .evaluate_script(source, env, source_name, run_in_sub_scope)
    }

    fn on_log_message(&self, callback: Box<dyn Fn(String) + Send + Sync>) {
        self.inner.on_log_message(callback);
    }

    fn set_copied_text(&self, text: Option<String>) {
        self.inner.set_copied_text(text);
    }

    fn close(&self) {
        self.inner.close();
    }

    fn lexical_scope_depth(&self) -> usize {
        self.inner.lexical_scope_depth()
    }

    fn env_scope_depth(&self) -> usize {
        self.inner.env_scope_depth()
    }
}

