//! The state machine that dispatches on a command's evaluated kind and
//! implements each one's effect. This is the largest component of the
//! crate — most of the command taxonomy is implemented directly here;
//! `repeat`/`retry` and nested `run-flow` delegate to their own modules
//! (retry.rs, subflow.rs).

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info_span, warn, Instrument};

use crate::condition;
use crate::driver::{AIEngine, Bounds, Driver, Recording, TapOptions};
use crate::error::{CommandFailure, DomainError, FlowError};
use crate::flow_controller::{CancelReason, FlowController};
use crate::lookup;
use crate::metadata::{FailurePolicy, MetadataStore, Observer};
use crate::protocol::{
    CommandEnvelope, CommandId, CommandKind, CommandMetadata, Direction, FlowConfig, Insight,
    InsightLevel, Orientation, PointSpec, SwipeShape,
};
use crate::script_engine::{self, ScriptEngine};
use crate::timing::InteractionClock;

/// Default timeout for a selector lookup that is not itself `optional`.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(10_000);
/// Default timeout for a lookup whose selector (or command) is `optional`;
/// shorter, because the caller already expects the element might be absent.
pub const DEFAULT_OPTIONAL_LOOKUP_TIMEOUT: Duration = Duration::from_millis(3_000);
const DEFAULT_SCROLL_UNTIL_VISIBLE_TIMEOUT_MS: u64 = 20_000;

/// Control-flow outcome of dispatching a single evaluated command —
/// internal to the interpreter, distinct from `CommandOutcome` (which is
/// what the loop reports to observers) and from `CommandFailure` (which is
/// what a genuine error looks like).
pub(crate) enum ExecError {
    Skipped,
    Failure(CommandFailure),
}

impl From<DomainError> for ExecError {
    fn from(e: DomainError) -> Self {
        ExecError::Failure(CommandFailure::Domain(e))
    }
}

impl From<FlowError> for ExecError {
    fn from(e: FlowError) -> Self {
        ExecError::Failure(e.into())
    }
}

impl From<CommandFailure> for ExecError {
    fn from(e: CommandFailure) -> Self {
        ExecError::Failure(e)
    }
}

/// What a fully-resolved command attempt produced, as reported to
/// observers. `Completed` carries whether the command's effect was
/// mutating, so a caller folding several outcomes together (a sub-flow or
/// `repeat` body) ORs the right bit instead of treating every completion
/// as mutating.
pub(crate) enum PerCommandOutcome {
    Completed(bool),
    Warned,
    Skipped,
}

/// Owns the collaborators that are out of scope to implement (`Driver`,
/// `ScriptEngine`, `AIEngine`) plus the in-scope engine state: the flow
/// controller, interaction clock, metadata store, and the two long-lived
/// resources (screen recording, copied-text buffer) whose lifetime
/// crosses many commands.
pub struct Orchestrator {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) ai_engine: Option<Arc<dyn AIEngine>>,
    pub(crate) script_engine: Arc<dyn ScriptEngine>,
    pub(crate) observer: Arc<dyn Observer>,
    pub(crate) metadata: MetadataStore,
    pub(crate) controller: Arc<FlowController>,
    pub(crate) clock: InteractionClock,
    copied_text: StdMutex<Option<String>>,
    recording: StdMutex<Option<Box<dyn Recording>>>,
    lookup_timeout: Duration,
    optional_lookup_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        driver: Arc<dyn Driver>,
        script_engine: Arc<dyn ScriptEngine>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            driver,
            ai_engine: None,
            script_engine,
            observer,
            metadata: MetadataStore::new(),
            controller: Arc::new(FlowController::new()),
            clock: InteractionClock::new(),
            copied_text: StdMutex::new(None),
            recording: StdMutex::new(None),
            lookup_timeout: DEFAULT_LOOKUP_TIMEOUT,
            optional_lookup_timeout: DEFAULT_OPTIONAL_LOOKUP_TIMEOUT,
        }
    }

    pub fn with_ai_engine(mut self, ai_engine: Arc<dyn AIEngine>) -> Self {
        self.ai_engine = Some(ai_engine);
        self
    }

    pub fn controller(&self) -> Arc<FlowController> {
        self.controller.clone()
    }

    /// Snapshot of a raw command's accumulated metadata, keyed by the
    /// identity assigned when the `CommandEnvelope` was constructed.
    /// Exposed so a reporter — or a test — can inspect `numberOfRuns`,
    /// `insight`, and the rest without reaching into the engine's
    /// internals.
    pub fn metadata_snapshot(&self, id: CommandId) -> CommandMetadata {
        self.metadata.snapshot(id)
    }

    fn lookup_timeout_for(&self, optional: bool) -> Duration {
        let base = if optional {
            self.optional_lookup_timeout
        } else {
            self.lookup_timeout
        };
        self.clock.adjusted(base)
    }

    /// Top-level entry point. Never propagates an error from the body:
    /// lifecycle hook failures and body failures are both folded into the
    /// returned bool, and `onFlowComplete` always runs once `onFlowStart`
    /// was attempted.
    pub async fn run_flow(&self, commands: &[CommandEnvelope]) -> Result<bool, FlowError> {
        let cfg = FlowConfig::from_commands(commands);
        self.observer.on_flow_start(commands);

        let define_variables: Vec<CommandEnvelope> = commands
            .iter()
            .filter(|c| matches!(c.kind, CommandKind::DefineVariables { .. }))
            .cloned()
            .collect();
        let define_variables_ok = if define_variables.is_empty() {
            true
        } else {
            self.execute_commands_top_level(&define_variables, &cfg)
                .await
        };
        let filtered: Vec<CommandEnvelope> = commands
            .iter()
            .filter(|c| !matches!(c.kind, CommandKind::DefineVariables { .. }))
            .cloned()
            .collect();

        let on_start_ok = if cfg.on_flow_start.is_empty() {
            true
        } else {
            self.execute_commands_top_level(&cfg.on_flow_start, &cfg)
                .await
        };

        let ok = if on_start_ok {
            let ok = self.execute_commands_top_level(&filtered, &cfg).await;
            self.close_recording();
            ok
        } else {
            false
        };

        // onFlowComplete always runs once onFlowStart was attempted,
        // regardless of whether the body succeeded.
        let on_complete_ok = if cfg.on_flow_complete.is_empty() {
            true
        } else {
            self.execute_commands_top_level(&cfg.on_flow_complete, &cfg)
                .await
        };

        Ok(define_variables_ok && on_start_ok && ok && on_complete_ok)
    }

    /// `executeCommands` at the top level: failures resolve to `false`
    /// rather than propagating.
    pub(crate) async fn execute_commands_top_level(
        &self,
        commands: &[CommandEnvelope],
        cfg: &FlowConfig,
    ) -> bool {
        for (index, raw) in commands.iter().enumerate() {
            if self.controller.is_cancelled() {
                self.observer.on_command_skipped(index, raw);
                continue;
            }
            self.controller.wait_if_paused().await;
            self.observer.on_command_start(index, raw);

            match self.run_one_command(index, raw, cfg).await {
                Ok(PerCommandOutcome::Completed(_)) => {
                    self.observer.on_command_complete(index, raw)
                }
                Ok(PerCommandOutcome::Warned) => self.observer.on_command_warned(index, raw),
                Ok(PerCommandOutcome::Skipped) => self.observer.on_command_skipped(index, raw),
                Err(failure) => match self.observer.on_command_failed(index, raw, &failure) {
                    FailurePolicy::Fail => return false,
                    FailurePolicy::Continue => continue,
                },
            }
        }
        true
    }

    /// Sub-flow variant of the loop: a `FAIL` resolution propagates as an
    /// error instead of becoming `false`, so an enclosing
    /// `retry` can catch it; returns whether any command mutated device
    /// state, not overall success.
    pub(crate) async fn execute_commands_subflow(
        &self,
        commands: &[CommandEnvelope],
        cfg: &FlowConfig,
    ) -> Result<bool, CommandFailure> {
        let mut mutated = false;
        for (index, raw) in commands.iter().enumerate() {
            if self.controller.is_cancelled() {
                self.observer.on_command_skipped(index, raw);
                continue;
            }
            self.controller.wait_if_paused().await;
            self.observer.on_command_start(index, raw);

            match self.run_one_command(index, raw, cfg).await {
                Ok(PerCommandOutcome::Completed(mutating)) => {
                    mutated |= mutating;
                    self.observer.on_command_complete(index, raw);
                }
                Ok(PerCommandOutcome::Warned) => self.observer.on_command_warned(index, raw),
                Ok(PerCommandOutcome::Skipped) => self.observer.on_command_skipped(index, raw),
                Err(failure) => match self.observer.on_command_failed(index, raw, &failure) {
                    FailurePolicy::Fail => return Err(failure),
                    FailurePolicy::Continue => continue,
                },
            }
        }
        Ok(mutated)
    }

    /// One raw command, start to finish: substitution, condition gating,
    /// dispatch, optional-demotion, metadata bookkeeping. Registers a
    /// per-command engine log sink before substitution runs and releases it
    /// on every exit path, so log lines emitted mid-substitution are
    /// captured too and the sink never outlives the command it belongs to.
    pub(crate) async fn run_one_command(
        &self,
        index: usize,
        raw: &CommandEnvelope,
        cfg: &FlowConfig,
    ) -> Result<PerCommandOutcome, CommandFailure> {
        self.script_engine.on_log_message(self.metadata.log_sink(raw.id));
        let outcome = self.run_one_command_inner(index, raw, cfg).await;
        self.script_engine.on_log_message(Box::new(|_| {}));
        outcome
    }

    async fn run_one_command_inner(
        &self,
        index: usize,
        raw: &CommandEnvelope,
        cfg: &FlowConfig,
    ) -> Result<PerCommandOutcome, CommandFailure> {
        let evaluated = script_engine::evaluate_command(self.script_engine.as_ref(), raw)?;
        self.metadata.with(raw.id, |m| {
            m.evaluated_command = Some(evaluated.clone());
            if let Some(label) = &raw.label {
                m.labeled_command = Some(label.clone());
            }
        });

        let span = info_span!("execute_command", index, kind = evaluated.kind.name());
        let result = async {
            if let Some(condition) = &evaluated.condition {
                if !condition.is_empty() {
                    let visible = condition::evaluate(
                        condition,
                        self.driver.as_ref(),
                        self.lookup_timeout_for(raw.optional),
                    )
                    .await
                    .map_err(ExecError::from)?;
                    if !visible {
                        return Err(ExecError::Skipped);
                    }
                }
            }
            self.execute_command(&evaluated, cfg).await
        }
        .instrument(span)
        .await;

        match result {
            Ok(mutating) => {
                if mutating {
                    self.clock.mark_interaction();
                }
                let snapshot = self.metadata.snapshot(raw.id);
                self.observer.on_command_metadata_update(raw, &snapshot);
                Ok(PerCommandOutcome::Completed(mutating))
            }
            Err(ExecError::Skipped) => Ok(PerCommandOutcome::Skipped),
            Err(ExecError::Failure(CommandFailure::Domain(e))) if raw.demotes_errors() => {
                let message = e.to_string();
                warn!(command = evaluated.kind.name(), %message, "command warned");
                self.metadata.with(raw.id, |m| {
                    m.insight = Some(Insight {
                        level: InsightLevel::Warning,
                        message: message.clone(),
                    });
                });
                Ok(PerCommandOutcome::Warned)
            }
            Err(ExecError::Failure(failure)) => Err(failure),
        }
    }

    /// Dispatches on `evaluated.kind`; returns whether the effect was
    /// mutating. A mutating effect advances `timeOfLastInteraction` to now.
    async fn execute_command(
        &self,
        evaluated: &CommandEnvelope,
        cfg: &FlowConfig,
    ) -> Result<bool, ExecError> {
        match &evaluated.kind {
            CommandKind::TapOnElement {
                selector,
                retry_if_no_change,
                wait_until_visible,
                long_press,
                app_id,
                tap_repeat,
                wait_to_settle_timeout_ms,
            } => {
                let timeout = self.lookup_timeout_for(selector.optional);
                let resolved =
                    lookup::find_element_with_timeout(
                        self.driver.as_ref(),
                        selector,
                        timeout,
                        lookup::DEFAULT_POLL_INTERVAL,
                    )
                    .await?;
                self.driver
                    .tap_element(
                        &resolved.node,
                        TapOptions {
                            retry_if_no_change: *retry_if_no_change,
                            wait_until_visible: *wait_until_visible,
                            long_press: *long_press,
                            app_id: app_id.clone(),
                            tap_repeat: *tap_repeat,
                            wait_to_settle_timeout_ms: *wait_to_settle_timeout_ms,
                        },
                    )
                    .await?;
                Ok(true)
            }

            CommandKind::TapOnPoint { point, long_press } => {
                let (x, y) = self.resolve_point(*point).await?;
                self.driver.tap_point(x, y, *long_press).await?;
                Ok(true)
            }

            CommandKind::Swipe(cmd) => {
                let duration = Duration::from_millis(cmd.duration_ms);
                let settle = cmd.wait_to_settle_timeout_ms.map(Duration::from_millis);
                match &cmd.shape {
                    SwipeShape::Direction { direction } => {
                        self.driver.swipe_direction(*direction, duration, settle).await?
                    }
                    SwipeShape::Points { start, end } => {
                        self.driver.swipe_points(*start, *end, duration, settle).await?
                    }
                    SwipeShape::PercentPoints { start, end } => {
                        let info = self.driver.cached_device_info().await;
                        let start = (start.0 / 100.0 * info.width, start.1 / 100.0 * info.height);
                        let end = (end.0 / 100.0 * info.width, end.1 / 100.0 * info.height);
                        self.driver.swipe_points(start, end, duration, settle).await?
                    }
                    SwipeShape::FromElement { selector, direction } => {
                        let timeout = self.lookup_timeout_for(selector.optional);
                        lookup::find_element_with_timeout(
                            self.driver.as_ref(),
                            selector,
                            timeout,
                            lookup::DEFAULT_POLL_INTERVAL,
                        )
                        .await?;
                        self.driver.swipe_from_center(*direction, duration, settle).await?
                    }
                }
                Ok(true)
            }

            CommandKind::InputText { text } => {
                if !self.driver.is_unicode_input_supported() && !text.is_ascii() {
                    return Err(DomainError::UnicodeNotSupported {
                        sample: text.clone(),
                    }
                    .into());
                }
                self.driver.input_text(text).await?;
                Ok(true)
            }

            CommandKind::EraseText { char_count } => {
                self.driver.erase_text(*char_count).await?;
                Ok(true)
            }

            CommandKind::PressKey { code } => {
                self.driver.press_key(code).await?;
                Ok(true)
            }

            CommandKind::HideKeyboard => {
                self.driver.hide_keyboard().await?;
                Ok(true)
            }

            CommandKind::Back => {
                self.driver.back_press().await?;
                Ok(true)
            }

            CommandKind::Scroll { direction } => {
                self.driver
                    .swipe_direction(*direction, Duration::from_millis(400), None)
                    .await?;
                Ok(true)
            }

            CommandKind::ScrollUntilVisible {
                selector,
                direction,
                scroll_duration_ms,
                visibility_percentage,
                center_element,
                wait_to_settle_timeout_ms,
                timeout_ms,
            } => {
                self.scroll_until_visible(
                    selector,
                    *direction,
                    *scroll_duration_ms,
                    *visibility_percentage,
                    *center_element,
                    wait_to_settle_timeout_ms.map(Duration::from_millis),
                    *timeout_ms,
                )
                .await
            }

            CommandKind::CopyTextFrom { selector } => {
                let timeout = self.lookup_timeout_for(selector.optional);
                let resolved = lookup::find_element_with_timeout(
                    self.driver.as_ref(),
                    selector,
                    timeout,
                    lookup::DEFAULT_POLL_INTERVAL,
                )
                .await?;
                let text = resolved
                    .node
                    .first_non_empty_text()
                    .map(str::to_string)
                    .ok_or_else(|| DomainError::UnableToCopyTextFromElement {
                        description: crate::selector::describe(selector),
                    })?;
                *self.copied_text.lock().unwrap() = Some(text.clone());
                self.script_engine.set_copied_text(Some(text));
                Ok(false)
            }

            CommandKind::PasteText => {
                let text = self.copied_text.lock().unwrap().clone();
                if let Some(text) = text {
                    self.driver.input_text(&text).await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }

            CommandKind::OpenLink {
                url,
                app_id,
                auto_verify,
                browser,
            } => {
                self.driver
                    .open_link(url, app_id.as_deref(), *auto_verify, *browser)
                    .await?;
                Ok(true)
            }

            CommandKind::LaunchApp {
                app_id,
                args,
                clear_state,
                clear_keychain,
                permissions,
                stop_if_running,
            } => {
                if *clear_keychain {
                    self.driver.clear_keychain().await.map_err(|e| {
                        DomainError::UnableToClearState {
                            app_id: app_id.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
                if *clear_state {
                    self.driver.clear_app_state(Some(app_id.as_str())).await.map_err(|e| {
                        DomainError::UnableToClearState {
                            app_id: app_id.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                }
                let default_permissions =
                    std::collections::HashMap::from([("all".to_string(), "allow".to_string())]);
                let permissions = permissions.as_ref().unwrap_or(&default_permissions);
                self.driver
                    .set_permissions(app_id, permissions)
                    .await
                    .map_err(|e| DomainError::UnableToClearState {
                        app_id: app_id.clone(),
                        reason: e.to_string(),
                    })?;
                self.driver
                    .launch_app(app_id, args, stop_if_running.unwrap_or(true))
                    .await
                    .map_err(|e| DomainError::UnableToLaunchApp {
                        app_id: app_id.clone(),
                        reason: e.to_string(),
                    })?;
                Ok(true)
            }

            CommandKind::StopApp { app_id } => {
                self.driver.stop_app(app_id.as_deref()).await?;
                Ok(true)
            }

            CommandKind::KillApp { app_id } => {
                self.driver.kill_app(app_id.as_deref()).await?;
                Ok(true)
            }

            CommandKind::ClearState { app_id } => {
                self.driver.clear_app_state(app_id.as_deref()).await?;
                if let Some(app_id) = app_id.as_deref().or(cfg.app_id.as_deref()) {
                    let unset = std::collections::HashMap::from([(
                        "all".to_string(),
                        "unset".to_string(),
                    )]);
                    self.driver.set_permissions(app_id, &unset).await?;
                }
                Ok(true)
            }

            CommandKind::ClearKeychain => {
                self.driver.clear_keychain().await?;
                Ok(true)
            }

            CommandKind::AssertCondition { condition, timeout_ms } => {
                let timeout = self.lookup_timeout_for(false);
                let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(timeout);
                let ok = condition::evaluate(condition, self.driver.as_ref(), timeout).await?;
                if !ok {
                    let description = describe_condition(condition);
                    return Err(DomainError::AssertionFailure {
                        description: description.clone(),
                        root_snapshot: crate::selector::snapshot(
                            &self.driver.view_hierarchy().await.unwrap_or_default(),
                        ),
                        debug_hint: format!("condition [{description}] evaluated to false"),
                    }
                    .into());
                }
                Ok(false)
            }

            CommandKind::AssertWithAi { assertion } => {
                let ai = self
                    .ai_engine
                    .as_ref()
                    .ok_or(DomainError::CloudApiKeyNotAvailable)?;
                let screenshot = self.driver.take_screenshot(false).await?;
                if let Some(defect) = ai.perform_assertion(&screenshot, assertion).await? {
                    self.observer.on_command_generated_output(
                        evaluated,
                        std::slice::from_ref(&defect),
                        &screenshot,
                    );
                    self.metadata.with(evaluated.id, |m| {
                        m.ai_reasoning = Some(defect.reasoning.clone());
                    });
                    return Err(DomainError::AssertionFailure {
                        description: assertion.clone(),
                        root_snapshot: String::new(),
                        debug_hint: defect.reasoning,
                    }
                    .into());
                }
                Ok(false)
            }

            CommandKind::AssertNoDefectsWithAi => {
                let ai = self
                    .ai_engine
                    .as_ref()
                    .ok_or(DomainError::CloudApiKeyNotAvailable)?;
                let screenshot = self.driver.take_screenshot(false).await?;
                let defects = ai.find_defects(&screenshot).await?;
                if !defects.is_empty() {
                    self.observer.on_command_generated_output(
                        evaluated,
                        &defects,
                        &screenshot,
                    );
                    let reasoning = defects
                        .iter()
                        .map(|d| d.reasoning.as_str())
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.metadata.with(evaluated.id, |m| {
                        m.ai_reasoning = Some(reasoning.clone());
                    });
                    return Err(DomainError::AssertionFailure {
                        description: "no defects".to_string(),
                        root_snapshot: String::new(),
                        debug_hint: reasoning,
                    }
                    .into());
                }
                Ok(false)
            }

            CommandKind::ExtractTextWithAi {
                query,
                output_variable,
            } => {
                let ai = self
                    .ai_engine
                    .as_ref()
                    .ok_or(DomainError::CloudApiKeyNotAvailable)?;
                let screenshot = self.driver.take_screenshot(false).await?;
                let text = ai.extract_text(&screenshot, query).await?;
                self.script_engine.put_env(output_variable, &text);
                self.metadata.with(evaluated.id, |m| {
                    m.ai_reasoning = Some(text.clone());
                });
                Ok(false)
            }

            CommandKind::DefineVariables { variables } => {
                for (k, v) in variables {
                    self.script_engine.put_env(k, v);
                }
                Ok(false)
            }

            CommandKind::RunScript { script, source_name } => {
                self.script_engine
                    .evaluate_script(script, None, source_name.as_deref(), true)?;
                Ok(true)
            }

            CommandKind::EvalScript { script } => {
                self.script_engine.evaluate_script(script, None, None, false)?;
                Ok(true)
            }

            CommandKind::RunFlow { commands, config } => {
                let subflow_cfg = config.clone().unwrap_or_default();
                crate::subflow::run_sub_flow(self, commands, cfg, &subflow_cfg).await
            }

            CommandKind::Repeat { times, commands } => {
                crate::retry::run_repeat(self, evaluated, times.as_deref(), commands, cfg).await
            }

            CommandKind::Retry {
                max_retries,
                commands,
            } => crate::retry::run_retry(self, evaluated, *max_retries, commands, cfg).await,

            CommandKind::SetLocation { latitude, longitude } => {
                self.driver.set_location(*latitude, *longitude).await?;
                Ok(true)
            }

            CommandKind::SetOrientation { orientation } => {
                self.driver.set_orientation(*orientation).await?;
                Ok(true)
            }

            CommandKind::SetAirplaneMode { enabled } => {
                self.driver.set_airplane_mode(*enabled).await?;
                Ok(true)
            }

            CommandKind::ToggleAirplaneMode => {
                let enabled = self.driver.is_airplane_mode_enabled().await?;
                self.driver.set_airplane_mode(!enabled).await?;
                Ok(true)
            }

            CommandKind::Travel { points, speed } => {
                self.driver.travel(points, *speed).await?;
                Ok(true)
            }

            CommandKind::TakeScreenshot { .. } => {
                self.driver.take_screenshot(true).await?;
                Ok(false)
            }

            CommandKind::StartRecording { .. } => {
                let recording = self.driver.start_screen_recording().await?;
                let mut slot = self.recording.lock().unwrap();
                if let Some(mut previous) = slot.take() {
                    previous.close();
                }
                *slot = Some(recording);
                Ok(false)
            }

            CommandKind::StopRecording => {
                self.close_recording();
                Ok(false)
            }

            CommandKind::AddMedia { paths } => {
                self.driver.add_media(paths).await?;
                Ok(true)
            }

            CommandKind::WaitForAnimationToEnd { timeout_ms } => {
                self.driver
                    .wait_for_animation_to_end(Duration::from_millis(timeout_ms.unwrap_or(5_000)))
                    .await?;
                Ok(false)
            }

            // Unknown/apply-configuration commands return false.
            CommandKind::ApplyConfiguration { .. } => Ok(false),
        }
    }

    async fn resolve_point(&self, point: PointSpec) -> Result<(f64, f64), FlowError> {
        match point {
            PointSpec::Absolute { x, y } => Ok((x, y)),
            PointSpec::Percent { x, y } => {
                let info = self.driver.cached_device_info().await;
                Ok((x / 100.0 * info.width, y / 100.0 * info.height))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn scroll_until_visible(
        &self,
        selector: &crate::protocol::ElementSelector,
        direction: Direction,
        scroll_duration_ms: u64,
        visibility_percentage: u8,
        center_element: bool,
        wait_to_settle: Option<Duration>,
        timeout_ms: Option<u64>,
    ) -> Result<bool, ExecError> {
        let timeout = Duration::from_millis(
            timeout_ms.unwrap_or(DEFAULT_SCROLL_UNTIL_VISIBLE_TIMEOUT_MS),
        );
        let deadline = Instant::now() + timeout;
        let device = self.driver.cached_device_info().await;
        let viewport = Bounds {
            x: 0.0,
            y: 0.0,
            width: device.width,
            height: device.height,
        };
        let mut mutated = false;
        let mut near_center_attempts = 0u32;

        loop {
            if let Some(resolved) =
                lookup::try_find_once(self.driver.as_ref(), selector).await?
            {
                let visible_pct = resolved.node.bounds.visible_fraction_within(viewport) * 100.0;
                let is_near_center = is_near_center(resolved.node.bounds, viewport);
                if center_element && visible_pct > 10.0 && near_center_attempts <= 4 && is_near_center {
                    return Ok(mutated);
                }
                if visible_pct >= visibility_percentage as f64 {
                    return Ok(mutated);
                }
            }

            if Instant::now() >= deadline {
                let description = crate::selector::describe(selector);
                return Err(DomainError::ElementNotFound {
                    description: description.clone(),
                    root_snapshot: crate::selector::snapshot(
                        &self.driver.view_hierarchy().await.unwrap_or_default(),
                    ),
                    debug_hint: format!(
                        "scrollUntilVisible timed out for [{description}]; tune timeout, speed \
                         (scroll_duration_ms), visibilityPercentage, or centerElement"
                    ),
                }
                .into());
            }

            self.driver
                .swipe_from_center(direction, Duration::from_millis(scroll_duration_ms), wait_to_settle)
                .await?;
            mutated = true;
            near_center_attempts += 1;
        }
    }

    fn close_recording(&self) {
        let mut slot = self.recording.lock().unwrap();
        if let Some(mut recording) = slot.take() {
            recording.close();
        }
    }

    pub fn cancel(&self) {
        self.controller.cancel(CancelReason::UserRequested);
    }
}

fn is_near_center(bounds: Bounds, viewport: Bounds) -> bool {
    let (cx, cy) = bounds.center();
    let (vx, vy) = viewport.center();
    (cx - vx).abs() < viewport.width * 0.25 && (cy - vy).abs() < viewport.height * 0.25
}

fn describe_condition(condition: &crate::protocol::Condition) -> String {
    let mut parts = Vec::new();
    if let Some(p) = &condition.platform {
        parts.push(format!("platform == {p}"));
    }
    if let Some(s) = &condition.visible {
        parts.push(format!("visible({})", crate::selector::describe(s)));
    }
    if let Some(s) = &condition.not_visible {
        parts.push(format!("notVisible({})", crate::selector::describe(s)));
    }
    if let Some(expr) = &condition.script_expression {
        parts.push(format!("script({expr})"));
    }
    if parts.is_empty() {
        "(true)".to_string()
    } else {
        parts.join(" && ")
    }
}
