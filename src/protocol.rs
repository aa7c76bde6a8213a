//! Command taxonomy, selector/condition data model, and flow configuration.
//!
//! A single `#[serde(tag = "type")]` enum for the ~40 command kinds, an envelope
//! carrying the attributes shared across all of them (`optional`, `label`,
//! `condition`), and small value types (`ElementSelector`, `Condition`,
//! `FlowConfig`) the rest of the crate builds on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Stable identity for a raw command, assigned once when the command is
/// constructed and never recomputed. Metadata lookups are keyed by object
/// identity, not structural equality, so that the same child re-visited
/// across `repeat` iterations resolves to the same metadata entry. A
/// monotonic counter stands in for address identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommandId(u64);

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

impl CommandId {
    fn next() -> Self {
        CommandId(NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Direction of a swipe/scroll gesture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

/// Device orientation for `set-orientation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Orientation {
    Portrait,
    LandscapeLeft,
    LandscapeRight,
    PortraitUpsideDown,
}

/// A resolved tap target: absolute coordinates or a percentage of the
/// screen. `tap-on-point-v2` parses either `"x,y"` or `"p%,p%"` into this.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PointSpec {
    Absolute { x: f64, y: f64 },
    Percent { x: f64, y: f64 },
}

impl PointSpec {
    /// Parses `"x,y"` (absolute) or `"p%,p%"` (percent, 0..100).
    pub fn parse(raw: &str) -> Result<Self, crate::error::DomainError> {
        let invalid = || {
            crate::error::DomainError::InvalidCommand(format!(
                "tap point `{raw}` must be \"x,y\" or \"p%,p%\""
            ))
        };
        let (x_raw, y_raw) = raw.split_once(',').ok_or_else(invalid)?;
        let x_raw = x_raw.trim();
        let y_raw = y_raw.trim();
        let is_percent = x_raw.ends_with('%') && y_raw.ends_with('%');
        if is_percent {
            let x: f64 = x_raw.trim_end_matches('%').parse().map_err(|_| invalid())?;
            let y: f64 = y_raw.trim_end_matches('%').parse().map_err(|_| invalid())?;
            if !(0.0..=100.0).contains(&x) || !(0.0..=100.0).contains(&y) {
                return Err(crate::error::DomainError::InvalidCommand(format!(
                    "percent tap point `{raw}` must fall within 0..100"
                )));
            }
            Ok(PointSpec::Percent { x, y })
        } else {
            let x: f64 = x_raw.parse().map_err(|_| invalid())?;
            let y: f64 = y_raw.parse().map_err(|_| invalid())?;
            Ok(PointSpec::Absolute { x, y })
        }
    }
}

/// The four input shapes a `swipe` command can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum SwipeShape {
    Direction { direction: Direction },
    Points { start: (f64, f64), end: (f64, f64) },
    PercentPoints { start: (f64, f64), end: (f64, f64) },
    FromElement {
        selector: ElementSelector,
        direction: Direction,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwipeCommand {
    #[serde(flatten)]
    pub shape: SwipeShape,
    pub duration_ms: u64,
    pub wait_to_settle_timeout_ms: Option<u64>,
}

/// A declarative matcher over view-hierarchy nodes.
///
/// Every field is an independent clause; `Selector::compile` (selector.rs)
/// intersects whichever are present. `None` means "no constraint from this
/// clause", not "match nothing".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSelector {
    pub text_regex: Option<String>,
    pub id_regex: Option<String>,
    pub size: Option<SizeClause>,
    pub traits: Vec<String>,
    pub enabled: Option<bool>,
    pub selected: Option<bool>,
    pub checked: Option<bool>,
    pub focused: Option<bool>,
    pub below: Option<Box<ElementSelector>>,
    pub above: Option<Box<ElementSelector>>,
    pub left_of: Option<Box<ElementSelector>>,
    pub right_of: Option<Box<ElementSelector>>,
    pub child_of: Option<Box<ElementSelector>>,
    pub contains_child: Option<Box<ElementSelector>>,
    pub contains_descendants: Vec<ElementSelector>,
    pub css: Option<String>,
    pub index: Option<usize>,
    pub optional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizeClause {
    pub width: f64,
    pub height: f64,
    pub tolerance: f64,
}

impl ElementSelector {
    /// Convenience constructor for the common "match by visible text" case,
    /// used heavily by tests and by `Condition`'s `visible`/`notVisible`.
    pub fn by_text(pattern: impl Into<String>) -> Self {
        Self {
            text_regex: Some(pattern.into()),
            ..Default::default()
        }
    }
}

/// Conjunction of clauses gating a command's execution. An empty
/// condition is vacuously true.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub platform: Option<String>,
    pub visible: Option<ElementSelector>,
    pub not_visible: Option<ElementSelector>,
    /// Pre-evaluation script source; substituted to a literal string by
    /// the script engine adapter before the condition evaluator inspects
    /// it (see script_engine.rs).
    pub script_expression: Option<String>,
}

impl Condition {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none()
            && self.visible.is_none()
            && self.not_visible.is_none()
            && self.script_expression.is_none()
    }
}

/// The ~40 command kinds. Shared attributes (`optional`, `label`,
/// `condition`) live on `CommandEnvelope`, not here — they're
/// envelope-level, not per-variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    TapOnElement {
        selector: ElementSelector,
        retry_if_no_change: bool,
        wait_until_visible: bool,
        long_press: bool,
        app_id: Option<String>,
        tap_repeat: Option<u32>,
        wait_to_settle_timeout_ms: Option<u64>,
    },
    TapOnPoint {
        point: PointSpec,
        long_press: bool,
    },
    Swipe(SwipeCommand),
    InputText {
        text: String,
    },
    EraseText {
        char_count: Option<u32>,
    },
    PressKey {
        code: String,
    },
    HideKeyboard,
    Back,
    Scroll {
        direction: Direction,
    },
    ScrollUntilVisible {
        selector: ElementSelector,
        direction: Direction,
        scroll_duration_ms: u64,
        visibility_percentage: u8,
        center_element: bool,
        wait_to_settle_timeout_ms: Option<u64>,
        timeout_ms: Option<u64>,
    },
    CopyTextFrom {
        selector: ElementSelector,
    },
    PasteText,
    OpenLink {
        url: String,
        app_id: Option<String>,
        auto_verify: bool,
        browser: bool,
    },
    LaunchApp {
        app_id: String,
        args: HashMap<String, String>,
        clear_state: bool,
        clear_keychain: bool,
        permissions: Option<HashMap<String, String>>,
        stop_if_running: Option<bool>,
    },
    StopApp {
        app_id: Option<String>,
    },
    KillApp {
        app_id: Option<String>,
    },
    ClearState {
        app_id: Option<String>,
    },
    ClearKeychain,
    AssertCondition {
        condition: Condition,
        timeout_ms: Option<u64>,
    },
    AssertWithAi {
        assertion: String,
    },
    AssertNoDefectsWithAi,
    ExtractTextWithAi {
        query: String,
        output_variable: String,
    },
    DefineVariables {
        variables: HashMap<String, String>,
    },
    RunScript {
        script: String,
        source_name: Option<String>,
    },
    EvalScript {
        script: String,
    },
    RunFlow {
        commands: Vec<CommandEnvelope>,
        config: Option<FlowConfig>,
    },
    Repeat {
        times: Option<String>,
        commands: Vec<CommandEnvelope>,
    },
    Retry {
        max_retries: Option<u32>,
        commands: Vec<CommandEnvelope>,
    },
    SetLocation {
        latitude: f64,
        longitude: f64,
    },
    SetOrientation {
        orientation: Orientation,
    },
    SetAirplaneMode {
        enabled: bool,
    },
    ToggleAirplaneMode,
    Travel {
        points: Vec<(f64, f64)>,
        speed: Option<f64>,
    },
    TakeScreenshot {
        path_hint: Option<String>,
    },
    StartRecording {
        path_hint: Option<String>,
    },
    StopRecording,
    AddMedia {
        paths: Vec<String>,
    },
    WaitForAnimationToEnd {
        timeout_ms: Option<u64>,
    },
    ApplyConfiguration {
        config: FlowConfig,
    },
}

impl CommandKind {
    /// Selector carried by this command's own `optional` flag, if any —
    /// used by the optional-demotion rule (`raw.optional || selector.optional`).
    pub fn selector_optional(&self) -> bool {
        match self {
            CommandKind::TapOnElement { selector, .. }
            | CommandKind::CopyTextFrom { selector }
            | CommandKind::ScrollUntilVisible { selector, .. } => selector.optional,
            CommandKind::Swipe(SwipeCommand {
                shape: SwipeShape::FromElement { selector, .. },
                ..
            }) => selector.optional,
            _ => false,
        }
    }

    /// The human-readable tag used in logs/insights.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::TapOnElement { .. } => "tapOnElement",
            CommandKind::TapOnPoint { .. } => "tapOnPoint",
            CommandKind::Swipe(_) => "swipe",
            CommandKind::InputText { .. } => "inputText",
            CommandKind::EraseText { .. } => "eraseText",
            CommandKind::PressKey { .. } => "pressKey",
            CommandKind::HideKeyboard => "hideKeyboard",
            CommandKind::Back => "back",
            CommandKind::Scroll { .. } => "scroll",
            CommandKind::ScrollUntilVisible { .. } => "scrollUntilVisible",
            CommandKind::CopyTextFrom { .. } => "copyTextFrom",
            CommandKind::PasteText => "pasteText",
            CommandKind::OpenLink { .. } => "openLink",
            CommandKind::LaunchApp { .. } => "launchApp",
            CommandKind::StopApp { .. } => "stopApp",
            CommandKind::KillApp { .. } => "killApp",
            CommandKind::ClearState { .. } => "clearState",
            CommandKind::ClearKeychain => "clearKeychain",
            CommandKind::AssertCondition { .. } => "assertCondition",
            CommandKind::AssertWithAi { .. } => "assertWithAi",
            CommandKind::AssertNoDefectsWithAi => "assertNoDefectsWithAi",
            CommandKind::ExtractTextWithAi { .. } => "extractTextWithAi",
            CommandKind::DefineVariables { .. } => "defineVariables",
            CommandKind::RunScript { .. } => "runScript",
            CommandKind::EvalScript { .. } => "evalScript",
            CommandKind::RunFlow { .. } => "runFlow",
            CommandKind::Repeat { .. } => "repeat",
            CommandKind::Retry { .. } => "retry",
            CommandKind::SetLocation { .. } => "setLocation",
            CommandKind::SetOrientation { .. } => "setOrientation",
            CommandKind::SetAirplaneMode { .. } => "setAirplaneMode",
            CommandKind::ToggleAirplaneMode => "toggleAirplaneMode",
            CommandKind::Travel { .. } => "travel",
            CommandKind::TakeScreenshot { .. } => "takeScreenshot",
            CommandKind::StartRecording { .. } => "startRecording",
            CommandKind::StopRecording => "stopRecording",
            CommandKind::AddMedia { .. } => "addMedia",
            CommandKind::WaitForAnimationToEnd { .. } => "waitForAnimationToEnd",
            CommandKind::ApplyConfiguration { .. } => "applyConfiguration",
        }
    }

    /// Children of a composite command, in the order `resetCommand`
    /// traversal visits them. Empty for leaves.
    pub fn children(&self) -> &[CommandEnvelope] {
        match self {
            CommandKind::RunFlow { commands, .. }
            | CommandKind::Repeat { commands, .. }
            | CommandKind::Retry { commands, .. } => commands,
            _ => &[],
        }
    }
}

/// A command plus the attributes shared by every variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: CommandId,
    pub kind: CommandKind,
    pub optional: bool,
    pub label: Option<String>,
    pub condition: Option<Condition>,
}

impl CommandEnvelope {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            id: CommandId::next(),
            kind,
            optional: false,
            label: None,
            condition: None,
        }
    }

    pub fn optional(mut self, optional: bool) -> Self {
        self.optional = optional;
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Optional-demotion test: true if a domain error raised while
    /// executing this command should be reclassified as a warning.
    pub fn demotes_errors(&self) -> bool {
        self.optional || self.kind.selector_optional()
    }
}

/// Lifecycle hooks and free-form engine options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    pub app_id: Option<String>,
    pub on_flow_start: Vec<CommandEnvelope>,
    pub on_flow_complete: Vec<CommandEnvelope>,
    pub ext: HashMap<String, String>,
}

/// Typed views over `FlowConfig::ext`, turning stringly options into typed
/// enums instead of scattering string comparisons through the
/// interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsEngineKind {
    GraalJs,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AndroidWebViewHierarchyMode {
    Devtools,
    Default,
}

impl FlowConfig {
    pub fn js_engine(&self) -> JsEngineKind {
        match self.ext.get("jsEngine").map(String::as_str) {
            Some("graaljs") => JsEngineKind::GraalJs,
            _ => JsEngineKind::Default,
        }
    }

    pub fn android_webview_hierarchy(&self) -> AndroidWebViewHierarchyMode {
        match self.ext.get("androidWebViewHierarchy").map(String::as_str) {
            Some("devtools") => AndroidWebViewHierarchyMode::Devtools,
            _ => AndroidWebViewHierarchyMode::Default,
        }
    }

    /// Scans a command list for an `apply-configuration` command and
    /// returns the config it carries, defaulting otherwise.
    pub fn from_commands(commands: &[CommandEnvelope]) -> FlowConfig {
        commands
            .iter()
            .find_map(|c| match &c.kind {
                CommandKind::ApplyConfiguration { config } => Some(config.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }
}

/// Severity of an `Insight`. Warnings are what an optional-demoted domain
/// error surfaces as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsightLevel {
    Info,
    Warning,
    Error,
}

/// Structured advisory message surfaced alongside a command's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub level: InsightLevel,
    pub message: String,
}

/// Per-raw-command accumulator. Keyed by `CommandId`, never by structural
/// equality, and lazily created the first time the interpreter touches a
/// given raw command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandMetadata {
    pub evaluated_command: Option<CommandEnvelope>,
    pub log_messages: Vec<String>,
    pub insight: Option<Insight>,
    pub number_of_runs: u32,
    pub ai_reasoning: Option<String>,
    pub labeled_command: Option<String>,
}

/// Upper bound on `log_messages` per command: a pathological script's
/// engine log spam must not grow a single metadata entry unboundedly.
pub const MAX_LOG_MESSAGES_PER_COMMAND: usize = 500;

impl CommandMetadata {
    pub fn push_log_message(&mut self, message: String) {
        if self.log_messages.len() >= MAX_LOG_MESSAGES_PER_COMMAND {
            self.log_messages.remove(0);
        }
        self.log_messages.push(message);
    }
}
