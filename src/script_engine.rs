//! The trait the embedded expression/script runtime implements, plus the
//! pure `${…}` substitution pass the interpreter runs over every raw
//! command before executing it.

use std::collections::HashMap;

use regex_lite::Regex;

use crate::error::FlowError;
use crate::protocol::{Condition, ElementSelector, CommandEnvelope, CommandKind, SwipeShape};

/// Scoped variable environment and expression evaluator. Two backends are
/// interchangeable behind this trait, selected by `FlowConfig::js_engine`.
/// Methods take `&self`: implementations hold their mutable scope stack
/// behind interior mutability so the engine can be shared across the task
/// tree as `Arc<dyn ScriptEngine>` without `&mut self` plumbing.
pub trait ScriptEngine: Send + Sync {
    fn put_env(&self, name: &str, value: &str);

    /// Lexical scope: opened/closed symmetrically around sub-flow bodies.
    fn enter_scope(&self);
    fn leave_scope(&self);

    /// Variable-binding isolation: a sub-flow's variables never leak to
    /// its parent.
    fn enter_env_scope(&self);
    fn leave_env_scope(&self);

    fn evaluate_script(
        &self,
        source: &str,
        env: Option<&HashMap<String, String>>,
        source_name: Option<&str>,
        run_in_sub_scope: bool,
    ) -> Result<String, FlowError>;

    fn on_log_message(&self, callback: Box<dyn Fn(String) + Send + Sync>);
    fn set_copied_text(&self, text: Option<String>);
    fn close(&self);

    /// Exposed purely so tests can assert that scope depth stays balanced:
    /// depths must match their pre-`runFlow` values once the flow returns
    /// or throws.
    fn lexical_scope_depth(&self) -> usize;
    fn env_scope_depth(&self) -> usize;
}

/// Matches `${ … }` interpolations. Regex clauses elsewhere use
/// case-insensitive/dot-all/multiline semantics; this one is plain since
/// it only delimits expression boundaries.
fn interpolation_pattern() -> Regex {
    Regex::new(r"\$\{([^}]*)\}").expect("static pattern")
}

/// Resolves every `${…}` interpolation in `input` via the engine, leaving
/// the surrounding literal text untouched. A string with no interpolations
/// is returned unchanged without invoking the engine.
fn substitute_string(engine: &dyn ScriptEngine, input: &str) -> Result<String, FlowError> {
    let pattern = interpolation_pattern();
    if !pattern.is_match(input) {
        return Ok(input.to_string());
    }
    let mut err = None;
    let result = pattern.replace_all(input, |caps: &regex_lite::Captures| {
        let expr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        match engine.evaluate_script(expr, None, None, false) {
            Ok(value) => value,
            Err(e) => {
                err = Some(e);
                String::new()
            }
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok(result.into_owned()),
    }
}

fn substitute_selector(
    engine: &dyn ScriptEngine,
    selector: &ElementSelector,
) -> Result<ElementSelector, FlowError> {
    let mut out = selector.clone();
    if let Some(t) = &selector.text_regex {
        out.text_regex = Some(substitute_string(engine, t)?);
    }
    if let Some(t) = &selector.id_regex {
        out.id_regex = Some(substitute_string(engine, t)?);
    }
    if let Some(c) = &selector.css {
        out.css = Some(substitute_string(engine, c)?);
    }
    if let Some(b) = &selector.below {
        out.below = Some(Box::new(substitute_selector(engine, b)?));
    }
    if let Some(b) = &selector.above {
        out.above = Some(Box::new(substitute_selector(engine, b)?));
    }
    if let Some(b) = &selector.left_of {
        out.left_of = Some(Box::new(substitute_selector(engine, b)?));
    }
    if let Some(b) = &selector.right_of {
        out.right_of = Some(Box::new(substitute_selector(engine, b)?));
    }
    if let Some(b) = &selector.child_of {
        out.child_of = Some(Box::new(substitute_selector(engine, b)?));
    }
    if let Some(b) = &selector.contains_child {
        out.contains_child = Some(Box::new(substitute_selector(engine, b)?));
    }
    out.contains_descendants = selector
        .contains_descendants
        .iter()
        .map(|s| substitute_selector(engine, s))
        .collect::<Result<_, _>>()?;
    Ok(out)
}

fn substitute_condition(
    engine: &dyn ScriptEngine,
    condition: &Condition,
) -> Result<Condition, FlowError> {
    Ok(Condition {
        platform: condition.platform.clone(),
        visible: condition
            .visible
            .as_ref()
            .map(|s| substitute_selector(engine, s))
            .transpose()?,
        not_visible: condition
            .not_visible
            .as_ref()
            .map(|s| substitute_selector(engine, s))
            .transpose()?,
        script_expression: condition
            .script_expression
            .as_ref()
            .map(|expr| engine.evaluate_script(expr, None, None, false))
            .transpose()?,
    })
}

fn substitute_kind(engine: &dyn ScriptEngine, kind: &CommandKind) -> Result<CommandKind, FlowError> {
    use CommandKind::*;
    Ok(match kind {
        TapOnElement {
            selector,
            retry_if_no_change,
            wait_until_visible,
            long_press,
            app_id,
            tap_repeat,
            wait_to_settle_timeout_ms,
        } => TapOnElement {
            selector: substitute_selector(engine, selector)?,
            retry_if_no_change: *retry_if_no_change,
            wait_until_visible: *wait_until_visible,
            long_press: *long_press,
            app_id: app_id.clone(),
            tap_repeat: *tap_repeat,
            wait_to_settle_timeout_ms: *wait_to_settle_timeout_ms,
        },
        Swipe(cmd) => {
            let shape = match &cmd.shape {
                SwipeShape::FromElement { selector, direction } => SwipeShape::FromElement {
                    selector: substitute_selector(engine, selector)?,
                    direction: *direction,
                },
                other => other.clone(),
            };
            Swipe(crate::protocol::SwipeCommand {
                shape,
                duration_ms: cmd.duration_ms,
                wait_to_settle_timeout_ms: cmd.wait_to_settle_timeout_ms,
            })
        }
        InputText { text } => InputText {
            text: substitute_string(engine, text)?,
        },
        PressKey { code } => PressKey {
            code: substitute_string(engine, code)?,
        },
        ScrollUntilVisible {
            selector,
            direction,
            scroll_duration_ms,
            visibility_percentage,
            center_element,
            wait_to_settle_timeout_ms,
            timeout_ms,
        } => ScrollUntilVisible {
            selector: substitute_selector(engine, selector)?,
            direction: *direction,
            scroll_duration_ms: *scroll_duration_ms,
            visibility_percentage: *visibility_percentage,
            center_element: *center_element,
            wait_to_settle_timeout_ms: *wait_to_settle_timeout_ms,
            timeout_ms: *timeout_ms,
        },
        CopyTextFrom { selector } => CopyTextFrom {
            selector: substitute_selector(engine, selector)?,
        },
        OpenLink {
            url,
            app_id,
            auto_verify,
            browser,
        } => OpenLink {
            url: substitute_string(engine, url)?,
            app_id: app_id.clone(),
            auto_verify: *auto_verify,
            browser: *browser,
        },
        LaunchApp {
            app_id,
            args,
            clear_state,
            clear_keychain,
            permissions,
            stop_if_running,
        } => LaunchApp {
            app_id: substitute_string(engine, app_id)?,
            args: args.clone(),
            clear_state: *clear_state,
            clear_keychain: *clear_keychain,
            permissions: permissions.clone(),
            stop_if_running: *stop_if_running,
        },
        AssertCondition { condition, timeout_ms } => AssertCondition {
            condition: substitute_condition(engine, condition)?,
            timeout_ms: *timeout_ms,
        },
        AssertWithAi { assertion } => AssertWithAi {
            assertion: substitute_string(engine, assertion)?,
        },
        ExtractTextWithAi {
            query,
            output_variable,
        } => ExtractTextWithAi {
            query: substitute_string(engine, query)?,
            output_variable: output_variable.clone(),
        },
        DefineVariables { variables } => {
            let mut out = HashMap::with_capacity(variables.len());
            for (k, v) in variables {
                out.insert(k.clone(), substitute_string(engine, v)?);
            }
            DefineVariables { variables: out }
        }
        EvalScript { script } => EvalScript {
            script: substitute_string(engine, script)?,
        },
        // Composite/structural/non-string-bearing variants: substitution
        // of their bodies happens per-command as each child is interpreted,
        // not eagerly here.
        other => other.clone(),
    })
}

/// Produces `evaluatedCommand` from a raw command: a pure transform that
/// may invoke the engine, leaving the raw command untouched so it can
/// remain the metadata key.
pub fn evaluate_command(
    engine: &dyn ScriptEngine,
    raw: &CommandEnvelope,
) -> Result<CommandEnvelope, FlowError> {
    Ok(CommandEnvelope {
        id: raw.id,
        kind: substitute_kind(engine, &raw.kind)?,
        optional: raw.optional,
        label: raw.label.clone(),
        condition: raw
            .condition
            .as_ref()
            .map(|c| substitute_condition(engine, c))
            .transpose()?,
    })
}

/// In-memory reference implementation used by tests and by callers that
/// have not wired in a real embedded engine. Supports `${name}` lookups
/// against a flat scope stack; any other expression evaluates to itself.
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Scopes {
        envs: Vec<HashMap<String, String>>,
        lexical_depth: usize,
        copied_text: Option<String>,
        log_sink: Option<Box<dyn Fn(String) + Send + Sync>>,
    }

    pub struct FakeScriptEngine {
        state: Mutex<Scopes>,
    }

    impl Default for FakeScriptEngine {
        fn default() -> Self {
            Self {
                state: Mutex::new(Scopes {
                    envs: vec![HashMap::new()],
                    ..Default::default()
                }),
            }
        }
    }

    impl ScriptEngine for FakeScriptEngine {
        fn put_env(&self, name: &str, value: &str) {
            let mut s = self.state.lock().unwrap();
            let top = s.envs.last_mut().expect("at least one env scope");
            top.insert(name.to_string(), value.to_string());
        }

        fn enter_scope(&self) {
            self.state.lock().unwrap().lexical_depth += 1;
        }

        fn leave_scope(&self) {
            let mut s = self.state.lock().unwrap();
            s.lexical_depth = s.lexical_depth.saturating_sub(1);
        }

        fn enter_env_scope(&self) {
            let mut s = self.state.lock().unwrap();
            let snapshot = s.envs.last().cloned().unwrap_or_default();
            s.envs.push(snapshot);
        }

        fn leave_env_scope(&self) {
            let mut s = self.state.lock().unwrap();
            if s.envs.len() > 1 {
                s.envs.pop();
            }
        }

        fn evaluate_script(
            &self,
            source: &str,
            _env: Option<&HashMap<String, String>>,
            _source_name: Option<&str>,
            _run_in_sub_scope: bool,
        ) -> Result<String, FlowError> {
            let trimmed = source.trim();
            let s = self.state.lock().unwrap();
            if let Some(top) = s.envs.last() {
                if let Some(v) = top.get(trimmed) {
                    return Ok(v.clone());
                }
            }
            Ok(trimmed.to_string())
        }

        fn on_log_message(&self, callback: Box<dyn Fn(String) + Send + Sync>) {
            self.state.lock().unwrap().log_sink = Some(callback);
        }

        fn set_copied_text(&self, text: Option<String>) {
            self.state.lock().unwrap().copied_text = text;
        }

        fn close(&self) {}

        fn lexical_scope_depth(&self) -> usize {
            self.state.lock().unwrap().lexical_depth
        }

        fn env_scope_depth(&self) -> usize {
            self.state.lock().unwrap().envs.len() - 1
        }
    }

    impl FakeScriptEngine {
        pub fn copied_text(&self) -> Option<String> {
            self.state.lock().unwrap().copied_text.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandKind;

    #[test]
    fn substitutes_flat_variable() {
        let engine = fakes::FakeScriptEngine::default();
        engine.put_env("name", "Ada");
        let raw = CommandEnvelope::new(CommandKind::InputText {
            text: "Hello ${name}!".to_string(),
        });
        let evaluated = evaluate_command(&engine, &raw).unwrap();
        match evaluated.kind {
            CommandKind::InputText { text } => assert_eq!(text, "Hello Ada!"),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn leaves_plain_strings_untouched() {
        let engine = fakes::FakeScriptEngine::default();
        let raw = CommandEnvelope::new(CommandKind::PressKey {
            code: "ENTER".to_string(),
        });
        let evaluated = evaluate_command(&engine, &raw).unwrap();
        match evaluated.kind {
            CommandKind::PressKey { code } => assert_eq!(code, "ENTER"),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn env_scope_isolation() {
        let engine = fakes::FakeScriptEngine::default();
        engine.put_env("a", "1");
        engine.enter_env_scope();
        engine.put_env("a", "2");
        assert_eq!(engine.evaluate_script("a", None, None, false).unwrap(), "2");
        engine.leave_env_scope();
        assert_eq!(engine.evaluate_script("a", None, None, false).unwrap(), "1");
    }
}
