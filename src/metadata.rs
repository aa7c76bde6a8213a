//! Per-raw-command metadata accumulation keyed by `CommandId`, and the
//! pluggable callbacks a reporter hangs off the interpreter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::driver::Defect;
use crate::error::CommandFailure;
use crate::protocol::{CommandEnvelope, CommandId, CommandMetadata};

/// What `on_command_failed` tells the loop to do next. Defaults to `Fail`:
/// an unhandled failure rethrows and stops the flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Continue,
    Fail,
}

/// All callbacks are no-ops by default and are invoked synchronously from
/// the executing task — implementations must not hold them across an
/// `.await` the core doesn't already own.
pub trait Observer: Send + Sync {
    fn on_flow_start(&self, _commands: &[CommandEnvelope]) {}
    fn on_command_start(&self, _index: usize, _raw: &CommandEnvelope) {}
    fn on_command_complete(&self, _index: usize, _raw: &CommandEnvelope) {}
    fn on_command_warned(&self, _index: usize, _raw: &CommandEnvelope) {}
    fn on_command_skipped(&self, _index: usize, _raw: &CommandEnvelope) {}
    fn on_command_failed(
        &self,
        _index: usize,
        _raw: &CommandEnvelope,
        _error: &CommandFailure,
    ) -> FailurePolicy {
        FailurePolicy::Fail
    }
    fn on_command_reset(&self, _raw: &CommandEnvelope) {}
    fn on_command_metadata_update(&self, _raw: &CommandEnvelope, _metadata: &CommandMetadata) {}
    fn on_command_generated_output(
        &self,
        _raw: &CommandEnvelope,
        _defects: &[Defect],
        _screenshot: &[u8],
    ) {
    }
}

/// The default bus: every callback is a no-op and failures always abort
/// the flow.
#[derive(Default)]
pub struct NoopObserver;
impl Observer for NoopObserver {}

/// Side-table keyed by raw-command identity: a `CommandId` counter stands
/// in for address identity, so the same `CommandEnvelope` revisited across
/// `repeat` iterations always maps back to the same entry.
///
/// Holds its table behind an `Arc` so a handle can be cloned into a
/// `'static` log-sink closure handed to the script engine (`ScriptEngine::
/// on_log_message` takes a `Box<dyn Fn(String) + Send + Sync>`, which
/// can't borrow `&self`) without the engine needing to know anything about
/// command identity.
#[derive(Default, Clone)]
pub struct MetadataStore {
    entries: Arc<Mutex<HashMap<CommandId, CommandMetadata>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily creates the entry for `id`: every raw command observed by the
    /// interpreter ends up with a metadata entry.
    pub fn with<R>(&self, id: CommandId, f: impl FnOnce(&mut CommandMetadata) -> R) -> R {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry(id).or_default();
        f(entry)
    }

    pub fn snapshot(&self, id: CommandId) -> CommandMetadata {
        self.entries.lock().unwrap().get(&id).cloned().unwrap_or_default()
    }

    pub fn reset_runs(&self, id: CommandId) {
        self.with(id, |m| m.number_of_runs = 0);
    }

    /// A `'static` closure that appends a log line to `id`'s metadata,
    /// capped at [`crate::protocol::MAX_LOG_MESSAGES_PER_COMMAND`].
    /// Handed to `ScriptEngine::on_log_message` for the duration of a
    /// single command's execution.
    pub fn log_sink(&self, id: CommandId) -> Box<dyn Fn(String) + Send + Sync> {
        let store = self.clone();
        Box::new(move |line| store.with(id, |m| m.push_log_message(line)))
    }
}

/// Test double used both by this crate's own unit tests and by downstream
/// integration tests that need to assert callback ordering.
pub mod fakes {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum ObservedEvent {
        FlowStart,
        Start(usize),
        Complete(usize),
        Warned(usize),
        Skipped(usize),
        Failed(usize),
        Reset,
    }

    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: StdMutex<Vec<ObservedEvent>>,
        pub failure_policy: StdMutex<Option<FailurePolicy>>,
        pub last_error: StdMutex<Option<String>>,
    }

    impl Observer for RecordingObserver {
        fn on_flow_start(&self, _commands: &[CommandEnvelope]) {
            self.events.lock().unwrap().push(ObservedEvent::FlowStart);
        }
        fn on_command_start(&self, index: usize, _raw: &CommandEnvelope) {
            self.events.lock().unwrap().push(ObservedEvent::Start(index));
        }
        fn on_command_complete(&self, index: usize, _raw: &CommandEnvelope) {
            self.events
                .lock()
                .unwrap()
                .push(ObservedEvent::Complete(index));
        }
        fn on_command_warned(&self, index: usize, _raw: &CommandEnvelope) {
            self.events.lock().unwrap().push(ObservedEvent::Warned(index));
        }
        fn on_command_skipped(&self, index: usize, _raw: &CommandEnvelope) {
            self.events
                .lock()
                .unwrap()
                .push(ObservedEvent::Skipped(index));
        }
        fn on_command_failed(
            &self,
            index: usize,
            _raw: &CommandEnvelope,
            error: &CommandFailure,
        ) -> FailurePolicy {
            self.events.lock().unwrap().push(ObservedEvent::Failed(index));
            *self.last_error.lock().unwrap() = Some(error.to_string());
            self.failure_policy.lock().unwrap().unwrap_or(FailurePolicy::Fail)
        }
        fn on_command_reset(&self, _raw: &CommandEnvelope) {
            self.events.lock().unwrap().push(ObservedEvent::Reset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CommandKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn lazily_creates_entry_on_first_touch() {
        let store = MetadataStore::new();
        let envelope = CommandEnvelope::new(CommandKind::Back);
        let before = store.snapshot(envelope.id);
        assert_eq!(before.number_of_runs, 0);
        store.with(envelope.id, |m| m.number_of_runs = 3);
        assert_eq!(store.snapshot(envelope.id).number_of_runs, 3);
    }

    #[test]
    fn log_messages_are_capped() {
        let mut metadata = CommandMetadata::default();
        for i in 0..(crate::protocol::MAX_LOG_MESSAGES_PER_COMMAND + 10) {
            metadata.push_log_message(format!("line {i}"));
        }
        assert_eq!(
            metadata.log_messages.len(),
            crate::protocol::MAX_LOG_MESSAGES_PER_COMMAND
        );
    }
}
