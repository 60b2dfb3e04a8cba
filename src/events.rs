use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::machine::Status;

/// Everything the core reports to the outside: status transitions, streamed
/// session output, and user-facing notices. The display layer decides how to
/// render these; the core only emits.
#[derive(Debug, Clone)]
pub enum AppEvent {
    MachineStatus { name: String, status: Status },
    SessionOutput { label: String, line: String },
    SessionClosed { label: String },
    /// A host-command macro asking the surrounding application to run one of
    /// its own commands (e.g. "refresh").
    HostCommand(String),
    Notice(String),
    Warning(String),
}

/// Clonable emitter handed to every entity that needs to report something.
/// A dropped receiver is not an error: a headless collection (tests) just
/// discards events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: UnboundedSender<AppEvent>,
}

impl EventBus {
    pub fn new() -> (Self, UnboundedReceiver<AppEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    pub fn notice(&self, message: impl Into<String>) {
        self.emit(AppEvent::Notice(message.into()));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.emit(AppEvent::Warning(message.into()));
    }

    pub fn status(&self, name: &str, status: Status) {
        self.emit(AppEvent::MachineStatus {
            name: name.to_string(),
            status,
        });
    }
}
