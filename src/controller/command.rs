use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Queue,
    Stop,
    Extract,
    DeleteLocal,
    DeleteRemote,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Queue => "QUEUE",
            Action::Stop => "STOP",
            Action::Extract => "EXTRACT",
            Action::DeleteLocal => "DELETE_LOCAL",
            Action::DeleteRemote => "DELETE_REMOTE",
        };
        f.write_str(s)
    }
}

/// Coarse classification of a failed command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandErrorKind {
    NotFound,
    Conflict,
    Transient,
    Internal,
}

impl CommandErrorKind {
    pub fn http_status(self) -> u16 {
        match self {
            CommandErrorKind::NotFound => 404,
            CommandErrorKind::Conflict => 409,
            CommandErrorKind::Transient | CommandErrorKind::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct CommandError {
    pub kind: CommandErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: CommandErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(CommandErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(CommandErrorKind::Conflict, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(CommandErrorKind::Transient, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CommandErrorKind::Internal, message)
    }
}

pub type CommandOutcome = Result<(), CommandError>;

/// Notified once a command has been dispatched.
///
/// Runs on the reconciliation thread; keep it short.
pub trait CommandCallback: Send {
    fn on_success(&mut self);
    fn on_failure(&mut self, error: &CommandError);
}

pub struct Command {
    pub action: Action,
    pub file_name: String,
    callbacks: Vec<Box<dyn CommandCallback>>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("action", &self.action)
            .field("file_name", &self.file_name)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

impl Command {
    pub fn new(action: Action, file_name: impl Into<String>) -> Self {
        Self {
            action,
            file_name: file_name.into(),
            callbacks: Vec::new(),
        }
    }

    pub fn add_callback(&mut self, callback: Box<dyn CommandCallback>) {
        self.callbacks.push(callback);
    }

    /// Attach a completion token the caller can block on.
    pub fn completion(&mut self) -> CommandCompletion {
        let (tx, rx) = bounded(1);
        self.add_callback(Box::new(CompletionCallback { tx: Some(tx) }));
        CommandCompletion {
            action: self.action,
            file_name: self.file_name.clone(),
            rx,
        }
    }

    pub(crate) fn complete(mut self, outcome: &CommandOutcome) {
        for callback in self.callbacks.iter_mut() {
            match outcome {
                Ok(()) => callback.on_success(),
                Err(e) => callback.on_failure(e),
            }
        }
    }
}

struct CompletionCallback {
    tx: Option<Sender<CommandOutcome>>,
}

impl CompletionCallback {
    fn send(&mut self, outcome: CommandOutcome) {
        if let Some(tx) = self.tx.take() {
            // The waiter may have given up already
            if tx.send(outcome).is_err() {
                debug!("Command waiter went away before completion");
            }
        }
    }
}

impl CommandCallback for CompletionCallback {
    fn on_success(&mut self) {
        self.send(Ok(()));
    }

    fn on_failure(&mut self, error: &CommandError) {
        self.send(Err(error.clone()));
    }
}

/// Caller-side handle for the result of one queued command
#[derive(Debug)]
pub struct CommandCompletion {
    action: Action,
    file_name: String,
    rx: Receiver<CommandOutcome>,
}

impl CommandCompletion {
    pub fn action(&self) -> Action {
        self.action
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn wait(self) -> CommandOutcome {
        self.rx.recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// `None` when the timeout elapses first. The command itself stays
    /// queued and is still dispatched later.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<CommandOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(dropped())),
        }
    }

    pub fn try_outcome(&self) -> Option<CommandOutcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(dropped())),
        }
    }
}

fn dropped() -> CommandError {
    CommandError::internal("command was dropped before it was processed")
}
