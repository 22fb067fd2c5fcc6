pub mod builder;
pub mod command;
#[allow(clippy::module_inception)]
pub mod controller;
pub mod delete;
pub mod extract;
pub mod memory_monitor;
pub mod persist;
pub mod scanner;
pub mod scanners;
pub mod ssh;
pub mod status;
pub mod transfer;

pub use builder::ModelBuilder;
pub use command::{Action, Command, CommandCompletion, CommandError, CommandErrorKind};
pub use controller::{Collaborators, Controller, ControllerError, ControllerHandle, ControllerOptions};
pub use persist::ControllerPersist;
pub use status::Status;
