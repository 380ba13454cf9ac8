use std::any::Any;
use std::process::ExitCode;

use vigil_face_core::AppResult;

use crate::cli::{Commands, OutputMode};

pub trait CommandHandler: Send + Sync {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode>;
    fn as_any(&self) -> &dyn Any;
}

mod compare;
mod monitor;

pub use compare::{CompareHandler, CompareHandlerDeps};
pub use monitor::{MonitorHandler, MonitorHandlerDeps};

impl From<Commands> for Box<dyn CommandHandler> {
    fn from(command: Commands) -> Self {
        match command {
            Commands::Monitor(args) => Box::new(MonitorHandler::new(args)),
            Commands::Compare(args) => Box::new(CompareHandler::new(args)),
        }
    }
}
