use std::any::Any;
use std::process::ExitCode;

use vigil_config::ResolvedConfig;
use vigil_face_core::AppResult;

use crate::cli::{CompareArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::compare::{run_compare, CompareOutcome};
use crate::config::{self, CompareSettings};
use crate::output::render_compare;

pub struct CompareHandler {
    args: CompareArgs,
    deps: CompareHandlerDeps,
}

pub struct CompareHandlerDeps {
    pub load_config: Box<dyn Fn() -> AppResult<ResolvedConfig> + Send + Sync>,
    pub compare: Box<dyn Fn(&CompareSettings) -> AppResult<CompareOutcome> + Send + Sync>,
    pub render: Box<dyn Fn(&CompareOutcome, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl CompareHandlerDeps {
    pub fn new(
        load_config: impl Fn() -> AppResult<ResolvedConfig> + Send + Sync + 'static,
        compare: impl Fn(&CompareSettings) -> AppResult<CompareOutcome> + Send + Sync + 'static,
        render: impl Fn(&CompareOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            load_config: Box::new(load_config),
            compare: Box::new(compare),
            render: Box::new(render),
        }
    }
}

impl Default for CompareHandlerDeps {
    fn default() -> Self {
        Self::new(config::load_config, run_compare, render_compare)
    }
}

impl CompareHandler {
    pub fn new(args: CompareArgs) -> Self {
        Self {
            args,
            deps: CompareHandlerDeps::default(),
        }
    }

    pub fn with_dependencies(args: CompareArgs, deps: CompareHandlerDeps) -> Self {
        Self { args, deps }
    }
}

impl CommandHandler for CompareHandler {
    fn execute(&self, mode: OutputMode, _verbose: bool) -> AppResult<ExitCode> {
        let resolved = (self.deps.load_config)()?;
        let settings = config::compare_settings(&self.args, &resolved)?;
        let outcome = (self.deps.compare)(&settings)?;
        (self.deps.render)(&outcome, mode)?;
        if outcome.matched {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::from(1))
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
