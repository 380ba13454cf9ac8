use std::any::Any;
use std::process::ExitCode;

use tracing::info;
use vigil_config::ResolvedConfig;
use vigil_face_core::AppResult;

use crate::cli::{MonitorArgs, OutputMode};
use crate::commands::CommandHandler;
use crate::config::{self, MonitorSettings};
use crate::monitor::{run_monitor, MonitorOutcome};
use crate::output::render_monitor;

pub struct MonitorHandler {
    args: MonitorArgs,
    deps: MonitorHandlerDeps,
}

pub struct MonitorHandlerDeps {
    pub load_config: Box<dyn Fn() -> AppResult<ResolvedConfig> + Send + Sync>,
    pub run: Box<dyn Fn(&MonitorSettings, OutputMode) -> AppResult<MonitorOutcome> + Send + Sync>,
    pub render: Box<dyn Fn(&MonitorOutcome, OutputMode) -> AppResult<()> + Send + Sync>,
}

impl MonitorHandlerDeps {
    pub fn new(
        load_config: impl Fn() -> AppResult<ResolvedConfig> + Send + Sync + 'static,
        run: impl Fn(&MonitorSettings, OutputMode) -> AppResult<MonitorOutcome>
            + Send
            + Sync
            + 'static,
        render: impl Fn(&MonitorOutcome, OutputMode) -> AppResult<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            load_config: Box::new(load_config),
            run: Box::new(run),
            render: Box::new(render),
        }
    }
}

impl Default for MonitorHandlerDeps {
    fn default() -> Self {
        Self::new(config::load_config, run_monitor, render_monitor)
    }
}

impl MonitorHandler {
    pub fn new(args: MonitorArgs) -> Self {
        Self {
            args,
            deps: MonitorHandlerDeps::default(),
        }
    }

    pub fn with_dependencies(args: MonitorArgs, deps: MonitorHandlerDeps) -> Self {
        Self { args, deps }
    }
}

impl CommandHandler for MonitorHandler {
    fn execute(&self, mode: OutputMode, verbose: bool) -> AppResult<ExitCode> {
        let resolved = (self.deps.load_config)()?;
        let settings = config::monitor_settings(&self.args, &resolved)?;
        if verbose {
            info!(
                subject = %settings.subject,
                device = %settings.capture.device.display(),
                threshold = settings.session.match_threshold,
                attempts = settings.attempts,
                "starting monitor"
            );
        }
        let outcome = (self.deps.run)(&settings, mode)?;
        (self.deps.render)(&outcome, mode)?;
        if outcome.verified {
            Ok(ExitCode::SUCCESS)
        } else {
            Ok(ExitCode::from(1))
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
