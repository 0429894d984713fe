//! Scoped ownership of the scheduler session and its job templates.
//!
//! A [`JobManager`] opens its session when constructed (only if a grid
//! backend was selected) and tears it down when closed or dropped: every
//! template is deleted first, then the session is exited. Both steps are
//! best effort; failures are logged and never propagated.
//!
//! Factories read the current configuration once and freeze it into the
//! returned [`BoundJob`] / [`BoundArgvJob`]. Later calls to
//! [`JobManager::update`] do not affect callables that already exist.

use crate::activation::{with_activation, CallOptions};
use crate::config::{ConfigMap, EnvMap, JobConfig};
use crate::drm::sge::SgeSession;
use crate::drm::{DrmSession, JobTemplate, TaskRange, WaitTimeout};
use crate::error::{PiperError, Result};
use crate::grid::{self, GridParams, ScriptParams, TemplateArena};
use crate::local::{self, LocalParams};
use crate::result::{JobCallable, JobResult};
use rand::Rng;
use std::env;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const DEFAULT_JOB_NAME: &str = "PiperJob";
pub const NULL_SINK: &str = "/dev/null";

/// Which backends a manager makes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    #[default]
    LocalOnly,
    /// Direct grid jobs plus script jobs for arbitrary shell command lines.
    Integrated,
    /// Direct grid jobs only.
    Standalone,
}

impl BackendSelection {
    pub fn uses_grid(self) -> bool {
        !matches!(self, BackendSelection::LocalOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendSelection::LocalOnly => "local",
            BackendSelection::Integrated => "grid-integrated",
            BackendSelection::Standalone => "grid-standalone",
        }
    }
}

#[derive(Debug)]
pub struct JobManager {
    selection: BackendSelection,
    normalize_env: bool,
    config: Option<JobConfig>,
    session: Option<Arc<dyn DrmSession>>,
    templates: Arc<Mutex<TemplateArena>>,
    closed: bool,
}

impl JobManager {
    /// Opens a manager, connecting to Grid Engine if a grid backend is selected.
    pub fn open(selection: BackendSelection) -> Result<Self> {
        if selection.uses_grid() {
            Self::open_with_session(selection, Arc::new(SgeSession::new()))
        } else {
            Ok(Self::unopened(selection, None))
        }
    }

    /// Opens a manager on an explicit session. The session is initialized here,
    /// so an unreachable scheduler fails construction.
    pub fn open_with_session(
        selection: BackendSelection,
        session: Arc<dyn DrmSession>,
    ) -> Result<Self> {
        if !selection.uses_grid() {
            return Ok(Self::unopened(selection, None));
        }
        session.initialize().map_err(|e| match e {
            unavailable @ PiperError::BackendUnavailable(_) => unavailable,
            other => PiperError::BackendUnavailable(other.to_string()),
        })?;
        debug!(contact = %session.contact(), "grid session opened");
        Ok(Self::unopened(selection, Some(session)))
    }

    fn unopened(selection: BackendSelection, session: Option<Arc<dyn DrmSession>>) -> Self {
        JobManager {
            selection,
            normalize_env: true,
            config: None,
            session,
            templates: Arc::new(Mutex::new(TemplateArena::default())),
            closed: false,
        }
    }

    /// Whether environment variable names are upper-cased on update.
    pub fn normalize_env(mut self, enabled: bool) -> Self {
        self.normalize_env = enabled;
        self
    }

    pub fn selection(&self) -> BackendSelection {
        self.selection
    }

    pub fn config(&self) -> Option<&JobConfig> {
        self.config.as_ref()
    }

    /// Replaces the configuration and merges `env` into the job environment.
    pub fn update(&mut self, config: Option<&ConfigMap>, env: Option<&EnvMap>) -> Result<()> {
        if let Some(options) = config {
            self.config = Some(JobConfig::from_options(options)?);
        }
        if let Some(env) = env {
            self.config
                .get_or_insert_with(JobConfig::default)
                .env
                .get_or_insert_with(EnvMap::new)
                .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        if self.normalize_env {
            if let Some(config) = self.config.as_mut() {
                config.normalize_env();
            }
        }
        Ok(())
    }

    /// Replaces the configuration with an already typed one.
    pub fn set_config(&mut self, mut config: JobConfig) {
        if self.normalize_env {
            config.normalize_env();
        }
        self.config = Some(config);
    }

    fn require_config(&self) -> Result<&JobConfig> {
        if self.closed {
            return Err(PiperError::Configuration("job manager is closed".to_string()));
        }
        self.config
            .as_ref()
            .ok_or_else(|| PiperError::Configuration("no configuration set".to_string()))
    }

    fn require_session(&self) -> Result<&Arc<dyn DrmSession>> {
        self.session.as_ref().ok_or_else(|| {
            PiperError::Configuration(format!(
                "grid jobs are not available with the {} backend selection",
                self.selection.as_str()
            ))
        })
    }

    pub fn local_job(&self) -> Result<BoundJob> {
        let config = self.require_config()?;
        Ok(BoundJob {
            backend: Backend::Local(LocalParams {
                workdir: config.workdir.as_deref().map(PathBuf::from),
                env: config.env.clone(),
            }),
        })
    }

    pub fn grid_single_job(&self) -> Result<BoundJob> {
        Ok(BoundJob {
            backend: Backend::Single(self.bind_grid()?),
        })
    }

    pub fn grid_single_job_with_args(&self) -> Result<BoundArgvJob> {
        Ok(BoundArgvJob {
            backend: ArgvBackend::Single(self.bind_grid()?),
        })
    }

    pub fn grid_array_job(&self, start: u32, end: u32, step: u32) -> Result<BoundJob> {
        let range = TaskRange::new(start, end, step)?;
        Ok(BoundJob {
            backend: Backend::Array(self.bind_grid()?, range),
        })
    }

    pub fn grid_array_job_with_args(&self, start: u32, end: u32, step: u32) -> Result<BoundArgvJob> {
        let range = TaskRange::new(start, end, step)?;
        Ok(BoundArgvJob {
            backend: ArgvBackend::Array(self.bind_grid()?, range),
        })
    }

    /// Grid job for arbitrary shell command lines, submitted as a script.
    pub fn grid_script_job(&self) -> Result<BoundJob> {
        if self.selection != BackendSelection::Integrated {
            return Err(PiperError::Configuration(format!(
                "script jobs need the {} backend selection, manager uses {}",
                BackendSelection::Integrated.as_str(),
                self.selection.as_str()
            )));
        }
        let grid = self.bind_grid()?;
        let config = self.require_config()?;
        let script_dir = config
            .scriptdir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        Ok(BoundJob {
            backend: Backend::Script(ScriptParams {
                grid,
                script_dir,
                keep_scripts: config.keepscripts,
            }),
        })
    }

    /// Creates, configures and registers one template.
    fn bind_grid(&self) -> Result<GridParams> {
        let config = self.require_config()?;
        let session = self.require_session()?;
        let mut template = session.create_job_template()?;
        if let Err(e) = configure_template(&mut template, config) {
            if let Err(del) = session.delete_job_template(&template) {
                warn!(error = %del, "deleting unconfigured job template failed");
            }
            return Err(e);
        }
        debug!(name = %template.job_name, "job template created");
        let id = self
            .templates
            .lock()
            .map_err(|_| PiperError::Session("submission lock poisoned".to_string()))?
            .insert(template);
        Ok(GridParams {
            session: session.clone(),
            templates: self.templates.clone(),
            template: id,
            timeout: WaitTimeout::Forever,
        })
    }

    pub fn template_count(&self) -> usize {
        self.templates
            .lock()
            .map(|arena| arena.len())
            .unwrap_or_else(|p| p.into_inner().len())
    }

    pub fn summarize_status(&self) -> String {
        let contact = self
            .session
            .as_ref()
            .map(|s| s.contact())
            .unwrap_or_else(|| "none".to_string());
        format!(
            "backends: {}\nsession: {}\njob templates: {}\nconfigured: {}\nclosed: {}",
            self.selection.as_str(),
            contact,
            self.template_count(),
            self.config.is_some(),
            self.closed
        )
    }

    /// Deletes every template, then exits the session.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let templates = self
            .templates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain();
        for template in &templates {
            if let Err(e) = session.delete_job_template(template) {
                warn!(name = %template.job_name, error = %e, "deleting job template failed");
            }
        }
        if let Err(e) = session.exit() {
            warn!(error = %e, "closing grid session failed");
        }
        debug!(templates = templates.len(), "grid session closed");
    }
}

impl Drop for JobManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn configure_template(template: &mut JobTemplate, config: &JobConfig) -> Result<()> {
    let suffix: String = {
        let mut rng = rand::rng();
        (0..4).map(|_| rng.random_range(b'A'..=b'Z') as char).collect()
    };
    template.job_name = format!(
        "{}{}",
        config.jobname.as_deref().unwrap_or(DEFAULT_JOB_NAME),
        suffix
    );
    template.working_directory = match config.workdir.as_deref() {
        Some(dir) => PathBuf::from(dir.trim_matches(':')),
        None => env::current_dir()?,
    };
    template.output_path =
        PathBuf::from(config.outpath.as_deref().unwrap_or(NULL_SINK).trim_matches(':'));
    template.error_path =
        PathBuf::from(config.errpath.as_deref().unwrap_or(NULL_SINK).trim_matches(':'));
    template.job_environment = config.env.clone().unwrap_or_default();
    template.remote_command = String::new();
    template.native_specification = config.native_spec.clone().unwrap_or_default();
    template.join_files = config.joinfiles;
    Ok(())
}

#[derive(Debug, Clone)]
enum Backend {
    Local(LocalParams),
    Single(GridParams),
    Array(GridParams, TaskRange),
    Script(ScriptParams),
}

/// A backend with all of its parameters bound, ready to run command lines.
#[derive(Debug, Clone)]
pub struct BoundJob {
    backend: Backend,
}

impl BoundJob {
    pub fn run(&self, command: &str) -> JobResult {
        self.run_with(command, &CallOptions::default())
    }

    pub fn run_with(&self, command: &str, options: &CallOptions) -> JobResult {
        let command = with_activation(command, options);
        match &self.backend {
            Backend::Local(params) => local::run_local(&command, params),
            Backend::Single(params) => grid::run_single(&command, None, params),
            Backend::Array(params, range) => grid::run_array(&command, None, params, *range),
            Backend::Script(params) => grid::run_script(&command, params),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.backend {
            Backend::Local(_) => "local",
            Backend::Single(_) => "grid-single",
            Backend::Array(..) => "grid-array",
            Backend::Script(_) => "grid-script",
        }
    }
}

impl JobCallable for BoundJob {
    fn call(&self, command: &str) -> JobResult {
        self.run(command)
    }
}

#[derive(Debug, Clone)]
enum ArgvBackend {
    Single(GridParams),
    Array(GridParams, TaskRange),
}

/// Grid backend whose command line also receives an argument vector ($1, $2, ...).
#[derive(Debug, Clone)]
pub struct BoundArgvJob {
    backend: ArgvBackend,
}

impl BoundArgvJob {
    pub fn run<S: ToString>(&self, command: &str, argv: &[S]) -> JobResult {
        self.run_with(command, argv, &CallOptions::default())
    }

    pub fn run_with<S: ToString>(
        &self,
        command: &str,
        argv: &[S],
        options: &CallOptions,
    ) -> JobResult {
        let command = with_activation(command, options);
        let argv: Vec<String> = argv.iter().map(ToString::to_string).collect();
        match &self.backend {
            ArgvBackend::Single(params) => grid::run_single(&command, Some(&argv), params),
            ArgvBackend::Array(params, range) => {
                grid::run_array(&command, Some(&argv), params, *range)
            }
        }
    }

    /// Fixes the argument vector so the job fits the `(command) -> result` shape.
    pub fn with_argv<S: ToString>(&self, argv: &[S]) -> ArgvJob {
        ArgvJob {
            job: self.clone(),
            argv: argv.iter().map(ToString::to_string).collect(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.backend {
            ArgvBackend::Single(_) => "grid-single-argv",
            ArgvBackend::Array(..) => "grid-array-argv",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArgvJob {
    job: BoundArgvJob,
    argv: Vec<String>,
}

impl JobCallable for ArgvJob {
    fn call(&self, command: &str) -> JobResult {
        self.job.run(command, &self.argv)
    }
}
