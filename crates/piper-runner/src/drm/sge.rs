//! Grid Engine session driven through `qsub`, `qstat` and `qacct`.

use super::{DrmSession, JobId, JobInfo, JobState, JobTemplate, TaskRange, WaitTimeout};
use crate::error::{PiperError, Result};
use crate::local::SHELL;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_ACCOUNTING_ATTEMPTS: u32 = 6;

/// Names (or paths) of the scheduler client programs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SgeTools {
    pub qsub: String,
    pub qstat: String,
    pub qacct: String,
}

impl Default for SgeTools {
    fn default() -> Self {
        SgeTools {
            qsub: "qsub".to_string(),
            qstat: "qstat".to_string(),
            qacct: "qacct".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct SgeSession {
    tools: SgeTools,
    poll_interval: Duration,
    accounting_attempts: u32,
    open: AtomicBool,
    next_handle: AtomicU64,
}

impl Default for SgeSession {
    fn default() -> Self {
        SgeSession::with_tools(SgeTools::default())
    }
}

impl SgeSession {
    pub fn new() -> Self {
        SgeSession::default()
    }

    pub fn with_tools(tools: SgeTools) -> Self {
        SgeSession {
            tools,
            poll_interval: DEFAULT_POLL_INTERVAL,
            accounting_attempts: DEFAULT_ACCOUNTING_ATTEMPTS,
            open: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn accounting_attempts(mut self, attempts: u32) -> Self {
        self.accounting_attempts = attempts.max(1);
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PiperError::Session("session is not open".to_string()))
        }
    }

    fn tool(&self, program: &str, args: &[String]) -> Result<String> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PiperError::Session(format!("failed to run {}: {}", program, e)))?;
        if !output.status.success() {
            let code = output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(PiperError::Session(format!(
                "{} exited with {}: {}",
                program,
                code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn listing(&self) -> Result<String> {
        self.tool(&self.tools.qstat, &[])
    }

    fn deadline(timeout: WaitTimeout) -> Option<Instant> {
        match timeout {
            WaitTimeout::Forever => None,
            WaitTimeout::NoWait => Some(Instant::now()),
            WaitTimeout::Seconds(secs) => Some(Instant::now() + Duration::from_secs(secs)),
        }
    }

    fn accounting(&self, job_id: &str) -> Result<JobInfo> {
        let (base, task) = split_job_id(job_id);
        let mut args = vec!["-j".to_string(), base.to_string()];
        if let Some(task) = task {
            args.push("-t".to_string());
            args.push(task.to_string());
        }
        let mut last_err = None;
        for attempt in 0..self.accounting_attempts {
            match self.tool(&self.tools.qacct, &args) {
                Ok(listing) => return Ok(parse_qacct(&listing, job_id)),
                Err(e) => {
                    debug!(job_id, attempt, error = %e, "accounting record not available yet");
                    last_err = Some(e);
                    thread::sleep(self.poll_interval);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            PiperError::Session(format!("no accounting record for job {}", job_id))
        }))
    }
}

impl DrmSession for SgeSession {
    fn contact(&self) -> String {
        format!("sge:{}", self.tools.qsub)
    }

    fn initialize(&self) -> Result<()> {
        self.listing()
            .map_err(|e| PiperError::BackendUnavailable(e.to_string()))?;
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(PiperError::Session("session already closed".to_string()));
        }
        Ok(())
    }

    fn create_job_template(&self) -> Result<JobTemplate> {
        self.ensure_open()?;
        Ok(JobTemplate {
            handle: self.next_handle.fetch_add(1, Ordering::SeqCst),
            ..JobTemplate::default()
        })
    }

    fn delete_job_template(&self, _template: &JobTemplate) -> Result<()> {
        self.ensure_open()
    }

    fn run_job(&self, template: &JobTemplate) -> Result<JobId> {
        self.ensure_open()?;
        let stdout = self.tool(&self.tools.qsub, &submit_args(template, None)?)?;
        let job_id = parse_submit_id(&stdout)?;
        debug!(job_id = %job_id, name = %template.job_name, "submitted grid job");
        Ok(job_id)
    }

    fn run_bulk_jobs(&self, template: &JobTemplate, range: TaskRange) -> Result<Vec<JobId>> {
        self.ensure_open()?;
        let stdout = self.tool(&self.tools.qsub, &submit_args(template, Some(range))?)?;
        let job_id = parse_submit_id(&stdout)?;
        let (base, _) = split_job_id(&job_id);
        debug!(job_id = %base, name = %template.job_name, "submitted grid array job");
        Ok(expand_bulk_ids(base, range))
    }

    fn job_status(&self, job_id: &str) -> Result<JobState> {
        self.ensure_open()?;
        Ok(parse_qstat_state(&self.listing()?, job_id))
    }

    fn wait(&self, job_id: &str, timeout: WaitTimeout) -> Result<JobInfo> {
        self.ensure_open()?;
        let deadline = Self::deadline(timeout);
        loop {
            if parse_qstat_state(&self.listing()?, job_id).is_finished() {
                break;
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Err(PiperError::Session(format!(
                    "timed out waiting for job {}",
                    job_id
                )));
            }
            thread::sleep(self.poll_interval);
        }
        self.accounting(job_id)
    }

    fn synchronize(&self, job_ids: &[JobId], timeout: WaitTimeout, _dispose: bool) -> Result<()> {
        self.ensure_open()?;
        let deadline = Self::deadline(timeout);
        loop {
            let listing = self.listing()?;
            let pending = job_ids
                .iter()
                .filter(|id| !parse_qstat_state(&listing, id).is_finished())
                .count();
            if pending == 0 {
                return Ok(());
            }
            if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                return Err(PiperError::Session(format!(
                    "timed out synchronizing {} of {} jobs",
                    pending,
                    job_ids.len()
                )));
            }
            thread::sleep(self.poll_interval);
        }
    }
}

/// Builds the `qsub` argument list.
///
/// `-v` takes a comma-separated list, so environment values containing a
/// comma are rejected. The native specification is split on whitespace
/// without shell quoting; quoted option values are not supported.
fn submit_args(template: &JobTemplate, range: Option<TaskRange>) -> Result<Vec<String>> {
    let mut args: Vec<String> = vec![
        "-terse".to_string(),
        "-N".to_string(),
        template.job_name.clone(),
        "-wd".to_string(),
        template.working_directory.display().to_string(),
        "-o".to_string(),
        template.output_path.display().to_string(),
        "-e".to_string(),
        template.error_path.display().to_string(),
        "-j".to_string(),
        if template.join_files { "y" } else { "n" }.to_string(),
    ];
    if !template.job_environment.is_empty() {
        if let Some((name, _)) = template
            .job_environment
            .iter()
            .find(|(k, v)| k.contains(',') || v.contains(','))
        {
            return Err(PiperError::Configuration(format!(
                "environment variable {} contains a comma, which qsub -v cannot pass",
                name
            )));
        }
        let vars = template
            .job_environment
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        args.push("-v".to_string());
        args.push(vars);
    }
    args.extend(
        template
            .native_specification
            .split_whitespace()
            .map(str::to_string),
    );
    if let Some(range) = range {
        args.push("-t".to_string());
        args.push(format!("{}-{}:{}", range.start, range.last_task(), range.step));
    }
    args.extend(
        ["-b", "y", "-shell", "no", SHELL, "-c"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(template.remote_command.clone());
    args.push(template.job_name.clone());
    args.extend(template.args.iter().cloned());
    Ok(args)
}

fn parse_submit_id(stdout: &str) -> Result<JobId> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PiperError::Session("qsub returned no job id".to_string()))
}

fn expand_bulk_ids(base: &str, range: TaskRange) -> Vec<JobId> {
    range.tasks().map(|t| format!("{}.{}", base, t)).collect()
}

/// Splits `123.4` into job `123` and task `4`.
fn split_job_id(job_id: &str) -> (&str, Option<&str>) {
    match job_id.split_once('.') {
        Some((base, task)) => (base, Some(task)),
        None => (job_id, None),
    }
}

fn parse_qstat_state(listing: &str, job_id: &str) -> JobState {
    let (base, task) = split_job_id(job_id);
    for line in listing.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 5 || tokens[0] != base {
            continue;
        }
        if let Some(task) = task {
            let trailing: Vec<&str> = tokens
                .iter()
                .skip(7)
                .copied()
                .filter(|t| !t.contains('@'))
                .collect();
            // A plain number names one task; ranges and lists are still pending.
            if let Some(field) = trailing.get(1) {
                if field.chars().all(|c| c.is_ascii_digit()) && *field != task {
                    continue;
                }
            }
        }
        return state_from_code(tokens[4]);
    }
    JobState::Done
}

fn state_from_code(code: &str) -> JobState {
    if code.contains('E') || code.contains('d') {
        JobState::Failed
    } else if code.contains('h') {
        JobState::Held
    } else if code.contains('s') || code.contains('S') || code.contains('T') {
        JobState::Suspended
    } else if code.contains('r') || code.contains('t') || code.contains('R') {
        JobState::Running
    } else if code.contains('q') || code.contains('w') {
        JobState::Queued
    } else {
        JobState::Undetermined
    }
}

fn parse_qacct(listing: &str, job_id: &str) -> JobInfo {
    let mut info = JobInfo {
        job_id: job_id.to_string(),
        ..JobInfo::default()
    };
    let mut failed = 0u32;
    for line in listing.lines() {
        let Some((key, value)) = line.trim().split_once(char::is_whitespace) else {
            continue;
        };
        let value = value.trim();
        match key {
            "exit_status" => {
                info.exit_status = value
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0)
            }
            "failed" => {
                failed = value
                    .split_whitespace()
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0)
            }
            "start_time" | "end_time" | "ru_maxrss" => {
                info.resource_usage
                    .insert(key.to_string(), value.to_string());
            }
            "maxvmem" => {
                info.resource_usage
                    .entry("ru_maxrss".to_string())
                    .or_insert_with(|| value.to_string());
            }
            _ => {}
        }
    }
    info.has_exited = failed == 0;
    info.was_aborted = failed != 0;
    info.has_signal = info.exit_status > 128;
    info
}
