//! Grid backends: single job, single job with argv, array job, script job.
//!
//! Template mutation and job-id acquisition happen while holding the
//! manager's template arena lock; status polling, waiting and output
//! collection happen after it is released. Like the local backend, these
//! functions never fail: every problem ends up as a line of error text.

use crate::drm::{DrmSession, JobId, JobTemplate, TaskRange, WaitTimeout};
use crate::error::{PiperError, Result};
use crate::result::JobResult;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

pub const OUTPUT_READ_ATTEMPTS: usize = 3;

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Index of a template in its manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TemplateId(usize);

/// Job templates owned by one manager. Only reachable through its lock.
#[derive(Debug, Default)]
pub struct TemplateArena {
    slots: Vec<JobTemplate>,
}

impl TemplateArena {
    pub fn insert(&mut self, template: JobTemplate) -> TemplateId {
        self.slots.push(template);
        TemplateId(self.slots.len() - 1)
    }

    pub fn get_mut(&mut self, id: TemplateId) -> Option<&mut JobTemplate> {
        self.slots.get_mut(id.0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn drain(&mut self) -> Vec<JobTemplate> {
        std::mem::take(&mut self.slots)
    }
}

/// Everything a grid backend call needs, captured once by the factory.
#[derive(Debug, Clone)]
pub struct GridParams {
    pub session: Arc<dyn DrmSession>,
    pub templates: Arc<Mutex<TemplateArena>>,
    pub template: TemplateId,
    pub timeout: WaitTimeout,
}

#[derive(Debug, Clone)]
pub struct ScriptParams {
    pub grid: GridParams,
    pub script_dir: PathBuf,
    pub keep_scripts: bool,
}

struct Submitted<T> {
    ids: T,
    output_path: PathBuf,
    error_path: PathBuf,
}

fn submit<T>(
    params: &GridParams,
    command: &str,
    argv: Option<&[String]>,
    run: impl FnOnce(&dyn DrmSession, &JobTemplate) -> Result<T>,
) -> Result<Submitted<T>> {
    let mut arena = params
        .templates
        .lock()
        .map_err(|_| PiperError::Session("submission lock poisoned".to_string()))?;
    let template = arena
        .get_mut(params.template)
        .ok_or_else(|| PiperError::Session("job template was already deleted".to_string()))?;
    template.remote_command = command.to_string();
    if let Some(argv) = argv {
        template.args = argv.to_vec();
    }
    let ids = run(params.session.as_ref(), template)?;
    Ok(Submitted {
        ids,
        output_path: template.output_path.clone(),
        error_path: template.error_path.clone(),
    })
}

/// Submits one job and collects what it left behind.
pub fn run_single(command: &str, argv: Option<&[String]>, params: &GridParams) -> JobResult {
    let submitted = match submit(params, command, argv, |session, template| {
        session.run_job(template)
    }) {
        Ok(s) => s,
        Err(e) => {
            return JobResult::failed(format!(
                "Error for single job call: {}\nMessage: {}",
                command, e
            ))
        }
    };
    let job_id = submitted.ids;
    debug!(job_id = %job_id, "grid job submitted");

    let mut out = vec![format!("Job {} submitted", job_id)];
    let mut err = Vec::new();
    follow_job(
        params,
        &job_id,
        &submitted.output_path,
        &submitted.error_path,
        &mut out,
        &mut err,
    );
    JobResult::new(out.join("\n"), err.join("\n"))
}

/// Submits a bulk job over `range`, synchronises once, then reaps every task.
pub fn run_array(
    command: &str,
    argv: Option<&[String]>,
    params: &GridParams,
    range: TaskRange,
) -> JobResult {
    let submitted = match submit(params, command, argv, |session, template| {
        session.run_bulk_jobs(template, range)
    }) {
        Ok(s) => s,
        Err(e) => {
            return JobResult::failed(format!(
                "Error for array job call: {}\nMessage: {}",
                command, e
            ))
        }
    };
    let job_ids: Vec<JobId> = submitted.ids;
    let Some(first) = job_ids.first() else {
        return JobResult::failed(format!(
            "Error for array job call: {}\nMessage: scheduler returned no task ids",
            command
        ));
    };
    debug!(first_task = %first, tasks = job_ids.len(), "grid array job submitted");

    let mut out = vec![format!("Array job {} submitted - first task", first)];
    let mut err = Vec::new();
    // Jobs are not disposed here: each one is reaped by its own wait below.
    if let Err(e) = params.session.synchronize(&job_ids, params.timeout, false) {
        warn!(first_task = %first, error = %e, "array job synchronization failed");
        err.push(format!(
            "Warning: synchronizing array job {} failed: {}",
            first, e
        ));
    }
    for job_id in &job_ids {
        let mut job_err = Vec::new();
        follow_job(
            params,
            job_id,
            &submitted.output_path,
            &submitted.error_path,
            &mut out,
            &mut job_err,
        );
        err.extend(
            job_err
                .into_iter()
                .map(|line| format!("Warning: task {}: {}", job_id, line)),
        );
    }
    JobResult::new(out.join("\n"), err.join("\n"))
}

/// Writes `command` into a shell script and submits that as a single job.
pub fn run_script(command: &str, params: &ScriptParams) -> JobResult {
    let script = match write_job_script(&params.script_dir, command) {
        Ok(path) => path,
        Err(e) => {
            return JobResult::failed(format!(
                "Error for script job call: {}\nMessage: {}",
                command, e
            ))
        }
    };
    let result = run_single(&script.display().to_string(), None, &params.grid);
    if !params.keep_scripts {
        if let Err(e) = fs::remove_file(&script) {
            warn!(script = %script.display(), error = %e, "failed to remove job script");
        }
    }
    result
}

fn write_job_script(dir: &Path, command: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let name = format!(
        "piper_job_{}_{}_{}.sh",
        std::process::id(),
        Utc::now().timestamp_micros(),
        SCRIPT_COUNTER.fetch_add(1, Ordering::SeqCst)
    );
    let path = dir.join(name);
    fs::write(&path, format!("#!{}\n{}\n", crate::local::SHELL, command))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
    }
    Ok(path)
}

fn follow_job(
    params: &GridParams,
    job_id: &str,
    output_path: &Path,
    error_path: &Path,
    out: &mut Vec<String>,
    err: &mut Vec<String>,
) {
    let session = params.session.as_ref();
    match session.job_status(job_id) {
        Ok(state) => out.push(format!("Job {} status: {}", job_id, state)),
        Err(e) => {
            warn!(job_id, error = %e, "checking job status failed");
            err.push(format!("Checking job status failed: {}", e));
        }
    }

    match session.wait(job_id, params.timeout) {
        Ok(info) => {
            if info.exit_status != 0 {
                err.push(format!("Exit {} - Error", info.exit_status));
            }
            out.push(format!(
                "Job {} finished with status: {} - [Was aborted? {}]",
                job_id, info.has_exited, info.was_aborted
            ));
            if let Some(start) = info.resource_usage.get("start_time") {
                let usage = |key: &str| {
                    info.resource_usage
                        .get(key)
                        .map(String::as_str)
                        .unwrap_or("n/a")
                };
                out.push(format!("Start: {}", start));
                out.push(format!("End: {}", usage("end_time")));
                out.push(format!("MAXRSS: {}", usage("ru_maxrss")));
            }
        }
        Err(e) => {
            warn!(job_id, error = %e, "waiting for job failed");
            err.push(format!("Error during job handling: {}", e));
            err.push(format!("Job ID: {}", job_id));
        }
    }

    match collect_files(output_path, &format!("*o{}", job_id)) {
        Ok(Some(content)) => out.push(content),
        Ok(None) => {}
        Err(line) => err.push(line),
    }
    match collect_files(error_path, &format!("*e{}", job_id)) {
        Ok(Some(content)) => err.push(content),
        Ok(None) => {}
        Err(line) => err.push(line),
    }
}

/// Output collection only scans directories; a null sink yields nothing.
fn collect_files(dir: &Path, pattern: &str) -> std::result::Result<Option<String>, String> {
    if !dir.is_dir() {
        return Ok(None);
    }
    match read_output_files(dir, pattern, OUTPUT_READ_ATTEMPTS) {
        Ok(content) if content.is_empty() => Ok(None),
        Ok(content) => Ok(Some(content)),
        Err(e) => Err(format!(
            "Reading {} in {} failed: {}",
            pattern,
            dir.display(),
            e
        )),
    }
}

/// Concatenates the trimmed contents of every file in `dir` matching `pattern`.
///
/// Each file gets up to `attempts` immediate read attempts; a file that stays
/// unreadable is skipped.
pub fn read_output_files(dir: &Path, pattern: &str, attempts: usize) -> Result<String> {
    let matcher = glob::Pattern::new(pattern)
        .map_err(|e| PiperError::Configuration(format!("bad file pattern {}: {}", pattern, e)))?;
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| matcher.matches(name))
        .collect();
    names.sort();

    let mut parts = Vec::new();
    for name in names {
        let path = dir.join(&name);
        let content = (0..attempts).find_map(|_| fs::read_to_string(&path).ok());
        match content {
            Some(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
            None => warn!(path = %path.display(), attempts, "giving up on job output file"),
        }
    }
    Ok(parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drm::JobState;
    use crate::testing::{FakeSession, SessionCall};

    fn params_with(session: Arc<FakeSession>, template: JobTemplate) -> GridParams {
        let mut arena = TemplateArena::default();
        let id = arena.insert(template);
        GridParams {
            session,
            templates: Arc::new(Mutex::new(arena)),
            template: id,
            timeout: WaitTimeout::Forever,
        }
    }

    #[test]
    fn single_job_reports_status_usage_and_output_files() {
        let logs = tempfile::tempdir().expect("tempdir");
        let session = Arc::new(FakeSession::new());
        session.set_usage("start_time", "10:00");
        session.set_usage("end_time", "10:05");
        session.set_usage("ru_maxrss", "2048");
        fs::write(logs.path().join("PiperJob.o1"), "aligned 10 reads\n").expect("write");
        fs::write(logs.path().join("PiperJob.e1"), "").expect("write");
        let template = JobTemplate {
            output_path: logs.path().to_path_buf(),
            error_path: logs.path().to_path_buf(),
            ..JobTemplate::default()
        };
        let params = params_with(session.clone(), template);

        let argv = vec!["a.bam".to_string(), "3".to_string()];
        let result = run_single("align.sh", Some(&argv), &params);

        assert!(result.is_success(), "stderr: {}", result.stderr);
        assert!(result.stdout.starts_with("Job 1 submitted"));
        assert!(result.stdout.contains("Job 1 status: running"));
        assert!(result.stdout.contains("finished with status: true - [Was aborted? false]"));
        assert!(result.stdout.contains("MAXRSS: 2048"));
        assert!(result.stdout.ends_with("aligned 10 reads"));
        let submitted = session.submitted();
        assert_eq!(submitted[0].remote_command, "align.sh");
        assert_eq!(submitted[0].args, argv);
    }

    #[test]
    fn status_and_exit_failures_become_error_lines() {
        let session = Arc::new(FakeSession::new());
        session.fail_status();
        session.set_exit_status(2);
        let params = params_with(session, JobTemplate::default());
        let result = run_single("false", None, &params);
        assert!(result.stdout.contains("finished with status"));
        assert!(result.stderr.contains("Checking job status failed"));
        assert!(result.stderr.contains("Exit 2 - Error"));
    }

    #[test]
    fn submission_failure_is_returned_not_raised() {
        let session = Arc::new(FakeSession::new());
        session.fail_submit();
        let params = params_with(session, JobTemplate::default());
        let result = run_single("echo hi", None, &params);
        assert!(result.stdout.is_empty());
        assert!(result
            .stderr
            .starts_with("Error for single job call: echo hi\nMessage:"));
    }

    #[test]
    fn array_job_synchronizes_once_then_waits_for_every_task() {
        let session = Arc::new(FakeSession::new());
        session.fail_wait_for("1.3");
        let params = params_with(session.clone(), JobTemplate::default());
        let range = TaskRange::new(1, 6, 2).expect("range");
        let result = run_array("split.sh", None, &params, range);

        assert!(result.stdout.starts_with("Array job 1.1 submitted - first task"));
        assert!(result.stdout.contains("Job 1.5 finished"));
        assert!(result.stderr.contains("Warning: task 1.3:"), "{}", result.stderr);
        let calls = session.calls();
        let syncs = calls
            .iter()
            .filter(|c| matches!(c, SessionCall::Synchronize { dispose: false, .. }))
            .count();
        assert_eq!(syncs, 1);
        let waits: Vec<_> = calls
            .iter()
            .filter_map(|c| match c {
                SessionCall::Wait(id) => Some(id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(waits, vec!["1.1", "1.3", "1.5"]);
    }

    #[test]
    fn script_job_submits_a_script_and_cleans_it_up() {
        let scripts = tempfile::tempdir().expect("tempdir");
        let session = Arc::new(FakeSession::new());
        let params = ScriptParams {
            grid: params_with(session.clone(), JobTemplate::default()),
            script_dir: scripts.path().to_path_buf(),
            keep_scripts: false,
        };
        let result = run_script("cat a b | sort > c", &params);
        assert!(result.is_success(), "{}", result.stderr);
        let submitted = session.submitted();
        let script = PathBuf::from(&submitted[0].remote_command);
        assert!(script.starts_with(scripts.path()));
        assert!(!script.exists(), "script should be removed");
    }

    #[test]
    fn kept_scripts_contain_the_command() {
        let scripts = tempfile::tempdir().expect("tempdir");
        let session = Arc::new(FakeSession::new());
        let params = ScriptParams {
            grid: params_with(session.clone(), JobTemplate::default()),
            script_dir: scripts.path().to_path_buf(),
            keep_scripts: true,
        };
        run_script("echo kept", &params);
        let script = PathBuf::from(&session.submitted()[0].remote_command);
        let body = fs::read_to_string(&script).expect("script kept");
        assert!(body.ends_with("echo kept\n"));
    }

    #[test]
    fn output_files_are_matched_by_job_id_suffix() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("job.o42"), " first \n").expect("write");
        fs::write(dir.path().join("other.o42"), "second").expect("write");
        fs::write(dir.path().join("job.o421"), "not mine").expect("write");
        fs::write(dir.path().join("job.e42"), "stderr").expect("write");
        let content = read_output_files(dir.path(), "*o42", 3).expect("read");
        assert_eq!(content, "first\nsecond");
    }

    #[test]
    fn fake_session_reports_running_before_wait() {
        let session = FakeSession::new();
        assert_eq!(session.job_status("1").expect("status"), JobState::Running);
    }
}
