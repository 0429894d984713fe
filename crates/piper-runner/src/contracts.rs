//! Input/output contracts around any job callable.
//!
//! Every contract except [`run_raw`] follows the same protocol: check that
//! the declared inputs exist, fill the command template, run the job,
//! scan its stderr for failure keywords, then check that the declared
//! outputs exist. Missing files are errors; a keyword hit is returned as
//! [`StepOutcome::Signalled`] because some tools exit 0 on failure.

use crate::error::{PiperError, Result};
use crate::result::{JobCallable, JobResult};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;
use walkdir::WalkDir;

pub const FAILURE_KEYWORDS: &[&str] = &["error", "fail", "failed", "failure", "segfault", "abort"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Substitution {
    /// `{inputfile}`, `{outputfile}`, ...
    #[default]
    Named,
    /// `{}` or `{0}`, `{1}`, ... in declaration order.
    Positional,
}

/// Result of a contract whose job ran to completion.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome<T> {
    Done(T),
    /// The job's stderr contained a failure keyword; carries that stderr.
    Signalled(String),
}

impl<T> StepOutcome<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            StepOutcome::Done(value) => Ok(value),
            StepOutcome::Signalled(stderr) => Err(PiperError::Signalled(stderr)),
        }
    }

    pub fn is_signalled(&self) -> bool {
        matches!(self, StepOutcome::Signalled(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> StepOutcome<U> {
        match self {
            StepOutcome::Done(value) => StepOutcome::Done(f(value)),
            StepOutcome::Signalled(stderr) => StepOutcome::Signalled(stderr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCheck {
    Passed { stdout: String, stderr: String },
    Signalled(String),
}

pub fn has_failure_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    FAILURE_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Normalises the job text and scans stderr for failure keywords.
pub fn check_job(result: JobResult) -> JobCheck {
    let stdout = result.stdout.trim().to_string();
    let stderr = result.stderr.trim().to_string();
    if !stderr.is_empty() && has_failure_keyword(&stderr) {
        return JobCheck::Signalled(stderr);
    }
    JobCheck::Passed { stdout, stderr }
}

/// Input paths as handed over by a pipeline, possibly nested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inputs {
    File(PathBuf),
    Nested(Vec<Inputs>),
}

impl Default for Inputs {
    fn default() -> Self {
        Inputs::Nested(Vec::new())
    }
}

impl Inputs {
    pub fn flatten(&self) -> Vec<PathBuf> {
        let mut out = Vec::new();
        self.flatten_into(&mut out);
        out
    }

    fn flatten_into(&self, out: &mut Vec<PathBuf>) {
        match self {
            Inputs::File(path) => out.push(path.clone()),
            Inputs::Nested(items) => items.iter().for_each(|i| i.flatten_into(out)),
        }
    }

    /// Exactly two paths, tolerating one extra level of nesting.
    pub fn pair(&self) -> Option<(PathBuf, PathBuf)> {
        let items: &[Inputs] = match self {
            Inputs::Nested(items) if items.len() == 1 => match &items[0] {
                Inputs::Nested(inner) => inner,
                _ => items,
            },
            Inputs::Nested(items) => items,
            Inputs::File(_) => std::slice::from_ref(self),
        };
        match items {
            [Inputs::File(a), Inputs::File(b)] => Some((a.clone(), b.clone())),
            _ => None,
        }
    }
}

impl From<PathBuf> for Inputs {
    fn from(value: PathBuf) -> Self {
        Inputs::File(value)
    }
}

impl From<&Path> for Inputs {
    fn from(value: &Path) -> Self {
        Inputs::File(value.to_path_buf())
    }
}

impl From<&str> for Inputs {
    fn from(value: &str) -> Self {
        Inputs::File(PathBuf::from(value))
    }
}

impl From<String> for Inputs {
    fn from(value: String) -> Self {
        Inputs::File(PathBuf::from(value))
    }
}

impl<T: Into<Inputs>> From<Vec<T>> for Inputs {
    fn from(value: Vec<T>) -> Self {
        Inputs::Nested(value.into_iter().map(Into::into).collect())
    }
}

/// Outputs discovered after the fact: files in `dir` whose names match `filter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternOutput {
    pub dir: PathBuf,
    pub filter: String,
    pub recursive: bool,
}

impl PatternOutput {
    pub fn new(dir: impl Into<PathBuf>, filter: impl Into<String>) -> Self {
        PatternOutput {
            dir: dir.into(),
            filter: filter.into(),
            recursive: false,
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    fn matcher(&self) -> Result<glob::Pattern> {
        file_matcher(&self.filter)
    }

    /// Current matches; a missing directory has none.
    fn scan(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        if !self.dir.is_dir() {
            return Err(PiperError::NotADirectory(self.dir.clone()));
        }
        if self.recursive {
            return walk_matches(&self.dir, &self.matcher()?);
        }
        let matcher = self.matcher()?;
        let mut found: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| matcher.matches(name))
                    .unwrap_or(false)
            })
            .map(|entry| entry.path())
            .collect();
        found.sort();
        Ok(found)
    }
}

fn file_matcher(filter: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(filter)
        .map_err(|e| PiperError::Configuration(format!("bad filter pattern {}: {}", filter, e)))
}

/// A missing `basedir` has no matches; unreadable entries below it are skipped.
fn walk_matches(basedir: &Path, matcher: &glob::Pattern) -> Result<Vec<PathBuf>> {
    let mut collected = Vec::new();
    if !basedir.exists() {
        return Ok(collected);
    }
    for entry in WalkDir::new(basedir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(basedir = %basedir.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_str()
            .map(|name| matcher.matches(name))
            .unwrap_or(false)
        {
            collected.push(entry.into_path());
        }
    }
    collected.sort();
    Ok(collected)
}

/// Every file below `basedir` whose name matches `filter`. Finding none is an error.
pub fn recursive_collect(basedir: &Path, filter: &str) -> Result<Vec<PathBuf>> {
    let collected = walk_matches(basedir, &file_matcher(filter)?)?;
    if collected.is_empty() {
        return Err(PiperError::NothingCollected(basedir.to_path_buf()));
    }
    Ok(collected)
}

/// Fills `{name}` / `{}` / `{N}` placeholders; `{{` and `}}` are literal braces.
pub fn format_command(
    template: &str,
    slots: &[(&str, String)],
    mode: Substitution,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    let mut next_positional = 0usize;
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if !closed {
                    return Err(PiperError::Template(format!(
                        "unclosed placeholder in {:?}",
                        template
                    )));
                }
                let value = match mode {
                    Substitution::Named => slots
                        .iter()
                        .find(|(name, _)| *name == key)
                        .map(|(_, value)| value),
                    Substitution::Positional if key.is_empty() => {
                        next_positional += 1;
                        slots.get(next_positional - 1).map(|(_, value)| value)
                    }
                    Substitution::Positional => key
                        .parse::<usize>()
                        .ok()
                        .and_then(|idx| slots.get(idx))
                        .map(|(_, value)| value),
                };
                let value = value.ok_or_else(|| {
                    PiperError::Template(format!(
                        "placeholder {{{}}} has no value in {:?}",
                        key, template
                    ))
                })?;
                out.push_str(value);
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '}' => {
                return Err(PiperError::Template(format!(
                    "single '}}' in {:?}",
                    template
                )))
            }
            other => out.push(other),
        }
    }
    Ok(out)
}

fn path_text(path: &Path) -> String {
    path.display().to_string()
}

fn require_input(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PiperError::MissingInput(path.to_path_buf()))
    }
}

fn require_inputs(paths: &[PathBuf]) -> Result<()> {
    paths.iter().try_for_each(|p| require_input(p))
}

fn require_output(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(PiperError::MissingOutput(path.to_path_buf()))
    }
}

fn require_named_output(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(PiperError::Arity("received no output file".to_string()));
    }
    Ok(())
}

fn execute<J: JobCallable + ?Sized>(
    command: &str,
    slots: &[(&str, String)],
    mode: Substitution,
    job: &J,
) -> Result<JobCheck> {
    let formatted = format_command(command, slots, mode)?;
    debug!(command = %formatted, "running contract job");
    Ok(check_job(job.call(&formatted)))
}

/// Runs the job, then verifies every expected output on success.
fn finish<T>(
    check: JobCheck,
    outputs: &[&Path],
    value: impl FnOnce() -> T,
) -> Result<StepOutcome<T>> {
    if let JobCheck::Signalled(stderr) = check {
        return Ok(StepOutcome::Signalled(stderr));
    }
    for output in outputs {
        require_output(output)?;
    }
    Ok(StepOutcome::Done(value()))
}

/// Runs `command` verbatim, with no path checks.
pub fn run_raw<J: JobCallable + ?Sized>(command: &str, job: &J) -> Result<StepOutcome<()>> {
    debug!(command, "running raw job");
    finish(check_job(job.call(command)), &[], || ())
}

pub fn in_out<J: JobCallable + ?Sized>(
    input: &Path,
    output: &Path,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<PathBuf>> {
    require_input(input)?;
    require_named_output(output)?;
    let slots = [
        ("inputfile", path_text(input)),
        ("outputfile", path_text(output)),
    ];
    let check = execute(command, &slots, mode, job)?;
    finish(check, &[output], || output.to_path_buf())
}

pub fn in_out_ref<J: JobCallable + ?Sized>(
    input: &Path,
    output: &Path,
    reference: &Path,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<PathBuf>> {
    require_input(input)?;
    require_named_output(output)?;
    require_input(reference)?;
    let slots = [
        ("inputfile", path_text(input)),
        ("outputfile", path_text(output)),
        ("referencefile", path_text(reference)),
    ];
    let check = execute(command, &slots, mode, job)?;
    finish(check, &[output], || output.to_path_buf())
}

/// Merge/join: all inputs are passed as one space-separated `{inputfiles}`.
pub fn ins_out<J: JobCallable + ?Sized>(
    inputs: &Inputs,
    output: &Path,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<PathBuf>> {
    let flattened = inputs.flatten();
    require_inputs(&flattened)?;
    require_named_output(output)?;
    let slots = [
        ("inputfiles", join_paths(&flattened)),
        ("outputfile", path_text(output)),
    ];
    let check = execute(command, &slots, mode, job)?;
    finish(check, &[output], || output.to_path_buf())
}

pub fn ins_out_ref<J: JobCallable + ?Sized>(
    inputs: &Inputs,
    output: &Path,
    reference: &Path,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<PathBuf>> {
    let flattened = inputs.flatten();
    require_inputs(&flattened)?;
    require_input(reference)?;
    require_named_output(output)?;
    let slots = [
        ("inputfiles", join_paths(&flattened)),
        ("outputfile", path_text(output)),
        ("referencefile", path_text(reference)),
    ];
    let check = execute(command, &slots, mode, job)?;
    finish(check, &[output], || output.to_path_buf())
}

/// Two inputs, one of which is the reference: the one ending in `ref_ext`.
/// The second is checked first, so when both match it is the reference;
/// when neither matches, the first is.
pub fn inref_out<J: JobCallable + ?Sized>(
    pair: &Inputs,
    output: &Path,
    ref_ext: &str,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<PathBuf>> {
    let (first, second) = pair.pair().ok_or_else(|| {
        PiperError::Arity(format!(
            "too many (or not enough) input files: {:?}",
            pair.flatten()
        ))
    })?;
    let (input, reference) = if path_text(&second).ends_with(ref_ext) {
        (first, second)
    } else {
        (second, first)
    };
    require_input(&input)?;
    require_input(&reference)?;
    require_named_output(output)?;
    let slots = [
        ("inputfile", path_text(&input)),
        ("outputfile", path_text(output)),
        ("referencefile", path_text(&reference)),
    ];
    let check = execute(command, &slots, mode, job)?;
    finish(check, &[output], || output.to_path_buf())
}

/// One input split into an open set of outputs matched by `pattern`.
pub fn in_pat<J: JobCallable + ?Sized>(
    input: &Path,
    pattern: &PatternOutput,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<Vec<PathBuf>>> {
    require_input(input)?;
    run_pattern(&[("inputfile", path_text(input))], pattern, command, job, mode)
}

pub fn ins_pat<J: JobCallable + ?Sized>(
    inputs: &Inputs,
    pattern: &PatternOutput,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<Vec<PathBuf>>> {
    let flattened = inputs.flatten();
    require_inputs(&flattened)?;
    run_pattern(
        &[("inputfiles", join_paths(&flattened))],
        pattern,
        command,
        job,
        mode,
    )
}

fn run_pattern<J: JobCallable + ?Sized>(
    slots: &[(&str, String)],
    pattern: &PatternOutput,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<Vec<PathBuf>>> {
    let existing = pattern.scan()?;
    if !existing.is_empty() {
        debug!(
            dir = %pattern.dir.display(),
            filter = %pattern.filter,
            found = existing.len(),
            "outputs already present, skipping job"
        );
        return Ok(StepOutcome::Done(existing));
    }
    if let JobCheck::Signalled(stderr) = execute(command, slots, mode, job)? {
        return Ok(StepOutcome::Signalled(stderr));
    }
    let produced = if pattern.recursive {
        recursive_collect(&pattern.dir, &pattern.filter)?
    } else {
        pattern.scan()?
    };
    if produced.is_empty() {
        return Err(PiperError::NoPatternOutput {
            command: command.to_string(),
            pattern: pattern.filter.clone(),
        });
    }
    Ok(StepOutcome::Done(produced))
}

pub fn inpair_out<J: JobCallable + ?Sized>(
    pair: &Inputs,
    output: &Path,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<PathBuf>> {
    let (first, second) = pair.pair().ok_or_else(|| {
        PiperError::Arity(format!("missing paired input: {:?}", pair.flatten()))
    })?;
    require_input(&first)?;
    require_input(&second)?;
    require_named_output(output)?;
    let slots = [
        ("inputfile1", path_text(&first)),
        ("inputfile2", path_text(&second)),
        ("outputfile", path_text(output)),
    ];
    let check = execute(command, &slots, mode, job)?;
    finish(check, &[output], || output.to_path_buf())
}

pub fn in_outpair<J: JobCallable + ?Sized>(
    input: &Path,
    outputs: &Inputs,
    command: &str,
    job: &J,
    mode: Substitution,
) -> Result<StepOutcome<(PathBuf, PathBuf)>> {
    let (first, second) = outputs.pair().ok_or_else(|| {
        PiperError::Arity(format!("missing paired output: {:?}", outputs.flatten()))
    })?;
    require_input(input)?;
    let slots = [
        ("inputfile", path_text(input)),
        ("outputfile1", path_text(&first)),
        ("outputfile2", path_text(&second)),
    ];
    let check = execute(command, &slots, mode, job)?;
    finish(check, &[first.as_path(), second.as_path()], || {
        (first.clone(), second.clone())
    })
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| path_text(p))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The catalog of contracts, addressable by their textual key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractKind {
    Raw,
    InOut,
    InOutRef,
    InsOut,
    InsOutRef,
    InrefOut,
    InPat,
    InsPat,
    InpairOut,
    InOutpair,
}

impl ContractKind {
    pub const ALL: [ContractKind; 10] = [
        ContractKind::Raw,
        ContractKind::InOut,
        ContractKind::InOutRef,
        ContractKind::InsOut,
        ContractKind::InsOutRef,
        ContractKind::InrefOut,
        ContractKind::InPat,
        ContractKind::InsPat,
        ContractKind::InpairOut,
        ContractKind::InOutpair,
    ];

    pub fn key(self) -> &'static str {
        match self {
            ContractKind::Raw => "raw",
            ContractKind::InOut => "in_out",
            ContractKind::InOutRef => "in_out_ref",
            ContractKind::InsOut => "ins_out",
            ContractKind::InsOutRef => "ins_out_ref",
            ContractKind::InrefOut => "inref_out",
            ContractKind::InPat => "in_pat",
            ContractKind::InsPat => "ins_pat",
            ContractKind::InpairOut => "inpair_out",
            ContractKind::InOutpair => "in_outpair",
        }
    }

    /// Declared (inputs, outputs) arity, for listings.
    pub fn arity(self) -> (&'static str, &'static str) {
        match self {
            ContractKind::Raw => ("none", "none"),
            ContractKind::InOut => ("1", "1"),
            ContractKind::InOutRef => ("1 + reference", "1"),
            ContractKind::InsOut => ("N", "1"),
            ContractKind::InsOutRef => ("N + reference", "1"),
            ContractKind::InrefOut => ("2 (one reference)", "1"),
            ContractKind::InPat => ("1", "pattern"),
            ContractKind::InsPat => ("N", "pattern"),
            ContractKind::InpairOut => ("2", "1"),
            ContractKind::InOutpair => ("1", "2"),
        }
    }
}

impl fmt::Display for ContractKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ContractKind {
    type Err = PiperError;

    fn from_str(s: &str) -> Result<Self> {
        ContractKind::ALL
            .iter()
            .copied()
            .find(|k| k.key() == s)
            .ok_or_else(|| PiperError::Configuration(format!("unknown contract: {}", s)))
    }
}

/// Arguments for [`run_contract`]; each contract reads only the fields it needs.
#[derive(Debug, Clone, Default)]
pub struct ContractArgs {
    pub command: String,
    pub inputs: Inputs,
    pub outputs: Inputs,
    pub reference: Option<PathBuf>,
    pub ref_ext: Option<String>,
    pub pattern: Option<PatternOutput>,
    pub mode: Substitution,
}

impl ContractArgs {
    fn single(what: &str, set: &Inputs) -> Result<PathBuf> {
        let mut paths = set.flatten();
        if paths.len() != 1 {
            return Err(PiperError::Arity(format!(
                "expected exactly one {} path, got {}",
                what,
                paths.len()
            )));
        }
        Ok(paths.remove(0))
    }

    fn input(&self) -> Result<PathBuf> {
        Self::single("input", &self.inputs)
    }

    fn output(&self) -> Result<PathBuf> {
        Self::single("output", &self.outputs)
    }

    fn reference(&self, kind: ContractKind) -> Result<&Path> {
        self.reference
            .as_deref()
            .ok_or_else(|| PiperError::Arity(format!("{} needs a reference file", kind)))
    }

    fn pattern(&self, kind: ContractKind) -> Result<&PatternOutput> {
        self.pattern
            .as_ref()
            .ok_or_else(|| PiperError::Arity(format!("{} needs an output pattern", kind)))
    }
}

/// Dispatches a contract by kind and returns every path it produced.
pub fn run_contract<J: JobCallable + ?Sized>(
    kind: ContractKind,
    args: &ContractArgs,
    job: &J,
) -> Result<StepOutcome<Vec<PathBuf>>> {
    let cmd = args.command.as_str();
    let mode = args.mode;
    let outcome = match kind {
        ContractKind::Raw => run_raw(cmd, job)?.map(|()| Vec::new()),
        ContractKind::InOut => {
            in_out(&args.input()?, &args.output()?, cmd, job, mode)?.map(|p| vec![p])
        }
        ContractKind::InOutRef => in_out_ref(
            &args.input()?,
            &args.output()?,
            args.reference(kind)?,
            cmd,
            job,
            mode,
        )?
        .map(|p| vec![p]),
        ContractKind::InsOut => {
            ins_out(&args.inputs, &args.output()?, cmd, job, mode)?.map(|p| vec![p])
        }
        ContractKind::InsOutRef => ins_out_ref(
            &args.inputs,
            &args.output()?,
            args.reference(kind)?,
            cmd,
            job,
            mode,
        )?
        .map(|p| vec![p]),
        ContractKind::InrefOut => {
            let ref_ext = args.ref_ext.as_deref().ok_or_else(|| {
                PiperError::Arity(format!("{} needs a reference extension", kind))
            })?;
            inref_out(&args.inputs, &args.output()?, ref_ext, cmd, job, mode)?.map(|p| vec![p])
        }
        ContractKind::InPat => in_pat(&args.input()?, args.pattern(kind)?, cmd, job, mode)?,
        ContractKind::InsPat => ins_pat(&args.inputs, args.pattern(kind)?, cmd, job, mode)?,
        ContractKind::InpairOut => {
            inpair_out(&args.inputs, &args.output()?, cmd, job, mode)?.map(|p| vec![p])
        }
        ContractKind::InOutpair => in_outpair(&args.input()?, &args.outputs, cmd, job, mode)?
            .map(|(a, b)| vec![a, b]),
    };
    Ok(outcome)
}
