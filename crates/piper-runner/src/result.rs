/// Text produced by one backend call.
///
/// Backends never fail; an empty `stderr` means the backend saw no problem.
/// Whether the job actually did its work is decided by the contract layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResult {
    pub stdout: String,
    pub stderr: String,
}

impl JobResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        JobResult {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        JobResult::new(String::new(), stderr)
    }

    pub fn is_success(&self) -> bool {
        self.stderr.is_empty()
    }
}

/// The shapes a tool's stdout or stderr may come back in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    Text(String),
    Bytes(Vec<u8>),
    Lines(Vec<String>),
    ByteLines(Vec<Vec<u8>>),
}

impl JobOutput {
    /// Reduces any shape to one trimmed string; list items are joined by newlines.
    pub fn normalize(self) -> String {
        match self {
            JobOutput::Text(s) => s.trim().to_string(),
            JobOutput::Bytes(b) => String::from_utf8_lossy(&b).trim().to_string(),
            JobOutput::Lines(lines) => lines.join("\n").trim().to_string(),
            JobOutput::ByteLines(lines) => lines
                .iter()
                .map(|l| String::from_utf8_lossy(l).into_owned())
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string(),
        }
    }
}

impl From<String> for JobOutput {
    fn from(value: String) -> Self {
        JobOutput::Text(value)
    }
}

impl From<&str> for JobOutput {
    fn from(value: &str) -> Self {
        JobOutput::Text(value.to_string())
    }
}

impl From<Vec<u8>> for JobOutput {
    fn from(value: Vec<u8>) -> Self {
        JobOutput::Bytes(value)
    }
}

impl From<Vec<String>> for JobOutput {
    fn from(value: Vec<String>) -> Self {
        JobOutput::Lines(value)
    }
}

impl From<Vec<Vec<u8>>> for JobOutput {
    fn from(value: Vec<Vec<u8>>) -> Self {
        JobOutput::ByteLines(value)
    }
}

impl<O, E> From<(O, E)> for JobResult
where
    O: Into<JobOutput>,
    E: Into<JobOutput>,
{
    fn from((stdout, stderr): (O, E)) -> Self {
        JobResult {
            stdout: stdout.into().normalize(),
            stderr: stderr.into().normalize(),
        }
    }
}

/// Anything that runs one command line and reports its text.
pub trait JobCallable {
    fn call(&self, command: &str) -> JobResult;
}

impl<F, R> JobCallable for F
where
    F: Fn(&str) -> R,
    R: Into<JobResult>,
{
    fn call(&self, command: &str) -> JobResult {
        self(command).into()
    }
}
