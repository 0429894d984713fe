/// Per-call options understood by every backend wrapper.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Name of a software environment to enter before the command runs.
    pub activate: Option<String>,
}

impl CallOptions {
    pub fn activate(env: impl Into<String>) -> Self {
        CallOptions {
            activate: Some(env.into()),
        }
    }
}

/// Brackets `command` with an environment activation pair when requested.
///
/// The deactivation runs after `;` so it is attempted even if the command fails.
pub fn with_activation(command: &str, options: &CallOptions) -> String {
    match options.activate.as_deref() {
        Some(env) => format!(
            "source activate {} && {} ; source deactivate",
            env, command
        ),
        None => command.to_string(),
    }
}
