use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use piper_runner::{
    load_options, run_contract, BackendSelection, BoundJob, CallOptions, ConfigMap, ContractArgs,
    ContractKind, Inputs, JobManager, JobResult, PatternOutput, PiperError, StepOutcome,
    Substitution,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "piper",
    version = "0.2.0",
    about = "Run pipeline job commands locally or on Grid Engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one command line on the selected backend.
    Run {
        #[arg(long, conflicts_with = "script")]
        grid: bool,
        /// Submit the command line as a generated shell script.
        #[arg(long, conflicts_with = "array")]
        script: bool,
        #[arg(long, value_name = "START:END:STEP", value_parser = parse_task_range)]
        array: Option<(u32, u32, u32)>,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_name = "ENV")]
        activate: Option<String>,
        #[arg(long)]
        json: bool,
        #[arg(last = true, required = true, value_name = "COMMAND")]
        command_line: Vec<String>,
    },
    /// Run one I/O contract around a command template.
    Step {
        kind: String,
        #[arg(long = "cmd", value_name = "TEMPLATE")]
        template: String,
        #[arg(long = "input")]
        inputs: Vec<PathBuf>,
        #[arg(long = "output")]
        outputs: Vec<PathBuf>,
        #[arg(long)]
        reference: Option<PathBuf>,
        #[arg(long)]
        ref_ext: Option<String>,
        #[arg(long, requires = "filter")]
        out_dir: Option<PathBuf>,
        #[arg(long, requires = "out_dir")]
        filter: Option<String>,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        positional: bool,
        #[arg(long)]
        grid: bool,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List the available I/O contracts.
    Contracts {
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("PIPER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            grid,
            script,
            array,
            config,
            activate,
            json,
            command_line,
        } => {
            let selection = if script {
                BackendSelection::Integrated
            } else if grid || array.is_some() {
                BackendSelection::Standalone
            } else {
                BackendSelection::LocalOnly
            };
            let manager = open_manager(selection, config.as_deref())?;
            let job = if script {
                manager.grid_script_job()?
            } else if let Some((start, end, step)) = array {
                manager.grid_array_job(start, end, step)?
            } else if grid {
                manager.grid_single_job()?
            } else {
                manager.local_job()?
            };
            let options = activate.map(CallOptions::activate).unwrap_or_default();
            let line = command_line.join(" ");
            debug!(backend = job.kind(), command = %line, "running command");
            let frozen = serde_json::to_value(manager.config())?;
            let result = job.run_with(&line, &options);
            manager.close();

            if json {
                let payload = json!({
                    "ok": result.is_success(),
                    "command": "run",
                    "backend": job.kind(),
                    "config": frozen,
                    "stdout": result.stdout,
                    "stderr": result.stderr
                });
                if !result.is_success() {
                    emit_json(&payload);
                    std::process::exit(1);
                }
                return Ok(Some(payload));
            }
            print_result(&result);
            if !result.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Step {
            kind,
            template,
            inputs,
            outputs,
            reference,
            ref_ext,
            out_dir,
            filter,
            recursive,
            positional,
            grid,
            config,
            json,
        } => {
            let kind: ContractKind = kind.parse()?;
            let selection = if grid {
                BackendSelection::Standalone
            } else {
                BackendSelection::LocalOnly
            };
            let manager = open_manager(selection, config.as_deref())?;
            let job: BoundJob = if grid {
                manager.grid_single_job()?
            } else {
                manager.local_job()?
            };
            let args = ContractArgs {
                command: template,
                inputs: Inputs::from(inputs),
                outputs: Inputs::from(outputs),
                reference,
                ref_ext,
                pattern: out_dir
                    .zip(filter)
                    .map(|(dir, filter)| PatternOutput::new(dir, filter).recursive(recursive)),
                mode: if positional {
                    Substitution::Positional
                } else {
                    Substitution::Named
                },
            };
            let outcome = run_contract(kind, &args, &job);
            manager.close();
            let produced = match outcome? {
                StepOutcome::Done(paths) => paths,
                StepOutcome::Signalled(stderr) => {
                    return Err(anyhow!(PiperError::Signalled(stderr)));
                }
            };
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "step",
                    "contract": kind.key(),
                    "backend": job.kind(),
                    "outputs": produced
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                })));
            }
            for path in produced {
                println!("{}", path.display());
            }
        }
        Commands::Contracts { json } => {
            if json {
                let contracts: Vec<Value> = ContractKind::ALL
                    .iter()
                    .map(|kind| {
                        let (inputs, outputs) = kind.arity();
                        json!({ "key": kind.key(), "inputs": inputs, "outputs": outputs })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "contracts",
                    "contracts": contracts
                })));
            }
            for kind in ContractKind::ALL {
                let (inputs, outputs) = kind.arity();
                println!("{:<12} inputs: {:<18} outputs: {}", kind.key(), inputs, outputs);
            }
        }
    }
    Ok(None)
}

fn open_manager(selection: BackendSelection, config: Option<&Path>) -> Result<JobManager> {
    let options = match config {
        Some(path) => load_options(path)?,
        None => ConfigMap::new(),
    };
    let mut manager = JobManager::open(selection)?;
    manager.update(Some(&options), None)?;
    Ok(manager)
}

fn parse_task_range(raw: &str) -> std::result::Result<(u32, u32, u32), String> {
    let parts: Vec<&str> = raw.split(':').collect();
    let [start, end, step] = parts.as_slice() else {
        return Err(format!("expected START:END:STEP, got {}", raw));
    };
    let number = |s: &str| {
        s.trim()
            .parse::<u32>()
            .map_err(|e| format!("bad task number {:?}: {}", s, e))
    };
    Ok((number(start)?, number(end)?, number(step)?))
}

fn print_result(result: &JobResult) {
    if !result.stdout.is_empty() {
        println!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprintln!("{}", result.stderr);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<PiperError>() {
        Some(e) if e.is_signalled() => "job_signalled",
        Some(e) if e.is_contract_violation() => "contract_violation",
        Some(PiperError::BackendUnavailable(_)) => "backend_unavailable",
        Some(PiperError::Configuration(_)) => "configuration_error",
        _ => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Step { json, .. } | Commands::Contracts { json } => {
            *json
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn task_ranges_parse_from_colon_triples() {
        assert_eq!(parse_task_range("1:10:2").expect("range"), (1, 10, 2));
        assert!(parse_task_range("1:10").is_err());
        assert!(parse_task_range("1:x:2").is_err());
    }

    #[test]
    fn run_collects_the_trailing_command_line() {
        let cli = Cli::try_parse_from(["piper", "run", "--json", "--", "echo", "hi there"])
            .expect("parse");
        match cli.command {
            Commands::Run {
                json,
                grid,
                command_line,
                ..
            } => {
                assert!(json);
                assert!(!grid);
                assert_eq!(command_line, vec!["echo", "hi there"]);
            }
            _ => panic!("expected run"),
        }
        assert!(Cli::try_parse_from(["piper", "run", "--grid", "--script", "--", "x"]).is_err());
    }

    #[test]
    fn error_codes_follow_the_error_kind() {
        let signalled = anyhow!(PiperError::Signalled("segfault".to_string()));
        assert_eq!(error_code(&signalled), "job_signalled");
        let missing = anyhow!(PiperError::MissingInput(PathBuf::from("/nope")));
        assert_eq!(error_code(&missing), "contract_violation");
        assert_eq!(error_code(&anyhow!("other")), "command_failed");
    }

    #[test]
    fn json_run_reports_output_and_the_frozen_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = dir.path().join("job.yaml");
        std::fs::write(
            &config,
            format!("workdir: {}\nenv:\n  sample: s1\n", dir.path().display()),
        )
        .expect("config");

        let payload = run_command(Commands::Run {
            grid: false,
            script: false,
            array: None,
            config: Some(config),
            activate: None,
            json: true,
            command_line: vec!["echo".to_string(), "$SAMPLE".to_string()],
        })
        .expect("run")
        .expect("payload");
        assert_eq!(payload["ok"], json!(true));
        assert_eq!(payload["backend"], json!("local"));
        assert_eq!(payload["stdout"], json!("s1"));
        assert_eq!(
            payload["config"]["workdir"],
            json!(dir.path().display().to_string())
        );
        assert_eq!(payload["config"]["env"]["SAMPLE"], json!("s1"));
        assert_eq!(payload["config"]["keepscripts"], json!(false));
    }

    #[test]
    fn local_step_runs_a_contract_end_to_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "b\na\n").expect("input");

        let payload = run_command(Commands::Step {
            kind: "in_out".to_string(),
            template: "sort {inputfile} > {outputfile}".to_string(),
            inputs: vec![input],
            outputs: vec![output.clone()],
            reference: None,
            ref_ext: None,
            out_dir: None,
            filter: None,
            recursive: false,
            positional: false,
            grid: false,
            config: None,
            json: true,
        })
        .expect("step")
        .expect("payload");
        assert_eq!(payload["ok"], json!(true));
        assert_eq!(payload["contract"], json!("in_out"));
        assert_eq!(std::fs::read_to_string(&output).expect("output"), "a\nb\n");
    }
}
