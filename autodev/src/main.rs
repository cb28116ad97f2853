//! Autonomous code-modification pipeline.
//!
//! `autodev run` drives one request end to end and prints the job log as it
//! grows. The other commands inspect configuration and exercise the sandbox
//! and validation runner on a local directory.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use autodev::core::run_state::RunState;
use autodev::core::types::RunStatus;
use autodev::exit_codes;
use autodev::io::config::{AutodevConfig, DEFAULT_CONFIG_FILE, load_config, mask_secret, write_config};
use autodev::io::generator::ChatGenerator;
use autodev::io::git::{GitSourceControl, Identity};
use autodev::io::github::GitHubPublisher;
use autodev::io::sandbox::{Sandbox, SandboxRequest, build_sandbox};
use autodev::io::validation::{SandboxValidator, Validator};
use autodev::logging;
use autodev::pipeline::{Pipeline, PipelineConfig, new_run_id};
use autodev::status::JobStatus;
use clap::{Parser, Subcommand};

/// Feature branch used when `--branch` is not given.
const DEFAULT_BRANCH: &str = "auto-dev-feature";

const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(
    name = "autodev",
    version,
    about = "Plan, apply, validate and publish code changes with bounded retries"
)]
struct Cli {
    /// Config file (TOML). Missing files fall back to defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the full pipeline against a repository and open a pull request.
    Run {
        /// Repository URL (HTTPS or SSH).
        #[arg(long)]
        repo: String,
        /// Natural-language change request.
        #[arg(long)]
        task: String,
        /// Feature branch to commit to.
        #[arg(long, default_value = DEFAULT_BRANCH)]
        branch: String,
        /// Explicit run id (default: timestamp plus random suffix).
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Print the effective config (secrets masked) and probe the sandbox.
    Check,
    /// Run the validation steps against a local directory.
    Validate {
        /// Directory to validate.
        #[arg(default_value = ".")]
        dir: PathBuf,
    },
    /// Run one command in the sandbox.
    Exec {
        #[arg(long, default_value = ".")]
        workdir: PathBuf,
        /// Timeout in seconds (default: sandbox.timeout_secs).
        #[arg(long)]
        timeout: Option<u64>,
        /// Command to run. A single argument is passed to `sh -c` as is;
        /// several are quoted and joined.
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    dotenv::dotenv().ok();
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Check => cmd_check(&load_config(&cli.config)?),
        Command::Validate { dir } => cmd_validate(&load_config(&cli.config)?, &dir),
        Command::Exec {
            workdir,
            timeout,
            command,
        } => cmd_exec(&load_config(&cli.config)?, &workdir, timeout, &command),
        Command::Run {
            repo,
            task,
            branch,
            run_id,
        } => {
            let config = load_config(&cli.config)?;
            let state = RunState::new(run_id.unwrap_or_else(new_run_id), repo, branch, task);
            cmd_run(&config, state)
        }
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    write_config(path, &AutodevConfig::default())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_check(config: &AutodevConfig) -> Result<i32> {
    println!("llm.base_url       = {}", config.llm.base_url);
    println!("llm.model          = {}", config.llm.model);
    println!("llm.api_key        = {}", mask_secret(config.llm.api_key.as_deref()));
    println!("github.token       = {}", mask_secret(config.github.token.as_deref()));
    println!("sandbox.runtime    = {:?}", config.sandbox.runtime);
    println!("sandbox.image      = {}", config.sandbox.image);
    println!("sandbox.timeout    = {}s", config.sandbox.timeout_secs);
    println!("max_attempts       = {}", config.max_attempts);
    println!("workspace_root     = {}", config.workspace_root.display());

    let mut code = exit_codes::OK;
    match build_sandbox(&config.sandbox).check_available() {
        Ok(version) => println!("sandbox            = available ({version})"),
        Err(err) => {
            println!("sandbox            = {err}");
            code = exit_codes::INVALID;
        }
    }
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        println!("missing            = {}", missing.join(", "));
        code = exit_codes::INVALID;
    }
    Ok(code)
}

fn cmd_validate(config: &AutodevConfig, dir: &Path) -> Result<i32> {
    let validator = SandboxValidator::new(
        build_sandbox(&config.sandbox),
        config.validation.clone(),
        Duration::from_secs(config.sandbox.timeout_secs),
    );
    let report = validator.validate(dir)?;
    print!("{}", report.transcript);
    if report.degraded {
        eprintln!("validation degraded: sandbox unavailable");
    }
    println!("exit code: {}", report.exit_code);
    Ok(if report.passed() {
        exit_codes::OK
    } else {
        exit_codes::VALIDATION_FAILED
    })
}

fn cmd_exec(
    config: &AutodevConfig,
    workdir: &Path,
    timeout: Option<u64>,
    command: &[String],
) -> Result<i32> {
    let sandbox = build_sandbox(&config.sandbox);
    let timeout = Duration::from_secs(timeout.unwrap_or(config.sandbox.timeout_secs));
    let request = SandboxRequest::new(shell_command(command), workdir, timeout);
    let result = sandbox.execute(&request)?;
    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    if result.timed_out {
        eprintln!("timed out after {}s", timeout.as_secs());
    }
    Ok(if result.success() {
        exit_codes::OK
    } else {
        exit_codes::VALIDATION_FAILED
    })
}

/// Join argv into one `sh -c` string, quoting where the shell would split.
fn shell_command(args: &[String]) -> String {
    match args {
        [single] => single.clone(),
        _ => args.iter().map(|arg| shell_quote(arg)).collect::<Vec<_>>().join(" "),
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn cmd_run(config: &AutodevConfig, state: RunState) -> Result<i32> {
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        return Err(anyhow!("missing credentials: {}", missing.join(", ")));
    }
    let token = config.github.token.clone();
    let generator = ChatGenerator::from_config(&config.llm)?;
    let validator = SandboxValidator::new(
        build_sandbox(&config.sandbox),
        config.validation.clone(),
        Duration::from_secs(config.sandbox.timeout_secs),
    );
    let scm = GitSourceControl::new(
        token.clone(),
        Identity {
            name: config.github.author_name.clone(),
            email: config.github.author_email.clone(),
        },
    );
    let publisher =
        GitHubPublisher::new(&config.github.api_base_url, token.as_deref().unwrap_or_default())?;

    println!("run {} on {} ({})", state.run_id, state.repo_url, state.branch);
    let (writer, reader) = JobStatus::start();
    let mut pipeline = Pipeline::new(
        PipelineConfig::from_config(config),
        generator,
        validator,
        scm,
        publisher,
    )
    .with_status(writer);
    let job = thread::spawn(move || pipeline.run(state));

    let mut offset = 0;
    loop {
        let running = reader.is_running();
        for line in reader.logs_since(offset) {
            println!("{line}");
            offset += 1;
        }
        if !running {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let state = job
        .join()
        .map_err(|_| anyhow!("pipeline thread panicked"))?
        .context("run pipeline")?;
    match state.status() {
        RunStatus::Completed => {
            if let Some(url) = &state.result_url {
                println!("pull request: {url}");
            }
            Ok(exit_codes::OK)
        }
        _ => Ok(exit_codes::RUN_FAILED),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["autodev", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_init_force_with_config() {
        let cli = Cli::parse_from(["autodev", "--config", "x.toml", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.config, PathBuf::from("x.toml"));
    }

    #[test]
    fn parse_run_defaults_branch() {
        let cli = Cli::parse_from([
            "autodev",
            "run",
            "--repo",
            "https://github.com/octo/demo",
            "--task",
            "Add a health check",
        ]);
        match cli.command {
            Command::Run { branch, run_id, .. } => {
                assert_eq!(branch, DEFAULT_BRANCH);
                assert!(run_id.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_exec_collects_trailing_command() {
        let cli = Cli::parse_from([
            "autodev", "exec", "--timeout", "5", "--", "echo", "hi", "there",
        ]);
        match cli.command {
            Command::Exec {
                timeout, command, ..
            } => {
                assert_eq!(timeout, Some(5));
                assert_eq!(command, vec!["echo", "hi", "there"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn exec_arguments_keep_their_quoting() {
        let args = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            shell_command(&args(&["python", "-c", "print('a b')"])),
            r"python -c 'print('\''a b'\'')'"
        );
        assert_eq!(shell_command(&args(&["echo", "", "x y"])), "echo '' 'x y'");
        assert_eq!(shell_command(&args(&["ls", "-la", "src/"])), "ls -la src/");
        assert_eq!(
            shell_command(&args(&["echo hi && echo there"])),
            "echo hi && echo there"
        );
    }

    #[test]
    fn parse_validate_defaults_to_cwd() {
        let cli = Cli::parse_from(["autodev", "validate"]);
        assert!(matches!(cli.command, Command::Validate { dir } if dir == Path::new(".")));
    }
}
