mod config;
mod dispatch;
mod exec;
mod process_directory;
mod protocol;
mod runtime;
mod security;
mod server;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use dispatch::{DispatchOutcome, ToolDispatcher};
use protocol::RpcRequestFrame;
use serde::Serialize;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

const EXEC_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "Policy-gated remote shell session service")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "SHELLGATE_CONFIG",
        default_value = "shellgate.toml"
    )]
    config: PathBuf,

    /// Override the WebSocket listener address.
    #[arg(long, global = true)]
    bind: Option<String>,

    /// Override the control HTTP listener address (empty disables it).
    #[arg(long = "http-bind", global = true)]
    http_bind: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "SHELLGATE_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the session server until ctrl-c.
    Serve,
    /// Check config, shell, blocklist store and allowed directories.
    Doctor(DoctorArgs),
    /// Run one command locally through the session engine.
    Exec(ExecArgs),
    /// Inspect or edit the command blocklist.
    Blocked(BlockedArgs),
    /// List or signal OS processes.
    Processes(ProcessesArgs),
    /// List supported call-surface methods.
    Methods(JsonFlag),
}

#[derive(Debug, Clone, Args, Default)]
struct JsonFlag {
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct ExecArgs {
    /// Command line handed to the configured shell.
    command: String,
    /// Working directory, inside one of the allowed directories.
    #[arg(long)]
    cwd: Option<String>,
    /// How long the initial call waits before detaching.
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Args)]
struct BlockedArgs {
    #[command(subcommand)]
    command: Option<BlockedSubcommand>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum BlockedSubcommand {
    /// List blocked command names.
    List,
    /// Block a command name.
    Add { name: String },
    /// Unblock a command name.
    Remove { name: String },
}

#[derive(Debug, Clone, Args)]
struct ProcessesArgs {
    #[command(subcommand)]
    command: Option<ProcessesSubcommand>,
    /// Emit output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum ProcessesSubcommand {
    /// Snapshot running processes.
    List,
    /// Send SIGTERM to a pid.
    Kill { pid: u32 },
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let command = cli.command.clone().unwrap_or(CliCommand::Serve);
    match command {
        CliCommand::Serve => run_server(&cli).await,
        CliCommand::Doctor(args) => run_doctor(&cli.config, args),
        CliCommand::Exec(args) => run_exec_command(&cli, args).await,
        CliCommand::Blocked(args) => run_blocked_command(&cli, args).await,
        CliCommand::Processes(args) => run_processes_command(&cli, args).await,
        CliCommand::Methods(args) => {
            print_methods(args.json);
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.bind.as_deref(), cli.http_bind.as_deref());
    cfg.validate()?;
    Ok(cfg)
}

async fn run_server(cli: &Cli) -> Result<()> {
    let cfg = load_config(cli)?;
    let runtime = runtime::ShellGateRuntime::new(cfg).await?;
    runtime.run().await
}

fn run_doctor(config_path: &Path, args: DoctorArgs) -> Result<()> {
    let config_result = Config::load(config_path).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, config_path);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

async fn run_exec_command(cli: &Cli, args: ExecArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let dispatcher = runtime::build_dispatcher(&cfg).await?;
    let mut params = json!({ "command": args.command });
    if let Some(cwd) = args.cwd {
        params["cwd"] = json!(cwd);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        params["timeoutMs"] = json!(timeout_ms);
    }

    let started = dispatch_rpc(&dispatcher, "execute_command", params).await?;
    let session_id = started
        .get("sessionId")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let mut output = started
        .get("output")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    if !args.json {
        print!("{output}");
    }

    let mut last = started;
    while !last
        .get("completed")
        .and_then(Value::as_bool)
        .unwrap_or(true)
    {
        tokio::time::sleep(Duration::from_millis(EXEC_POLL_INTERVAL_MS)).await;
        last = dispatch_rpc(
            &dispatcher,
            "read_output",
            json!({ "sessionId": session_id }),
        )
        .await?;
        let chunk = last.get("output").and_then(Value::as_str).unwrap_or_default();
        if !args.json {
            print!("{chunk}");
        }
        output.push_str(chunk);
    }

    let exit_code = last.get("exitCode").and_then(Value::as_i64);
    if args.json {
        print_json_value(&json!({
            "sessionId": session_id,
            "output": output,
            "exitCode": exit_code
        }));
    } else {
        eprintln!(
            "session {session_id} exited with {}",
            exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "signal".to_owned())
        );
    }
    Ok(())
}

async fn run_blocked_command(cli: &Cli, args: BlockedArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let dispatcher = runtime::build_dispatcher(&cfg).await?;
    let payload = match args.command.unwrap_or(BlockedSubcommand::List) {
        BlockedSubcommand::List => {
            dispatch_rpc(&dispatcher, "list_blocked_commands", json!({})).await?
        }
        BlockedSubcommand::Add { name } => {
            dispatch_rpc(&dispatcher, "block_command", json!({ "command": name })).await?
        }
        BlockedSubcommand::Remove { name } => {
            dispatch_rpc(&dispatcher, "unblock_command", json!({ "command": name })).await?
        }
    };
    if args.json {
        print_json_value(&payload);
    } else if let Some(names) = payload.get("blockedCommands").and_then(Value::as_array) {
        println!("blocked commands: {}", names.len());
        for name in names.iter().filter_map(Value::as_str) {
            println!("{name}");
        }
    } else {
        let name = payload
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let changed = payload
            .get("changed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        println!("blocklist: command={name} changed={changed}");
    }
    Ok(())
}

async fn run_processes_command(cli: &Cli, args: ProcessesArgs) -> Result<()> {
    let cfg = load_config(cli)?;
    let dispatcher = runtime::build_dispatcher(&cfg).await?;
    match args.command.unwrap_or(ProcessesSubcommand::List) {
        ProcessesSubcommand::List => {
            let payload = dispatch_rpc(&dispatcher, "list_processes", json!({})).await?;
            if args.json {
                print_json_value(&payload);
                return Ok(());
            }
            let rows = payload
                .get("processes")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            println!("{:>8}  {:>6}  {:>10}  NAME", "PID", "CPU%", "MEM");
            for row in rows {
                println!(
                    "{:>8}  {:>6.1}  {:>10}  {}",
                    row.get("pid").and_then(Value::as_u64).unwrap_or(0),
                    row.get("cpuPercent").and_then(Value::as_f64).unwrap_or(0.0),
                    row.get("memoryBytes").and_then(Value::as_u64).unwrap_or(0),
                    row.get("name").and_then(Value::as_str).unwrap_or("?")
                );
            }
        }
        ProcessesSubcommand::Kill { pid } => {
            let payload = dispatch_rpc(&dispatcher, "kill_process", json!({ "pid": pid })).await?;
            if args.json {
                print_json_value(&payload);
            } else {
                let already_exited = payload
                    .get("alreadyExited")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                println!("kill: pid={pid} already_exited={already_exited}");
            }
        }
    }
    Ok(())
}

fn print_methods(json_output: bool) {
    let methods = dispatch::supported_methods();
    if json_output {
        print_json_value(&json!({
            "count": methods.len(),
            "methods": methods
        }));
    } else {
        println!("methods: {}", methods.len());
        for method in methods {
            println!("{method}");
        }
    }
}

async fn dispatch_rpc(dispatcher: &ToolDispatcher, method: &str, params: Value) -> Result<Value> {
    let request = RpcRequestFrame {
        id: format!("cli-{method}-{}", exec::now_ms()),
        method: method.to_owned(),
        params,
    };
    match dispatcher.handle_request(&request).await {
        DispatchOutcome::Handled(payload) => Ok(payload),
        DispatchOutcome::NotHandled => Err(anyhow!("method not handled: {method}")),
        DispatchOutcome::Error { code, message } => Err(anyhow!(
            "{method} failed: code={code} message={message}"
        )),
    }
}

fn print_json_value(value: &Value) {
    let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    println!("{rendered}");
}

fn build_doctor_report(
    config_result: std::result::Result<Config, String>,
    config_path: &Path,
) -> DoctorReport {
    let mut checks = Vec::new();

    let cfg = match config_result {
        Ok(cfg) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "pass".to_owned(),
                message: if config_path.exists() {
                    format!("loaded {}", config_path.display())
                } else {
                    format!("{} not found, using defaults", config_path.display())
                },
                detail: None,
            });
            cfg
        }
        Err(err) => {
            checks.push(DoctorCheck {
                id: "config.load".to_owned(),
                status: "fail".to_owned(),
                message: format!("failed to load {}", config_path.display()),
                detail: Some(err),
            });
            return DoctorReport { ok: false, checks };
        }
    };

    let shell_ok = shell_available(&cfg.exec.shell);
    checks.push(DoctorCheck {
        id: "exec.shell".to_owned(),
        status: if shell_ok { "pass" } else { "fail" }.to_owned(),
        message: if shell_ok {
            format!("`{}` runs commands", cfg.exec.shell)
        } else {
            format!("`{}` is not runnable", cfg.exec.shell)
        },
        detail: None,
    });

    checks.push(blocklist_check(&cfg.security.blocklist_path));

    for dir in &cfg.security.allowed_directories {
        let exists = dir.is_dir();
        checks.push(DoctorCheck {
            id: "security.allowed_directory".to_owned(),
            status: if exists { "pass" } else { "warn" }.to_owned(),
            message: dir.display().to_string(),
            detail: (!exists).then(|| "missing, will be created on start".to_owned()),
        });
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn blocklist_check(path: &Path) -> DoctorCheck {
    let id = "security.blocklist".to_owned();
    if !path.exists() {
        return DoctorCheck {
            id,
            status: "warn".to_owned(),
            message: format!("{} missing", path.display()),
            detail: Some("will be seeded from default_blocked_commands".to_owned()),
        };
    }
    let parsed = std::fs::read_to_string(path)
        .map_err(|err| err.to_string())
        .and_then(|text| serde_json::from_str::<Value>(&text).map_err(|err| err.to_string()));
    match parsed {
        Ok(value) => {
            let count = value
                .get("blockedCommands")
                .and_then(Value::as_array)
                .map(Vec::len)
                .unwrap_or(0);
            DoctorCheck {
                id,
                status: "pass".to_owned(),
                message: format!("{} readable", path.display()),
                detail: Some(format!("{count} blocked command(s)")),
            }
        }
        Err(err) => DoctorCheck {
            id,
            status: "fail".to_owned(),
            message: format!("{} unreadable", path.display()),
            detail: Some(err),
        },
    }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn shell_available(shell: &str) -> bool {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.args(["/C", "exit 0"]);
        command
    } else {
        let mut command = Command::new(shell);
        command.args(["-c", "true"]);
        command
    };
    command
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}
