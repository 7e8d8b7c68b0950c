//! Single binary playing three roles depending on how it is invoked
//! (spec.md §4.5, §6.1):
//!
//! - `bdg <url>` / `bdg status|peek|stop|cleanup|cdp|details` — the ephemeral
//!   CLI client. Talks to the daemon over its Unix socket and exits.
//! - `bdg __daemon` — the persistent daemon. Never invoked by a user
//!   directly; spawned detached by [`bdg::ipc::client::ensure_daemon_running`].
//! - `bdg __worker` — the supervised worker. Spawned by the daemon with its
//!   stdio piped; never touches a terminal.

use std::time::Duration;

use clap::{Parser, error::ErrorKind};
use serde_json::{Value, json};

use bdg::cli::{CdpArgs, Cli, CleanupArgs, Command, DetailsArgs, PeekArgs};
use bdg::config;
use bdg::error::{AppError, ExitCode};
use bdg::ipc::client as ipc_client;
use bdg::session::{self, BdgPaths, SessionMetadata};
use bdg::{daemon, worker};

/// Round-trip budget for the interactive `peek`/`details`/`cdp` commands,
/// which read already-running in-memory state and should answer quickly.
const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(8);
/// `stop_session` additionally waits out the worker's own `SIGTERM` grace
/// period daemon-side, so it gets a longer budget than other forwards.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// How long the CLI polls for Chrome to actually exit after `stop_session`
/// reports success, before declaring it unresponsive.
const CHROME_EXIT_POLL: Duration = Duration::from_secs(3);
/// Interval between `peek --follow` refreshes.
const FOLLOW_INTERVAL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) {
                e.print().expect("failed to write to stdout");
                std::process::exit(0);
            }
            let msg = e.kind().to_string();
            let full = e.to_string();
            let clean = full
                .lines()
                .filter(|line| {
                    let trimmed = line.trim();
                    !trimmed.is_empty() && !trimmed.starts_with("For more information") && !trimmed.starts_with("Usage:")
                })
                .map(|line| line.strip_prefix("error: ").unwrap_or(line).trim())
                .collect::<Vec<_>>()
                .join(", ");
            let clean = if clean.is_empty() { msg } else { clean };
            AppError::new(clean, ExitCode::InvalidArgs).print_json_stderr();
            std::process::exit(ExitCode::InvalidArgs as i32);
        }
    };

    let paths = match BdgPaths::new() {
        Ok(paths) => paths,
        Err(e) => {
            AppError::from(e).print_json_stderr();
            std::process::exit(ExitCode::DaemonError as i32);
        }
    };

    // `__daemon`/`__worker` are internal re-exec targets, never reached by a
    // user directly (they're hidden from --help). Everything else is the
    // ephemeral CLI client.
    match &cli.command {
        Some(Command::Daemon) => {
            init_role_logging(&paths.daemon_log_file());
            if let Err(e) = daemon::run(paths).await {
                e.print_json_stderr();
                std::process::exit(e.code as i32);
            }
        }
        Some(Command::Worker) => {
            init_role_logging(&paths.worker_log_file());
            if let Err(e) = worker::run().await {
                e.print_json_stderr();
                std::process::exit(e.code as i32);
            }
        }
        _ => {
            init_cli_logging();
            if let Err(e) = run(&cli, &paths).await {
                if cli.json {
                    e.print_json_stderr();
                } else {
                    e.print_human_stderr(suggestion_for(&e));
                }
                #[allow(clippy::cast_possible_truncation)]
                std::process::exit(e.code as i32);
            }
        }
    }
}

/// Stderr-only logging for the CLI role: the CLI's stdout is reserved for
/// command output (plain text or, with `--json`, a single JSON value).
fn init_cli_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("BDG_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init();
}

/// File logging for the daemon/worker roles: both pipe their stdio for IPC
/// framing, so nothing may be written to stdout/stderr.
fn init_role_logging(log_path: &std::path::Path) {
    let filter = tracing_subscriber::EnvFilter::try_from_env("BDG_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let file = std::fs::OpenOptions::new().create(true).append(true).open(log_path);
    if let Ok(file) = file {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(move || file.try_clone().expect("failed to clone log file handle"))
            .try_init();
    }
    // A log file that can't be opened is not fatal to either role; they run
    // unlogged rather than refuse to start a telemetry session.
}

async fn run(cli: &Cli, paths: &BdgPaths) -> Result<(), AppError> {
    match &cli.command {
        None => cmd_start(cli, paths).await,
        Some(Command::Status) => cmd_status(cli, paths).await,
        Some(Command::Peek(args)) => cmd_peek(cli, args, paths).await,
        Some(Command::Stop) => cmd_stop(cli, paths).await,
        Some(Command::Cleanup(args)) => cmd_cleanup(cli, args, paths),
        Some(Command::Cdp(args)) => cmd_cdp(cli, args, paths).await,
        Some(Command::Details(args)) => cmd_details(cli, args, paths).await,
        Some(Command::Daemon) | Some(Command::Worker) => unreachable!("handled in main before role dispatch"),
    }
}

// ---------------------------------------------------------------------------
// bdg <url> [flags]
// ---------------------------------------------------------------------------

async fn cmd_start(cli: &Cli, paths: &BdgPaths) -> Result<(), AppError> {
    let Some(url) = cli.url.as_deref() else {
        return Err(AppError::invalid_args(
            "a URL is required to start a session (or use a subcommand: status, peek, stop, cleanup, cdp, details)",
        ));
    };
    url::Url::parse(url).map_err(|e| AppError::invalid_args(format!("invalid URL {url:?}: {e}")))?;

    let (config_path, config_file) = config::load_config(cli.config.as_deref());
    let resolved = config::resolve_config(&config_file, config_path);
    let opts = &cli.start;

    let telemetry: Vec<String> = resolved.telemetry.enabled.clone();
    let params = json!({
        "url": url,
        "port": opts.port.unwrap_or(resolved.chrome.port),
        "headless": opts.headless || resolved.chrome.headless,
        "chromePath": resolved.chrome.chrome_path,
        "userDataDir": opts.user_data_dir.as_ref().map(|p| p.display().to_string()).or(resolved.chrome.user_data_dir),
        "connectTimeoutMs": opts.timeout.map(|s| s * 1000).unwrap_or(10_000),
        "telemetry": telemetry,
        "includeAll": opts.include_all || resolved.telemetry.include_all,
        "maxBodySizeMb": if opts.compact { 0 } else { opts.max_body_size_mb.unwrap_or(resolved.telemetry.max_body_size_mb) },
        "networkInclude": resolved.telemetry.network_include,
        "networkExclude": resolved.telemetry.network_exclude,
        "fetchAllBodies": false,
        "previewIntervalSecs": resolved.session.preview_interval_secs,
        "previewMaxEntries": resolved.session.preview_max_entries,
    });

    ipc_client::ensure_daemon_running(paths).await?;
    let data = ipc_client::call(paths, "start_session", params, INTERACTIVE_TIMEOUT).await?;

    print_output(cli, &data, |v| {
        println!("started session for {url}");
        println!("  worker pid:  {}", v["workerPid"]);
        println!("  chrome pid:  {}", v["chromePid"]);
        println!("  port:        {}", v["port"]);
        println!("  target:      {}", v["targetUrl"].as_str().unwrap_or(url));
        println!("run `bdg peek` to sample telemetry, `bdg stop` to end the session.");
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// bdg status
// ---------------------------------------------------------------------------

async fn cmd_status(cli: &Cli, paths: &BdgPaths) -> Result<(), AppError> {
    let data = match connect_existing(paths).await {
        Ok(()) => ipc_client::call(paths, "status", json!({}), INTERACTIVE_TIMEOUT).await?,
        Err(_) => json!({ "active": false }),
    };

    print_output(cli, &data, |v| {
        if v.get("active").and_then(Value::as_bool) == Some(false) {
            println!("no active session");
            return;
        }
        println!("daemon pid: {}", v["daemonPid"]);
        println!("state:      {}", v["state"].as_str().unwrap_or("unknown"));
        match &v["session"] {
            Value::Null => println!("session:    none"),
            session => {
                println!("session:");
                println!("  target url:  {}", session["targetUrl"].as_str().unwrap_or("?"));
                println!("  chrome pid:  {}", session["chromePid"]);
                println!("  telemetry:   {}", session["activeTelemetry"]);
            }
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// bdg peek
// ---------------------------------------------------------------------------

async fn cmd_peek(cli: &Cli, args: &PeekArgs, paths: &BdgPaths) -> Result<(), AppError> {
    connect_existing(paths).await?;
    let params = json!({
        "lastN": args.last,
        "network": args.network,
        "console": args.console,
    });

    if !args.follow {
        let data = ipc_client::call(paths, "peek", params, INTERACTIVE_TIMEOUT).await?;
        print_output(cli, &data, |v| render_peek(v, args.verbose));
        return Ok(());
    }

    loop {
        let data = ipc_client::call(paths, "peek", params.clone(), INTERACTIVE_TIMEOUT).await?;
        print_output(cli, &data, |v| render_peek(v, args.verbose));
        tokio::select! {
            _ = tokio::time::sleep(FOLLOW_INTERVAL) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }
}

fn render_peek(v: &Value, verbose: bool) {
    if let Some(items) = v.get("network").and_then(Value::as_array) {
        println!("network ({}):", items.len());
        for item in items {
            if verbose {
                println!("  {item}");
            } else {
                println!(
                    "  [{}] {} {} -> {}",
                    item["requestId"].as_str().unwrap_or("?"),
                    item["method"].as_str().unwrap_or("?"),
                    item["url"].as_str().unwrap_or("?"),
                    item["status"]
                );
            }
        }
    }
    if let Some(items) = v.get("console").and_then(Value::as_array) {
        println!("console ({}):", items.len());
        for (i, item) in items.iter().enumerate() {
            if verbose {
                println!("  [{i}] {item}");
            } else {
                println!("  [{i}] {}: {}", item["type"].as_str().unwrap_or("?"), item["text"].as_str().unwrap_or(""));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// bdg stop
// ---------------------------------------------------------------------------

async fn cmd_stop(cli: &Cli, paths: &BdgPaths) -> Result<(), AppError> {
    connect_existing(paths).await?;
    let data = ipc_client::call(paths, "stop_session", json!({}), STOP_TIMEOUT).await?;

    let chrome_pid = data.get("chromePid").and_then(Value::as_u64).map(|p| p as u32);
    let mut force_killed = false;
    if let Some(pid) = chrome_pid {
        let deadline = tokio::time::Instant::now() + CHROME_EXIT_POLL;
        while session::pid_is_alive(pid) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        if session::pid_is_alive(pid) {
            kill_process_group(pid);
            force_killed = true;
        }
    }

    let data = json!({ "stopped": true, "chromePid": chrome_pid, "forceKilled": force_killed });
    print_output(cli, &data, |v| {
        println!("session stopped");
        if v["forceKilled"].as_bool() == Some(true) {
            println!("  chrome did not exit on its own; process group was force-killed");
        }
    });
    Ok(())
}

// ---------------------------------------------------------------------------
// bdg cleanup
// ---------------------------------------------------------------------------

fn cmd_cleanup(cli: &Cli, args: &CleanupArgs, paths: &BdgPaths) -> Result<(), AppError> {
    let chrome_pid = session::read_json::<SessionMetadata>(&paths.meta_file())
        .ok()
        .flatten()
        .map(|m| m.chrome_pid);

    let mut removed = Vec::new();
    let mut skipped = Vec::new();

    remove_pid_guarded(&paths.pid_file(), "session.pid", args.force, &mut removed, &mut skipped);
    remove_always(&paths.meta_file(), "session.meta.json", &mut removed);
    remove_always(&paths.preview_file(), "session.preview.json", &mut removed);
    remove_always(&paths.socket_file(), "bdg.sock", &mut removed);

    if args.all {
        remove_pid_guarded(&paths.daemon_pid_file(), "daemon.pid", args.force, &mut removed, &mut skipped);
        remove_pid_guarded(&paths.lock_file(), "session.lock", args.force, &mut removed, &mut skipped);
    }

    let mut killed_chrome_pid = None;
    if args.aggressive {
        if let Some(pid) = chrome_pid.filter(|&p| p != 0) {
            kill_process_group(pid);
            killed_chrome_pid = Some(pid);
        }
    }

    let data = json!({
        "removed": removed,
        "skipped": skipped,
        "killedChromePid": killed_chrome_pid,
    });
    print_output(cli, &data, |v| {
        let removed = v["removed"].as_array().map_or(0, Vec::len);
        let skipped = v["skipped"].as_array().map_or(0, Vec::len);
        println!("cleanup: removed {removed} file(s), skipped {skipped} (owner still alive)");
        if let Some(pid) = v["killedChromePid"].as_u64() {
            println!("killed orphaned chrome process group (pid {pid})");
        }
    });
    Ok(())
}

/// Remove a bare-PID file (`daemon.pid`/`session.pid`/`session.lock`) unless
/// it names a live process, in which case it is left alone — `--force`
/// bypasses the liveness check entirely.
fn remove_pid_guarded(path: &std::path::Path, label: &str, force: bool, removed: &mut Vec<String>, skipped: &mut Vec<String>) {
    if !path.exists() {
        return;
    }
    if !force {
        if let Ok(Some(pid)) = session::read_pid_file(path) {
            if session::pid_is_alive(pid) {
                skipped.push(label.to_owned());
                return;
            }
        }
    }
    if session::remove_if_exists(path).is_ok() {
        removed.push(label.to_owned());
    }
}

fn remove_always(path: &std::path::Path, label: &str, removed: &mut Vec<String>) {
    if path.exists() && session::remove_if_exists(path).is_ok() {
        removed.push(label.to_owned());
    }
}

// ---------------------------------------------------------------------------
// bdg cdp
// ---------------------------------------------------------------------------

async fn cmd_cdp(cli: &Cli, args: &CdpArgs, paths: &BdgPaths) -> Result<(), AppError> {
    if args.list {
        let data = serde_json::to_value(bdg::cdp::catalog::CATALOG).unwrap_or(Value::Null);
        print_output(cli, &data, |v| {
            for entry in v.as_array().into_iter().flatten() {
                println!("{:<28} {}", entry["method"].as_str().unwrap_or(""), entry["description"].as_str().unwrap_or(""));
            }
        });
        return Ok(());
    }
    if let Some(method) = &args.describe {
        let Some(entry) = bdg::cdp::catalog::describe(method) else {
            return Err(AppError::new(format!("no catalog entry for {method}"), ExitCode::InvalidArgs));
        };
        let data = serde_json::to_value(entry).unwrap_or(Value::Null);
        print_output(cli, &data, |v| {
            println!("{} ({})", v["method"].as_str().unwrap_or(""), v["domain"].as_str().unwrap_or(""));
            println!("  {}", v["description"].as_str().unwrap_or(""));
        });
        return Ok(());
    }
    if let Some(query) = &args.search {
        let results = bdg::cdp::catalog::search(query);
        let data = serde_json::to_value(&results).unwrap_or(Value::Null);
        print_output(cli, &data, |v| {
            for entry in v.as_array().into_iter().flatten() {
                println!("{:<28} {}", entry["method"].as_str().unwrap_or(""), entry["description"].as_str().unwrap_or(""));
            }
        });
        return Ok(());
    }

    let Some(method) = &args.method else {
        return Err(AppError::invalid_args("cdp: specify a method, or one of --list/--describe/--search"));
    };
    let call_params: Value = match &args.params {
        Some(raw) => serde_json::from_str(raw).map_err(|e| AppError::invalid_args(format!("--params is not valid JSON: {e}")))?,
        None => Value::Null,
    };

    connect_existing(paths).await?;
    let data = ipc_client::call(
        paths,
        "cdp_call",
        json!({ "method": method, "params": call_params }),
        INTERACTIVE_TIMEOUT,
    )
    .await?;
    print_output(cli, &data, |v| println!("{}", serde_json::to_string_pretty(v).unwrap_or_default()));
    Ok(())
}

// ---------------------------------------------------------------------------
// bdg details network|console <id>
// ---------------------------------------------------------------------------

async fn cmd_details(cli: &Cli, args: &DetailsArgs, paths: &BdgPaths) -> Result<(), AppError> {
    connect_existing(paths).await?;
    let data = ipc_client::call(
        paths,
        "details",
        json!({ "itemType": args.item_type.as_str(), "id": args.id }),
        INTERACTIVE_TIMEOUT,
    )
    .await?;
    print_output(cli, &data, |v| println!("{}", serde_json::to_string_pretty(v).unwrap_or_default()));
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Handshake an already-running daemon without spawning one. Used by every
/// subcommand that only makes sense against an active session: if nothing
/// answers, there is nothing to peek/stop/describe.
async fn connect_existing(paths: &BdgPaths) -> Result<(), AppError> {
    ipc_client::call(paths, "handshake", json!({}), Duration::from_secs(2))
        .await
        .map(|_| ())
        .map_err(|_| AppError::new("no active session (daemon is not running)", ExitCode::ResourceNotFound))
}

fn print_output(cli: &Cli, data: &Value, human: impl FnOnce(&Value)) {
    if cli.json {
        println!("{}", serde_json::to_string(data).unwrap_or_else(|_| "null".to_owned()));
    } else {
        human(data);
    }
}

fn suggestion_for(err: &AppError) -> Option<&'static str> {
    match err.code {
        ExitCode::ResourceBusy => Some("run `bdg stop` to end the existing session first"),
        ExitCode::WorkerStartFailed | ExitCode::DaemonError => Some("run `bdg cleanup --all --aggressive` and try again"),
        _ => None,
    }
}

/// `SIGTERM` the process group, poll briefly, escalate to `SIGKILL` if it
/// hasn't exited. Mirrors the teacher's Chrome-process-group termination,
/// generalized for reuse by both `bdg stop`'s fallback and `bdg cleanup
/// --aggressive`.
fn kill_process_group(pid: u32) {
    #[cfg(unix)]
    {
        use std::thread;

        #[allow(clippy::cast_possible_wrap)]
        let pid_i32 = pid as i32;

        // SAFETY: libc::kill with a negative pid targets the process group.
        if unsafe { libc::kill(-pid_i32, libc::SIGTERM) } != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGTERM) };
        }

        let poll_interval = Duration::from_millis(100);
        let max_wait = Duration::from_secs(2);
        let start = std::time::Instant::now();
        while start.elapsed() < max_wait {
            if !session::pid_is_alive(pid) {
                return;
            }
            thread::sleep(poll_interval);
        }

        if unsafe { libc::kill(-pid_i32, libc::SIGKILL) } != 0 {
            unsafe { libc::kill(pid_i32, libc::SIGKILL) };
        }
    }
    #[cfg(windows)]
    {
        let _ = std::process::Command::new("taskkill").args(["/T", "/F", "/PID", &pid.to_string()]).output();
    }
}
