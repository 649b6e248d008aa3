mod bootstrap;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use keyhold_agent::session::LifetimePolicy;
use keyhold_agent::{KeyStore, SshAgent};
use keyhold_core::config::{self, AutoLockPolicy, Config};
use keyhold_core::paths;

fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout carries only the shell-evalable
    // environment lines.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args();
    let config = config::load(&args.config_path)
        .with_context(|| format!("load config {}", args.config_path.display()))?;

    let socket_path = resolve_socket_path(&args, &config)?;

    if args.print_env {
        // Attach a new shell to an already-running daemon.
        print!("{}", env_lines(&socket_path, None));
        return Ok(());
    }

    prepare_socket_dir(&socket_path)?;

    if args.foreground {
        print!("{}", env_lines(&socket_path, Some(std::process::id())));
    } else {
        daemonize(&socket_path)?;
    }

    // Locked pages and the dumpable bit are per-process state, so hardening
    // runs in the surviving process, after any fork but before the key store
    // exists.
    bootstrap::harden_process();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?
        .block_on(run(config, socket_path))
}

/// Detach from the calling shell, `ssh-agent` style.
///
/// The parent prints the eval-able environment lines (carrying the child's
/// pid) and exits, so `eval "$(keyholdd)"` returns as soon as the agent is
/// forked.  The child becomes a session leader and points stdin/stdout at
/// `/dev/null` — the shell's command substitution reads until every copy of
/// the stdout pipe is closed.  stderr stays open for logs.
#[cfg(unix)]
fn daemonize(socket_path: &Path) -> Result<()> {
    use std::os::unix::io::AsRawFd as _;

    // SAFETY: still single-threaded; the async runtime starts after this.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(std::io::Error::last_os_error()).context("fork"),
        0 => {
            // SAFETY: no pointer arguments.
            if unsafe { libc::setsid() } == -1 {
                tracing::warn!("setsid failed: {}", std::io::Error::last_os_error());
            }
            let devnull = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/null")
                .context("open /dev/null")?;
            // SAFETY: both fds are open for the duration of the calls.
            unsafe {
                libc::dup2(devnull.as_raw_fd(), libc::STDIN_FILENO);
                libc::dup2(devnull.as_raw_fd(), libc::STDOUT_FILENO);
            }
            Ok(())
        }
        child => {
            // Ends with a newline, which flushes the line-buffered stdout
            // before the hard exit.
            print!("{}", env_lines(socket_path, Some(child as u32)));
            std::process::exit(0);
        }
    }
}

#[cfg(not(unix))]
fn daemonize(socket_path: &Path) -> Result<()> {
    print!("{}", env_lines(socket_path, Some(std::process::id())));
    Ok(())
}

async fn run(config: Config, socket_path: PathBuf) -> Result<()> {
    let store = KeyStore::new();
    let policy = LifetimePolicy {
        default_lifetime: config.agent.default_key_lifetime_secs.map(Duration::from_secs),
        max_lifetime: config.agent.max_key_lifetime_secs.map(Duration::from_secs),
    };

    {
        let agent = SshAgent::new(Arc::clone(&store), socket_path.clone(), policy);
        tokio::spawn(async move {
            if let Err(e) = agent.listen().await {
                tracing::error!("agent listener exited: {e:#}");
                std::process::exit(1);
            }
        });
    }

    tracing::info!(socket = %socket_path.display(), "keyholdd ready");

    // Expiry reaper — evicts keys whose lifetime constraint has passed.
    {
        let reaper_store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                match reaper_store.write() {
                    Ok(mut guard) => {
                        let removed = guard.purge_expired(Instant::now());
                        if removed > 0 {
                            tracing::info!(removed, "expired keys evicted");
                        }
                    }
                    Err(e) => {
                        tracing::warn!("key store lock poisoned in reaper: {e}");
                        return;
                    }
                }
            }
        });
    }

    // Auto-lock policy — clears the whole store on idle / max-unlocked timeout.
    if config.autolock.idle_timeout_minutes.is_some()
        || config.autolock.max_unlocked_minutes.is_some()
    {
        let autolock = config.autolock.clone();
        let autolock_store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = enforce_autolock(&autolock_store, &autolock) {
                    tracing::warn!("auto-lock check failed: {e}");
                    return;
                }
            }
        });
    }

    shutdown_signal().await;
    tracing::info!("received shutdown signal, exiting");

    // Remove the socket so the next start doesn't find a stale one.
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!(path = %socket_path.display(), "socket cleanup failed: {e}");
    }
    Ok(())
}

/// Apply the auto-lock policy once.  Both timeouts evict every key.
fn enforce_autolock(
    store: &Arc<std::sync::RwLock<KeyStore>>,
    policy: &AutoLockPolicy,
) -> Result<()> {
    let mut guard = store
        .write()
        .map_err(|e| anyhow::anyhow!("key store lock poisoned: {e}"))?;
    if guard.is_empty() {
        return Ok(());
    }

    if let Some(idle_min) = policy.idle_timeout_minutes
        && guard.idle_for() >= Duration::from_secs(idle_min * 60)
    {
        tracing::info!(idle_minutes = idle_min, "idle timeout expired, evicting all keys");
        guard.remove_all();
        return Ok(());
    }

    if let Some(max_min) = policy.max_unlocked_minutes
        && let Some(held) = guard.unlocked_for()
        && held >= Duration::from_secs(max_min * 60)
    {
        tracing::info!(max_minutes = max_min, "max key lifetime expired, evicting all keys");
        guard.remove_all();
    }
    Ok(())
}

/// `eval`-able environment lines, mirroring `ssh-agent -s` output.
///
/// The pid lines are omitted when the daemon pid is unknown (`--print-env`
/// against an already-running agent).
fn env_lines(socket_path: &Path, pid: Option<u32>) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;",
        socket_path.display()
    );
    if let Some(pid) = pid {
        let _ = writeln!(out, "KEYHOLD_AGENT_PID={pid}; export KEYHOLD_AGENT_PID;");
        let _ = writeln!(out, "echo Agent pid {pid};");
    }
    out
}

/// Wait for ctrl-c (SIGINT) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("failed to register SIGTERM handler: {e}, falling back to SIGINT only");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

/// Resolve the socket path: CLI flag, then config, then the XDG default.
fn resolve_socket_path(args: &Args, config: &Config) -> Result<PathBuf> {
    if let Some(path) = &args.socket_path {
        return Ok(path.clone());
    }
    if let Some(path) = &config.agent.socket_path {
        return Ok(path.clone());
    }
    Ok(paths::default_socket_path()?)
}

/// Create the socket's parent directory with mode 0700 and remove any stale
/// socket from a previous run.
fn prepare_socket_dir(socket_path: &Path) -> Result<()> {
    if let Some(dir) = socket_path.parent() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::{DirBuilderExt as _, PermissionsExt as _};
            if !dir.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(dir)
                    .with_context(|| format!("create socket directory {}", dir.display()))?;
            } else {
                let meta = std::fs::metadata(dir)?;
                if meta.permissions().mode() & 0o077 != 0 {
                    std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
                }
            }
        }
        #[cfg(not(unix))]
        std::fs::create_dir_all(dir)?;
    }

    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("remove stale socket {}", socket_path.display()))?;
        tracing::debug!(path = %socket_path.display(), "removed stale socket");
    }
    Ok(())
}

struct Args {
    config_path: PathBuf,
    socket_path: Option<PathBuf>,
    foreground: bool,
    print_env: bool,
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    parse_args_from(&argv)
}

/// Hand-rolled argument parsing: `--config <path>`, `--socket <path>`,
/// `--foreground`, `--print-env`, `--help`.
fn parse_args_from(argv: &[String]) -> Args {
    let mut config_path = None;
    let mut socket_path = None;
    let mut foreground = false;
    let mut print_env = false;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" | "-c" => {
                let Some(path) = argv.get(i + 1) else {
                    eprintln!("error: --config requires a path argument");
                    std::process::exit(1);
                };
                config_path = Some(PathBuf::from(path));
                i += 1;
            }
            "--socket" | "-s" => {
                let Some(path) = argv.get(i + 1) else {
                    eprintln!("error: --socket requires a path argument");
                    std::process::exit(1);
                };
                socket_path = Some(PathBuf::from(path));
                i += 1;
            }
            "--foreground" | "-F" => foreground = true,
            "--print-env" => print_env = true,
            "--help" | "-h" => {
                eprintln!("Usage: keyholdd [--config <path>] [--socket <path>] [--foreground]");
                eprintln!();
                eprintln!("Prints SSH_AUTH_SOCK export lines on stdout and detaches, so");
                eprintln!("`eval \"$(keyholdd)\"` starts the agent and sets up the shell.");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  -c, --config <path>  Config file (default: $XDG_CONFIG_HOME/keyhold/config.toml)");
                eprintln!("  -s, --socket <path>  Agent socket (default: $XDG_RUNTIME_DIR/keyhold/agent.sock)");
                eprintln!("  -F, --foreground     Stay in the foreground instead of detaching");
                eprintln!("      --print-env      Print the export lines for the resolved socket and exit");
                eprintln!("  -h, --help           Show this help message");
                std::process::exit(0);
            }
            arg => {
                if let Some(path) = arg.strip_prefix("--config=") {
                    config_path = Some(PathBuf::from(path));
                } else if let Some(path) = arg.strip_prefix("--socket=") {
                    socket_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("error: unknown argument '{arg}'");
                    std::process::exit(1);
                }
            }
        }
        i += 1;
    }

    Args {
        config_path: config_path.unwrap_or_else(paths::default_config_path),
        socket_path,
        foreground,
        print_env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("keyholdd")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn detaches_by_default() {
        let args = parse_args_from(&argv(&[]));
        assert!(!args.foreground);
        assert!(!args.print_env);
    }

    #[test]
    fn foreground_and_print_env_flags() {
        assert!(parse_args_from(&argv(&["--foreground"])).foreground);
        assert!(parse_args_from(&argv(&["-F"])).foreground);
        assert!(parse_args_from(&argv(&["--print-env"])).print_env);
    }

    #[test]
    fn socket_flag_forms() {
        let args = parse_args_from(&argv(&["--socket", "/tmp/a.sock"]));
        assert_eq!(args.socket_path.as_deref(), Some(Path::new("/tmp/a.sock")));
        let args = parse_args_from(&argv(&["--socket=/tmp/b.sock"]));
        assert_eq!(args.socket_path.as_deref(), Some(Path::new("/tmp/b.sock")));
    }

    #[test]
    fn env_lines_are_shell_evalable() {
        let with_pid = env_lines(Path::new("/run/user/1000/keyhold/agent.sock"), Some(42));
        assert_eq!(
            with_pid,
            "SSH_AUTH_SOCK=/run/user/1000/keyhold/agent.sock; export SSH_AUTH_SOCK;\n\
             KEYHOLD_AGENT_PID=42; export KEYHOLD_AGENT_PID;\n\
             echo Agent pid 42;\n"
        );

        // No pid lines when attaching to an already-running agent.
        let attach = env_lines(Path::new("/tmp/agent.sock"), None);
        assert_eq!(attach, "SSH_AUTH_SOCK=/tmp/agent.sock; export SSH_AUTH_SOCK;\n");
    }
}
