mod client;
mod tty;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use ssh_key::public::KeyData;
use ssh_key::{HashAlg, PrivateKey, PublicKey};
use zeroize::Zeroizing;

use client::AgentClient;
use keyhold_core::authorized_keys;
use keyhold_core::paths;

#[tokio::main]
async fn main() -> Result<()> {
    // Reset SIGPIPE to default so piping output to `head` etc. exits cleanly
    // instead of panicking with "broken pipe".
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let args = strip_socket_flag(std::env::args().skip(1).collect());
    let cmd = args.first().map(String::as_str).unwrap_or("help");

    match cmd {
        "add" => cmd_add(&args[1..]).await,
        "list" | "ls" => cmd_list(&args[1..]).await,
        "remove" | "rm" => cmd_remove(&args[1..]).await,
        "remove-all" => cmd_remove_all().await,
        "lock" => cmd_lock().await,
        "unlock" => cmd_unlock().await,
        "status" => cmd_status().await,
        "env" => cmd_env(),
        "authorize" => cmd_authorize(&args[1..]),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
keyhold - SSH authentication key agent CLI

USAGE:
    keyhold <command> [args...]

COMMANDS:
    add [-t <secs>] [-c] [keyfile...|-] Add private keys to the agent
                                        (default: ~/.ssh/id_ed25519, id_ecdsa, id_rsa;
                                        `-` scans stdin for pasted PEM blocks)
    list [-L]                           List held keys by fingerprint (alias: ls)
                                        -L prints full public key lines
    remove <keyfile|SHA256:fp>...       Remove keys from the agent (alias: rm)
    remove-all                          Remove every key from the agent
    lock                                Lock the agent with a passphrase
    unlock                              Unlock a locked agent
    status                              Show socket path and key count
    env                                 Print SSH_AUTH_SOCK export lines for shell eval
    authorize <pubkey.pub> [--dir <d>]  Append a public key to authorized_keys
                                        (default dir: ~/.ssh, modes 0700/0600 enforced)
    help                                Show this help

FLAGS:
    -t <secs>                           Key lifetime; the agent forgets the key afterwards
    -c, --confirm                       Ask for confirmation on every signature
    -s, --socket <path>                 Agent socket (default: $SSH_AUTH_SOCK,
                                        then $XDG_RUNTIME_DIR/keyhold/agent.sock)

NOTES:
    Encrypted key files are decrypted locally before the key is handed to the
    agent; the passphrase never crosses the socket.

    A key file that is readable by group or others triggers a warning —
    OpenSSH itself refuses such keys. Fix with: chmod 600 <keyfile>

EXAMPLES:
    eval \"$(keyholdd)\"                        # start the agent, export SSH_AUTH_SOCK
    keyhold add                                  # add default key files
    keyhold add -t 3600 ~/.ssh/id_ed25519        # forget after an hour
    keyhold list
    keyhold remove SHA256:Yr0iPCjdiv7R2bFNNXQZ6cQwDUi1zSyUmBTSZQzIqiY
    keyhold authorize ~/.ssh/id_ed25519.pub --dir /home/deploy/.ssh"
    );
}

// ---------------------------------------------------------------------------
// Socket resolution
// ---------------------------------------------------------------------------

/// Drop the global `--socket` flag (and its value) so subcommand parsers
/// only ever see their own arguments.  [`socket_path`] re-reads the flag
/// from the raw argv.
fn strip_socket_flag(args: Vec<String>) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        if arg == "--socket" || arg == "-s" {
            skip_value = true;
            continue;
        }
        if arg.starts_with("--socket=") {
            continue;
        }
        out.push(arg);
    }
    out
}

/// Resolve the agent socket: `--socket <path>` flag, then `$SSH_AUTH_SOCK`,
/// then the daemon default.
fn socket_path() -> Result<PathBuf> {
    let argv: Vec<String> = std::env::args().collect();
    for i in 0..argv.len() {
        if (argv[i] == "--socket" || argv[i] == "-s")
            && let Some(p) = argv.get(i + 1)
        {
            return Ok(PathBuf::from(p));
        }
        if let Some(p) = argv[i].strip_prefix("--socket=") {
            return Ok(PathBuf::from(p));
        }
    }
    Ok(paths::client_socket_path()?)
}

async fn connect() -> Result<AgentClient> {
    AgentClient::connect(&socket_path()?).await
}

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

async fn cmd_add(args: &[String]) -> Result<()> {
    let mut lifetime_secs: Option<u32> = None;
    let mut confirm = false;
    let mut from_stdin = false;
    let mut files: Vec<PathBuf> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-t" => {
                let Some(raw) = args.get(i + 1) else {
                    bail!("-t requires a lifetime in seconds");
                };
                let secs: u32 = raw
                    .parse()
                    .with_context(|| format!("invalid lifetime '{raw}'"))?;
                if secs == 0 {
                    bail!("lifetime must be greater than 0 seconds");
                }
                lifetime_secs = Some(secs);
                i += 1;
            }
            "-c" | "--confirm" => confirm = true,
            "-" => from_stdin = true,
            other if other.starts_with('-') => bail!("unknown flag for add: {other}"),
            path => files.push(PathBuf::from(path)),
        }
        i += 1;
    }

    if files.is_empty() && !from_stdin {
        files = default_key_files()?;
        if files.is_empty() {
            bail!(
                "no key files given and none of the default files exist \
                 (~/.ssh/id_ed25519, id_ecdsa, id_rsa)"
            );
        }
    }

    let mut client = connect().await?;

    if from_stdin {
        add_from_stdin(&mut client, lifetime_secs, confirm).await?;
    }
    for path in &files {
        warn_if_permissive(path);
        let key = load_and_decrypt(path)?;
        let comment = if key.comment().is_empty() {
            path.display().to_string()
        } else {
            key.comment().to_string()
        };
        client.add(&key, comment.clone(), lifetime_secs, confirm).await?;
        println!("Identity added: {} ({comment})", path.display());
        if let Some(secs) = lifetime_secs {
            println!("Lifetime set to {secs} seconds");
        }
    }
    Ok(())
}

/// Scan stdin for pasted PEM blocks and add every key found.
///
/// Encrypted blocks are refused rather than prompted for: stdin is already
/// consumed, and pasted material has no filename to prompt about.
async fn add_from_stdin(
    client: &mut AgentClient,
    lifetime_secs: Option<u32>,
    confirm: bool,
) -> Result<()> {
    use std::io::Read as _;

    let mut text = Zeroizing::new(String::new());
    std::io::stdin()
        .read_to_string(&mut text)
        .context("read key material from stdin")?;

    let keys = keyhold_agent::pem::extract_keys(&text);
    if keys.is_empty() {
        bail!("no private keys found on stdin");
    }

    for key in keys {
        let key = keyhold_agent::pem::ensure_plaintext(key)
            .context("encrypted keys cannot be added from stdin; decrypt first or use a file")?;
        let comment = if key.comment().is_empty() {
            "pasted-key".to_string()
        } else {
            key.comment().to_string()
        };
        client.add(&key, comment.clone(), lifetime_secs, confirm).await?;
        println!("Identity added: {comment}");
    }
    Ok(())
}

/// Default key files, in OpenSSH preference order, filtered to what exists.
fn default_key_files() -> Result<Vec<PathBuf>> {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .context("HOME is not set")?;
    let ssh_dir = home.join(".ssh");
    Ok(["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .filter(|p| p.exists())
        .collect())
}

/// Load a private key file, prompting for its passphrase when encrypted.
///
/// Three attempts, matching ssh-add; a wrong passphrase re-prompts, any
/// other error aborts.
fn load_and_decrypt(path: &Path) -> Result<PrivateKey> {
    let key = keyhold_agent::pem::load_key_file(path)
        .with_context(|| format!("load key file {}", path.display()))?;
    if !key.is_encrypted() {
        return Ok(key);
    }

    for attempt in 0..3 {
        let prompt = if attempt == 0 {
            format!("Enter passphrase for {}: ", path.display())
        } else {
            format!("Bad passphrase, try again for {}: ", path.display())
        };
        let passphrase = tty::prompt_hidden(&prompt)?;
        match keyhold_agent::pem::decrypt(&key, &passphrase) {
            Ok(decrypted) => return Ok(decrypted),
            Err(keyhold_core::KeyholdError::WrongPassphrase) => continue,
            Err(e) => return Err(e).context("decrypt key"),
        }
    }
    bail!("too many bad passphrases for {}", path.display());
}

/// Warn about key files OpenSSH itself would refuse to use.
fn warn_if_permissive(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt as _;
        if let Ok(meta) = std::fs::metadata(path) {
            let mode = meta.mode();
            if mode & 0o077 != 0 {
                eprintln!(
                    "WARNING: {} is accessible by group or others (mode {:o}); \
                     fix with: chmod 600 {}",
                    path.display(),
                    mode & 0o777,
                    path.display()
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// list / remove
// ---------------------------------------------------------------------------

async fn cmd_list(args: &[String]) -> Result<()> {
    let full = match args {
        [] => false,
        [flag] if flag == "-L" || flag == "--full" => true,
        _ => bail!("usage: keyhold list [-L]"),
    };

    let mut client = connect().await?;
    let identities = client.list().await?;
    if identities.is_empty() {
        println!("The agent has no identities.");
        return Ok(());
    }

    for identity in &identities {
        if full {
            let mut public = PublicKey::from(identity.pubkey.clone());
            public.set_comment(&identity.comment);
            match public.to_openssh() {
                Ok(line) => println!("{line}"),
                Err(e) => eprintln!("cannot serialise {}: {e}", identity.comment),
            }
        } else {
            println!(
                "{} {} ({})",
                identity.pubkey.fingerprint(HashAlg::Sha256),
                identity.comment,
                identity.pubkey.algorithm().as_str(),
            );
        }
    }
    Ok(())
}

async fn cmd_remove(args: &[String]) -> Result<()> {
    if args.is_empty() {
        bail!("usage: keyhold remove <keyfile|SHA256:fingerprint>...");
    }

    let mut client = connect().await?;
    for arg in args {
        let pubkey = resolve_removal_target(&mut client, arg).await?;
        let fingerprint = pubkey.fingerprint(HashAlg::Sha256);
        client.remove(pubkey).await?;
        println!("Identity removed: {fingerprint}");
    }
    Ok(())
}

/// Turn a removal argument into the public key the protocol wants.
///
/// `SHA256:…` fingerprints are matched against the agent's identity list;
/// anything else is treated as a key file path (`.pub`, or a private key
/// whose `.pub` sibling is used when present).
async fn resolve_removal_target(client: &mut AgentClient, arg: &str) -> Result<KeyData> {
    if arg.starts_with("SHA256:") {
        let identities = client.list().await?;
        return identities
            .into_iter()
            .find(|id| id.pubkey.fingerprint(HashAlg::Sha256).to_string() == arg)
            .map(|id| id.pubkey)
            .with_context(|| format!("agent holds no key with fingerprint {arg}"));
    }

    let path = Path::new(arg);
    if path.extension().is_some_and(|e| e == "pub") {
        return Ok(authorized_keys::load_public_key(path)?.key_data().clone());
    }

    let sibling = PathBuf::from(format!("{arg}.pub"));
    if sibling.exists() {
        return Ok(authorized_keys::load_public_key(&sibling)?.key_data().clone());
    }

    // Fall back to parsing the private key file; the public half is readable
    // even when the key is encrypted.
    let key = keyhold_agent::pem::load_key_file(path)
        .with_context(|| format!("load key file {arg}"))?;
    Ok(key.public_key().key_data().clone())
}

async fn cmd_remove_all() -> Result<()> {
    let mut client = connect().await?;
    client.remove_all().await?;
    println!("All identities removed.");
    Ok(())
}

// ---------------------------------------------------------------------------
// lock / unlock / status / env
// ---------------------------------------------------------------------------

async fn cmd_lock() -> Result<()> {
    let passphrase = tty::prompt_hidden("Enter lock passphrase: ")?;
    let again = tty::prompt_hidden("Again: ")?;
    if passphrase.as_str() != again.as_str() {
        bail!("passphrases do not match");
    }
    if passphrase.is_empty() {
        bail!("empty passphrase refused");
    }

    let mut client = connect().await?;
    client.lock(passphrase).await?;
    println!("Agent locked.");
    Ok(())
}

async fn cmd_unlock() -> Result<()> {
    let passphrase = tty::prompt_hidden("Enter unlock passphrase: ")?;
    let mut client = connect().await?;
    client.unlock(passphrase).await?;
    println!("Agent unlocked.");
    Ok(())
}

async fn cmd_status() -> Result<()> {
    let path = socket_path()?;
    println!("socket: {}", path.display());

    match AgentClient::connect(&path).await {
        Ok(mut client) => {
            let count = client.list().await?.len();
            println!("agent:  running");
            println!("keys:   {count}");
            if count == 0 {
                println!("        (none held — or the agent is locked)");
            }
        }
        Err(_) => {
            println!("agent:  not running");
        }
    }
    Ok(())
}

fn cmd_env() -> Result<()> {
    let path = socket_path()?;
    println!("SSH_AUTH_SOCK={}; export SSH_AUTH_SOCK;", path.display());
    Ok(())
}

// ---------------------------------------------------------------------------
// authorize
// ---------------------------------------------------------------------------

fn cmd_authorize(args: &[String]) -> Result<()> {
    let mut pubkey_file: Option<PathBuf> = None;
    let mut dir: Option<PathBuf> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--dir" => {
                let Some(d) = args.get(i + 1) else {
                    bail!("--dir requires a path argument");
                };
                dir = Some(PathBuf::from(d));
                i += 1;
            }
            other if other.starts_with('-') => bail!("unknown flag for authorize: {other}"),
            path if pubkey_file.is_none() => pubkey_file = Some(PathBuf::from(path)),
            extra => bail!("unexpected argument: {extra}"),
        }
        i += 1;
    }

    let Some(pubkey_file) = pubkey_file else {
        bail!("usage: keyhold authorize <pubkey.pub> [--dir <path>]");
    };
    let dir = match dir {
        Some(d) => d,
        None => std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".ssh"))
            .context("HOME is not set; pass --dir")?,
    };

    let key = authorized_keys::load_public_key(&pubkey_file)
        .with_context(|| format!("read public key {}", pubkey_file.display()))?;
    let appended = authorized_keys::authorize(&dir, &key)?;

    let fingerprint = key.fingerprint(HashAlg::Sha256);
    if appended {
        println!("Authorized {fingerprint} in {}", dir.join("authorized_keys").display());
    } else {
        println!("{fingerprint} is already authorized.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strip_socket_flag_removes_flag_and_value() {
        assert_eq!(
            strip_socket_flag(argv(&["add", "--socket", "/tmp/a.sock", "key"])),
            argv(&["add", "key"])
        );
        assert_eq!(
            strip_socket_flag(argv(&["list", "--socket=/tmp/a.sock", "-L"])),
            argv(&["list", "-L"])
        );
        assert_eq!(
            strip_socket_flag(argv(&["-s", "/tmp/a.sock", "status"])),
            argv(&["status"])
        );
        // Unrelated arguments pass through untouched.
        assert_eq!(strip_socket_flag(argv(&["remove", "id_rsa"])), argv(&["remove", "id_rsa"]));
    }
}
