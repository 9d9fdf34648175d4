//! SSH sessions into guest VMs.
//!
//! All guest interaction goes through [`GuestSession`]: command execution
//! with streamed output, SFTP file/directory upload, and disposal. The
//! production implementation is [`SshSession`] over libssh2; the trait seam
//! exists so the task supervisor can be exercised against a scripted
//! session in tests.
//!
//! Disposal is the cancellation primitive of the whole agent: shutting down
//! the cloned TCP stream fails any blocking channel read a sibling task is
//! waiting on, which surfaces as [`AgentError::SshDisposed`].

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ssh2::{OpenFlags, OpenType, Session, Sftp};
use tracing::{debug, trace};

use crate::error::AgentError;

/// How long a single TCP connect attempt may take while polling for SSH.
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between SSH readiness probes.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Authentication material for a guest user.
#[derive(Debug, Clone)]
pub enum SshAuth {
    Password(String),
    KeyFile(PathBuf),
}

/// Who to log in as, and how.
#[derive(Debug, Clone)]
pub struct SshCredentials {
    pub user: String,
    pub auth: SshAuth,
}

/// Byte-chunk callback invoked as output arrives.
pub type ChunkSink = Box<dyn FnMut(&[u8]) + Send>;

/// Options for a single exec.
#[derive(Default)]
pub struct ExecOpts {
    /// Working directory inside the guest.
    pub cwd: Option<String>,
    /// Environment additions, exported before the command runs.
    pub env: Vec<(String, String)>,
    /// Tolerate a non-zero exit and report it in the output instead of
    /// failing.
    pub allow_non_zero_exit_code: bool,
    /// Invoked with each raw stdout chunk as it arrives.
    pub on_stdout: Option<ChunkSink>,
    /// Invoked with each raw stderr chunk as it arrives.
    pub on_stderr: Option<ChunkSink>,
    /// Host-side path where a transcript of the output is appended.
    pub log_file_path: Option<PathBuf>,
    /// Wall-clock bound; on expiry the session is disposed and the exec
    /// fails.
    pub timeout: Option<Duration>,
}

/// Result of a completed exec.
#[derive(Debug)]
pub struct ExecOutput {
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Stdout as a lossy string, trimmed. Convenience for commands that
    /// print a single token.
    pub fn stdout_trimmed(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }
}

/// Command execution and file transfer into one guest.
#[async_trait]
pub trait GuestSession: Send + Sync {
    /// Run a shell command, streaming output through the opts callbacks.
    async fn exec(&self, command: &str, opts: ExecOpts) -> Result<ExecOutput>;

    /// Write a file over SFTP with the given mode.
    async fn write_file(&self, path: &str, content: Vec<u8>, mode: i32) -> Result<()>;

    /// Recursively upload a local directory.
    async fn put_directory(&self, local_dir: PathBuf, remote_dir: String) -> Result<()>;

    /// Close the underlying transport. Any in-flight exec fails with
    /// [`AgentError::SshDisposed`]. Idempotent.
    fn dispose(&self);
}

/// Authenticated SSH session to a single VM.
pub struct SshSession {
    session: Arc<Mutex<Session>>,
    tcp: TcpStream,
    disposed: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl SshSession {
    /// Connect and authenticate, retrying until `deadline` elapses. The VM
    /// may still be booting, so connection refusals and handshake resets
    /// are retried rather than surfaced.
    pub async fn connect(
        addr: SocketAddr,
        creds: SshCredentials,
        deadline: Duration,
    ) -> Result<Self> {
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let mut last_err = anyhow!("SSH never attempted");

            loop {
                match Self::try_connect(addr, &creds) {
                    Ok(session) => return Ok(session),
                    Err(err) => {
                        trace!(peer = %addr, error = %err, "SSH not ready yet");
                        last_err = err;
                    }
                }

                if start.elapsed() >= deadline {
                    return Err(last_err
                        .context(format!("SSH to {} not ready after {:?}", addr, deadline)));
                }
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
        })
        .await
        .context("SSH connect task panicked")?
    }

    fn try_connect(addr: SocketAddr, creds: &SshCredentials) -> Result<Self> {
        let tcp = TcpStream::connect_timeout(&addr, CONNECT_ATTEMPT_TIMEOUT)?;
        let tcp_clone = tcp.try_clone().context("cloning SSH transport")?;

        let mut session = Session::new().context("creating SSH session")?;
        session.set_tcp_stream(tcp);
        session.handshake().context("SSH handshake")?;

        match &creds.auth {
            SshAuth::Password(password) => session
                .userauth_password(&creds.user, password)
                .context("SSH password auth")?,
            SshAuth::KeyFile(key_path) => session
                .userauth_pubkey_file(&creds.user, None, key_path, None)
                .context("SSH pubkey auth")?,
        }

        if !session.authenticated() {
            anyhow::bail!("SSH authentication for {} failed", creds.user);
        }

        debug!(peer = %addr, user = %creds.user, "SSH session established");

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            tcp: tcp_clone,
            disposed: Arc::new(AtomicBool::new(false)),
            peer: addr,
        })
    }
}

#[async_trait]
impl GuestSession for SshSession {
    async fn exec(&self, command: &str, mut opts: ExecOpts) -> Result<ExecOutput> {
        let timeout = opts.timeout.take();
        let allow_non_zero = opts.allow_non_zero_exit_code;

        let full_command = build_command(command, opts.cwd.as_deref(), &opts.env);
        let session = Arc::clone(&self.session);
        let disposed = Arc::clone(&self.disposed);
        let on_stdout = opts.on_stdout.take();
        let on_stderr = opts.on_stderr.take();
        let log_file_path = opts.log_file_path.take();

        let task = tokio::task::spawn_blocking(move || {
            exec_blocking(
                session,
                disposed,
                full_command,
                on_stdout,
                on_stderr,
                log_file_path,
            )
        });

        let output = match timeout {
            Some(limit) => match tokio::time::timeout(limit, task).await {
                Ok(joined) => joined.context("SSH exec task panicked")??,
                Err(_) => {
                    // The blocking read unblocks once the socket is shut
                    // down; the orphaned task then exits on its own.
                    self.dispose();
                    return Err(anyhow::Error::new(AgentError::SshDisposed)
                        .context(format!("exec exceeded timeout of {:?}", limit)));
                }
            },
            None => task.await.context("SSH exec task panicked")??,
        };

        if output.code != 0 && !allow_non_zero {
            return Err(AgentError::SshExecFailed {
                code: output.code,
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            }
            .into());
        }

        Ok(output)
    }

    async fn write_file(&self, path: &str, content: Vec<u8>, mode: i32) -> Result<()> {
        let session = Arc::clone(&self.session);
        let disposed = Arc::clone(&self.disposed);
        let path = path.to_string();

        tokio::task::spawn_blocking(move || {
            let guard = lock_session(&session)?;
            let sftp = guard.sftp().map_err(|e| ssh_err(&disposed, e.into()))?;

            let mut file = sftp
                .open_mode(
                    Path::new(&path),
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    mode,
                    OpenType::File,
                )
                .map_err(|e| ssh_err(&disposed, e.into()))
                .with_context(|| format!("opening {} over SFTP", path))?;

            file.write_all(&content)
                .map_err(|e| ssh_err(&disposed, e.into()))
                .with_context(|| format!("writing {} over SFTP", path))?;
            Ok(())
        })
        .await
        .context("SFTP write task panicked")?
    }

    async fn put_directory(&self, local_dir: PathBuf, remote_dir: String) -> Result<()> {
        let session = Arc::clone(&self.session);
        let disposed = Arc::clone(&self.disposed);

        tokio::task::spawn_blocking(move || {
            let guard = lock_session(&session)?;
            let sftp = guard.sftp().map_err(|e| ssh_err(&disposed, e.into()))?;
            put_tree(&sftp, &local_dir, &remote_dir)
        })
        .await
        .context("SFTP upload task panicked")?
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self.peer, "Disposing SSH session");
        let _ = self.tcp.shutdown(Shutdown::Both);
    }
}

/// Wrap command execution in `bash -c`, with env exports and cwd applied
/// inside the guest shell. `setenv` over the wire is rejected by stock sshd
/// configs, so the environment travels in the script instead.
fn build_command(command: &str, cwd: Option<&str>, env: &[(String, String)]) -> String {
    let mut script = String::new();
    for (key, value) in env {
        script.push_str(&format!("export {}={}\n", key, shell_quote(value)));
    }
    if let Some(dir) = cwd {
        script.push_str(&format!("cd {}\n", shell_quote(dir)));
    }
    script.push_str(command);
    format!("bash -c {}", shell_quote(&script))
}

/// Single-quote a string for POSIX shells.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn lock_session(session: &Arc<Mutex<Session>>) -> Result<std::sync::MutexGuard<'_, Session>> {
    session
        .lock()
        .map_err(|_| anyhow!("SSH session mutex poisoned"))
}

/// Map a transport failure: if the session was disposed concurrently, the
/// error is the cancellation signal, not a transport fault.
fn ssh_err(disposed: &AtomicBool, err: anyhow::Error) -> anyhow::Error {
    if disposed.load(Ordering::SeqCst) {
        anyhow::Error::new(AgentError::SshDisposed)
    } else {
        err
    }
}

fn exec_blocking(
    session: Arc<Mutex<Session>>,
    disposed: Arc<AtomicBool>,
    command: String,
    mut on_stdout: Option<ChunkSink>,
    mut on_stderr: Option<ChunkSink>,
    log_file_path: Option<PathBuf>,
) -> Result<ExecOutput> {
    let guard = lock_session(&session)?;

    let mut channel = guard
        .channel_session()
        .map_err(|e| ssh_err(&disposed, e.into()))
        .context("opening SSH channel")?;
    channel
        .exec(&command)
        .map_err(|e| ssh_err(&disposed, e.into()))
        .context("starting remote command")?;

    let mut log_file = match &log_file_path {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening transcript {}", path.display()))?,
        ),
        None => None,
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = channel
            .read(&mut buf)
            .map_err(|e| ssh_err(&disposed, e.into()))
            .context("reading remote stdout")?;
        if n == 0 {
            break;
        }
        let chunk = &buf[..n];
        stdout.extend_from_slice(chunk);
        if let Some(sink) = on_stdout.as_mut() {
            sink(chunk);
        }
        if let Some(file) = log_file.as_mut() {
            file.write_all(chunk).context("appending transcript")?;
        }
    }

    {
        let mut err_stream = channel.stderr();
        loop {
            let n = err_stream
                .read(&mut buf)
                .map_err(|e| ssh_err(&disposed, e.into()))
                .context("reading remote stderr")?;
            if n == 0 {
                break;
            }
            let chunk = &buf[..n];
            stderr.extend_from_slice(chunk);
            if let Some(sink) = on_stderr.as_mut() {
                sink(chunk);
            }
            if let Some(file) = log_file.as_mut() {
                file.write_all(chunk).context("appending transcript")?;
            }
        }
    }

    channel
        .wait_close()
        .map_err(|e| ssh_err(&disposed, e.into()))
        .context("waiting for channel close")?;
    let code = channel
        .exit_status()
        .map_err(|e| ssh_err(&disposed, e.into()))
        .context("reading exit status")?;

    Ok(ExecOutput {
        code,
        stdout,
        stderr,
    })
}

fn put_tree(sftp: &Sftp, local: &Path, remote: &str) -> Result<()> {
    if sftp.stat(Path::new(remote)).is_err() {
        sftp.mkdir(Path::new(remote), 0o755)
            .with_context(|| format!("creating remote dir {}", remote))?;
    }

    for entry in std::fs::read_dir(local)
        .with_context(|| format!("reading local dir {}", local.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let remote_path = format!("{}/{}", remote, name);

        if path.is_dir() {
            put_tree(sftp, &path, &remote_path)?;
        } else {
            use std::os::unix::fs::PermissionsExt;
            let mode = (entry.metadata()?.permissions().mode() & 0o777) as i32;
            let content = std::fs::read(&path)?;

            let mut file = sftp
                .open_mode(
                    Path::new(&remote_path),
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    mode,
                    OpenType::File,
                )
                .with_context(|| format!("opening remote file {}", remote_path))?;
            file.write_all(&content)
                .with_context(|| format!("writing remote file {}", remote_path))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("abc"), "'abc'");
    }

    #[test]
    fn test_shell_quote_embedded_quote() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_build_command_env_and_cwd() {
        let cmd = build_command(
            "git fetch --all",
            Some("/home/hocus/dev/project"),
            &[(
                "GIT_SSH_COMMAND".to_string(),
                "ssh -o StrictHostKeyChecking=no".to_string(),
            )],
        );

        assert!(cmd.starts_with("bash -c '"));
        assert!(cmd.contains("export GIT_SSH_COMMAND="));
        assert!(cmd.contains("cd '\\''/home/hocus/dev/project'\\''"));
        assert!(cmd.contains("git fetch --all"));
    }

    #[test]
    fn test_build_command_bare() {
        let cmd = build_command("echo hi", None, &[]);
        assert_eq!(cmd, "bash -c 'echo hi'");
    }
}
