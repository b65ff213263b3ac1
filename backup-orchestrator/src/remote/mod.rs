//! SSH access to remote hosts: command execution and SFTP file movement.
//!
//! Every command is rendered with each argument single-quoted, so unit names
//! and paths can never splice into the shell line. All calls here block; the
//! pipeline runs them inside `tokio::task::spawn_blocking`.

use std::fmt;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use crate::error::PipelineError;

/// Address and credentials for one SSH endpoint.
#[derive(Clone)]
pub struct RemoteHost {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
}

impl fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteHost")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Single-quote a string for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    let mut quoted = String::with_capacity(s.len() + 2);
    quoted.push('\'');
    for c in s.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}

/// A remote command built from a fixed program name and quoted arguments.
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    program: String,
    args: Vec<String>,
    sudo_password: Option<String>,
}

impl RemoteCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            sudo_password: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Run the command under `sudo -S`, feeding the password on stdin.
    pub fn sudo(mut self, password: &str) -> Self {
        self.sudo_password = Some(password.to_string());
        self
    }

    pub fn sudo_password(&self) -> Option<&str> {
        self.sudo_password.as_deref()
    }

    pub fn render(&self) -> String {
        let mut line = String::new();
        if self.sudo_password.is_some() {
            line.push_str("sudo -S ");
        }
        line.push_str(&self.program);
        for arg in &self.args {
            line.push(' ');
            line.push_str(&shell_quote(arg));
        }
        line
    }
}

/// Structured result of one remote command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Shell and file operations against one connected host.
pub trait RemoteShell: Send + Sync {
    fn exec(&self, cmd: &RemoteCommand) -> Result<ExecOutput, PipelineError>;
    fn upload(&self, local: &Path, remote: &str) -> Result<(), PipelineError>;
    fn download(&self, remote: &str, local: &Path) -> Result<(), PipelineError>;
    fn mkdir_p(&self, remote: &str) -> Result<(), PipelineError>;
    fn read_dir(&self, remote: &str) -> Result<Vec<RemoteEntry>, PipelineError>;
    fn is_dir(&self, remote: &str) -> Result<bool, PipelineError>;
    fn exists(&self, remote: &str) -> Result<bool, PipelineError>;
}

/// Opens shells. The orchestrator and the wide-column driver share one
/// implementation; tests substitute fakes.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, host: &RemoteHost) -> Result<Arc<dyn RemoteShell>, PipelineError>;
}

pub struct SshConnector;

impl RemoteConnector for SshConnector {
    fn connect(&self, host: &RemoteHost) -> Result<Arc<dyn RemoteShell>, PipelineError> {
        Ok(Arc::new(SshSession::open(host)?))
    }
}

/// An authenticated ssh2 session. A job owns its session exclusively and uses
/// it sequentially; the mutex only upholds that contract. Dropping the
/// session disconnects it, so a job that exits on any path releases its
/// remote side.
pub struct SshSession {
    sess: std::sync::Mutex<ssh2::Session>,
}

impl SshSession {
    pub fn open(host: &RemoteHost) -> Result<Self, PipelineError> {
        let addr = format!("{}:{}", host.host, host.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| PipelineError::RemoteUnreachable(format!("{addr}: {e}")))?;

        let mut sess = ssh2::Session::new().map_err(session_err)?;
        sess.set_tcp_stream(tcp);
        sess.handshake()
            .map_err(|e| PipelineError::RemoteUnreachable(format!("{addr}: handshake: {e}")))?;
        sess.userauth_password(&host.user, &host.password)
            .map_err(|e| {
                PipelineError::RemoteUnreachable(format!("{addr}: authentication failed: {e}"))
            })?;
        if !sess.authenticated() {
            return Err(PipelineError::RemoteUnreachable(format!(
                "{addr}: authentication failed"
            )));
        }

        Ok(Self {
            sess: std::sync::Mutex::new(sess),
        })
    }

    fn session(&self) -> Result<std::sync::MutexGuard<'_, ssh2::Session>, PipelineError> {
        self.sess
            .lock()
            .map_err(|_| PipelineError::Internal("remote session lock poisoned".into()))
    }

    fn sftp(&self) -> Result<ssh2::Sftp, PipelineError> {
        self.session()?.sftp().map_err(session_err)
    }
}

impl RemoteShell for SshSession {
    fn exec(&self, cmd: &RemoteCommand) -> Result<ExecOutput, PipelineError> {
        let mut channel = self.session()?.channel_session().map_err(session_err)?;
        channel.exec(&cmd.render()).map_err(session_err)?;

        if let Some(password) = cmd.sudo_password() {
            writeln!(channel, "{password}").map_err(session_err)?;
        }

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).map_err(session_err)?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(session_err)?;

        channel.wait_close().map_err(session_err)?;
        let exit_code = channel.exit_status().map_err(session_err)?;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<(), PipelineError> {
        let data = std::fs::read(local)?;
        let sftp = self.sftp()?;
        let mut file = sftp.create(Path::new(remote)).map_err(session_err)?;
        file.write_all(&data).map_err(session_err)?;
        Ok(())
    }

    fn download(&self, remote: &str, local: &Path) -> Result<(), PipelineError> {
        let sftp = self.sftp()?;
        let mut file = sftp.open(Path::new(remote)).map_err(session_err)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).map_err(session_err)?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, data)?;
        Ok(())
    }

    fn mkdir_p(&self, remote: &str) -> Result<(), PipelineError> {
        let out = self.exec(&RemoteCommand::new("mkdir").arg("-p").arg(remote))?;
        if !out.success() {
            return Err(PipelineError::Internal(format!(
                "failed to create remote directory {remote}: {}",
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    fn read_dir(&self, remote: &str) -> Result<Vec<RemoteEntry>, PipelineError> {
        let sftp = self.sftp()?;
        let entries = sftp.readdir(Path::new(remote)).map_err(session_err)?;
        Ok(entries
            .into_iter()
            .filter_map(|(path, stat)| {
                path.file_name().map(|n| RemoteEntry {
                    name: n.to_string_lossy().to_string(),
                    is_dir: stat.is_dir(),
                })
            })
            .collect())
    }

    fn is_dir(&self, remote: &str) -> Result<bool, PipelineError> {
        let sftp = self.sftp()?;
        let stat = sftp.stat(Path::new(remote)).map_err(session_err)?;
        Ok(stat.is_dir())
    }

    fn exists(&self, remote: &str) -> Result<bool, PipelineError> {
        let sftp = self.sftp()?;
        Ok(sftp.stat(Path::new(remote)).is_ok())
    }
}

fn session_err(e: impl fmt::Display) -> PipelineError {
    PipelineError::Internal(format!("remote session error: {e}"))
}

/// Recursively copy a remote file or directory tree to the local filesystem.
/// Returns the number of files copied.
pub fn download_tree(
    shell: &dyn RemoteShell,
    remote: &str,
    local: &Path,
) -> Result<usize, PipelineError> {
    if !shell.is_dir(remote)? {
        shell.download(remote, local)?;
        return Ok(1);
    }

    std::fs::create_dir_all(local)?;
    let mut copied = 0;
    for entry in shell.read_dir(remote)? {
        let remote_child = format!("{}/{}", remote.trim_end_matches('/'), entry.name);
        let local_child = local.join(&entry.name);
        if entry.is_dir {
            copied += download_tree(shell, &remote_child, &local_child)?;
        } else {
            shell.download(&remote_child, &local_child)?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Recursively copy a local file or directory tree to the remote host.
/// Returns the number of files copied.
pub fn upload_tree(
    shell: &dyn RemoteShell,
    local: &Path,
    remote: &str,
) -> Result<usize, PipelineError> {
    if local.is_file() {
        shell.upload(local, remote)?;
        return Ok(1);
    }

    shell.mkdir_p(remote)?;
    let mut copied = 0;
    for entry in walkdir::WalkDir::new(local) {
        let entry = entry.map_err(|e| PipelineError::Internal(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(local)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let remote_path = format!("{}/{}", remote.trim_end_matches('/'), relative);
        if let Some(idx) = remote_path.rfind('/') {
            shell.mkdir_p(&remote_path[..idx])?;
        }
        shell.upload(entry.path(), &remote_path)?;
        copied += 1;
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_and_hostile_args() {
        assert_eq!(shell_quote("simple"), "'simple'");
        assert_eq!(shell_quote("with space"), "'with space'");
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn renders_quoted_command_line() {
        let cmd = RemoteCommand::new("nodetool")
            .arg("snapshot")
            .arg("-t")
            .arg("label; rm -rf /");
        assert_eq!(
            cmd.render(),
            "nodetool 'snapshot' '-t' 'label; rm -rf /'"
        );
    }

    #[test]
    fn renders_sudo_prefix() {
        let cmd = RemoteCommand::new("systemctl")
            .arg("restart")
            .arg("scylla-server")
            .sudo("secret");
        assert_eq!(cmd.render(), "sudo -S systemctl 'restart' 'scylla-server'");
        assert_eq!(cmd.sudo_password(), Some("secret"));
    }
}
