//! [`RemoteTransport`] over the system `ssh` and `rsync` clients.

use std::ffi::OsString;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use super::{RemoteError, RemoteFuture, RemoteTransport, SshOptions, SyncRequest};
use crate::instance::SshEndpoint;
use crate::output::SharedOutput;
use crate::util::expand_tilde;

/// Text `ssh` prints on stderr when the host key cannot be verified.
pub const HOST_KEY_FAILURE_MARKER: &str = "Host key verification failed";

const SSH_CLIENT_FAILURE: i32 = 255;

/// Transport spawning one `ssh` process per command.
#[derive(Clone, Debug, Default)]
pub struct SshTransport {
    options: SshOptions,
}

impl SshTransport {
    /// Creates a transport with the given client settings.
    #[must_use]
    pub const fn new(options: SshOptions) -> Self {
        Self { options }
    }

    /// Returns the client settings.
    #[must_use]
    pub const fn options(&self) -> &SshOptions {
        &self.options
    }

    /// Renders an interactive `ssh` invocation for an operator to paste.
    #[must_use]
    pub fn interactive_command(&self, endpoint: &SshEndpoint) -> String {
        let mut parts = vec![self.options.ssh_bin.clone()];
        parts.extend(
            self.ssh_options_for(endpoint, false)
                .into_iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.push(endpoint.ssh_target());
        parts.join(" ")
    }

    pub(crate) fn ssh_args(&self, endpoint: &SshEndpoint, command: &str) -> Vec<OsString> {
        let mut args = self.common_ssh_options(endpoint);
        args.push(OsString::from(endpoint.ssh_target()));
        args.push(OsString::from(command));
        args
    }

    pub(crate) fn rsync_args(&self, endpoint: &SshEndpoint, request: &SyncRequest) -> Vec<OsString> {
        let mut args = vec![OsString::from("-pthrvz"), OsString::from("-L")];
        args.extend(
            request
                .excludes
                .iter()
                .map(|pattern| OsString::from(format!("--exclude={pattern}"))),
        );
        args.push(OsString::from("-e"));
        args.push(OsString::from(self.build_remote_shell(endpoint)));
        args.push(OsString::from(format!("{}/", request.source)));
        args.push(OsString::from(format!(
            "{}:{}",
            endpoint.ssh_target(),
            request.destination
        )));
        args
    }

    fn common_ssh_options(&self, endpoint: &SshEndpoint) -> Vec<OsString> {
        self.ssh_options_for(endpoint, self.options.batch_mode)
    }

    fn ssh_options_for(&self, endpoint: &SshEndpoint, batch_mode: bool) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(endpoint.port.to_string()),
        ];

        if let Some(ref identity_file) = endpoint.key_path {
            args.push(OsString::from("-i"));
            args.push(OsString::from(expand_tilde(identity_file)));
        }

        if batch_mode {
            args.push(OsString::from("-o"));
            args.push(OsString::from("BatchMode=yes"));
        }

        if !self.options.strict_host_key_checking {
            args.push(OsString::from("-o"));
            args.push(OsString::from("StrictHostKeyChecking=no"));
        }

        if !self.options.known_hosts_file.trim().is_empty() {
            args.push(OsString::from("-o"));
            args.push(OsString::from(format!(
                "UserKnownHostsFile={}",
                self.options.known_hosts_file
            )));
        }

        args
    }

    fn build_remote_shell(&self, endpoint: &SshEndpoint) -> String {
        let opts = self
            .common_ssh_options(endpoint)
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        format!("{} {}", self.options.ssh_bin, opts)
    }

    async fn run_ssh(
        &self,
        endpoint: &SshEndpoint,
        command: &str,
        sink: &SharedOutput,
    ) -> Result<Option<i32>, RemoteError> {
        let program = self.options.ssh_bin.as_str();
        debug!(host = %endpoint.host, command, "starting remote command");
        let mut child = Command::new(program)
            .args(self.ssh_args(endpoint, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| RemoteError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        let io_error = |message: &str| RemoteError::Io {
            program: program.to_owned(),
            message: message.to_owned(),
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error("stderr was not captured"))?;

        let (stdout_result, stderr_result, status) = tokio::join!(
            drain_lines(stdout, |line| {
                sink.push_stdout(line);
                false
            }),
            drain_lines(stderr, |line| {
                let trust_failure = line.contains(HOST_KEY_FAILURE_MARKER);
                sink.push_stderr(line);
                trust_failure
            }),
            child.wait(),
        );
        stdout_result.map_err(|err| io_error(&err.to_string()))?;
        let trust_failure = stderr_result.map_err(|err| io_error(&err.to_string()))?;
        let code = status.map_err(|err| io_error(&err.to_string()))?.code();

        if trust_failure && code == Some(SSH_CLIENT_FAILURE) {
            return Err(RemoteError::HostKeyUnverifiable {
                host: endpoint.host.clone(),
            });
        }
        Ok(code)
    }

    async fn run_rsync(
        &self,
        endpoint: &SshEndpoint,
        request: &SyncRequest,
    ) -> Result<(), RemoteError> {
        if !request.source.is_dir() {
            return Err(RemoteError::MissingSource {
                path: request.source.clone(),
            });
        }
        let program = self.options.rsync_bin.as_str();
        debug!(host = %endpoint.host, destination = %request.destination, "starting rsync");
        let output = Command::new(program)
            .args(self.rsync_args(endpoint, request))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| RemoteError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        if stderr.contains(HOST_KEY_FAILURE_MARKER) {
            return Err(RemoteError::HostKeyUnverifiable {
                host: endpoint.host.clone(),
            });
        }
        Err(RemoteError::SyncFailure {
            program: program.to_owned(),
            status_text: output
                .status
                .code()
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr,
        })
    }
}

/// Forwards every line of `stream` to `on_line`, returning whether any call
/// reported `true`.
///
/// Bytes that are not valid UTF-8 are replaced rather than ending the read.
async fn drain_lines<S, F>(stream: S, mut on_line: F) -> std::io::Result<bool>
where
    S: AsyncRead + Unpin,
    F: FnMut(String) -> bool,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut flagged = false;
    while reader.read_until(b'\n', &mut buf).await? > 0 {
        let without_lf = buf.strip_suffix(b"\n").unwrap_or(&buf);
        let bytes = without_lf.strip_suffix(b"\r").unwrap_or(without_lf);
        flagged |= on_line(String::from_utf8_lossy(bytes).into_owned());
        buf.clear();
    }
    Ok(flagged)
}

impl RemoteTransport for SshTransport {
    fn exec<'a>(
        &'a self,
        endpoint: &'a SshEndpoint,
        command: &'a str,
        sink: &'a SharedOutput,
    ) -> RemoteFuture<'a, Option<i32>> {
        Box::pin(self.run_ssh(endpoint, command, sink))
    }

    fn sync<'a>(
        &'a self,
        endpoint: &'a SshEndpoint,
        request: &'a SyncRequest,
    ) -> RemoteFuture<'a, ()> {
        Box::pin(self.run_rsync(endpoint, request))
    }
}
