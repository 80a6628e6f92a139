//! Media-engine worker process
//!
//! Each worker owns one child process bound to its shard's UDP port range and
//! the control channel on the parent end of a Unix socket pair.

use crate::channel::{Channel, Notification};
use crate::config::SfuConfig;
use crate::error::{Error, Result};
use crate::types::ShardId;
use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use std::os::unix::io::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Environment variable carrying the control channel fd number
pub const CHANNEL_FD_ENV: &str = "MEDIASOUP_CHANNEL_FD";

/// What a shard's engine is launched with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSpec {
    pub shard: ShardId,
    pub min_port: u16,
    pub max_port: u16,
}

/// How a worker process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub shard: ShardId,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// Clean exit with status 0
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// A running worker as seen by the pool
pub struct LaunchedWorker {
    pub channel: Arc<Channel>,
    /// Fires once when the process ends
    pub exited: oneshot::Receiver<WorkerExit>,
    /// Cancel to terminate the process
    pub shutdown: CancellationToken,
}

/// Starts engine workers for the pool
#[async_trait]
pub trait WorkerLauncher: Send + Sync + 'static {
    async fn launch(
        &self,
        spec: &ShardSpec,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) -> Result<LaunchedWorker>;
}

/// Command-line arguments for a shard's engine process
#[must_use]
pub fn worker_args(config: &SfuConfig, spec: &ShardSpec) -> Vec<String> {
    let mut args = vec![
        format!("soupd#{}", spec.shard),
        format!("--logLevel={}", config.log_level),
    ];
    args.extend(config.log_tags.iter().map(|tag| format!("--logTag={tag}")));
    args.push(format!("--rtcIPv4={}", config.rtc_ipv4));
    args.push(format!("--rtcIPv6={}", config.rtc_ipv6));
    args.push(format!("--rtcMinPort={}", spec.min_port));
    args.push(format!("--rtcMaxPort={}", spec.max_port));
    args
}

/// Spawns real engine processes
pub struct ProcessLauncher {
    config: Arc<SfuConfig>,
}

impl ProcessLauncher {
    #[must_use]
    pub const fn new(config: Arc<SfuConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(
        &self,
        spec: &ShardSpec,
        notify_tx: mpsc::UnboundedSender<Notification>,
    ) -> Result<LaunchedWorker> {
        let shard = spec.shard;
        let (parent, child_end) = std::os::unix::net::UnixStream::pair()?;
        parent.set_nonblocking(true)?;

        // Let the child inherit its end of the pair.
        let child_fd = child_end.as_raw_fd();
        fcntl(child_fd, FcntlArg::F_SETFD(FdFlag::empty()))
            .map_err(|e| Error::Spawn(format!("clear FD_CLOEXEC on channel fd: {e}")))?;

        let args = worker_args(&self.config, spec);
        let mut child = Command::new(&self.config.worker_bin)
            .args(&args)
            .env(CHANNEL_FD_ENV, child_fd.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::Spawn(format!("{}: {e}", self.config.worker_bin.display()))
            })?;
        drop(child_end);

        info!(
            shard,
            pid = child.id(),
            min_port = spec.min_port,
            max_port = spec.max_port,
            "media engine worker spawned"
        );

        let stream = tokio::net::UnixStream::from_std(parent)?;
        let channel = Channel::new(stream, shard, self.config.request_timeout(), notify_tx);

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(shard, "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(shard, "stderr", stderr));
        }

        let (exit_tx, exited) = oneshot::channel();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                () = token.cancelled() => {
                    debug!(shard, "terminating media engine worker");
                    if let Err(e) = child.kill().await {
                        warn!(shard, error = %e, "failed to kill media engine worker");
                    }
                    child.wait().await
                }
            };
            let exit = match status {
                Ok(status) => WorkerExit {
                    shard,
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    error!(shard, error = %e, "child process error");
                    WorkerExit {
                        shard,
                        code: None,
                        signal: None,
                    }
                }
            };
            if !exit.is_success() {
                error!(
                    shard,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "child process exited"
                );
            }
            let _ = exit_tx.send(exit);
        });

        Ok(LaunchedWorker {
            channel,
            exited,
            shutdown,
        })
    }
}

/// Re-emit a child's output stream line by line
async fn forward_lines<R>(shard: ShardId, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.is_empty() => {}
            Ok(Some(line)) => {
                if stream == "stderr" {
                    warn!(target: "soupd::engine", shard, stream, "{line}");
                } else {
                    debug!(target: "soupd::engine", shard, stream, "{line}");
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(shard, stream, error = %e, "failed to read worker output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_args() {
        let config = SfuConfig {
            log_level: "warn".to_string(),
            log_tags: vec!["ice".to_string(), "dtls".to_string()],
            rtc_ipv6: false,
            ..Default::default()
        };
        let spec = ShardSpec {
            shard: 2,
            min_port: 40000,
            max_port: 40999,
        };
        assert_eq!(
            worker_args(&config, &spec),
            vec![
                "soupd#2",
                "--logLevel=warn",
                "--logTag=ice",
                "--logTag=dtls",
                "--rtcIPv4=true",
                "--rtcIPv6=false",
                "--rtcMinPort=40000",
                "--rtcMaxPort=40999",
            ]
        );
    }

    #[test]
    fn test_worker_exit_success() {
        let exit = WorkerExit {
            shard: 0,
            code: Some(0),
            signal: None,
        };
        assert!(exit.is_success());
        let exit = WorkerExit {
            shard: 0,
            code: None,
            signal: Some(9),
        };
        assert!(!exit.is_success());
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let config = SfuConfig {
            worker_bin: "/nonexistent/mediasoup-worker".into(),
            ..Default::default()
        };
        let launcher = ProcessLauncher::new(Arc::new(config));
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = ShardSpec {
            shard: 0,
            min_port: 10000,
            max_port: 20000,
        };
        let err = launcher.launch(&spec, tx).await.err();
        assert!(matches!(err, Some(Error::Spawn(_))));
    }
}
