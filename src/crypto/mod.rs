//! GPG subprocess pipelines.
//!
//! Encryption and decryption shell out to `gpg` with piped stdio, the same
//! way the delta codec drives its external binary: the child is spawned
//! per transfer, fed by a background task, and its exit status is checked
//! before the transfer may succeed. Backpressure comes from the OS pipe
//! buffers plus the pull-based part loop, so a slow uploader blocks the
//! plaintext reader instead of buffering the object in memory.

mod agent;

pub use agent::AgentProxy;

use crate::error::{Error, Result};
use crate::pipeline::parts::{Md5Tap, ReaderParts};
use crate::store::PartSource;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

const FEED_CHUNK: usize = 64 * 1024;

/// Encryption settings for a pipeline instance.
#[derive(Clone, Default)]
pub struct CryptoContext {
    /// GPG recipient; uploads are encrypted iff set.
    pub keyid: Option<String>,
    /// Passphrase proxy for batch decryption, if the operator supplied one.
    pub agent: Option<Arc<AgentProxy>>,
}

impl CryptoContext {
    /// Build from config: encrypt for `keyid` when given, and stand up the
    /// passphrase proxy iff `SFS3_PASSPHRASE` is set (otherwise gpg's own
    /// agent handles prompting).
    pub fn from_env(keyid: Option<String>) -> Result<Self> {
        let agent = match std::env::var("SFS3_PASSPHRASE") {
            Ok(pass) if !pass.is_empty() => Some(Arc::new(
                AgentProxy::spawn(pass).map_err(|e| Error::Crypto(e.to_string()))?,
            )),
            _ => None,
        };
        Ok(Self { keyid, agent })
    }
}

fn gpg_command(agent: Option<&AgentProxy>) -> Command {
    let mut cmd = Command::new("gpg");
    cmd.args(["--batch", "--yes", "--quiet", "--no-tty"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(agent) = agent {
        // historical agent handoff format: <socket>:<pid>:<protocol>
        cmd.env(
            "GPG_AGENT_INFO",
            format!("{}:0:1", agent.socket_path().display()),
        );
    }
    cmd
}

/// Collect stderr and exit status once the output side is drained.
async fn wait_gpg(mut child: Child) -> Result<()> {
    let mut stderr = String::new();
    if let Some(mut pipe) = child.stderr.take() {
        let _ = pipe.read_to_string(&mut stderr).await;
    }
    let status = child
        .wait()
        .await
        .map_err(|e| Error::Crypto(format!("gpg: {}", e)))?;
    if status.success() {
        Ok(())
    } else {
        Err(Error::Crypto(format!(
            "gpg exited with {}: {}",
            status,
            stderr.trim()
        )))
    }
}

/// Part source producing ciphertext: plaintext is pumped through
/// `gpg --encrypt` while the rolling MD5 is fed the plaintext, and the
/// parts are sliced from gpg's stdout.
pub struct GpgEncryptParts {
    inner: ReaderParts<ChildStdout>,
    child: Option<Child>,
    feeder: Option<JoinHandle<Result<()>>>,
}

impl GpgEncryptParts {
    pub fn spawn<R>(reader: R, keyid: &str, part_size: usize, tap: Md5Tap) -> Result<Self>
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
    {
        let mut cmd = gpg_command(None);
        cmd.args(["--encrypt", "--recipient", keyid, "--output", "-"]);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Crypto(format!("failed to spawn gpg: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Crypto("gpg stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Crypto("gpg stdout unavailable".to_string()))?;

        debug!(keyid, "spawned gpg encrypt pipeline");

        let feeder = tokio::spawn(async move {
            let mut reader = reader;
            let mut buf = vec![0u8; FEED_CHUNK];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                tap.update(&buf[..n]);
                stdin
                    .write_all(&buf[..n])
                    .await
                    .map_err(|e| Error::Crypto(format!("gpg stdin: {}", e)))?;
            }
            // EOF on stdin lets gpg flush the final cipher block
            drop(stdin);
            Ok(())
        });

        Ok(Self {
            inner: ReaderParts::new(stdout, part_size, None),
            child: Some(child),
            feeder: Some(feeder),
        })
    }
}

#[async_trait]
impl PartSource for GpgEncryptParts {
    async fn next_part(&mut self) -> Result<Option<Bytes>> {
        match self.inner.next_part().await? {
            Some(part) => Ok(Some(part)),
            None => {
                if let Some(feeder) = self.feeder.take() {
                    feeder
                        .await
                        .map_err(|e| Error::Crypto(format!("gpg feeder: {}", e)))??;
                }
                if let Some(child) = self.child.take() {
                    wait_gpg(child).await?;
                }
                Ok(None)
            }
        }
    }
}

/// Running `gpg --decrypt` pipeline: ciphertext chunks are pumped into
/// stdin by a background task while the caller drains plaintext from
/// `stdout`. `finish` must be called after stdout EOF.
pub struct GpgDecryptor {
    stdout: Option<ChildStdout>,
    child: Child,
    feeder: JoinHandle<Result<u64>>,
}

impl GpgDecryptor {
    pub fn spawn(
        ciphertext: BoxStream<'static, Result<Bytes>>,
        agent: Option<&AgentProxy>,
        progress: Option<Arc<dyn Fn(u64) + Send + Sync>>,
    ) -> Result<Self> {
        let mut cmd = gpg_command(agent);
        cmd.args(["--decrypt", "--use-agent", "--output", "-"]);
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Crypto(format!("failed to spawn gpg: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Crypto("gpg stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Crypto("gpg stdout unavailable".to_string()))?;

        debug!("spawned gpg decrypt pipeline");

        let feeder = tokio::spawn(async move {
            let mut ciphertext = ciphertext;
            let mut wire_bytes = 0u64;
            while let Some(chunk) = ciphertext.next().await {
                let chunk = chunk?;
                wire_bytes += chunk.len() as u64;
                stdin
                    .write_all(&chunk)
                    .await
                    .map_err(|e| Error::Crypto(format!("gpg stdin: {}", e)))?;
                if let Some(cb) = &progress {
                    cb(chunk.len() as u64);
                }
            }
            drop(stdin);
            Ok(wire_bytes)
        });

        Ok(Self {
            stdout: Some(stdout),
            child,
            feeder,
        })
    }

    /// The plaintext side of the pipeline. Panics if taken twice.
    pub fn take_stdout(&mut self) -> ChildStdout {
        self.stdout.take().expect("stdout already taken")
    }

    /// Propagate ciphertext-stream errors (a stall during the body read
    /// surfaces here) and the gpg exit status. A retriable stream error
    /// outranks the knock-on gpg failure it causes; otherwise gpg's stderr
    /// tells the real story.
    pub async fn finish(self) -> Result<u64> {
        let fed = self
            .feeder
            .await
            .map_err(|e| Error::Crypto(format!("gpg feeder: {}", e)))?;
        let status = wait_gpg(self.child).await;
        match (fed, status) {
            (Ok(wire_bytes), Ok(())) => Ok(wire_bytes),
            (Err(e), _) if !matches!(e, Error::Crypto(_)) => Err(e),
            (_, Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
        }
    }
}
