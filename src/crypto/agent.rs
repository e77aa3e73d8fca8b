//! Assuan-style passphrase proxy.
//!
//! GPG resolves passphrases through its agent socket. When the operator
//! supplies a passphrase out of band (`SFS3_PASSPHRASE`), this proxy
//! answers the agent protocol on a transient UNIX socket instead of
//! letting gpg prompt. Only the commands gpg actually sends during a
//! batch decrypt are implemented: `OPTION`, `GETINFO`, `GET_PASSPHRASE`,
//! and `BYE`; arguments arrive percent-encoded and are URL-decoded.

use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A running passphrase proxy. The socket lives in a private temp
/// directory and disappears when the proxy is dropped.
pub struct AgentProxy {
    _dir: TempDir,
    socket: PathBuf,
    task: JoinHandle<()>,
}

impl AgentProxy {
    /// Bind the socket and start answering connections.
    pub fn spawn(passphrase: String) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("sfs3-agent").tempdir()?;
        let socket = dir.path().join("S.gpg-agent");
        let listener = UnixListener::bind(&socket)?;

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let pass = passphrase.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve(stream, &pass).await {
                                warn!("agent proxy connection failed: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("agent proxy accept failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            _dir: dir,
            socket,
            task,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }
}

impl Drop for AgentProxy {
    fn drop(&mut self) {
        self.task.abort();
        // the TempDir field removes the directory itself
        let _ = std::fs::remove_file(&self.socket);
    }
}

/// Percent-escape for Assuan data lines: `%`, CR and LF must not appear raw.
fn assuan_escape(value: &str) -> String {
    value
        .replace('%', "%25")
        .replace('\r', "%0D")
        .replace('\n', "%0A")
}

async fn serve(stream: UnixStream, passphrase: &str) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write.write_all(b"OK Pleased to meet you\n").await?;

    while let Some(line) = lines.next_line().await? {
        let mut words = line.splitn(2, ' ');
        let command = words.next().unwrap_or("");
        let args = words.next().unwrap_or("");

        match command {
            "OPTION" | "GETINFO" | "RESET" | "NOP" => {
                write.write_all(b"OK\n").await?;
            }
            "GET_PASSPHRASE" => {
                // args: <cache-id> <error> <prompt> <description>, each
                // percent-encoded; decoded only for the debug trail
                for (i, arg) in args.split(' ').enumerate() {
                    if let Ok(decoded) = urlencoding::decode(arg) {
                        debug!(arg = i, value = %decoded, "GET_PASSPHRASE argument");
                    }
                }
                let reply = format!("D {}\nOK\n", assuan_escape(passphrase));
                write.write_all(reply.as_bytes()).await?;
            }
            "BYE" => {
                write.write_all(b"OK closing connection\n").await?;
                break;
            }
            _ => {
                write.write_all(b"ERR 280 unknown command\n").await?;
            }
        }
    }
    Ok(())
}
