//! Worker node: a TCP listener serving the single-line command
//! protocol.
//!
//! Connections are served strictly one at a time, to completion; a
//! second client queues in the transport backlog. Within a connection,
//! commands execute in order. The tracked-PID set is owned here and
//! passed `&mut` into the dispatcher, so no locking is needed under
//! this sequential model; admitting concurrent connections would
//! require a mutex around it.

pub mod dispatch;
pub mod launcher;
pub mod system;
pub mod tracker;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::worker::dispatch::{Dispatcher, Disposition};
use crate::worker::launcher::ProcessLauncher;
use crate::worker::system::ProcessControl;
use crate::worker::tracker::ProcessTracker;

pub use dispatch::PendingConfirmation;
pub use launcher::{PidDiscovery, PollingDiscovery, ShellLauncher, StartOutcome};
pub use system::{SystemControl, CRITICAL_PROCESSES};

pub struct Worker {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Dispatcher,
    tracker: ProcessTracker,
}

impl Worker {
    pub async fn bind(
        config: WorkerConfig,
        control: Arc<dyn ProcessControl>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "Worker listening");
        Ok(Self {
            listener,
            local_addr,
            dispatcher: Dispatcher::new(control, launcher, config.confirm_timeout),
            tracker: ProcessTracker::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept and serve connections until an EXIT command arrives.
    /// Accept failures and per-connection I/O errors are logged and
    /// never stop the listener.
    pub async fn serve(mut self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            tracing::debug!(%peer, "Connection accepted");
            match self.serve_connection(stream).await {
                Ok(ConnectionEnd::PeerClosed) => {
                    tracing::debug!(%peer, "Connection closed");
                }
                Ok(ConnectionEnd::Exit) => {
                    tracing::info!("EXIT received, worker shutting down");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "Connection error");
                }
            }
        }
    }

    async fn serve_connection(&mut self, stream: TcpStream) -> Result<ConnectionEnd> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(ConnectionEnd::PeerClosed);
            }
            if line.trim().is_empty() {
                continue;
            }

            match self.dispatcher.dispatch(&line, &mut self.tracker).await {
                Disposition::Reply(text) => {
                    writer.write_all(format!("{text}\n").as_bytes()).await?;
                }
                Disposition::Confirm { pending, prompt } => {
                    writer.write_all(format!("{prompt}\n").as_bytes()).await?;

                    // Exactly one further line decides the kill; an
                    // unresponsive peer hits the deadline instead of
                    // stalling the connection forever.
                    let mut reply = String::new();
                    let read = timeout(
                        self.dispatcher.confirm_timeout(),
                        reader.read_line(&mut reply),
                    )
                    .await;
                    let answer = match read {
                        Ok(Ok(n)) if n > 0 => Some(reply.as_str()),
                        _ => None,
                    };
                    let text = self
                        .dispatcher
                        .resolve_confirmation(&pending, answer, &mut self.tracker);
                    writer.write_all(format!("{text}\n").as_bytes()).await?;
                }
                Disposition::Shutdown(text) => {
                    writer.write_all(format!("{text}\n").as_bytes()).await?;
                    writer.flush().await?;
                    return Ok(ConnectionEnd::Exit);
                }
            }
        }
    }
}

enum ConnectionEnd {
    PeerClosed,
    Exit,
}
