//! Master-side connection client.
//!
//! One fresh connection per request, a bounded write/read, then close.
//! Every failure mode (connect refused, timeout, peer closing early,
//! undecodable bytes) collapses into [`DroverError::Unreachable`]; a
//! failed probe affects only the current operation and is never retried.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::WorkerDescriptor;
use crate::error::{DroverError, Result};

/// Upper bound on a single response frame.
const MAX_RESPONSE_BYTES: usize = 8192;

/// One open connection to a worker, capable of multiple line exchanges.
/// Only the kill confirmation handshake needs more than one; everything
/// else goes through [`Client::request`].
pub struct Exchange {
    stream: TcpStream,
    deadline: Duration,
    worker: String,
}

impl Exchange {
    pub async fn open(worker: &WorkerDescriptor, deadline: Duration) -> Result<Self> {
        let stream = timeout(deadline, TcpStream::connect(worker.addr()))
            .await
            .map_err(|_| DroverError::Unreachable(worker.name.clone()))?
            .map_err(|_| DroverError::Unreachable(worker.name.clone()))?;
        Ok(Self {
            stream,
            deadline,
            worker: worker.name.clone(),
        })
    }

    /// Send one command line and read one bounded response frame.
    pub async fn send(&mut self, line: &str) -> Result<String> {
        let unreachable = || DroverError::Unreachable(self.worker.clone());

        let message = format!("{line}\n");
        timeout(self.deadline, self.stream.write_all(message.as_bytes()))
            .await
            .map_err(|_| unreachable())?
            .map_err(|_| unreachable())?;

        let mut buf = vec![0u8; MAX_RESPONSE_BYTES];
        let n = timeout(self.deadline, self.stream.read(&mut buf))
            .await
            .map_err(|_| unreachable())?
            .map_err(|_| unreachable())?;
        if n == 0 {
            return Err(unreachable());
        }
        let text = std::str::from_utf8(&buf[..n]).map_err(|_| unreachable())?;
        Ok(text.trim_end().to_string())
    }
}

/// One-shot request client used for everything without a handshake.
#[derive(Debug, Clone)]
pub struct Client {
    deadline: Duration,
}

impl Client {
    pub fn new(deadline: Duration) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Open, send one line, read one bounded response, close.
    pub async fn request(&self, worker: &WorkerDescriptor, line: &str) -> Result<String> {
        let mut exchange = Exchange::open(worker, self.deadline).await?;
        exchange.send(line).await
    }
}
