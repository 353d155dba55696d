//! Wire protocol shared by master and workers.
//!
//! Commands are single lines with a case-insensitive keyword. Responses
//! are free text except for METRICS and PIDS, whose bodies are JSON and
//! form a contract consumed by the master's scheduler and migration
//! coordinator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel meaning "metric unavailable"; a worker reporting it scores
/// itself out of scheduling without failing the whole query.
pub const METRIC_UNAVAILABLE: f64 = 999.0;

/// First-line marker of a kill confirmation prompt. The master decides
/// whether to answer `yes` based on this prefix.
pub const CONFIRM_PREFIX: &str = "CONFIRM:";

/// First-line marker of every failure reply from a worker. The master
/// keys off it when deciding whether a NAME lookup succeeded.
pub const ERROR_PREFIX: &str = "ERROR:";

/// Exact indicator returned by STATUS when the tracker is empty.
pub const NO_ACTIVE_PROCESSES: &str = "No active processes.";

/// Per-node load sample, exchanged as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(default = "unavailable")]
    pub cpu: f64,
    #[serde(default = "unavailable")]
    pub mem: f64,
    #[serde(default)]
    pub procs: u64,
}

fn unavailable() -> f64 {
    METRIC_UNAVAILABLE
}

impl MetricsSnapshot {
    /// Snapshot a worker reports when sampling itself failed.
    pub fn degraded() -> Self {
        Self {
            cpu: METRIC_UNAVAILABLE,
            mem: METRIC_UNAVAILABLE,
            procs: 0,
        }
    }

    /// Weighted load score; lower is better.
    pub fn score(&self) -> f64 {
        0.6 * self.cpu + 0.4 * self.mem
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("No command provided")]
    MissingCommand,
    #[error("{0} requires a PID")]
    MissingPid(&'static str),
    #[error("Invalid PID: {0}")]
    InvalidPid(String),
    #[error("MIGRATE requires '--to <worker>'")]
    MissingTarget,
    #[error("Invalid command")]
    Unrecognized,
}

/// A parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Run(String),
    Status,
    StatusAll,
    Metrics,
    Name(u32),
    Pids,
    Kill(u32),
    Migrate { pid: u32, target: String },
    Exit,
}

impl Request {
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim();
        let mut parts = line.splitn(2, char::is_whitespace);
        let keyword = parts.next().unwrap_or("").to_ascii_uppercase();
        let rest = parts.next().unwrap_or("").trim();

        match keyword.as_str() {
            "RUN" => {
                if rest.is_empty() {
                    Err(ParseError::MissingCommand)
                } else {
                    Ok(Request::Run(rest.to_string()))
                }
            }
            "STATUS" => {
                if rest.eq_ignore_ascii_case("ALL") {
                    Ok(Request::StatusAll)
                } else {
                    Ok(Request::Status)
                }
            }
            "METRICS" => Ok(Request::Metrics),
            "NAME" => parse_pid(rest, "NAME").map(Request::Name),
            "PIDS" => Ok(Request::Pids),
            "KILL" => parse_pid(rest, "KILL").map(Request::Kill),
            "MIGRATE" => {
                let mut args = rest.split_whitespace();
                let pid = match args.next() {
                    Some(p) => p
                        .parse::<u32>()
                        .map_err(|_| ParseError::InvalidPid(p.to_string()))?,
                    None => return Err(ParseError::MissingPid("MIGRATE")),
                };
                match (args.next(), args.next()) {
                    (Some(flag), Some(target)) if flag.eq_ignore_ascii_case("--to") => {
                        Ok(Request::Migrate {
                            pid,
                            target: target.to_string(),
                        })
                    }
                    _ => Err(ParseError::MissingTarget),
                }
            }
            "EXIT" => Ok(Request::Exit),
            _ => Err(ParseError::Unrecognized),
        }
    }
}

fn parse_pid(rest: &str, keyword: &'static str) -> Result<u32, ParseError> {
    let arg = rest.split_whitespace().next();
    match arg {
        None => Err(ParseError::MissingPid(keyword)),
        Some(p) => p
            .parse::<u32>()
            .map_err(|_| ParseError::InvalidPid(p.to_string())),
    }
}
