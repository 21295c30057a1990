//! Sample trace format.
//!
//! One event per line, addresses in hexadecimal without a prefix:
//!
//! ```text
//! N <thread> <address>          new sample
//! A <thread> <address> r|w      access
//! M <thread>                    merge all samples
//! E <thread> t|f                enable or disable a thread
//! ```
//!
//! Blank lines and lines starting with `#` are ignored when reading.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use crate::common::{RdaError, Result};
use crate::parallel::ParallelSampledStack;
use crate::sampled::SampleTracker;

/// One trace line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    /// Start sampling `address` on `thread`.
    NewSample {
        /// Thread id.
        thread: usize,
        /// Byte address.
        address: u64,
    },
    /// Reference to `address` by `thread`.
    Access {
        /// Thread id.
        thread: usize,
        /// Byte address.
        address: u64,
        /// Store rather than load.
        is_write: bool,
    },
    /// `thread` requested a merge of every sample.
    Merge {
        /// Thread id.
        thread: usize,
    },
    /// `thread` was enabled or disabled.
    Enable {
        /// Thread id.
        thread: usize,
        /// New state.
        enabled: bool,
    },
}

impl TraceEvent {
    /// Thread the event belongs to.
    pub const fn thread(&self) -> usize {
        match *self {
            Self::NewSample { thread, .. }
            | Self::Access { thread, .. }
            | Self::Merge { thread }
            | Self::Enable { thread, .. } => thread,
        }
    }

    fn parse_fields(line: &str) -> std::result::Result<Self, String> {
        let mut fields = line.split_whitespace();
        let kind = fields.next().ok_or("empty event")?;
        let thread = fields
            .next()
            .ok_or("missing thread id")?
            .parse::<usize>()
            .map_err(|e| format!("bad thread id: {e}"))?;
        let mut address = || -> std::result::Result<u64, String> {
            let text = fields.next().ok_or("missing address")?;
            u64::from_str_radix(text.trim_start_matches("0x"), 16)
                .map_err(|e| format!("bad address {text:?}: {e}"))
        };
        let event = match kind {
            "N" => Self::NewSample {
                thread,
                address: address()?,
            },
            "A" => {
                let address = address()?;
                let is_write = match fields.next() {
                    Some("w") => true,
                    Some("r") => false,
                    other => return Err(format!("access type must be r or w, got {other:?}")),
                };
                Self::Access {
                    thread,
                    address,
                    is_write,
                }
            }
            "M" => Self::Merge { thread },
            "E" => {
                let enabled = match fields.next() {
                    Some("t") => true,
                    Some("f") => false,
                    other => return Err(format!("enable flag must be t or f, got {other:?}")),
                };
                Self::Enable { thread, enabled }
            }
            other => return Err(format!("unknown event type {other:?}")),
        };
        if let Some(extra) = fields.next() {
            return Err(format!("trailing field {extra:?}"));
        }
        Ok(event)
    }
}

impl FromStr for TraceEvent {
    type Err = RdaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_fields(s).map_err(|message| RdaError::Trace { line: 1, message })
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NewSample { thread, address } => write!(f, "N {thread} {address:x}"),
            Self::Access {
                thread,
                address,
                is_write,
            } => write!(
                f,
                "A {thread} {address:x} {}",
                if is_write { 'w' } else { 'r' }
            ),
            Self::Merge { thread } => write!(f, "M {thread}"),
            Self::Enable { thread, enabled } => {
                write!(f, "E {thread} {}", if enabled { 't' } else { 'f' })
            }
        }
    }
}

/// Reads every event of a trace file.
///
/// # Errors
///
/// Returns [`RdaError::Io`] on read failure and [`RdaError::Trace`] with the 1-based line number
/// of the first malformed line.
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<TraceEvent>> {
    let reader = BufReader::new(File::open(path)?);
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            continue;
        }
        let event = TraceEvent::parse_fields(text).map_err(|message| RdaError::Trace {
            line: idx + 1,
            message,
        })?;
        events.push(event);
    }
    Ok(events)
}

/// Writes `events`, one per line.
///
/// # Errors
///
/// Returns [`RdaError::Io`] on write failure.
pub fn write_trace(path: impl AsRef<Path>, events: &[TraceEvent]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for event in events {
        writeln!(writer, "{event}")?;
    }
    writer.flush()?;
    Ok(())
}

/// Feeds `events` to a single-owner sample tracker.
///
/// Merge events carry no meaning for these trackers and are skipped. Returns the number of
/// accesses after which no sample was tracked anywhere.
///
/// # Errors
///
/// Propagates tracker errors.
pub fn replay<T: SampleTracker + ?Sized>(tracker: &mut T, events: &[TraceEvent]) -> Result<u64> {
    let mut idle = 0;
    for event in events {
        match *event {
            TraceEvent::NewSample { thread, address } => tracker.new_sample(address, thread, 0)?,
            TraceEvent::Access {
                thread,
                address,
                is_write,
            } => {
                if tracker.access(address, thread, 0, is_write)? {
                    idle += 1;
                }
            }
            TraceEvent::Merge { .. } => {}
            TraceEvent::Enable { thread, enabled } => tracker.set_thread_enabled(thread, enabled),
        }
    }
    Ok(idle)
}

/// Feeds `events` to the parallel stack handles (indexed by thread id) from one OS thread.
///
/// Only valid with a serial barrier, since every handle acts for all threads in turn.
///
/// # Errors
///
/// Returns [`RdaError::Trace`] for an event whose thread has no handle, and propagates stack
/// errors.
pub fn replay_parallel(handles: &mut [ParallelSampledStack], events: &[TraceEvent]) -> Result<u64> {
    let mut idle = 0;
    for (idx, event) in events.iter().enumerate() {
        let thread = event.thread();
        let handle = handles.get_mut(thread).ok_or_else(|| RdaError::Trace {
            line: idx + 1,
            message: format!("no stack registered for thread {thread}"),
        })?;
        match *event {
            TraceEvent::NewSample { address, .. } => handle.new_sample(address, 0)?,
            TraceEvent::Access {
                address, is_write, ..
            } => {
                if handle.access(address, 0, is_write)? {
                    idle += 1;
                }
            }
            TraceEvent::Merge { .. } => handle.merge_all_samples()?,
            TraceEvent::Enable { enabled, .. } => handle.set_enabled(enabled),
        }
    }
    Ok(idle)
}
