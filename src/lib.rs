// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Core runtime for the Train Real-Time Data Protocol (IEC 61375-2-3):
//! cyclic process data (PD), correlated message data (MD) sessions, and the
//! wire codec they share.
//!
//! This crate is the protocol engine only. It does not parse XML
//! configuration, does not ship demo binaries, and does not pick sockets'
//! OS-specific options beyond what `std`/`libc` give for free — a caller
//! embeds [`session::Session`] and drives its three work functions
//! (`get_interval`, `process_receive`, `process_send`) from their own event
//! loop.
//!
//! ```no_run
//! use std::net::Ipv4Addr;
//! use std::sync::Arc;
//! use trdp::clock::SystemClock;
//! use trdp::config::{MdConfig, PdConfig, ProcessConfig};
//! use trdp::log::TracingSink;
//! use trdp::session::Session;
//!
//! # fn main() -> trdp::error::Result<()> {
//! let mut session = Session::open(
//!     Ipv4Addr::new(10, 0, 0, 1),
//!     None,
//!     PdConfig::default(),
//!     MdConfig::default(),
//!     ProcessConfig::default(),
//!     Arc::new(SystemClock),
//!     Arc::new(TracingSink),
//!     false,
//! )?;
//! loop {
//!     let (watch, timeout) = session.get_interval(std::time::Duration::from_millis(100));
//!     let readable = trdp::multiplex::select_readable(&watch, timeout)?;
//!     session.process_receive(&readable)?;
//!     session.process_send();
//!     # break;
//! }
//! # session.close();
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod codec;
pub mod config;
pub mod constant;
pub mod dataset;
pub mod error;
pub mod handle;
pub mod ladder;
pub mod log;
pub mod md;
pub mod multiplex;
pub mod pd;
pub mod session;
pub mod stats;
pub mod uri;

use config::MemConfig;
use error::{Error, Result};
use log::LogSink;
use std::sync::{Arc, OnceLock};

/// Process-wide state installed by [`init`]: the log sink and memory
/// configuration are, per spec.md §9's design note, the only global mutable
/// state this crate keeps — everything else lives on a [`session::Session`].
struct Runtime {
    log_sink: Arc<dyn LogSink>,
    mem_config: MemConfig,
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Install the process-wide log sink and memory configuration. Must be
/// called once before any [`session::Session::open`]; a second call returns
/// [`Error::State`] rather than silently replacing the first sink.
pub fn init(log_sink: Arc<dyn LogSink>, mem_config: MemConfig) -> Result<()> {
    RUNTIME
        .set(Runtime { log_sink, mem_config })
        .map_err(|_| Error::State("init called more than once"))
}

/// Tear down process-wide state. There is deliberately no way to "un-set" a
/// `OnceLock`, matching the original design's single-process-lifetime
/// assumption; `terminate` exists as the documented bookend `init` expects,
/// and simply checks that `init` ran.
pub fn terminate() -> Result<()> {
    if RUNTIME.get().is_none() {
        return Err(Error::NotInitialised);
    }
    Ok(())
}

/// The log sink installed by [`init`], or the default `tracing`-backed sink
/// if `init` was never called — sessions opened without an explicit sink
/// still log somewhere.
pub fn log_sink() -> Arc<dyn LogSink> {
    RUNTIME.get().map(|r| r.log_sink.clone()).unwrap_or_else(|| Arc::new(log::TracingSink))
}

/// The memory configuration installed by [`init`], or the built-in default
/// block ladder.
pub fn mem_config() -> MemConfig {
    RUNTIME.get().map(|r| r.mem_config.clone()).unwrap_or_default()
}
