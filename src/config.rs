// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Configuration structs passed at `open_session` / `init` time (spec.md
//! §6 "Configuration"). An XML parser that populates these from a file is
//! explicitly out of scope (spec.md §1); callers build them directly or
//! bring their own parser.

use crate::constant::MD_DEFAULT_MAX_RETRIES;
use std::time::Duration;

/// Pre-reserved block-count ladder for the allocator, mirroring the
/// original's `PREALLOCATE` table: one entry per size class, giving the
/// number of blocks of that size to reserve up front so the steady-state
/// path never allocates (spec.md §5 "Memory").
#[derive(Debug, Clone)]
pub struct MemConfig {
    /// `(block_size_bytes, preallocated_count)` pairs, smallest first.
    pub block_ladder: Vec<(usize, usize)>,
}

impl Default for MemConfig {
    fn default() -> Self {
        MemConfig {
            block_ladder: vec![
                (32, 16),
                (64, 16),
                (128, 16),
                (256, 8),
                (1024, 8),
                (4096, 4),
                (16384, 2),
                (65536, 1),
            ],
        }
    }
}

/// Default behaviour applied to new publications unless overridden.
#[derive(Debug, Clone)]
pub struct PdConfig {
    pub default_qos: u8,
    pub default_ttl: u8,
    pub default_timeout: Duration,
    pub default_behaviour: crate::pd::subscription::TimeoutBehaviour,
}

impl Default for PdConfig {
    fn default() -> Self {
        PdConfig {
            default_qos: 5,
            default_ttl: 64,
            default_timeout: Duration::from_millis(1_000),
            default_behaviour: crate::pd::subscription::TimeoutBehaviour::ZeroOnTimeout,
        }
    }
}

/// Default behaviour applied to new MD sessions unless overridden.
///
/// `max_retries` defaults to 5 (`TRDP_MD_DEFAULT_SEND_PARAM`, see DESIGN.md
/// Open Question 4); retransmissions are spaced at
/// `reply_timeout / (max_retries + 1)`.
#[derive(Debug, Clone)]
pub struct MdConfig {
    pub default_qos: u8,
    pub default_ttl: u8,
    pub default_reply_timeout: Duration,
    pub default_confirm_timeout: Duration,
    pub max_retries: u32,
}

impl Default for MdConfig {
    fn default() -> Self {
        MdConfig {
            default_qos: 3,
            default_ttl: 64,
            default_reply_timeout: Duration::from_secs(1),
            default_confirm_timeout: Duration::from_millis(500),
            max_retries: MD_DEFAULT_MAX_RETRIES,
        }
    }
}

/// Process-wide scheduling hints, surfaced only through the statistics
/// snapshot — this crate has no OS scheduler hook of its own.
#[derive(Debug, Clone, Default)]
pub struct ProcessConfig {
    pub priority: i32,
    pub cycle_time: Duration,
}
