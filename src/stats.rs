// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! Statistics snapshot delivered via the well-known statistics pull telegram
//! (spec.md §6). Field layout is grounded in
//! `original_source/trdp/test/diverse/getStats.c`'s `TRDP_STATISTICS_T`;
//! third-party tools parse this format, so field order must stay stable.

use std::sync::atomic::{AtomicU32, Ordering};

/// ComId of the well-known statistics pull telegram.
pub const STATISTICS_COM_ID: u32 = 31;

/// Number of allocator size classes tracked (mirrors `VOS_MEM_NBLOCKSIZES`).
pub const MEM_BLOCK_SIZE_CLASSES: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct MemStatistics {
    pub total: u32,
    pub free: u32,
    pub min_free: u32,
    pub num_alloc_blocks: u32,
    pub num_alloc_err: u32,
    pub num_free_err: u32,
    pub block_size: [u32; MEM_BLOCK_SIZE_CLASSES],
    pub used_block_size: [u32; MEM_BLOCK_SIZE_CLASSES],
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PdStatistics {
    pub def_qos: u32,
    pub def_ttl: u32,
    pub def_timeout: u32,
    pub num_subs: u32,
    pub num_pub: u32,
    pub num_rcv: u32,
    pub num_crc_err: u32,
    pub num_prot_err: u32,
    pub num_topo_err: u32,
    pub num_no_subs: u32,
    pub num_no_pub: u32,
    pub num_timeout: u32,
    pub num_send: u32,
    pub num_missed: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MdStatistics {
    pub num_listeners: u32,
    pub num_rq_sent: u32,
    pub num_reply_rcv: u32,
    pub num_confirm_sent: u32,
    pub num_crc_err: u32,
    pub num_prot_err: u32,
    pub num_topo_err: u32,
    pub num_no_subs: u32,
    pub num_timeout: u32,
    pub num_send: u32,
    pub num_rcv: u32,
}

/// A point-in-time snapshot, as delivered on the wire by the statistics pull
/// telegram.
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub version: u32,
    pub time_stamp: u64,
    pub up_time: u32,
    pub statistic_time: u32,
    pub host_name: String,
    pub leader_name: String,
    pub own_ip_addr: u32,
    pub leader_ip_addr: u32,
    pub process_prio: u32,
    pub process_cycle: u32,
    pub mem: MemStatistics,
    pub pd: PdStatistics,
    pub md: MdStatistics,
}

/// Atomic counters a session updates as it runs; `snapshot()` reads them all
/// into a [`Statistics`] value without blocking the work cycle.
#[derive(Debug, Default)]
pub struct Counters {
    pub pd_num_subs: AtomicU32,
    pub pd_num_pub: AtomicU32,
    pub pd_num_rcv: AtomicU32,
    pub pd_num_crc_err: AtomicU32,
    pub pd_num_prot_err: AtomicU32,
    pub pd_num_topo_err: AtomicU32,
    pub pd_num_no_subs: AtomicU32,
    pub pd_num_no_pub: AtomicU32,
    pub pd_num_timeout: AtomicU32,
    pub pd_num_send: AtomicU32,
    pub pd_num_missed: AtomicU32,
    pub md_num_listeners: AtomicU32,
    pub md_num_rq_sent: AtomicU32,
    pub md_num_reply_rcv: AtomicU32,
    pub md_num_confirm_sent: AtomicU32,
    pub md_num_crc_err: AtomicU32,
    pub md_num_prot_err: AtomicU32,
    pub md_num_topo_err: AtomicU32,
    pub md_num_no_subs: AtomicU32,
    pub md_num_timeout: AtomicU32,
    pub md_num_send: AtomicU32,
    pub md_num_rcv: AtomicU32,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump(counter: &AtomicU32) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Reset every counter to zero (`reset_statistics`).
    pub fn reset(&self) {
        let fields: [&AtomicU32; 21] = [
            &self.pd_num_subs,
            &self.pd_num_pub,
            &self.pd_num_rcv,
            &self.pd_num_crc_err,
            &self.pd_num_prot_err,
            &self.pd_num_topo_err,
            &self.pd_num_no_subs,
            &self.pd_num_no_pub,
            &self.pd_num_timeout,
            &self.pd_num_send,
            &self.pd_num_missed,
            &self.md_num_listeners,
            &self.md_num_rq_sent,
            &self.md_num_reply_rcv,
            &self.md_num_confirm_sent,
            &self.md_num_crc_err,
            &self.md_num_prot_err,
            &self.md_num_topo_err,
            &self.md_num_no_subs,
            &self.md_num_timeout,
            &self.md_num_send,
        ];
        for f in fields {
            f.store(0, Ordering::Relaxed);
        }
        self.md_num_rcv.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self, base: Statistics) -> Statistics {
        Statistics {
            pd: PdStatistics {
                def_qos: base.pd.def_qos,
                def_ttl: base.pd.def_ttl,
                def_timeout: base.pd.def_timeout,
                num_subs: self.pd_num_subs.load(Ordering::Relaxed),
                num_pub: self.pd_num_pub.load(Ordering::Relaxed),
                num_rcv: self.pd_num_rcv.load(Ordering::Relaxed),
                num_crc_err: self.pd_num_crc_err.load(Ordering::Relaxed),
                num_prot_err: self.pd_num_prot_err.load(Ordering::Relaxed),
                num_topo_err: self.pd_num_topo_err.load(Ordering::Relaxed),
                num_no_subs: self.pd_num_no_subs.load(Ordering::Relaxed),
                num_no_pub: self.pd_num_no_pub.load(Ordering::Relaxed),
                num_timeout: self.pd_num_timeout.load(Ordering::Relaxed),
                num_send: self.pd_num_send.load(Ordering::Relaxed),
                num_missed: self.pd_num_missed.load(Ordering::Relaxed),
            },
            md: MdStatistics {
                num_listeners: self.md_num_listeners.load(Ordering::Relaxed),
                num_rq_sent: self.md_num_rq_sent.load(Ordering::Relaxed),
                num_reply_rcv: self.md_num_reply_rcv.load(Ordering::Relaxed),
                num_confirm_sent: self.md_num_confirm_sent.load(Ordering::Relaxed),
                num_crc_err: self.md_num_crc_err.load(Ordering::Relaxed),
                num_prot_err: self.md_num_prot_err.load(Ordering::Relaxed),
                num_topo_err: self.md_num_topo_err.load(Ordering::Relaxed),
                num_no_subs: self.md_num_no_subs.load(Ordering::Relaxed),
                num_timeout: self.md_num_timeout.load(Ordering::Relaxed),
                num_send: self.md_num_send.load(Ordering::Relaxed),
                num_rcv: self.md_num_rcv.load(Ordering::Relaxed),
            },
            ..base
        }
    }
}
