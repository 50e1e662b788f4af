//! Out-of-band per-block statistics. Finalize pushes a record per block
//! through a bounded channel (dropped on overflow, never blocking the
//! ingest); a monitor thread turns them into log lines.

use crossbeam_channel::Receiver;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct BlockStats {
    pub block_num: i64,
    pub pktidx: u64,
    pub npacket: u32,
    pub ndrop: u32,
}

/// Log finalized-block stats until every sender is gone
pub fn monitor(rx: Receiver<BlockStats>) {
    while let Ok(stats) = rx.recv() {
        if stats.ndrop > 0 {
            warn!(
                block = stats.block_num,
                pktidx = stats.pktidx,
                npkt = stats.npacket,
                ndrop = stats.ndrop,
                "finalized block with drops"
            );
        } else {
            debug!(
                block = stats.block_num,
                pktidx = stats.pktidx,
                npkt = stats.npacket,
                "finalized block"
            );
        }
    }
}
