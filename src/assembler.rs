//! The two-block sliding window over the output ring.
//!
//! Incoming packets land in one of two working blocks W[0] and W[1], with
//! W[1] always one block number ahead of W[0]. A packet one block past the
//! window finalizes W[0] and slides the window forward; a packet just
//! behind the window counts as late; anything further out reinitializes
//! the window past the disruptor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::warn;

use crate::block::{BlockRing, RingWait};
use crate::ingest::IngestError;
use crate::monitoring::BlockStats;
use crate::obs::Geometry;
use crate::packet::FengInfo;
use crate::scatter::{block_units, payload_units, scatter_packet};
use crate::status::{upsert_record, StatusBuffer};

const FREE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct WorkingBlock {
    slot: usize,
    block_num: i64,
    npacket: u32,
    piperblk: u64,
    pkts_per_block: u64,
}

pub struct BlockAssembler {
    ring: Arc<BlockRing>,
    status: Arc<StatusBuffer>,
    run: Arc<AtomicBool>,
    stats: Option<Sender<BlockStats>>,
    wblk: [WorkingBlock; 2],
    next_slot: usize,
    nlate: u64,
    ndrop_total: u64,
}

impl BlockAssembler {
    /// Claim the first two output blocks for absolute block numbers 0 and 1
    pub fn new(
        ring: Arc<BlockRing>,
        status: Arc<StatusBuffer>,
        run: Arc<AtomicBool>,
        stats: Option<Sender<BlockStats>>,
    ) -> Result<Self, IngestError> {
        let placeholder = WorkingBlock {
            slot: 0,
            block_num: 0,
            npacket: 0,
            piperblk: 0,
            pkts_per_block: 0,
        };
        let mut asm = Self {
            ring,
            status,
            run,
            stats,
            wblk: [placeholder; 2],
            next_slot: 0,
            nlate: 0,
            ndrop_total: 0,
        };
        asm.wblk[0] = asm.acquire(0)?;
        asm.wblk[1] = asm.acquire(1)?;
        Ok(asm)
    }

    /// Late packets seen since the last drain
    pub fn take_nlate(&mut self) -> u64 {
        std::mem::take(&mut self.nlate)
    }

    /// Drops accumulated by finalized blocks since the last drain
    pub fn take_ndrop(&mut self) -> u64 {
        std::mem::take(&mut self.ndrop_total)
    }

    /// Run the decision table for one parsed packet. Returns true when the
    /// payload was scattered into a working block.
    pub fn accept(
        &mut self,
        info: &FengInfo,
        payload: &[u8],
        geo: &Geometry,
    ) -> Result<bool, IngestError> {
        // Keep both blocks' idea of the geometry current; cheaper to store
        // per packet than to branch on change
        for w in &mut self.wblk {
            w.piperblk = geo.piperblk;
            w.pkts_per_block = geo.pkts_per_block;
        }

        let b = (info.pktidx / geo.piperblk) as i64;
        if b == self.wblk[1].block_num + 1 {
            // Advance the window
            self.finalize(0);
            self.wblk.swap(0, 1);
            self.wblk[1] = self.acquire(b)?;
        } else if b < self.wblk[0].block_num - 1 || b > self.wblk[1].block_num + 1 {
            warn!(
                pktidx = info.pktidx,
                "working blocks reinit due to packet discontinuity"
            );
            // Hand the partial blocks downstream with their drop counts,
            // then restart the window just past the disruptor (which is
            // itself discarded)
            self.finalize(0);
            self.finalize(1);
            self.wblk[0] = self.acquire(b + 1)?;
            self.wblk[1] = self.acquire(b + 2)?;
        } else if b == self.wblk[0].block_num - 1 {
            self.nlate += 1;
            return Ok(false);
        }

        let idx = b - self.wblk[0].block_num;
        if !(0..2).contains(&idx) {
            return Ok(false);
        }
        let w = &mut self.wblk[idx as usize];
        let Some(stream) = geo.stream_for(info.feng_chan) else {
            return Ok(false);
        };
        // Safety: working block slots stay in Processing between acquire
        // and finalize
        let data = unsafe { self.ring.data_mut(w.slot) };
        let (Some(units), Some(pl)) = (block_units(data), payload_units(payload)) else {
            return Ok(false);
        };
        if scatter_packet(units, geo, info.feng_id as usize, stream, info.pktidx, pl) {
            w.npacket += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Publish the working block's counters into its header and hand it to
    /// the consumer
    fn finalize(&mut self, idx: usize) {
        let w = self.wblk[idx];
        let ndrop = w.pkts_per_block.saturating_sub(w.npacket as u64) as u32;
        let pktidx = w.block_num as u64 * w.piperblk;
        // Safety: the slot is still held in Processing until set_filled
        let header = unsafe { self.ring.header_mut(w.slot) };
        upsert_record(header, "PKTIDX", &pktidx.to_string());
        upsert_record(header, "NPKT", &w.npacket.to_string());
        upsert_record(header, "NDROP", &ndrop.to_string());
        upsert_record(header, "DROPSTAT", &format!("{}/{}", ndrop, w.pkts_per_block));
        self.ring.set_filled(w.slot);
        self.ndrop_total += ndrop as u64;
        if let Some(tx) = &self.stats {
            // Stats are best effort; a slow observer never blocks the ingest
            let _ = tx.try_send(BlockStats {
                block_num: w.block_num,
                pktidx,
                npacket: w.npacket,
                ndrop,
            });
        }
    }

    /// Claim the next output slot for `block_num`, retrying the free-wait
    /// until it succeeds or the ingest is cancelled. The status snapshot is
    /// copied into the block header on success.
    fn acquire(&mut self, block_num: i64) -> Result<WorkingBlock, IngestError> {
        let slot = self.next_slot;
        self.next_slot = (self.next_slot + 1) % self.ring.n_blocks();

        let prev_netstat = {
            let mut st = self.status.lock();
            let prev = st.get_str("NETSTAT").unwrap_or_default();
            st.put_str("NETSTAT", "waitfree");
            st.put_str("NETBUFST", &self.buffer_status());
            prev
        };

        loop {
            match self.ring.wait_free(slot, FREE_WAIT) {
                RingWait::Ready => break,
                RingWait::TimedOut => {
                    if !self.run.load(Ordering::Relaxed) {
                        return Err(IngestError::Cancelled);
                    }
                    let mut st = self.status.lock();
                    st.put_str("NETSTAT", "outblocked");
                    st.put_str("NETBUFST", &self.buffer_status());
                }
                RingWait::Shutdown => return Err(IngestError::Cancelled),
            }
        }

        {
            let mut st = self.status.lock();
            st.put_str("NETSTAT", &prev_netstat);
            // Safety: wait_free just moved the slot to Processing
            st.render_into(unsafe { self.ring.header_mut(slot) });
        }
        Ok(WorkingBlock {
            slot,
            block_num,
            npacket: 0,
            piperblk: 0,
            pkts_per_block: 0,
        })
    }

    fn buffer_status(&self) -> String {
        format!("{}/{}", self.ring.used(), self.ring.n_blocks())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::ObsInfo;
    use crate::status::find_record;
    use crate::STATUS_TOTAL_SIZE;

    fn geometry() -> Geometry {
        let obs = ObsInfo {
            fenchan: 64,
            nants: 1,
            nstrm: 1,
            pkt_ntime: 2,
            pkt_nchan: 4,
            schan: 0,
        };
        // 4 packet indices per block, 4 packets per block
        Geometry::derive(&obs, 64).unwrap()
    }

    struct Fixture {
        ring: Arc<BlockRing>,
        asm: BlockAssembler,
    }

    impl Fixture {
        fn new(n_blocks: usize) -> Self {
            let ring = Arc::new(BlockRing::new(n_blocks, STATUS_TOTAL_SIZE, 64));
            let status = Arc::new(StatusBuffer::new());
            let run = Arc::new(AtomicBool::new(true));
            let asm =
                BlockAssembler::new(Arc::clone(&ring), status, run, None).unwrap();
            Self { ring, asm }
        }

        fn feed(&mut self, pktidx: u64) -> bool {
            let geo = geometry();
            let payload = vec![1u8; geo.payload_bytes];
            let info = FengInfo {
                pktidx,
                feng_id: 0,
                feng_chan: 0,
            };
            self.asm.accept(&info, &payload, &geo).unwrap()
        }

        fn drain(&self, slot: usize) -> (u64, u32, u32) {
            assert_eq!(
                self.ring.wait_filled(slot, Duration::from_millis(50)),
                RingWait::Ready
            );
            // Safety: observed Filled above and released below
            let header = unsafe { self.ring.header(slot) };
            let out = (
                find_record(header, "PKTIDX").unwrap().parse().unwrap(),
                find_record(header, "NPKT").unwrap().parse().unwrap(),
                find_record(header, "NDROP").unwrap().parse().unwrap(),
            );
            self.ring.set_free(slot);
            out
        }
    }

    #[test]
    fn test_advance_finalizes_previous_block() {
        let mut fx = Fixture::new(4);
        for pktidx in 0..8 {
            assert!(fx.feed(pktidx));
        }
        // Window is {0,1}; block 2's first packet slides it forward
        assert!(fx.feed(8));
        let (pktidx, npkt, ndrop) = fx.drain(0);
        assert_eq!((pktidx, npkt, ndrop), (0, 4, 0));
    }

    #[test]
    fn test_late_packet_counted_and_discarded() {
        let mut fx = Fixture::new(4);
        for pktidx in 0..8 {
            fx.feed(pktidx);
        }
        fx.feed(8); // window now {1,2}
        assert!(!fx.feed(1)); // block 0 is just behind the window
        assert_eq!(fx.asm.take_nlate(), 1);
        assert_eq!(fx.asm.take_nlate(), 0);
    }

    #[test]
    fn test_discontinuity_flushes_both_blocks() {
        let mut fx = Fixture::new(6);
        for pktidx in 0..4 {
            fx.feed(pktidx);
        }
        // Block 25 is far outside {0,1}: both partials flush, the
        // disruptor is dropped, and the window follows at {26,27}
        assert!(!fx.feed(100));
        let (pktidx0, npkt0, ndrop0) = fx.drain(0);
        assert_eq!((pktidx0, npkt0, ndrop0), (0, 4, 0));
        let (pktidx1, npkt1, ndrop1) = fx.drain(1);
        assert_eq!((pktidx1, npkt1, ndrop1), (4, 0, 4));
        assert_eq!(fx.asm.take_ndrop(), 4);
        // The new window accepts packets for blocks 26 and 27; the
        // disruptor's own block is now one behind it
        assert!(fx.feed(26 * 4));
        assert!(fx.feed(27 * 4));
        assert!(!fx.feed(100));
        assert_eq!(fx.asm.take_nlate(), 1);
    }

    #[test]
    fn test_duplicates_clamp_ndrop() {
        let mut fx = Fixture::new(4);
        for _ in 0..6 {
            fx.feed(0);
        }
        for pktidx in 1..4 {
            fx.feed(pktidx);
        }
        fx.feed(8); // advance past block 0
        let (_, npkt, ndrop) = fx.drain(0);
        assert_eq!(npkt, 9);
        assert_eq!(ndrop, 0);
    }
}
