//! Packet sources: the contract the ingest consumes, plus the pcap-backed
//! capture front end that fills slot-aligned input blocks

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::block::{BlockRing, RingWait};
use crate::packet::{clear_slots, write_frame, SlotLayout, PKT_HEADER_SIZE};

// eth + IPv4 + UDP headers preceding the datagram body
const UDP_HEADER_SIZE: usize = 42;

/// One installed destination flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub addr: Ipv4Addr,
    pub port: u16,
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow index {0} exceeds the flow table")]
    Index(usize),
}

/// Anything that delivers slot-aligned frames in blocks. The ingest only
/// needs the ring, the slot geometry, and a way to steer flows.
pub trait PacketSource: Send + Sync {
    fn ring(&self) -> &BlockRing;
    fn slot_layout(&self) -> SlotLayout;
    fn install_flow(&self, idx: usize, flow: Option<Flow>) -> Result<(), FlowError>;
}

/// Capture front end backed by libpcap. `install_flow` updates a flow table
/// and the capture thread rebuilds its BPF filter on the next iteration.
pub struct CaptureSource {
    ring: BlockRing,
    layout: SlotLayout,
    flows: Mutex<Vec<Option<Flow>>>,
    filter_dirty: AtomicBool,
}

impl CaptureSource {
    pub fn new(n_blocks: usize, layout: SlotLayout, max_flows: u32) -> Self {
        Self {
            ring: BlockRing::new(n_blocks, 0, layout.block_size()),
            layout,
            flows: Mutex::new(vec![None; max_flows as usize]),
            filter_dirty: AtomicBool::new(false),
        }
    }

    /// BPF expression matching the active flows, or None when the table is
    /// empty (capture then sees nothing useful, which is the IDLE case)
    fn filter_expression(&self) -> Option<String> {
        let flows = self.flows.lock();
        let active: Vec<Flow> = flows.iter().flatten().copied().collect();
        let first = active.first()?;
        let hosts = active
            .iter()
            .map(|f| format!("dst host {}", f.addr))
            .collect::<Vec<_>>()
            .join(" or ");
        Some(format!("udp and dst port {} and ({})", first.port, hosts))
    }
}

impl PacketSource for CaptureSource {
    fn ring(&self) -> &BlockRing {
        &self.ring
    }

    fn slot_layout(&self) -> SlotLayout {
        self.layout
    }

    fn install_flow(&self, idx: usize, flow: Option<Flow>) -> Result<(), FlowError> {
        let mut flows = self.flows.lock();
        let slot = flows.get_mut(idx).ok_or(FlowError::Index(idx))?;
        *slot = flow;
        self.filter_dirty.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Capture loop: strip the wire encapsulation and pack frames into input
/// blocks until the run flag drops
pub fn capture_udp(
    mut cap: pcap::Capture<pcap::Active>,
    source: &CaptureSource,
    run: &AtomicBool,
) {
    let layout = source.slot_layout();
    let ring = source.ring();
    let max_payload = layout.slot_size - layout.payload_offset;
    let mut block_idx = 0;

    'blocks: while run.load(Ordering::Relaxed) {
        loop {
            match ring.wait_free(block_idx, Duration::from_millis(100)) {
                RingWait::Ready => break,
                RingWait::TimedOut => {
                    if !run.load(Ordering::Relaxed) {
                        break 'blocks;
                    }
                }
                RingWait::Shutdown => break 'blocks,
            }
        }
        // Safety: wait_free put this slot in Processing; nobody else
        // touches it until set_filled
        let block = unsafe { ring.data_mut(block_idx) };
        clear_slots(block, &layout);

        let mut slot_idx = 0;
        while slot_idx < layout.slots_per_block && run.load(Ordering::Relaxed) {
            if source.filter_dirty.swap(false, Ordering::Relaxed) {
                match source.filter_expression() {
                    Some(expr) => {
                        if let Err(e) = cap.filter(&expr, true) {
                            warn!("capture filter rejected: {e}");
                        }
                    }
                    None => {
                        // Nothing to match; an always-false program drops
                        // everything until flows come back
                        if let Err(e) = cap.filter("udp and dst port 1", true) {
                            warn!("capture filter rejected: {e}");
                        }
                    }
                }
            }
            let packet = match cap.next_packet() {
                Ok(pak) => pak,
                Err(pcap::Error::TimeoutExpired) => continue,
                Err(e) => {
                    // Keep truckin'
                    warn!("libpcap error: {e}");
                    continue;
                }
            };
            if packet.data.len() < UDP_HEADER_SIZE + PKT_HEADER_SIZE {
                continue;
            }
            let datagram = &packet.data[UDP_HEADER_SIZE..];
            let (header, payload) = datagram.split_at(PKT_HEADER_SIZE);
            if payload.len() > max_payload {
                continue;
            }
            write_frame(layout.slot_mut(block, slot_idx), &layout, header, payload);
            slot_idx += 1;
        }
        // A partial block on shutdown still goes out; unused slots stay
        // marked empty
        ring.set_filled(block_idx);
        block_idx = (block_idx + 1) % ring.n_blocks();
    }
    info!("capture exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_expression_tracks_flows() {
        let layout = SlotLayout::for_payload(2048, 16);
        let src = CaptureSource::new(2, layout, 4);
        assert_eq!(src.filter_expression(), None);

        src.install_flow(
            0,
            Some(Flow {
                addr: Ipv4Addr::new(10, 0, 0, 1),
                port: 4015,
            }),
        )
        .unwrap();
        src.install_flow(
            1,
            Some(Flow {
                addr: Ipv4Addr::new(10, 0, 0, 2),
                port: 4015,
            }),
        )
        .unwrap();
        assert_eq!(
            src.filter_expression().unwrap(),
            "udp and dst port 4015 and (dst host 10.0.0.1 or dst host 10.0.0.2)"
        );

        src.install_flow(1, None).unwrap();
        assert_eq!(
            src.filter_expression().unwrap(),
            "udp and dst port 4015 and (dst host 10.0.0.1)"
        );
        assert!(src.install_flow(9, None).is_err());
    }
}
