//! Run states and the start/stop gating driven by the status buffer

use std::net::Ipv4Addr;

use tracing::{error, info};

use crate::capture::{Flow, PacketSource};
use crate::status::StatusBuffer;

/// Falls back to the SNAP default when the status buffer is silent
const DEFAULT_PKTNTIME: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Listen,
    Record,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::Listen => "LISTEN",
            RunState::Record => "RECORD",
        }
    }
}

/// Modified Julian Date as integer day, integer second of day, and
/// fractional second
pub fn mjd_from_unix(unix_secs: f64) -> (u32, u32, f64) {
    let whole = unix_secs.floor();
    let frac = unix_secs - whole;
    let whole = whole as i64;
    // MJD 40587 is the Unix epoch
    let imjd = 40587 + whole.div_euclid(86400);
    let smjd = whole.rem_euclid(86400);
    (imjd as u32, smjd as u32, frac)
}

/// Convert a requested dwell in seconds to the stop index: a whole number
/// of blocks past the (already normalized) start index
pub fn dwell_to_pktstop(pktstart: u64, dwell: f64, tbin: f64, pkt_ntime: u32, piperblk: u64) -> u64 {
    let secs_per_block = tbin * pkt_ntime as f64 * piperblk as f64;
    if secs_per_block <= 0.0 {
        return pktstart;
    }
    let dwell_blocks = (dwell / secs_per_block).trunc() as u64;
    pktstart + piperblk * dwell_blocks
}

/// Gate the given packet index against PKTSTART/PKTSTOP.
///
/// Inside the window: DAQSTATE becomes RECORD and, on the first such call,
/// the observation start time is derived from SYNCTIME plus the packet
/// index cadence and stored as STT_IMJD/STT_SMJD/STT_OFFS with STTVALID=1.
/// Outside: DAQSTATE returns to LISTEN and STTVALID falls to 0.
pub fn check_start_stop(status: &StatusBuffer, pktidx: u64) -> RunState {
    let mut st = status.lock();
    let sttvalid = st.get_u32("STTVALID").unwrap_or(0);
    let pktstart = st.get_u64("PKTSTART").unwrap_or(0);
    let pktstop = st.get_u64("PKTSTOP").unwrap_or(0);

    if pktstart <= pktidx && pktidx < pktstop {
        st.put_str("DAQSTATE", "RECORD");
        if sttvalid != 1 {
            st.put_u32("STTVALID", 1);
            let pktntime = st.get_u32("PKTNTIME").unwrap_or(DEFAULT_PKTNTIME);
            let chan_bw = st.get_f64("CHAN_BW").unwrap_or(1.0);
            let synctime = st.get_u64("SYNCTIME").unwrap_or(0);
            let realtime_secs = if chan_bw != 0.0 {
                pktidx as f64 * pktntime as f64 / (1e6 * chan_bw.abs())
            } else {
                0.0
            };
            let (imjd, smjd, offs) = mjd_from_unix(synctime as f64 + realtime_secs);
            st.put_u32("STT_IMJD", imjd);
            st.put_u32("STT_SMJD", smjd);
            st.put_f64("STT_OFFS", offs);
        }
        RunState::Record
    } else {
        st.put_str("DAQSTATE", "LISTEN");
        if sttvalid != 0 {
            st.put_u32("STTVALID", 0);
        }
        RunState::Listen
    }
}

/// A destination spec in `A.B.C.D+N` notation: N+1 contiguous addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestIp {
    pub addr: Ipv4Addr,
    pub count: u32,
}

pub fn parse_destip(s: &str) -> Option<DestIp> {
    let (ip, extra) = match s.split_once('+') {
        Some((ip, extra)) => (ip, Some(extra)),
        None => (s, None),
    };
    let addr: Ipv4Addr = ip.trim().parse().ok()?;
    let count = extra.and_then(|e| e.trim().parse::<u32>().ok()).unwrap_or(0) + 1;
    Some(DestIp { addr, count })
}

/// Apply a DESTIP change: tear down or install flows on the packet source.
/// While flows are active the only accepted change is to 0.0.0.0. On any
/// rejected or invalid change the previous value is kept. Returns the new
/// flow count.
pub fn process_destip_change(
    new: &str,
    current: &mut String,
    nstreams: u32,
    max_flows: u32,
    port: u16,
    source: &dyn PacketSource,
) -> u32 {
    if new == current.as_str() {
        return nstreams;
    }
    if nstreams > 0 && new != "0.0.0.0" {
        error!("already listening to {current}, can't switch to {new}");
        return nstreams;
    }
    let Some(dest) = parse_destip(new) else {
        error!("invalid DESTIP: {new}");
        return nstreams;
    };
    if dest.addr.is_unspecified() {
        info!("dest_ip {new} (removing {nstreams} flows)");
        for idx in 0..nstreams {
            if let Err(e) = source.install_flow(idx as usize, None) {
                error!("flow removal failed: {e}");
            }
        }
        *current = new.to_owned();
        0
    } else {
        let count = dest.count.min(max_flows);
        info!("dest_ip {new}, adding {count} flows");
        let mut installed = 0;
        for idx in 0..count {
            let addr = Ipv4Addr::from(u32::from(dest.addr) + idx);
            match source.install_flow(idx as usize, Some(Flow { addr, port })) {
                Ok(()) => installed = idx + 1,
                Err(e) => {
                    error!("flow install failed: {e}");
                    break;
                }
            }
        }
        *current = new.to_owned();
        installed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRing;
    use crate::capture::FlowError;
    use crate::packet::SlotLayout;
    use parking_lot::Mutex;

    #[test]
    fn test_mjd_epoch() {
        assert_eq!(mjd_from_unix(0.0), (40587, 0, 0.0));
        let (imjd, smjd, offs) = mjd_from_unix(86400.0 + 43200.0 + 0.25);
        assert_eq!((imjd, smjd), (40588, 43200));
        assert!((offs - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_parse_destip() {
        assert_eq!(
            parse_destip("10.17.64.10"),
            Some(DestIp {
                addr: Ipv4Addr::new(10, 17, 64, 10),
                count: 1
            })
        );
        assert_eq!(
            parse_destip("10.17.64.10+3"),
            Some(DestIp {
                addr: Ipv4Addr::new(10, 17, 64, 10),
                count: 4
            })
        );
        assert!(parse_destip("not-an-ip").is_none());
        assert!(parse_destip("").is_none());
    }

    #[test]
    fn test_dwell_to_pktstop() {
        // Two blocks of dwell at TBIN=4us, 16 times/pkt, 128 pktidx/block
        let tbin = 4e-6;
        let dwell = 2.0 * tbin * 16.0 * 128.0;
        assert_eq!(dwell_to_pktstop(256, dwell, tbin, 16, 128), 512);
        // A dwell shorter than one block records nothing
        assert_eq!(dwell_to_pktstop(256, tbin, tbin, 16, 128), 256);
    }

    fn gating_status() -> StatusBuffer {
        let status = StatusBuffer::new();
        {
            let mut st = status.lock();
            st.put_u64("PKTSTART", 256);
            st.put_u64("PKTSTOP", 512);
            st.put_u32("PKTNTIME", 16);
            st.put_f64("CHAN_BW", 0.25);
            st.put_u64("SYNCTIME", 1_700_000_000);
        }
        status
    }

    #[test]
    fn test_start_stop_gating() {
        let status = gating_status();
        assert_eq!(check_start_stop(&status, 128), RunState::Listen);
        assert_eq!(status.lock().get_u32("STTVALID"), Some(0));

        assert_eq!(check_start_stop(&status, 256), RunState::Record);
        let (imjd, smjd, offs) =
            mjd_from_unix(1_700_000_000.0 + 256.0 * 16.0 / (1e6 * 0.25));
        {
            let st = status.lock();
            assert_eq!(st.get_u32("STTVALID"), Some(1));
            assert_eq!(st.get_u32("STT_IMJD"), Some(imjd));
            assert_eq!(st.get_u32("STT_SMJD"), Some(smjd));
            assert!((st.get_f64("STT_OFFS").unwrap() - offs).abs() < 1e-9);
        }

        // Still recording: the start time must not be recomputed
        status.lock().put_u64("SYNCTIME", 0);
        assert_eq!(check_start_stop(&status, 384), RunState::Record);
        assert_eq!(status.lock().get_u32("STT_IMJD"), Some(imjd));

        // Past the stop index the state falls back and STTVALID drops
        assert_eq!(check_start_stop(&status, 512), RunState::Listen);
        let st = status.lock();
        assert_eq!(st.get_u32("STTVALID"), Some(0));
        assert_eq!(st.get_str("DAQSTATE").as_deref(), Some("LISTEN"));
    }

    struct StubSource {
        ring: BlockRing,
        layout: SlotLayout,
        flows: Mutex<Vec<(usize, Option<Flow>)>>,
    }

    impl StubSource {
        fn new() -> Self {
            Self {
                ring: BlockRing::new(1, 0, 64),
                layout: SlotLayout::for_payload(2048, 1),
                flows: Mutex::new(Vec::new()),
            }
        }
    }

    impl PacketSource for StubSource {
        fn ring(&self) -> &BlockRing {
            &self.ring
        }
        fn slot_layout(&self) -> SlotLayout {
            self.layout
        }
        fn install_flow(&self, idx: usize, flow: Option<Flow>) -> Result<(), FlowError> {
            self.flows.lock().push((idx, flow));
            Ok(())
        }
    }

    #[test]
    fn test_destip_change_rules() {
        let src = StubSource::new();
        let mut current = "0.0.0.0".to_owned();

        // Install 3 flows (clamped by MAXFLOWS=16)
        let n = process_destip_change("10.0.0.1+2", &mut current, 0, 16, 4015, &src);
        assert_eq!(n, 3);
        assert_eq!(current, "10.0.0.1+2");
        assert_eq!(src.flows.lock().len(), 3);

        // Changing to another address while active is rejected
        let n = process_destip_change("10.0.0.9", &mut current, n, 16, 4015, &src);
        assert_eq!(n, 3);
        assert_eq!(current, "10.0.0.1+2");

        // Tearing down with 0.0.0.0 is always allowed
        let n = process_destip_change("0.0.0.0", &mut current, n, 16, 4015, &src);
        assert_eq!(n, 0);
        assert_eq!(current, "0.0.0.0");
        let flows = src.flows.lock();
        assert!(flows[3..].iter().all(|(_, f)| f.is_none()));
    }

    #[test]
    fn test_destip_clamped_to_max_flows() {
        let src = StubSource::new();
        let mut current = "0.0.0.0".to_owned();
        let n = process_destip_change("10.0.0.1+31", &mut current, 0, 4, 4015, &src);
        assert_eq!(n, 4);
    }
}
