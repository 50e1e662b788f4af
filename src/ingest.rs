//! The ingest loop: packet blocks in, GUPPI-style raw blocks out.
//!
//! A single dedicated thread runs this loop. It waits (bounded) on the
//! packet-input ring, walks every slot of each input block through the
//! assembler's decision table, and once per second refreshes the heartbeat,
//! throughput figures, observation parameters, and destination flows.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam_channel::Sender;
use thiserror::Error;
use tracing::{info, warn};

use crate::assembler::BlockAssembler;
use crate::block::{BlockRing, RingWait};
use crate::capture::PacketSource;
use crate::monitoring::BlockStats;
use crate::obs::{Geometry, ObsInfo, NPOL};
use crate::packet::{parse_slot, SlotFrame, SlotLayout};
use crate::state::{check_start_stop, dwell_to_pktstop, process_destip_change, RunState};
use crate::status::StatusBuffer;
use crate::{
    DEFAULT_BINDPORT, DEFAULT_DWELL_SECONDS, DEFAULT_MAXFLOWS, PKT_ALIGNMENT_SIZE,
};

/// How long one input-ring wait may block before the loop services its
/// 1 Hz duties
const INPUT_WAIT: Duration = Duration::from_millis(50);

const TICK_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("slot header/payload offsets must be multiples of {PKT_ALIGNMENT_SIZE} bytes")]
    UnalignedSlotLayout,
    #[error("cancelled while holding a working block")]
    Cancelled,
}

/// Everything the ingest thread owns; file-scope state in spirit, fields in
/// practice
pub struct IngestContext {
    pub status: Arc<StatusBuffer>,
    pub source: Arc<dyn PacketSource>,
    pub out_ring: Arc<BlockRing>,
    pub run: Arc<AtomicBool>,
    pub stats: Option<Sender<BlockStats>>,
}

/// Drive the ingest until the run flag drops. Cancellation is a clean
/// return; only configuration errors at startup are fatal.
pub fn run_ingest(ctx: IngestContext) -> Result<(), IngestError> {
    let layout = ctx.source.slot_layout();
    if !layout.aligned() {
        return Err(IngestError::UnalignedSlotLayout);
    }
    let (max_flows, port) = init_status(&ctx);

    let asm = match BlockAssembler::new(
        Arc::clone(&ctx.out_ring),
        Arc::clone(&ctx.status),
        Arc::clone(&ctx.run),
        ctx.stats.clone(),
    ) {
        Ok(asm) => asm,
        Err(IngestError::Cancelled) => return Ok(()),
        Err(e) => return Err(e),
    };

    let n_in = ctx.source.ring().n_blocks();
    let mut ingest = IngestLoop {
        status: ctx.status,
        source: ctx.source,
        out_ring: ctx.out_ring,
        run: ctx.run,
        asm,
        layout,
        max_flows,
        port,
        obs: ObsInfo::default(),
        geometry: None,
        state: RunState::Idle,
        dest_ip: "0.0.0.0".to_owned(),
        nstreams: 0,
        waiting: false,
        block_idx_in: 0,
        status_pktidx: None,
        packet_count: 0,
        nbogus: 0,
        last_bogus_log: None,
        bits_net: 0,
        pkts_net: 0,
        ns_net: 0,
        bits_phys: 0,
        pkts_phys: 0,
        prev_phys: None,
        last_tick: None,
        last_wait_end: None,
        fill_to_free_ns: vec![0; n_in],
        fill_to_free_sum: 0,
    };
    match ingest.run() {
        Err(IngestError::Cancelled) => {
            info!("ingest cancelled");
            Ok(())
        }
        other => {
            info!("ingest exiting");
            other
        }
    }
}

/// Seed the status buffer the way the thread init always has: read what the
/// operator already set, fill in defaults, and write everything back
fn init_status(ctx: &IngestContext) -> (u32, u16) {
    let mut st = ctx.status.lock();
    let max_flows = st.get_u32("MAXFLOWS").unwrap_or(DEFAULT_MAXFLOWS);
    let port = st.get_u32("BINDPORT").unwrap_or(DEFAULT_BINDPORT as u32) as u16;
    let nbits = st.get_u32("NBITS").unwrap_or(4);
    let npol = st.get_u32("NPOL").unwrap_or(NPOL as u32);
    let mut chan_bw = st.get_f64("CHAN_BW").unwrap_or(900.0 / 4096.0);
    if chan_bw == 0.0 {
        chan_bw = 1.0;
    }
    let obsnchan = st.get_u32("OBSNCHAN").unwrap_or(1);
    let nants = st.get_u32("NANTS").unwrap_or(1).max(1);
    let overlap = st.get_u32("OVERLAP").unwrap_or(0);
    let obs_mode = st.get_str("OBS_MODE").unwrap_or_else(|| "RAW".to_owned());
    let dwell = st.get_f64("DWELL").unwrap_or(DEFAULT_DWELL_SECONDS);

    st.put_u32("MAXFLOWS", max_flows);
    st.put_u32("BINDPORT", port as u32);
    st.put_str("DAQSTATE", RunState::Idle.as_str());
    st.put_u64("BLOCSIZE", ctx.out_ring.data_size() as u64);
    st.put_u32("NBITS", nbits);
    st.put_u32("NPOL", npol);
    st.put_u32("NANTS", nants);
    st.put_f64("OBSBW", chan_bw * obsnchan as f64 / nants as f64);
    st.put_f64("CHAN_BW", chan_bw);
    st.put_u32("OBSNCHAN", obsnchan);
    st.put_u32("OVERLAP", overlap);
    st.put_str("PKTFMT", "ATASNAPV");
    st.put_f64("TBIN", 1e-6 / chan_bw.abs());
    st.put_str("OBS_MODE", &obs_mode);
    st.put_f64("DWELL", dwell);
    st.put_u64("NDROP", 0);
    st.put_u32("STTVALID", 0);
    st.put_str("NETSTAT", "idle");
    if st.get_str("DESTIP").is_none() {
        st.put_str("DESTIP", "0.0.0.0");
    }
    if st.get_u64("PKTSTART").is_none() {
        st.put_u64("PKTSTART", 0);
    }
    if st.get_u64("PKTSTOP").is_none() {
        st.put_u64("PKTSTOP", 0);
    }
    (max_flows, port)
}

struct IngestLoop {
    status: Arc<StatusBuffer>,
    source: Arc<dyn PacketSource>,
    out_ring: Arc<BlockRing>,
    run: Arc<AtomicBool>,
    asm: BlockAssembler,
    layout: SlotLayout,
    max_flows: u32,
    port: u16,
    obs: ObsInfo,
    geometry: Option<Geometry>,
    state: RunState,
    dest_ip: String,
    nstreams: u32,
    waiting: bool,
    block_idx_in: usize,
    /// Last pktidx that triggered the per-block status republish
    status_pktidx: Option<u64>,
    /// Packets seen since the last 1 Hz update
    packet_count: u64,
    nbogus: u64,
    last_bogus_log: Option<Instant>,
    // NETGBPS/NETPKPS window: processing time between ring waits
    bits_net: u64,
    pkts_net: u64,
    ns_net: u64,
    // PHYSGBPS/PHYSPKPS window: wall clock between ticks
    bits_phys: u64,
    pkts_phys: u64,
    prev_phys: Option<Instant>,
    last_tick: Option<Instant>,
    last_wait_end: Option<Instant>,
    // Moving average of fill-to-free latency per input block
    fill_to_free_ns: Vec<u64>,
    fill_to_free_sum: u64,
}

impl IngestLoop {
    fn run(&mut self) -> Result<(), IngestError> {
        let source = Arc::clone(&self.source);
        let in_ring = source.ring();

        while self.run.load(Ordering::Relaxed) {
            // Wait for the next input block, servicing the tick while idle
            let filled_at = loop {
                let wait_begin = Instant::now();
                if let Some(end) = self.last_wait_end.take() {
                    self.ns_net += (wait_begin - end).as_nanos() as u64;
                }
                let rv = in_ring.wait_filled(self.block_idx_in, INPUT_WAIT);
                let wait_end = Instant::now();
                self.last_wait_end = Some(wait_end);

                if self
                    .last_tick
                    .map_or(true, |t| t.elapsed() >= TICK_PERIOD)
                {
                    self.tick();
                }

                match rv {
                    RingWait::Ready => break Some(wait_end),
                    RingWait::Shutdown => break None,
                    RingWait::TimedOut => {
                        if !self.run.load(Ordering::Relaxed) {
                            break None;
                        }
                        if !self.waiting {
                            self.status.lock().put_str("NETSTAT", "waiting");
                            self.waiting = true;
                        }
                    }
                }
            };
            let Some(filled_at) = filled_at else {
                break;
            };
            if !self.run.load(Ordering::Relaxed) {
                in_ring.set_free(self.block_idx_in);
                break;
            }

            // Without valid geometry (or without flows) there is nothing to
            // scatter; recycle the input block and keep looping
            if self.geometry.is_none() || self.state == RunState::Idle {
                let netstat = if self.geometry.is_none() {
                    "obsinfo"
                } else {
                    "idle"
                };
                self.status.lock().put_str("NETSTAT", netstat);
                self.waiting = false;
                in_ring.set_free(self.block_idx_in);
                self.block_idx_in = (self.block_idx_in + 1) % in_ring.n_blocks();
                continue;
            }

            if self.waiting {
                self.status.lock().put_str("NETSTAT", "receiving");
                self.waiting = false;
            }

            // Safety: wait_filled observed this block Filled; it is
            // released right after the walk, cancelled or not
            let block = unsafe { in_ring.data(self.block_idx_in) };
            let walked = self.process_block(block);
            in_ring.set_free(self.block_idx_in);
            walked?;

            let elapsed = filled_at.elapsed().as_nanos() as u64;
            self.fill_to_free_sum += elapsed;
            self.fill_to_free_sum -= self.fill_to_free_ns[self.block_idx_in];
            self.fill_to_free_ns[self.block_idx_in] = elapsed;
            if self.block_idx_in == in_ring.n_blocks() - 1 {
                let avg_ms =
                    (self.fill_to_free_sum as f64 / in_ring.n_blocks() as f64).round() / 1e6;
                self.status.lock().put_f64("NETBLKMS", avg_ms);
            }
            self.block_idx_in = (self.block_idx_in + 1) % in_ring.n_blocks();
        }
        Ok(())
    }

    /// Walk every slot of one input block through parse, filter, and the
    /// assembler's decision table
    fn process_block(&mut self, block: &[u8]) -> Result<(), IngestError> {
        let Some(geo) = self.geometry else {
            return Ok(());
        };
        for idx in 0..self.layout.slots_per_block {
            let slot = self.layout.slot(block, idx);
            let (info, payload) = match parse_slot(slot, &self.layout) {
                SlotFrame::Empty => continue,
                SlotFrame::Malformed => {
                    self.count_bogus("malformed frame");
                    continue;
                }
                SlotFrame::Frame(info, payload) => (info, payload),
            };
            if payload.len() != geo.payload_bytes {
                self.count_bogus("unexpected payload size");
                continue;
            }
            // Ignore packets with FID past this instance's antennas
            if (info.feng_id as usize) >= geo.nants {
                continue;
            }

            self.packet_count += 1;
            self.pkts_net += 1;
            self.pkts_phys += 1;
            self.bits_net += 8 * geo.payload_bytes as u64;
            self.bits_phys += 8 * geo.payload_bytes as u64;

            // First packet of a block: republish derived values and run the
            // start/stop gate on this packet's index
            if info.pktidx % geo.piperblk == 0 && self.status_pktidx != Some(info.pktidx) {
                self.status_pktidx = Some(info.pktidx);
                self.boundary_update(info.pktidx, &geo);
                self.state = check_start_stop(&self.status, info.pktidx);
            }

            self.asm.accept(&info, payload, &geo)?;
        }
        Ok(())
    }

    /// The once-per-block status republish
    fn boundary_update(&mut self, pktidx: u64, geo: &Geometry) {
        let mut netgbps = 0.0;
        let mut netpkps = 0.0;
        if self.ns_net != 0 {
            netgbps = self.bits_net as f64 / self.ns_net as f64;
            netpkps = 1e9 * self.pkts_net as f64 / self.ns_net as f64;
            self.bits_net = 0;
            self.pkts_net = 0;
            self.ns_net = 0;
        }
        let ndrop = self.asm.take_ndrop();
        let nlate = self.asm.take_nlate();

        let mut st = self.status.lock();
        st.put_u64("PKTIDX", pktidx);
        st.put_u64("BLOCSIZE", geo.eff_block_size as u64);

        // PKTSTART is normalized down to a block boundary and written back
        let pktstart = st.get_u64("PKTSTART").unwrap_or(0);
        let pktstart = pktstart - pktstart % geo.piperblk;
        st.put_u64("PKTSTART", pktstart);

        let dwell = st.get_f64("DWELL").unwrap_or(DEFAULT_DWELL_SECONDS);
        st.put_f64("DWELL", dwell);

        st.put_f64("NETGBPS", netgbps);
        st.put_f64("NETPKPS", netpkps);

        let mut chan_bw = st.get_f64("CHAN_BW").unwrap_or(1.0);
        if chan_bw == 0.0 {
            chan_bw = 1.0;
        }
        let tbin = 1e-6 / chan_bw.abs();
        st.put_f64("TBIN", tbin);
        st.put_u64(
            "PKTSTOP",
            dwell_to_pktstop(pktstart, dwell, tbin, geo.pkt_ntime as u32, geo.piperblk),
        );

        st.add_u64("NDROP", ndrop);
        st.add_u64("NLATE", nlate);
    }

    /// The 1 Hz tick: heartbeat, physical rates, ObsInfo refresh, DESTIP
    fn tick(&mut self) {
        let now = Instant::now();
        self.last_tick = Some(now);

        let mut physgbps = 0.0;
        let mut physpkps = 0.0;
        if let Some(prev) = self.prev_phys {
            let ns = (now - prev).as_nanos() as f64;
            if ns > 0.0 {
                physgbps = self.bits_phys as f64 / ns;
                physpkps = 1e9 * self.pkts_phys as f64 / ns;
            }
        }
        self.bits_phys = 0;
        self.pkts_phys = 0;
        self.prev_phys = Some(now);

        let new_destip = {
            let mut st = self.status.lock();
            st.put_str(
                "DAQPULSE",
                &Utc::now().format("%a %b %e %H:%M:%S %Y").to_string(),
            );
            st.add_u64("NPKTS", std::mem::take(&mut self.packet_count));
            st.add_u64("NBOGUS", std::mem::take(&mut self.nbogus));
            st.put_f64("PHYSGBPS", physgbps);
            st.put_f64("PHYSPKPS", physpkps);

            self.obs.refresh(&st);
            self.geometry = Geometry::derive(&self.obs, self.out_ring.data_size());
            match self.geometry {
                Some(geo) => {
                    st.put_u32("OBSNCHAN", geo.obsnchan as u32);
                    st.put_u64("PIPERBLK", geo.piperblk);
                    st.put_u64("BLOCSIZE", geo.eff_block_size as u64);
                    let chan_bw = st.get_f64("CHAN_BW").unwrap_or(1.0);
                    st.put_f64("OBSBW", chan_bw * geo.obsnchan as f64 / geo.nants as f64);
                    st.put_str("OBSINFO", "VALID");
                }
                None => st.put_str("OBSINFO", "INVALID"),
            }
            st.get_str("DESTIP").unwrap_or_else(|| "0.0.0.0".to_owned())
        };

        if new_destip != self.dest_ip {
            self.nstreams = process_destip_change(
                &new_destip,
                &mut self.dest_ip,
                self.nstreams,
                self.max_flows,
                self.port,
                self.source.as_ref(),
            );
            let new_state = if self.nstreams > 0 {
                if self.state == RunState::Idle {
                    RunState::Listen
                } else {
                    self.state
                }
            } else {
                RunState::Idle
            };
            let mut st = self.status.lock();
            // Echo back whatever survived the change rules
            st.put_str("DESTIP", &self.dest_ip);
            if new_state != self.state {
                self.state = new_state;
                st.put_str("DAQSTATE", new_state.as_str());
                match new_state {
                    RunState::Idle => {
                        st.put_u32("STTVALID", 0);
                        st.put_str("NETSTAT", "idle");
                    }
                    _ => st.put_str("NETSTAT", "listen"),
                }
            }
        }
    }

    fn count_bogus(&mut self, what: &str) {
        self.nbogus += 1;
        let due = self
            .last_bogus_log
            .map_or(true, |t| t.elapsed() >= Duration::from_secs(1));
        if due {
            self.last_bogus_log = Some(Instant::now());
            warn!("dropping bogus frames: {what}");
        }
    }
}

/// Raise this thread to round-robin realtime priority 1 (as permitted by
/// rlimits) and optionally pin it to a core. Failures degrade to normal
/// scheduling with a warning.
pub fn set_realtime(core: Option<usize>) {
    unsafe {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_RTPRIO, &mut rlim) == 0 && rlim.rlim_max >= 1 {
            rlim.rlim_cur = 1;
            if libc::setrlimit(libc::RLIMIT_RTPRIO, &rlim) != 0 {
                warn!("setrlimit(RLIMIT_RTPRIO) failed");
            }
        }
        let param = libc::sched_param { sched_priority: 1 };
        if libc::sched_setscheduler(0, libc::SCHED_RR, &param) != 0 {
            warn!("sched_setscheduler(SCHED_RR) failed, staying best-effort");
        }
        if let Some(core) = core {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(core, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                warn!("sched_setaffinity({core}) failed");
            }
        }
    }
}
