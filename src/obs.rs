//! Observation parameters and the geometry derived from them

use crate::status::StatusGuard;

/// Dual polarization, packed together on the wire
pub const NPOL: usize = 2;
/// 4+4 bit complex voltage samples
pub const BYTES_PER_SAMPLE: usize = 1;

/// Parameters that define an observation. Read from the status buffer once
/// per second; every derived quantity is recomputed when they change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObsInfo {
    pub fenchan: u32,
    pub nants: u32,
    pub nstrm: u32,
    pub pkt_ntime: u32,
    pub pkt_nchan: u32,
    pub schan: i32,
}

impl Default for ObsInfo {
    fn default() -> Self {
        // Sentinels that fail valid() until the operator supplies real values
        Self {
            fenchan: 0,
            nants: 0,
            nstrm: 0,
            pkt_ntime: 0,
            pkt_nchan: 0,
            schan: -1,
        }
    }
}

impl ObsInfo {
    pub fn valid(&self) -> bool {
        self.fenchan > 0
            && self.nants > 0
            && self.nstrm > 0
            && self.pkt_ntime > 0
            && self.pkt_nchan > 0
            && self.schan >= 0
            && self.nstrm * self.pkt_nchan <= self.fenchan
    }

    /// Voltage bytes carried by one packet
    pub fn payload_bytes(&self) -> usize {
        self.pkt_ntime as usize * self.pkt_nchan as usize * NPOL * BYTES_PER_SAMPLE
    }

    /// Refresh fields from the status buffer; absent keys leave the current
    /// value untouched, matching the read-no-change-if-missing discipline
    pub fn refresh(&mut self, st: &StatusGuard) {
        if let Some(v) = st.get_u32("FENCHAN") {
            self.fenchan = v;
        }
        if let Some(v) = st.get_u32("NANTS") {
            self.nants = v;
        }
        if let Some(v) = st.get_u32("NSTRM") {
            self.nstrm = v;
        }
        if let Some(v) = st.get_u32("PKTNTIME") {
            self.pkt_ntime = v;
        }
        if let Some(v) = st.get_u32("PKTNCHAN") {
            self.pkt_nchan = v;
        }
        if let Some(v) = st.get_i32("SCHAN") {
            self.schan = v;
        }
    }
}

/// Block geometry and scatter strides, computed once per ObsInfo change.
/// All strides are in 16-bit units (the packed polarization pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub obsnchan: usize,
    pub piperblk: u64,
    pub eff_block_size: usize,
    pub pkts_per_block: u64,
    pub payload_bytes: usize,
    pub pkt_ntime: usize,
    pub pkt_nchan: usize,
    pub nants: usize,
    pub nstrm: usize,
    pub schan: i32,
    /// Channel-to-channel spacing for one antenna/stream: NTIME of the block
    pub ostride: usize,
    /// One stream of one antenna across the whole block
    pub stream_stride: usize,
    /// All streams of one antenna
    pub fid_stride: usize,
    /// Time offset of one pktidx within a channel row
    pub pktidx_stride: usize,
    /// Number of 16-bit units actually written per block
    pub eff_elems: usize,
}

impl Geometry {
    /// Derive the block geometry, or None when the parameters are not yet
    /// valid or the data area cannot hold a single packet index
    pub fn derive(obs: &ObsInfo, block_data_size: usize) -> Option<Self> {
        if !obs.valid() {
            return None;
        }
        let nants = obs.nants as usize;
        let nstrm = obs.nstrm as usize;
        let pkt_ntime = obs.pkt_ntime as usize;
        let pkt_nchan = obs.pkt_nchan as usize;
        let payload_bytes = obs.payload_bytes();

        let bytes_per_pktidx = nants * nstrm * payload_bytes;
        let piperblk = (block_data_size / bytes_per_pktidx) as u64;
        if piperblk == 0 {
            return None;
        }
        let obsnchan = nants * nstrm * pkt_nchan;
        let eff_block_size = piperblk as usize * bytes_per_pktidx;
        let stream_stride = payload_bytes / 2 * piperblk as usize;
        Some(Self {
            obsnchan,
            piperblk,
            eff_block_size,
            pkts_per_block: piperblk * (nants * nstrm) as u64,
            payload_bytes,
            pkt_ntime,
            pkt_nchan,
            nants,
            nstrm,
            schan: obs.schan,
            ostride: piperblk as usize * pkt_ntime,
            stream_stride,
            fid_stride: stream_stride * nstrm,
            pktidx_stride: pkt_ntime,
            eff_elems: eff_block_size / 2,
        })
    }

    /// Which channel chunk of an antenna a packet belongs to, or None when
    /// the starting channel is outside this instance's share
    pub fn stream_for(&self, feng_chan: u32) -> Option<usize> {
        let rel = feng_chan as i64 - self.schan as i64;
        if rel < 0 || rel as usize % self.pkt_nchan != 0 {
            return None;
        }
        let stream = rel as usize / self.pkt_nchan;
        (stream < self.nstrm).then_some(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean_obs() -> ObsInfo {
        ObsInfo {
            fenchan: 4096,
            nants: 1,
            nstrm: 1,
            pkt_ntime: 16,
            pkt_nchan: 64,
            schan: 0,
        }
    }

    #[test]
    fn test_clean_run_geometry() {
        // 128 packet indices of 1 ant x 1 stream x 64 chan x 16 time x 2 pol
        let geo = Geometry::derive(&clean_obs(), 262_144).unwrap();
        assert_eq!(geo.piperblk, 128);
        assert_eq!(geo.pkts_per_block, 128);
        assert_eq!(geo.obsnchan, 64);
        assert_eq!(geo.payload_bytes, 2048);
        assert_eq!(geo.eff_block_size, 262_144);
        assert_eq!(geo.ostride, 128 * 16);
        assert_eq!(geo.stream_stride, 1024 * 128);
        assert_eq!(geo.fid_stride, geo.stream_stride);
        assert_eq!(geo.pktidx_stride, 16);
    }

    #[test]
    fn test_effective_size_truncates() {
        // A block that holds 127.5 packet indices only holds 127
        let geo = Geometry::derive(&clean_obs(), 262_144 - 1024).unwrap();
        assert_eq!(geo.piperblk, 127);
        assert_eq!(geo.eff_block_size, 127 * 2048);
        assert!(geo.eff_block_size <= 262_144 - 1024);
    }

    #[test]
    fn test_invalid_obs() {
        assert!(!ObsInfo::default().valid());
        assert!(Geometry::derive(&ObsInfo::default(), 262_144).is_none());
        let mut obs = clean_obs();
        obs.pkt_ntime = 0;
        assert!(Geometry::derive(&obs, 262_144).is_none());
        // Valid parameters, but the block can't hold one packet index
        assert!(Geometry::derive(&clean_obs(), 1024).is_none());
    }

    #[test]
    fn test_stream_lookup() {
        let mut obs = clean_obs();
        obs.nstrm = 4;
        obs.schan = 256;
        let geo = Geometry::derive(&obs, 4 * 262_144).unwrap();
        assert_eq!(geo.stream_for(256), Some(0));
        assert_eq!(geo.stream_for(256 + 3 * 64), Some(3));
        // Below SCHAN, misaligned, and past the last stream
        assert_eq!(geo.stream_for(128), None);
        assert_eq!(geo.stream_for(256 + 13), None);
        assert_eq!(geo.stream_for(256 + 4 * 64), None);
    }
}
