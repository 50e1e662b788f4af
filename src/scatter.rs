//! Strided scatter of one packet payload into a raw block.
//!
//! Block data is a [FID][STREAM][CHAN][TIME] lattice of 16-bit units (the
//! packed polarization pair). A packet owns the rectangle at its antenna,
//! stream, and packet-index coordinates; the kernel walks the payload
//! linearly and strides across the destination.

use byte_slice_cast::{AsMutSliceOf, AsSliceOf};

use crate::obs::Geometry;

/// View a block's data area as 16-bit units. Fails only if the backing
/// storage is misaligned, which the u64-backed rings rule out.
pub fn block_units(data: &mut [u8]) -> Option<&mut [u16]> {
    data.as_mut_slice_of::<u16>().ok()
}

/// View a packet payload as 16-bit units
pub fn payload_units(payload: &[u8]) -> Option<&[u16]> {
    payload.as_slice_of::<u16>().ok()
}

/// Scatter one payload into `block` at the packet's rectangle. Returns
/// false without touching the block when the coordinates or payload do not
/// fit the geometry; the caller drops such packets silently.
pub fn scatter_packet(
    block: &mut [u16],
    geo: &Geometry,
    feng_id: usize,
    stream: usize,
    pktidx: u64,
    payload: &[u16],
) -> bool {
    if feng_id >= geo.nants || stream >= geo.nstrm {
        return false;
    }
    if payload.len() != geo.pkt_ntime * geo.pkt_nchan {
        return false;
    }
    let base = feng_id * geo.fid_stride
        + stream * geo.stream_stride
        + (pktidx % geo.piperblk) as usize * geo.pktidx_stride;
    // The rectangle's last element; proving it in range once makes the
    // indexing below panic-free
    let last = base + (geo.pkt_nchan - 1) * geo.ostride + geo.pkt_ntime - 1;
    if last >= geo.eff_elems || geo.eff_elems > block.len() {
        return false;
    }

    let mut tbase = base;
    for row in payload.chunks_exact(geo.pkt_nchan) {
        let mut dst = tbase;
        for &unit in row {
            block[dst] = unit;
            dst += geo.ostride;
        }
        tbase += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obs::ObsInfo;

    fn small_geometry() -> Geometry {
        let obs = ObsInfo {
            fenchan: 64,
            nants: 2,
            nstrm: 2,
            pkt_ntime: 2,
            pkt_nchan: 4,
            schan: 0,
        };
        // 4 packet indices per block: 2*2*4*2*2 * 4 = 256 bytes
        Geometry::derive(&obs, 256).unwrap()
    }

    #[test]
    fn test_every_sample_lands_at_its_offset() {
        let geo = small_geometry();
        let mut block = vec![0xAAAAu16; geo.eff_elems];
        let payload: Vec<u16> = (0..(geo.pkt_ntime * geo.pkt_nchan) as u16).collect();
        let (fid, stream, pktidx) = (1, 0, 6u64);
        assert!(scatter_packet(&mut block, &geo, fid, stream, pktidx, &payload));

        let base = fid * geo.fid_stride
            + stream * geo.stream_stride
            + (pktidx % geo.piperblk) as usize * geo.pktidx_stride;
        let mut touched = 0;
        for t in 0..geo.pkt_ntime {
            for c in 0..geo.pkt_nchan {
                let at = base + c * geo.ostride + t;
                assert_eq!(block[at], payload[t * geo.pkt_nchan + c]);
                touched += 1;
            }
        }
        // Exactly the rectangle changed, nothing else
        let sentinels = block.iter().filter(|&&v| v == 0xAAAA).count();
        assert_eq!(sentinels, block.len() - touched);
    }

    #[test]
    fn test_extreme_coordinates_stay_in_bounds() {
        let geo = small_geometry();
        let mut block = vec![0u16; geo.eff_elems];
        let payload = vec![1u16; geo.pkt_ntime * geo.pkt_nchan];
        // Highest antenna, stream, and packet index of the block touch the
        // final element and nothing past it
        assert!(scatter_packet(
            &mut block,
            &geo,
            geo.nants - 1,
            geo.nstrm - 1,
            geo.piperblk - 1,
            &payload
        ));
        assert_eq!(block[geo.eff_elems - 1], 1);
    }

    #[test]
    fn test_bad_inputs_leave_block_untouched() {
        let geo = small_geometry();
        let mut block = vec![0u16; geo.eff_elems];
        let good = vec![1u16; geo.pkt_ntime * geo.pkt_nchan];
        assert!(!scatter_packet(&mut block, &geo, geo.nants, 0, 0, &good));
        assert!(!scatter_packet(&mut block, &geo, 0, geo.nstrm, 0, &good));
        let short = vec![1u16; 3];
        assert!(!scatter_packet(&mut block, &geo, 0, 0, 0, &short));
        // Undersized destination
        let mut tiny = vec![0u16; geo.eff_elems - 1];
        assert!(!scatter_packet(&mut tiny, &geo, 0, 0, 0, &good));
        assert!(block.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_duplicate_last_write_wins() {
        let geo = small_geometry();
        let mut block = vec![0u16; geo.eff_elems];
        let first = vec![1u16; geo.pkt_ntime * geo.pkt_nchan];
        let second = vec![2u16; geo.pkt_ntime * geo.pkt_nchan];
        assert!(scatter_packet(&mut block, &geo, 0, 0, 2, &first));
        assert!(scatter_packet(&mut block, &geo, 0, 0, 2, &second));
        let base = 2 * geo.pktidx_stride;
        assert_eq!(block[base], 2);
    }
}
