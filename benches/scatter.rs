use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;
use snap_slurper::obs::{Geometry, ObsInfo};
use snap_slurper::packet::{encode_header, parse_slot, write_frame, FengInfo, SlotLayout};
use snap_slurper::scatter::scatter_packet;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    // The production SNAP geometry: 256 channels x 16 times per packet
    let obs = ObsInfo {
        fenchan: 4096,
        nants: 1,
        nstrm: 1,
        pkt_ntime: 16,
        pkt_nchan: 256,
        schan: 0,
    };
    let geo = Geometry::derive(&obs, 128 * 1024 * 1024).unwrap();

    let mut payload = vec![0u8; geo.payload_bytes];
    rng.fill(&mut payload[..]);
    let info = FengInfo {
        pktidx: 12345,
        feng_id: 0,
        feng_chan: 0,
    };

    let layout = SlotLayout::for_payload(geo.payload_bytes, 16);
    let mut slot = vec![0u8; layout.slot_size];
    write_frame(&mut slot, &layout, &encode_header(&info, 256), &payload);

    c.bench_function("header parse", |b| {
        b.iter(|| parse_slot(black_box(&slot), black_box(&layout)))
    });

    let mut block = vec![0u16; geo.eff_elems];
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect();
    c.bench_function("packet scatter", |b| {
        b.iter(|| {
            scatter_packet(
                black_box(&mut block),
                &geo,
                0,
                0,
                black_box(info.pktidx),
                &units,
            )
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
