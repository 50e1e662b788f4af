use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use snap_slurper::args::{convert_filter, Args};
use snap_slurper::block::{BlockRing, RingWait};
use snap_slurper::capture::{capture_udp, CaptureSource, PacketSource};
use snap_slurper::ingest::{run_ingest, set_realtime, IngestContext};
use snap_slurper::monitoring;
use snap_slurper::packet::SlotLayout;
use snap_slurper::status::{find_record, StatusBuffer};
use snap_slurper::{DEFAULT_MAXFLOWS, STATUS_TOTAL_SIZE};
use tracing::debug;

fn main() -> eyre::Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let status = Arc::new(StatusBuffer::new());
    {
        let mut st = status.lock();
        st.put_str("BINDHOST", &args.device_name);
        st.put_u32("BINDPORT", args.port as u32);
    }

    let layout = SlotLayout::for_payload(args.payload_size, args.slots);
    let source = Arc::new(CaptureSource::new(args.in_blocks, layout, DEFAULT_MAXFLOWS));
    let out_ring = Arc::new(BlockRing::new(
        args.out_blocks,
        STATUS_TOTAL_SIZE,
        args.block_size,
    ));
    let run = Arc::new(AtomicBool::new(true));
    let (stats_tx, stats_rx) = crossbeam_channel::bounded(64);

    let cap = pcap::Capture::from_device(args.device_name.as_str())?
        .snaplen(9200)
        .promisc(true)
        .timeout(50)
        .open()?;
    let capture_handle = {
        let source = Arc::clone(&source);
        let run = Arc::clone(&run);
        thread::spawn(move || capture_udp(cap, &source, &run))
    };

    let monitor_handle = thread::spawn(move || monitoring::monitor(stats_rx));

    // Stand-in for the downstream recorder: drain filled blocks in order
    let drain_handle = {
        let ring = Arc::clone(&out_ring);
        let run = Arc::clone(&run);
        thread::spawn(move || {
            let mut idx = 0;
            while run.load(Ordering::Relaxed) {
                match ring.wait_filled(idx, Duration::from_millis(100)) {
                    RingWait::Ready => {
                        // Safety: observed Filled, released right below
                        let header = unsafe { ring.header(idx) };
                        if let Some(pktidx) = find_record(header, "PKTIDX") {
                            debug!("drained block at PKTIDX {pktidx}");
                        }
                        ring.set_free(idx);
                        idx = (idx + 1) % ring.n_blocks();
                    }
                    RingWait::TimedOut => continue,
                    RingWait::Shutdown => break,
                }
            }
        })
    };

    // The ingest owns this thread until cancellation or a fatal error
    set_realtime(args.core);
    let result = run_ingest(IngestContext {
        status,
        source: Arc::clone(&source) as Arc<dyn PacketSource>,
        out_ring: Arc::clone(&out_ring),
        run: Arc::clone(&run),
        stats: Some(stats_tx),
    });

    run.store(false, Ordering::Relaxed);
    source.ring().shutdown();
    out_ring.shutdown();
    let _ = capture_handle.join();
    let _ = drain_handle.join();
    let _ = monitor_handle.join();

    result?;
    Ok(())
}
