//! Argument parsing for running from the command line.
//!
//! Only host plumbing lives here; every observation parameter flows through
//! the status buffer.

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Network device to capture packets from (MTU must allow jumbo frames)
    #[clap(short, long)]
    pub device_name: String,
    /// Port the F-engines send UDP data to
    #[clap(short, long, default_value_t = 4015)]
    #[clap(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,
    /// Voltage payload bytes per packet (PKTNTIME x PKTNCHAN x 2)
    #[clap(long, default_value_t = 8192)]
    pub payload_size: usize,
    /// Packet slots per input block
    #[clap(long, default_value_t = 2048)]
    pub slots: usize,
    /// Blocks in the packet-input ring
    #[clap(long, default_value_t = 8)]
    pub in_blocks: usize,
    /// Blocks in the raw-block output ring
    #[clap(long, default_value_t = 8)]
    pub out_blocks: usize,
    /// Data bytes per output block
    #[clap(long, default_value_t = 128 * 1024 * 1024)]
    pub block_size: usize,
    /// Pin the ingest thread to this core
    #[clap(long)]
    pub core: Option<usize>,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}
