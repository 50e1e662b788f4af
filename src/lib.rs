use num_complex::Complex;

pub mod args;
pub mod assembler;
pub mod block;
pub mod capture;
pub mod ingest;
pub mod monitoring;
pub mod obs;
pub mod packet;
pub mod scatter;
pub mod state;
pub mod status;

/// Required alignment of the header and payload offsets within a packet slot
pub const PKT_ALIGNMENT_SIZE: usize = 64;
/// Offset of the application header within a slot (past the 42-byte
/// eth/IP/UDP encapsulation, rounded up to the alignment)
pub const PKT_OFFSET_HEADER: usize = 64;
/// Offset of the voltage payload within a slot
pub const PKT_OFFSET_PAYLOAD: usize = 128;

/// One status record is a fixed 80-byte card
pub const STATUS_RECORD_SIZE: usize = 80;
/// Size of the status snapshot copied into each block header
pub const STATUS_TOTAL_SIZE: usize = STATUS_RECORD_SIZE * 192;

/// The top 8 bits of the packet timestamp carry an auxiliary channel tag
/// and are masked off before any index math
pub const PKTIDX_MASK: u64 = (1 << 56) - 1;

pub const DEFAULT_BINDPORT: u16 = 4015;
pub const DEFAULT_MAXFLOWS: u32 = 16;
pub const DEFAULT_DWELL_SECONDS: f64 = 300.0;

/// A single-polarization voltage sample (4+4 bit complex on the wire,
/// sign-extended on unpack)
pub type ComplexByte = Complex<i8>;
