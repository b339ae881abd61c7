pub mod codec;
pub mod reassembly;
pub mod transport;
