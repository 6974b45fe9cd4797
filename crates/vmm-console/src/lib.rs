//! Console multiplexer: captures per-VM serial output from FIFOs into
//! bounded timestamped rings and streams it to attached clients.

pub mod mux;
pub mod ring;

pub use mux::Mux;
pub use ring::ConsoleRing;
