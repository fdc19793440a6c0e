//! Hardware seam implementations.
//!
//! The wire transport to the FPGA device service lives outside this crate;
//! what ships here is the mock used by tests and demos.

pub mod mock_bus;

pub use mock_bus::{BusCall, MockBus};
