//! The device-service seam the sequencer programs boards through.
//!
//! Calls look synchronous but cross an RPC boundary that may suspend, fail
//! or time out. These are the only suspension points in a cycle; the compile
//! pipeline never touches this trait.

use anyhow::Result;
use async_trait::async_trait;

/// Program/start channel to the FPGA device service.
///
/// Any failure is treated as that board's programming or start failing and
/// propagates as a fatal sequence error; a failed start is never reported as
/// success.
#[async_trait]
pub trait BoardBus: Send + Sync {
    /// Load a compiled byte program into a board's sequence RAM.
    async fn program_sequence(&self, board_id: &str, program: &[u8]) -> Result<()>;

    /// Arm a programmed board. Primed boards release on the master trigger.
    async fn start_sequence(&self, board_id: &str) -> Result<()>;
}
