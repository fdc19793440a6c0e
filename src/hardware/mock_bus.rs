//! Mock board bus for testing
//!
//! Simulates the FPGA device service without hardware. It provides:
//! - Simulated call latency
//! - Per-board and one-shot failure injection
//! - Call logging for test verification, including start ordering

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::traits::BoardBus;

/// One recorded bus operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    Program { board: String, bytes: Vec<u8> },
    Start { board: String },
}

/// Mock implementation of [`BoardBus`].
///
/// # Example
///
/// ```
/// use shotctl::hardware::MockBus;
/// use shotctl::traits::BoardBus;
///
/// # async fn example() -> anyhow::Result<()> {
/// let bus = MockBus::new();
/// bus.program_sequence("alpha", &[0, 1, 2]).await?;
/// bus.start_sequence("alpha").await?;
/// assert_eq!(bus.started_boards(), vec!["alpha"]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MockBus {
    latency_ms: Arc<Mutex<u64>>,
    should_fail_next: Arc<AtomicBool>,
    fail_program: Arc<Mutex<HashSet<String>>>,
    fail_start: Arc<Mutex<HashSet<String>>>,
    call_log: Arc<Mutex<Vec<BusCall>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set simulated latency in milliseconds
    pub fn with_latency(self, ms: u64) -> Self {
        *self.latency_ms.lock().unwrap() = ms;
        self
    }

    /// Inject a failure for the next operation, whatever it is
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Fail every `program_sequence` call for the given board
    pub fn fail_program_for(&self, board: &str) {
        self.fail_program.lock().unwrap().insert(board.to_string());
    }

    /// Fail every `start_sequence` call for the given board
    pub fn fail_start_for(&self, board: &str) {
        self.fail_start.lock().unwrap().insert(board.to_string());
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<BusCall> {
        self.call_log.lock().unwrap().clone()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.call_log.lock().unwrap().clear();
    }

    /// Boards that received `start_sequence`, in call order
    pub fn started_boards(&self) -> Vec<String> {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                BusCall::Start { board } => Some(board.clone()),
                BusCall::Program { .. } => None,
            })
            .collect()
    }

    /// Boards that received `program_sequence`, in call order
    pub fn programmed_boards(&self) -> Vec<String> {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                BusCall::Program { board, .. } => Some(board.clone()),
                BusCall::Start { .. } => None,
            })
            .collect()
    }

    /// The byte program last loaded into a board, if any
    pub fn program_for(&self, board: &str) -> Option<Vec<u8>> {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find_map(|call| match call {
                BusCall::Program { board: b, bytes } if b == board => Some(bytes.clone()),
                _ => None,
            })
    }

    fn log_call(&self, call: BusCall) {
        self.call_log.lock().unwrap().push(call);
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency_ms.lock().unwrap();
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }
}

#[async_trait]
impl BoardBus for MockBus {
    async fn program_sequence(&self, board_id: &str, program: &[u8]) -> Result<()> {
        self.simulate_latency().await;
        self.log_call(BusCall::Program {
            board: board_id.to_string(),
            bytes: program.to_vec(),
        });

        if self.check_failure() || self.fail_program.lock().unwrap().contains(board_id) {
            return Err(anyhow!("injected programming failure for '{board_id}'"));
        }
        Ok(())
    }

    async fn start_sequence(&self, board_id: &str) -> Result<()> {
        self.simulate_latency().await;
        self.log_call(BusCall::Start {
            board: board_id.to_string(),
        });

        if self.check_failure() || self.fail_start.lock().unwrap().contains(board_id) {
            return Err(anyhow!("injected start failure for '{board_id}'"));
        }
        Ok(())
    }
}
