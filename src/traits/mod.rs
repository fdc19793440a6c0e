//! Capability traits at the external-collaborator seam.

pub mod board_bus;

pub use board_bus::BoardBus;
