//! Alpaca Protocol Client
//!
//! Implements the telescope part of the ASCOM Alpaca REST API so the
//! conformance engine can exercise network-attached mounts. Every call is
//! translated into the engine's [`telescope_conform::Telescope`] contract.

mod client;
mod runner;
mod telescope;

pub use client::*;
pub use runner::*;
pub use telescope::*;

/// Alpaca API version
pub const ALPACA_API_VERSION: u32 = 1;

/// Default Alpaca API port
pub const ALPACA_DEFAULT_PORT: u16 = 11111;

/// A telescope exposed by an Alpaca server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlpacaDevice {
    pub device_number: u32,
    pub base_url: String,
}

impl AlpacaDevice {
    pub fn new(base_url: impl Into<String>, device_number: u32) -> Self {
        Self {
            device_number,
            base_url: base_url.into(),
        }
    }

    /// Get a unique identifier for this device
    pub fn id(&self) -> String {
        format!("alpaca:{}:telescope:{}", self.base_url, self.device_number)
    }
}

impl std::fmt::Display for AlpacaDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Telescope #{} at {}", self.device_number, self.base_url)
    }
}
