//! # Rustkasa
//!
//! Asynchronous TP-Link Kasa Local API implementation for local control and
//! monitoring of Kasa smart-home mains devices (plugs, dimmers, bulbs, power
//! strips) without cloud dependencies.
//!
//! Devices are found via UDP broadcast discovery and controlled over a
//! per-device TCP command channel. Two incompatible wire generations are
//! supported behind one call contract: the legacy length-prefixed autokey-XOR
//! framing, and the KLAP handshake-authenticated protocol of newer firmware.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rustkasa::{Credentials, Registry};
//!
//! # async fn run() -> rustkasa::Result<()> {
//! let registry = Registry::new(Credentials::default());
//! registry.refresh().await?;
//! if let Some(device) = registry.get("8006A1B2C3").await {
//!     device.set_relay(true).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod device;
pub mod discovery;
pub mod error;
pub mod klap;
pub mod registry;
pub mod transport;

pub use device::{
    ChildOutlet, Device, DeviceDescriptor, DeviceFamily, DeviceState, EnergyReading, Facet, Outlet,
};
pub use discovery::{DiscoveredDevice, Discovery};
pub use error::{KasaError, Result};
pub use klap::Credentials;
pub use registry::Registry;
pub use transport::{Endpoint, LEGACY_PORT, ProtocolVariant, Transport};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
