//! Bus controller adapters
//!
//! Each adapter implements [`crate::host::adapter::BusController`] for one
//! kind of host controller.

#[cfg(feature = "sdhci")]
pub mod sdhci;
#[cfg(feature = "spi")]
pub mod spi;
