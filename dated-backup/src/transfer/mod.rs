//! Transfer accounting shared by the local store and remote transports.

pub mod progress;

pub use progress::{TransferStats, TransferTimer};
