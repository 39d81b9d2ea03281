//! Identifier and address types shared by the HPNL crates.

#[macro_use]
pub mod strong_type;

pub mod address;
pub mod ids;

pub use address::{Address, AddressParseError};
pub use ids::*;
