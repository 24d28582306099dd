//! Settlement engines.
//!
//! - `rtgs`: gross settlement with the three-stage admission check
//!   (bilateral limit, multilateral limit, liquidity)
//! - `release`: the bounded Q2 liquidity-release cascade
//! - `lsm`: liquidity-saving netting (bilateral offsets and multilateral
//!   cycles), operating only on Q2

pub mod lsm;
pub mod release;
pub mod rtgs;
