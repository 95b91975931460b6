//! Generic Access Profile types shared with the Security Manager
//!
//! Only the addressing model is needed here: device addresses, their types and
//! the random address sub-types used for privacy.

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;
