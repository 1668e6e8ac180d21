//! Common functionality for the Beacon telemetry crates.
#![warn(missing_docs)]

mod kind;
mod platform;
mod retry;
mod time;

pub use kind::*;
pub use platform::*;
pub use retry::*;
pub use time::*;
