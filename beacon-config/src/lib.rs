//! Configuration for the Beacon telemetry channel.
//!
//! The configuration is read from a `config.yml` file in a configuration folder. All sections and
//! fields are optional and fall back to defaults suitable for a single process.
//!
//! ```yaml
//! endpoint:
//!   url: https://dc.services.visualstudio.com/v2/track
//!   instrumentation_key: 00000000-0000-0000-0000-000000000000
//! buffer:
//!   max_items: 500
//!   flush_interval: 30
//! sampling:
//!   mode: adaptive
//!   adaptive:
//!     max_items_per_second: 5
//! storage:
//!   max_size: 50MiB
//! ```
#![warn(missing_docs)]

mod byte_size;
mod config;
mod overrides;

pub use byte_size::*;
pub use config::*;
pub use overrides::*;
