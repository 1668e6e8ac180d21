//! Beacon forwards telemetry to an ingestion endpoint.
//!
//! The binary reads telemetry items as newline delimited JSON from standard input and submits
//! them through a [`beacon_channel::Channel`]. It is a thin shell around the channel: items are
//! buffered, sampled and batched, and transmissions that fail are kept in an overflow store on
//! disk until they can be delivered, also across restarts.
//!
//! # Usage
//!
//! ```text
//! my-application | beacon run --config ./.beacon
//! ```
//!
//! Every input line is a JSON object with at least a `kind`, for instance:
//!
//! ```json
//! {"kind": "event", "correlation_id": "f3a1", "data": {"name": "checkout"}}
//! ```
//!
//! The configuration is read from `config.yml` in the config folder. A few values can be
//! overridden with `BEACON_*` environment variables or command line arguments; run
//! `beacon config show` to print the effective configuration.
//!
//! # Workspace Crates
//!
//!  - `beacon`: Main entry point and command line interface.
//!  - [`beacon-channel`]: Item buffer, transmission scheduler and overflow store.
//!  - [`beacon-common`]: Common utilities shared by all crates.
//!  - [`beacon-config`]: Static configuration for the CLI and the channel.
//!  - [`beacon-log`]: Logging setup.
//!  - [`beacon-sampling`]: Fixed and adaptive sampling.
//!  - [`beacon-statsd`]: StatsD metric client for internal measurements.
//!
//! [`beacon-channel`]: ../beacon_channel/index.html
//! [`beacon-common`]: ../beacon_common/index.html
//! [`beacon-config`]: ../beacon_config/index.html
//! [`beacon-log`]: ../beacon_log/index.html
//! [`beacon-sampling`]: ../beacon_sampling/index.html
//! [`beacon-statsd`]: ../beacon_statsd/index.html
#![warn(missing_docs)]

mod cli;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            beacon_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
