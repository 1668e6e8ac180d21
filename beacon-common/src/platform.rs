//! Access to the host environment.
//!
//! The pipeline reads machine identity, settings and configuration files only through the
//! [`Platform`] trait, so that embedders and tests can substitute their own environment.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

/// Prefix of environment variables exposed as application settings.
pub const SETTINGS_PREFIX: &str = "BEACON_";

/// Capabilities of the host the telemetry channel runs on.
pub trait Platform: Send + Sync {
    /// Returns application settings as lowercase keys without prefix.
    fn application_settings(&self) -> BTreeMap<String, String>;

    /// Reads a configuration file, returning `None` if it does not exist.
    fn read_configuration(&self, path: &Path) -> io::Result<Option<String>>;

    /// Writes a line of diagnostic output for a developer watching the process.
    fn write_debug_output(&self, message: &str);

    /// Returns the name of this machine, if it can be determined.
    fn machine_name(&self) -> Option<String>;
}

/// The platform implementation backed by the process environment and the local filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultPlatform;

impl Platform for DefaultPlatform {
    fn application_settings(&self) -> BTreeMap<String, String> {
        settings_from_vars(std::env::vars())
    }

    fn read_configuration(&self, path: &Path) -> io::Result<Option<String>> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(Some(contents)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    #[allow(clippy::print_stderr)]
    fn write_debug_output(&self, message: &str) {
        eprintln!("[beacon] {message}");
    }

    fn machine_name(&self) -> Option<String> {
        hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .filter(|name| !name.is_empty())
    }
}

/// Collects all `BEACON_*` variables, stripping the prefix and lowercasing the key.
pub fn settings_from_vars<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(key, value)| {
            let name = key.strip_prefix(SETTINGS_PREFIX)?;
            (!name.is_empty()).then(|| (name.to_ascii_lowercase(), value))
        })
        .collect()
}
