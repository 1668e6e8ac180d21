use std::collections::BTreeMap;

/// Configuration values that can be overridden from the environment or the command line.
///
/// All values are raw strings and are validated when applied with
/// [`Config::apply_override`](crate::Config::apply_override).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OverridableConfig {
    /// The ingestion endpoint URL.
    pub endpoint: Option<String>,
    /// The instrumentation key. An empty value removes a configured key.
    pub instrumentation_key: Option<String>,
    /// The folder of the overflow store.
    pub storage_path: Option<String>,
    /// A fixed sampling percentage.
    pub sampling_percentage: Option<String>,
    /// The shutdown timeout in seconds.
    pub shutdown_timeout: Option<String>,
}

impl OverridableConfig {
    /// Extracts overrides from application settings.
    ///
    /// The keys are the setting names without prefix, as returned by
    /// [`Platform::application_settings`](beacon_common::Platform::application_settings). For
    /// instance, `BEACON_ENDPOINT` overrides the endpoint.
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| settings.get(key).cloned();

        Self {
            endpoint: get("endpoint"),
            instrumentation_key: get("instrumentation_key"),
            storage_path: get("storage_path"),
            sampling_percentage: get("sampling_percentage"),
            shutdown_timeout: get("shutdown_timeout"),
        }
    }

    /// Fills all values not set in `self` from `fallback`.
    pub fn or(self, fallback: Self) -> Self {
        Self {
            endpoint: self.endpoint.or(fallback.endpoint),
            instrumentation_key: self.instrumentation_key.or(fallback.instrumentation_key),
            storage_path: self.storage_path.or(fallback.storage_path),
            sampling_percentage: self.sampling_percentage.or(fallback.sampling_percentage),
            shutdown_timeout: self.shutdown_timeout.or(fallback.shutdown_timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_settings() {
        let settings = BTreeMap::from([
            ("endpoint".to_owned(), "http://localhost".to_owned()),
            ("unrelated".to_owned(), "1".to_owned()),
        ]);

        let overrides = OverridableConfig::from_settings(&settings);
        assert_eq!(
            overrides,
            OverridableConfig {
                endpoint: Some("http://localhost".to_owned()),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_precedence() {
        let cli = OverridableConfig {
            endpoint: Some("http://cli".to_owned()),
            ..Default::default()
        };
        let env = OverridableConfig {
            endpoint: Some("http://env".to_owned()),
            storage_path: Some("/var/lib/beacon".to_owned()),
            ..Default::default()
        };

        let merged = cli.or(env);
        assert_eq!(merged.endpoint.as_deref(), Some("http://cli"));
        assert_eq!(merged.storage_path.as_deref(), Some("/var/lib/beacon"));
    }
}
