use beacon_config::Config;
use beacon_statsd::MetricsClientConfig;

/// Print spawn infos to the log.
pub fn dump_spawn_infos(config: &Config) {
    if config.path().as_os_str().is_empty() {
        beacon_log::info!("launching beacon without config folder");
    } else {
        beacon_log::info!(
            "launching beacon from config folder {}",
            config.path().display()
        );
    }

    beacon_log::info!("  endpoint: {}", config.endpoint());
    match config.instrumentation_key() {
        Some(key) => beacon_log::info!("  instrumentation key: {key}"),
        None => beacon_log::info!("  instrumentation key: -"),
    };
    beacon_log::info!("  sampling: {:?}", config.sampling().mode);
    beacon_log::info!("  overflow store: {}", config.storage_path().display());
    beacon_log::info!("  log level: {}", config.logging().level);
}

/// Initialize the metric system.
pub fn init_metrics(config: &Config) {
    let Some(host) = config.statsd_addr() else {
        return;
    };

    beacon_statsd::init(MetricsClientConfig {
        prefix: config.metrics_prefix(),
        host,
        default_tags: config.metrics_default_tags().clone(),
        default_sample_rate: config.metrics_sample_rate().into(),
    });
}
