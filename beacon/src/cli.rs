use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_channel::{Channel, ChannelOptions, HttpTransport, TelemetryItem};
use beacon_common::{DefaultPlatform, Platform};
use beacon_config::{Config, OverridableConfig};
use clap::{Arg, ArgMatches, Command, value_parser};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::setup;

/// Default folder holding `config.yml`.
const DEFAULT_CONFIG_PATH: &str = ".beacon";

fn make_app() -> Command {
    Command::new("beacon")
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_name("CONFIG")
                .value_parser(value_parser!(PathBuf))
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Forward telemetry items read from stdin")
                .after_help(
                    "Reads one JSON object per line from stdin until EOF or an interrupt, then \
                     flushes and exits.",
                )
                .arg(
                    Arg::new("endpoint")
                        .long("endpoint")
                        .value_name("URL")
                        .help("The ingestion endpoint URL."),
                )
                .arg(
                    Arg::new("instrumentation_key")
                        .long("instrumentation-key")
                        .value_name("KEY")
                        .help("The instrumentation key written into every item."),
                )
                .arg(
                    Arg::new("storage_path")
                        .long("storage-path")
                        .value_name("PATH")
                        .help("The folder of the overflow store."),
                )
                .arg(
                    Arg::new("sampling_percentage")
                        .long("sampling-percentage")
                        .value_name("PERCENT")
                        .help("Sample all items at a fixed percentage."),
                )
                .arg(
                    Arg::new("shutdown_timeout")
                        .long("shutdown-timeout")
                        .value_name("SECONDS")
                        .help("Time to wait for pending transmissions on exit."),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the beacon config")
                .subcommand_required(true)
                .subcommand(Command::new("show").about("Show the effective configuration")),
        )
}

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let matches = make_app().get_matches();
    let config_path = matches
        .get_one::<PathBuf>("config")
        .map_or(Path::new(DEFAULT_CONFIG_PATH), PathBuf::as_path);

    let platform = DefaultPlatform;
    let mut config = Config::from_path(config_path)?;

    // Arguments of `run` take precedence over the environment.
    let arguments = match matches.subcommand_matches("run") {
        Some(matches) => extract_overrides(matches),
        None => OverridableConfig::default(),
    };
    let settings = OverridableConfig::from_settings(&platform.application_settings());
    config.apply_override(arguments.or(settings))?;

    beacon_log::init(config.logging());

    if let Some(matches) = matches.subcommand_matches("config") {
        manage_config(&config, matches)
    } else if matches.subcommand_matches("run").is_some() {
        run(config)
    } else {
        unreachable!();
    }
}

fn extract_overrides(matches: &ArgMatches) -> OverridableConfig {
    let get = |id: &str| matches.get_one::<String>(id).cloned();

    OverridableConfig {
        endpoint: get("endpoint"),
        instrumentation_key: get("instrumentation_key"),
        storage_path: get("storage_path"),
        sampling_percentage: get("sampling_percentage"),
        shutdown_timeout: get("shutdown_timeout"),
    }
}

fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    if matches.subcommand_matches("show").is_some() {
        show_config(config)
    } else {
        unreachable!();
    }
}

#[allow(clippy::print_stdout)]
fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.to_yaml_string()?);
    Ok(())
}

fn run(config: Config) -> Result<()> {
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("beacon")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(forward_stdin(Arc::new(config)))
}

async fn forward_stdin(config: Arc<Config>) -> Result<()> {
    let transport = HttpTransport::new(&config).context("failed to create the HTTP client")?;
    let channel = Channel::start(config.clone(), transport, ChannelOptions::default()).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).split(b'\n');
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    loop {
        tokio::select! {
            line = lines.next_segment() => match line {
                Ok(Some(line)) => {
                    if let Some(item) = parse_line(&line) {
                        channel.track(item);
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    beacon_log::error!(
                        error = &error as &dyn std::error::Error,
                        "failed to read stdin, shutting down"
                    );
                    break;
                }
            },
            _ = &mut interrupt => {
                beacon_log::info!("received interrupt, shutting down");
                break;
            }
        }
    }

    let report = channel.shutdown(config.shutdown_timeout()).await;
    beacon_log::info!(
        sent = report.sent,
        persisted = report.persisted,
        dropped = report.dropped,
        "beacon stopped"
    );

    Ok(())
}

/// Parses one line of input into an item.
///
/// Lines are raw bytes, so input that is not valid UTF-8 is rejected by the JSON parser and
/// skipped like any other malformed item.
fn parse_line(line: &[u8]) -> Option<TelemetryItem> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return None;
    }

    match serde_json::from_slice(line) {
        Ok(item) => Some(item),
        Err(error) => {
            beacon_log::warn!(
                error = &error as &dyn std::error::Error,
                "skipping invalid telemetry item"
            );
            None
        }
    }
}
