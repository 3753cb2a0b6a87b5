//! CLI argument parsing for gpolicy

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Watch GPU policy violations and print them as JSON lines
#[derive(Debug, Parser)]
#[command(name = "gpolicy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/gpolicy/config.yaml")]
    pub config: PathBuf,

    /// Watch only these device ids (overrides config)
    #[arg(short, long, value_delimiter = ',')]
    pub devices: Vec<u32>,

    /// Interval between device sweeps
    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub poll_interval: Duration,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "GPOLICY_METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GPOLICY_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "GPOLICY_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["gpolicy"]).unwrap();
        assert_eq!(cli.config.to_str().unwrap(), "/etc/gpolicy/config.yaml");
        assert!(cli.devices.is_empty());
        assert_eq!(cli.poll_interval, Duration::from_secs(1));
        assert_eq!(cli.log_level, "info");
        assert!(!cli.log_json);
    }

    #[test]
    fn test_cli_device_list() {
        let cli = Cli::try_parse_from(["gpolicy", "-d", "0,3", "--poll-interval", "250ms"]).unwrap();
        assert_eq!(cli.devices, vec![0, 3]);
        assert_eq!(cli.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_cli_rejects_bad_interval() {
        assert!(Cli::try_parse_from(["gpolicy", "--poll-interval", "soon"]).is_err());
    }
}
