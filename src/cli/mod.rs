//! Command-line interface for purgeman.

use crate::config::ServiceConfig;
use crate::daemon::CHILD_PROCESS_ARG;
use crate::error::Result;
use clap::Parser;
use std::path::{Path, PathBuf};

/// purgeman - purges HTTP caches when catalog entries change.
#[derive(Parser, Debug)]
#[command(name = "purgeman")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path, `-` to read it from stdin.
    ///
    /// Without a file, settings are read from `PURGEMAN_*` variables.
    #[arg(short, long, env = "PURGEMAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stay in the foreground instead of detaching
    #[arg(short, long)]
    pub foreground: bool,

    /// Log file path
    #[arg(long, env = "PURGEMAN_LOG")]
    pub log: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Run as the background child of a detaching parent
    #[arg(long = "child-process", hide = true)]
    pub child_process: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Load the configuration and apply command-line overrides.
    pub fn load_config(&self) -> Result<ServiceConfig> {
        let mut config = match self.config.as_deref() {
            Some(path) if path == Path::new("-") => ServiceConfig::from_reader(std::io::stdin())?,
            Some(path) => ServiceConfig::from_file(path)?,
            None => ServiceConfig::from_env()?,
        };

        self.apply_overrides(&mut config);
        Ok(config)
    }

    /// Apply flags given on the command line on top of `config`.
    pub fn apply_overrides(&self, config: &mut ServiceConfig) {
        if self.foreground {
            config.foreground = true;
        }
        if let Some(log) = &self.log {
            config.observability.log_path = Some(log.clone());
        }
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
    }
}

/// Whether the raw process arguments mark this process as the background child.
pub fn is_child_process<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter().skip(1).any(|arg| arg.as_ref() == CHILD_PROCESS_ARG)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "purgeman",
            "--config",
            "/etc/purgeman.yaml",
            "-f",
            "--log",
            "/var/log/purgeman.log",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/purgeman.yaml")));
        assert!(cli.foreground);
        assert_eq!(cli.log, Some(PathBuf::from("/var/log/purgeman.log")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(!cli.child_process);
    }

    #[test]
    fn test_child_marker() {
        let cli = Cli::try_parse_from(["purgeman", CHILD_PROCESS_ARG]).unwrap();
        assert!(cli.child_process);

        assert!(is_child_process(["purgeman", "--child-process"]));
        assert!(!is_child_process(["--child-process"]));
        assert!(!is_child_process(["purgeman", "-f"]));
    }

    #[test]
    fn test_load_config_file_with_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "broker:\n  host: mq.local\n  exchange: irods\nretry_interval: 5s\n"
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "purgeman",
            "--config",
            file.path().to_str().unwrap(),
            "--foreground",
            "--log-level",
            "warn",
        ])
        .unwrap();

        let config = cli.load_config().unwrap();
        assert_eq!(config.broker.host, "mq.local");
        assert_eq!(config.broker.exchange, "irods");
        assert_eq!(config.retry_interval, std::time::Duration::from_secs(5));
        assert!(config.foreground);
        assert_eq!(config.observability.log_level, "warn");
    }

    #[test]
    fn test_load_config_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli::try_parse_from(["purgeman", "--config", dir.path().to_str().unwrap()])
            .unwrap();
        assert!(cli.load_config().unwrap_err().is_config());
    }
}
