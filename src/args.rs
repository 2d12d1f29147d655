// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use clap::{
    Parser,
    error::{Error, ErrorKind},
};
use reqwest::Client;
use serde::Deserialize;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

use crate::transfer::Command;

pub const DEFAULT_MOUNT_POINT: &str = "fatfs";
pub const DEFAULT_CAPACITY: u64 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_URL_LENGTH: usize = 8 * 1024;
const DEFAULT_NETWORK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum ArgsError {
    #[error("Failed to build HTTP client: {0}")]
    ClientBuild(#[from] reqwest::Error),
    #[error("Failed to read config file {path}: {source}")]
    ReadConfig {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    ParseConfig {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Parser, Debug, Clone)]
#[command(
    version,
    about,
    long_about = "Download a URL received on stdin into a capacity-bounded storage volume"
)]
pub struct Args {
    /// Destination path inside the volume, or `null` to discard the body
    pub destination: String,

    /// Number of URL bytes sent on stdin after the input prompt
    #[arg(allow_negative_numbers = true)]
    pub url_length: i64,

    /// Network read buffer size in bytes
    #[arg(allow_negative_numbers = true)]
    pub network_buffer_size: i64,

    /// Storage write buffer size in bytes
    #[arg(allow_negative_numbers = true)]
    pub storage_buffer_size: i64,

    /// Time to wait for the URL on stdin, in seconds
    #[arg(long, value_parser = parse_duration_seconds)]
    pub acquire_timeout: Option<Duration>,

    /// Volume capacity in bytes
    #[arg(long, value_parser = parse_greater_than_zero::<u64>)]
    pub capacity: Option<u64>,

    /// TOML configuration file
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Maximum accepted URL length in bytes
    #[arg(long, value_parser = parse_greater_than_zero::<usize>)]
    pub max_url_length: Option<usize>,

    /// Directory backing the storage volume
    #[arg(long, short)]
    pub mount_point: Option<PathBuf>,

    /// Network connect and read timeout in seconds
    #[arg(long, value_parser = parse_duration_seconds)]
    pub network_timeout: Option<Duration>,

    /// Disable progress bar output
    #[arg(long, short, default_value_t = false)]
    pub quiet: bool,

    /// User-Agent string for HTTP requests
    #[arg(long, short)]
    pub user_agent: Option<String>,
}

impl Args {
    pub fn command(&self) -> Command {
        Command {
            destination: self.destination.clone(),
            url_length: self.url_length,
            network_buffer_size: self.network_buffer_size,
            storage_buffer_size: self.storage_buffer_size,
        }
    }
}

/// Settings read from the `--config` file. Every key is optional.
#[derive(Deserialize, Debug, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub mount_point: Option<PathBuf>,
    pub capacity: Option<u64>,
    pub network_timeout_secs: Option<u64>,
    pub acquire_timeout_secs: Option<u64>,
    pub max_url_length: Option<usize>,
    pub user_agent: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ArgsError> {
        let content = std::fs::read_to_string(path).map_err(|source| ArgsError::ReadConfig {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ArgsError::ParseConfig {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub mount_point: PathBuf,
    pub capacity: u64,
    pub network_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_url_length: usize,
    pub user_agent: String,
    pub quiet: bool,
}

impl Settings {
    /// Command line flags win over the config file, which wins over defaults.
    pub fn resolve(args: &Args, file: FileConfig) -> Self {
        let seconds = |secs: Option<u64>| secs.filter(|s| *s > 0).map(Duration::from_secs);

        Settings {
            mount_point: args
                .mount_point
                .clone()
                .or(file.mount_point)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MOUNT_POINT)),
            capacity: args
                .capacity
                .or(file.capacity.filter(|c| *c > 0))
                .unwrap_or(DEFAULT_CAPACITY),
            network_timeout: args
                .network_timeout
                .or(seconds(file.network_timeout_secs))
                .unwrap_or(DEFAULT_NETWORK_TIMEOUT),
            acquire_timeout: args
                .acquire_timeout
                .or(seconds(file.acquire_timeout_secs))
                .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT),
            max_url_length: args
                .max_url_length
                .or(file.max_url_length.filter(|l| *l > 0))
                .unwrap_or(DEFAULT_MAX_URL_LENGTH),
            user_agent: args
                .user_agent
                .clone()
                .or(file.user_agent)
                .unwrap_or_else(default_user_agent),
            quiet: args.quiet,
        }
    }
}

fn default_user_agent() -> String {
    concat!(
        "httpget-to-fs/",
        env!("CARGO_PKG_VERSION_MAJOR"),
        ".",
        env!("CARGO_PKG_VERSION_MINOR")
    )
    .to_string()
}

fn parse_greater_than_zero<T>(s: &str) -> Result<T, Error>
where
    T: std::str::FromStr + Default + PartialEq,
{
    let v: T = s.parse().map_err(|_| {
        Error::raw(
            ErrorKind::InvalidValue,
            format!("`{s}` isn't a valid integer"),
        )
    })?;
    if v == T::default() {
        Err(Error::raw(
            ErrorKind::InvalidValue,
            "Value must be greater than 0",
        ))
    } else {
        Ok(v)
    }
}

fn parse_duration_seconds(s: &str) -> Result<Duration, Error> {
    let seconds = parse_greater_than_zero::<u64>(s)?;
    Ok(Duration::from_secs(seconds))
}

pub fn build_client(settings: &Settings) -> Result<Client, ArgsError> {
    Ok(reqwest::Client::builder()
        .connect_timeout(settings.network_timeout)
        .read_timeout(settings.network_timeout)
        .user_agent(&settings.user_agent)
        .build()?)
}

pub fn parse_args() -> Result<(Args, Settings, Client), ArgsError> {
    let args = Args::parse();

    let file = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let settings = Settings::resolve(&args, file);
    let client = build_client(&settings)?;

    Ok((args, settings, client))
}

#[cfg(test)]
pub fn create_test_settings(mount_point: PathBuf) -> Settings {
    Settings {
        mount_point,
        capacity: 1 << 20,
        network_timeout: Duration::from_secs(5),
        acquire_timeout: Duration::from_secs(5),
        max_url_length: DEFAULT_MAX_URL_LENGTH,
        user_agent: "test-agent/1.0".to_string(),
        quiet: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;
    use std::time::Duration;
    use tempfile::TempDir;

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["httpget-to-fs", "out.bin", "20", "4096", "4096"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn parse_greater_than_zero_valid() {
        assert_eq!(parse_greater_than_zero::<usize>("1").unwrap(), 1);
        assert_eq!(parse_greater_than_zero::<usize>("5").unwrap(), 5);
        assert_eq!(parse_greater_than_zero::<u64>("999999").unwrap(), 999_999);
    }

    #[test]
    fn parse_greater_than_zero_invalid_zero() {
        let result = parse_greater_than_zero::<usize>("0");
        assert!(result.is_err());
        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidValue);
        assert!(error.to_string().contains("Value must be greater than 0"));
    }

    #[test]
    fn parse_greater_than_zero_invalid_non_numeric() {
        let result = parse_greater_than_zero::<u64>("abc");
        assert!(result.is_err());
        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidValue);
        assert!(error.to_string().contains("`abc` isn't a valid integer"));
    }

    #[test]
    fn parse_greater_than_zero_invalid_negative() {
        let result = parse_greater_than_zero::<u64>("-1");
        assert!(result.is_err());
        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidValue);
        assert!(error.to_string().contains("`-1` isn't a valid integer"));
    }

    #[test]
    fn parse_duration_seconds_valid() {
        assert_eq!(parse_duration_seconds("1").unwrap(), Duration::from_secs(1));
        assert_eq!(
            parse_duration_seconds("30").unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn parse_duration_seconds_invalid_zero() {
        let result = parse_duration_seconds("0");
        assert!(result.is_err());
        let error = result.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidValue);
        assert!(error.to_string().contains("Value must be greater than 0"));
    }

    #[test]
    fn positional_numbers_accept_negative_values() {
        let args = Args::try_parse_from(["httpget-to-fs", "null", "-5", "4096", "0"]).unwrap();
        let command = args.command();
        assert_eq!(command.destination, "null");
        assert_eq!(command.url_length, -5);
        assert_eq!(command.storage_buffer_size, 0);
    }

    #[test]
    fn resolve_uses_defaults() {
        let settings = Settings::resolve(&parse(&[]), FileConfig::default());
        assert_eq!(settings.mount_point, PathBuf::from(DEFAULT_MOUNT_POINT));
        assert_eq!(settings.capacity, DEFAULT_CAPACITY);
        assert_eq!(settings.network_timeout, Duration::from_secs(5));
        assert_eq!(settings.acquire_timeout, Duration::from_secs(30));
        assert_eq!(settings.max_url_length, 8192);
        assert!(settings.user_agent.starts_with("httpget-to-fs/"));
        assert!(!settings.quiet);
    }

    #[test]
    fn resolve_prefers_flags_over_config_file() {
        let file = FileConfig {
            mount_point: Some(PathBuf::from("/mnt/file")),
            capacity: Some(1000),
            network_timeout_secs: Some(9),
            acquire_timeout_secs: Some(60),
            max_url_length: Some(512),
            user_agent: Some("from-file".to_string()),
        };
        let args = parse(&["--capacity", "2000", "--network-timeout", "3", "-q"]);

        let settings = Settings::resolve(&args, file);
        assert_eq!(settings.mount_point, PathBuf::from("/mnt/file"));
        assert_eq!(settings.capacity, 2000);
        assert_eq!(settings.network_timeout, Duration::from_secs(3));
        assert_eq!(settings.acquire_timeout, Duration::from_secs(60));
        assert_eq!(settings.max_url_length, 512);
        assert_eq!(settings.user_agent, "from-file");
        assert!(settings.quiet);
    }

    #[test]
    fn resolve_ignores_zero_values_in_config_file() {
        let file = FileConfig {
            capacity: Some(0),
            max_url_length: Some(0),
            network_timeout_secs: Some(0),
            ..FileConfig::default()
        };

        let settings = Settings::resolve(&parse(&[]), file);
        assert_eq!(settings.capacity, DEFAULT_CAPACITY);
        assert_eq!(settings.max_url_length, DEFAULT_MAX_URL_LENGTH);
        assert_eq!(settings.network_timeout, Duration::from_secs(5));
    }

    #[test]
    fn load_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(
            &path,
            "mount_point = \"/data\"\ncapacity = 4096\nacquire_timeout_secs = 10\n",
        )
        .unwrap();

        let file = FileConfig::load(&path).unwrap();
        assert_eq!(
            file,
            FileConfig {
                mount_point: Some(PathBuf::from("/data")),
                capacity: Some(4096),
                acquire_timeout_secs: Some(10),
                ..FileConfig::default()
            }
        );
    }

    #[test]
    fn load_config_rejects_unknown_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "mount_piont = \"/data\"\n").unwrap();

        assert!(matches!(
            FileConfig::load(&path),
            Err(ArgsError::ParseConfig { .. })
        ));
        assert!(matches!(
            FileConfig::load(&temp_dir.path().join("missing.toml")),
            Err(ArgsError::ReadConfig { .. })
        ));
    }

    #[test]
    fn build_client_from_settings() {
        let settings = create_test_settings(PathBuf::from("."));
        assert!(build_client(&settings).is_ok());
    }
}
