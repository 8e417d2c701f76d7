//! Command line configuration
//!
//! Settings come from an optional TOML file, then `SIMPERIUM_*` environment
//! variables, then command line flags.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;
use simperium_client::SimperiumConfig;
use validator::Validate;

pub const ENV_PREFIX: &str = "SIMPERIUM";
pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 30;

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "simperium", version, about = "Sync Simperium buckets from the command line")]
pub struct Cli {
    /// TOML settings file
    #[arg(short = 'c', long = "config", env = "SIMPERIUM_CONFIG")]
    pub config: Option<PathBuf>,
    #[arg(long = "app-id")]
    pub app_id: Option<String>,
    #[arg(long = "app-secret")]
    pub app_secret: Option<String>,
    /// Directory for the saved user, objects and queued changes
    #[arg(long = "data-dir")]
    pub data_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in and save the access token
    Login(UserArgs),
    /// Create an account and sign in
    Signup(UserArgs),
    /// Forget the saved access token
    Logout,
    /// Print network changes to a bucket until interrupted
    Watch { bucket: String },
    /// Print one object, or every object in the bucket
    Get { bucket: String, key: Option<String> },
    /// Replace an object with the given JSON object
    Put { bucket: String, key: String, json: String },
    /// Delete an object
    Delete { bucket: String, key: String },
    /// Print earlier versions of an object
    Revisions {
        bucket: String,
        key: String,
        #[arg(long, default_value_t = 10)]
        max: u64,
    },
}

#[derive(Debug, Args, Validate)]
pub struct UserArgs {
    #[arg(short, long)]
    #[validate(email(message = "username must be an email address"))]
    pub username: String,
    #[arg(short, long, env = "SIMPERIUM_PASSWORD", hide_env_values = true)]
    #[validate(length(min = 4, message = "password is too short"))]
    pub password: String,
}

/// Resolved settings
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(default)]
pub struct Settings {
    #[validate(length(min = 1, message = "app_id is required"))]
    pub app_id: String,
    #[validate(length(min = 1, message = "app_secret is required"))]
    pub app_secret: String,
    pub auth_url: Option<String>,
    pub socket_url: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub array_diff: bool,
    /// Seconds to wait for the index and for changes to be acknowledged
    pub sync_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            auth_url: None,
            socket_url: None,
            data_dir: None,
            array_diff: false,
            sync_timeout_secs: DEFAULT_SYNC_TIMEOUT_SECS,
        }
    }
}

impl Settings {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()).format(FileFormat::Toml));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        if let Some(v) = &cli.app_id {
            builder = builder.set_override("app_id", v.as_str())?;
        }
        if let Some(v) = &cli.app_secret {
            builder = builder.set_override("app_secret", v.as_str())?;
        }
        if let Some(v) = &cli.data_dir {
            builder = builder.set_override("data_dir", v.to_string_lossy().to_string())?;
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Data directory, `~/.simperium/{app id}` unless configured
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(format!("{}/.simperium", home)).join(&self.app_id)
        })
    }

    pub fn client_config(&self) -> SimperiumConfig {
        let mut config = SimperiumConfig::new(&self.app_id, &self.app_secret)
            .with_data_dir(self.data_dir())
            .with_array_diff(self.array_diff);
        if let Some(url) = &self.auth_url {
            config.auth_url = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = &self.socket_url {
            config.socket_url = url.trim_end_matches('/').to_string();
        }
        config
    }
}
