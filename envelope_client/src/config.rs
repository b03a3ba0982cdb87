// Runtime configuration: defaults < TOML file < ENVELOPE_CLIENT_* env < flags
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Environment, File};
use envelope_core::{
    ClientConfig, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT,
    DEFAULT_RESPONSE_TIMEOUT_MS, KeyPaths, KeyWrap, PoolConfig,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_address: String,
    pub server_port: u16,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub pool_size: usize,
    pub single_use: bool,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    /// Base64 DER public key of the server.
    pub peer_public_key: String,
    pub max_frame_size: usize,
    pub key_wrap: KeyWrap,
    pub client_id: String,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "envelope_client", about = "Sends RSA/AES-enveloped messages to an envelope server")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML file with any of the settings below
    #[arg(long, short, global = true)]       pub config: Option<PathBuf>,
    #[arg(long, global = true)]              pub server_address: Option<String>,
    #[arg(long, global = true)]              pub server_port: Option<u16>,
    /// Response timeout in milliseconds
    #[arg(long, global = true)]              pub timeout_ms: Option<u64>,
    #[arg(long, global = true)]              pub connect_timeout_ms: Option<u64>,
    #[arg(long, global = true)]              pub pool_size: Option<usize>,
    /// Park connections for reuse instead of closing them after each reply
    #[arg(long, global = true)]              pub reuse_connections: bool,
    #[arg(long, global = true)]              pub private_key: Option<PathBuf>,
    #[arg(long, global = true)]              pub public_key: Option<PathBuf>,
    #[arg(long, global = true)]              pub peer_public_key: Option<String>,
    #[arg(long, global = true)]              pub max_frame_size: Option<u64>,
    #[arg(long, global = true, value_enum)]  pub key_wrap: Option<KeyWrap>,
    #[arg(long, global = true)]              pub client_id: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Send one message and print the decrypted reply
    Send { message: String },

    /// Send a timestamped message on a fixed interval until Ctrl+C
    Periodic {
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,

        /// Stop after this many sends
        #[arg(long)]
        count: Option<u64>,
    },
}

impl Cli {
    pub fn parse_and_build_config() -> Result<(Command, Settings)> {
        let c = <Cli as Parser>::parse();
        let settings = Settings::from_cli(&c)?;
        Ok((c.command, settings))
    }
}

fn path_value(p: &Option<PathBuf>) -> Option<String> {
    p.as_ref().map(|p| p.display().to_string())
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("server_address", "127.0.0.1")?
            .set_default("server_port", i64::from(DEFAULT_PORT))?
            .set_default("timeout_ms", DEFAULT_RESPONSE_TIMEOUT_MS as i64)?
            .set_default("connect_timeout_ms", DEFAULT_CONNECT_TIMEOUT_MS as i64)?
            .set_default("pool_size", 1_i64)?
            .set_default("single_use", true)?
            .set_default("private_key_path", "client_private.pem")?
            .set_default("public_key_path", "client_public.pem")?
            .set_default("max_frame_size", DEFAULT_MAX_FRAME_LEN as i64)?
            .set_default("key_wrap", KeyWrap::default().as_str())?
            .set_default("client_id", "default")?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()));
        }

        // bare CLIENT_ID is honoured for compatibility with existing deployments
        let client_id_env = std::env::var("CLIENT_ID").ok();

        let settings: Settings = builder
            .add_source(Environment::with_prefix("ENVELOPE_CLIENT").try_parsing(true))
            .set_override_option("client_id", client_id_env)?
            .set_override_option("server_address", cli.server_address.clone())?
            .set_override_option("server_port", cli.server_port.map(i64::from))?
            .set_override_option("timeout_ms", cli.timeout_ms.map(|n| n as i64))?
            .set_override_option("connect_timeout_ms", cli.connect_timeout_ms.map(|n| n as i64))?
            .set_override_option("pool_size", cli.pool_size.map(|n| n as i64))?
            .set_override_option("single_use", cli.reuse_connections.then_some(false))?
            .set_override_option("private_key_path", path_value(&cli.private_key))?
            .set_override_option("public_key_path", path_value(&cli.public_key))?
            .set_override_option("peer_public_key", cli.peer_public_key.clone())?
            .set_override_option("max_frame_size", cli.max_frame_size.map(|n| n as i64))?
            .set_override_option("key_wrap", cli.key_wrap.map(|w| w.as_str()))?
            .set_override_option("client_id", cli.client_id.clone())?
            .build()?
            .try_deserialize()
            .context("invalid client configuration (is peer_public_key set?)")?;
        Ok(settings)
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            pool: PoolConfig {
                address: format!("{}:{}", self.server_address, self.server_port),
                size: self.pool_size,
                single_use: self.single_use,
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                max_frame_len: self.max_frame_size,
            },
            response_timeout: Duration::from_millis(self.timeout_ms),
            key_wrap: self.key_wrap,
        }
    }

    pub fn key_paths(&self) -> KeyPaths {
        KeyPaths {
            private_key: self.private_key_path.clone(),
            public_key: self.public_key_path.clone(),
            peer_public_key: self.peer_public_key.clone(),
        }
    }
}
