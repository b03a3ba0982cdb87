// Runtime configuration: defaults < TOML file < ENVELOPE_SERVER_* env < flags
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use config::{Environment, File};
use envelope_core::{
    DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT, DEFAULT_SHUTDOWN_GRACE, KeyPaths, KeyWrap, ServerConfig,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_address: String,
    pub port: u16,
    pub keep_alive: bool,
    pub private_key_path: PathBuf,
    pub public_key_path: PathBuf,
    /// Base64 DER public key of the client we reply to.
    pub peer_public_key: String,
    pub max_frame_size: usize,
    pub key_wrap: KeyWrap,
    pub shutdown_grace_ms: u64,
    pub log_dir: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "envelope_server", about = "Answers RSA/AES-enveloped requests over TCP")]
pub struct Cli {
    /// TOML file with any of the settings below
    #[arg(long, short)]                      pub config: Option<PathBuf>,
    #[arg(long)]                             pub bind_address: Option<String>,
    #[arg(long)]                             pub port: Option<u16>,
    /// Keep serving requests on a connection until the client closes it
    #[arg(long)]                             pub keep_alive: bool,
    #[arg(long)]                             pub private_key: Option<PathBuf>,
    #[arg(long)]                             pub public_key: Option<PathBuf>,
    #[arg(long)]                             pub peer_public_key: Option<String>,
    #[arg(long)]                             pub max_frame_size: Option<u64>,
    #[arg(long, value_enum)]                 pub key_wrap: Option<KeyWrap>,
    /// How long shutdown waits for in-flight exchanges, in milliseconds
    #[arg(long)]                             pub shutdown_grace_ms: Option<u64>,
    /// Also write logs to a daily-rolling file in this directory
    #[arg(long)]                             pub log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn parse_and_build_config() -> Result<Settings> {
        let c = <Cli as Parser>::parse();
        Settings::from_cli(&c)
    }
}

fn path_value(p: &Option<PathBuf>) -> Option<String> {
    p.as_ref().map(|p| p.display().to_string())
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("bind_address", "0.0.0.0")?
            .set_default("port", i64::from(DEFAULT_PORT))?
            .set_default("keep_alive", false)?
            .set_default("private_key_path", "server_private.pem")?
            .set_default("public_key_path", "server_public.pem")?
            .set_default("max_frame_size", DEFAULT_MAX_FRAME_LEN as i64)?
            .set_default("key_wrap", KeyWrap::default().as_str())?
            .set_default("shutdown_grace_ms", DEFAULT_SHUTDOWN_GRACE.as_millis() as i64)?;

        if let Some(path) = &cli.config {
            builder = builder.add_source(File::from(path.as_path()));
        }

        let settings: Settings = builder
            .add_source(Environment::with_prefix("ENVELOPE_SERVER").try_parsing(true))
            .set_override_option("bind_address", cli.bind_address.clone())?
            .set_override_option("port", cli.port.map(i64::from))?
            .set_override_option("keep_alive", cli.keep_alive.then_some(true))?
            .set_override_option("private_key_path", path_value(&cli.private_key))?
            .set_override_option("public_key_path", path_value(&cli.public_key))?
            .set_override_option("peer_public_key", cli.peer_public_key.clone())?
            .set_override_option("max_frame_size", cli.max_frame_size.map(|n| n as i64))?
            .set_override_option("key_wrap", cli.key_wrap.map(|w| w.as_str()))?
            .set_override_option("shutdown_grace_ms", cli.shutdown_grace_ms.map(|n| n as i64))?
            .set_override_option("log_dir", path_value(&cli.log_dir))?
            .build()?
            .try_deserialize()
            .context("invalid server configuration (is peer_public_key set?)")?;
        Ok(settings)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.bind_address, self.port),
            max_frame_len: self.max_frame_size,
            keep_alive: self.keep_alive,
            key_wrap: self.key_wrap,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_with_only_peer_key() {
        let cli = Cli::parse_from(["envelope_server", "--peer-public-key", "AAAA"]);
        let s = Settings::from_cli(&cli).unwrap();

        assert_eq!(s.server_config().bind_addr, format!("0.0.0.0:{DEFAULT_PORT}"));
        assert!(!s.keep_alive);
        assert_eq!(s.max_frame_size, DEFAULT_MAX_FRAME_LEN);
        assert_eq!(s.key_wrap, KeyWrap::Pkcs1v15);
        assert_eq!(s.private_key_path, PathBuf::from("server_private.pem"));
        assert!(s.log_dir.is_none());
        assert_eq!(s.server_config().shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }

    #[test]
    fn file_then_flags_override() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "port = 7000\nkeep_alive = true\nkey_wrap = \"oaep-sha256\"\npeer_public_key = \"FROMFILE\""
        )
        .unwrap();

        let path = file.path().to_str().unwrap();
        let cli = Cli::parse_from(["envelope_server", "-c", path, "--port", "7100", "--shutdown-grace-ms", "250"]);
        let s = Settings::from_cli(&cli).unwrap();

        assert_eq!(s.port, 7100);
        assert!(s.keep_alive);
        assert_eq!(s.key_wrap, KeyWrap::OaepSha256);
        assert_eq!(s.key_paths().peer_public_key, "FROMFILE");
        assert_eq!(s.server_config().shutdown_grace, Duration::from_millis(250));
    }

    #[test]
    fn key_wrap_flag_beats_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "key_wrap = \"pkcs1v15\"\npeer_public_key = \"X\"").unwrap();

        let path = file.path().to_str().unwrap();
        let cli = Cli::parse_from(["envelope_server", "-c", path, "--key-wrap", "oaep-sha256"]);
        assert_eq!(Settings::from_cli(&cli).unwrap().key_wrap, KeyWrap::OaepSha256);
    }

    #[test]
    fn sample_config_file_loads() {
        let sample = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../config/server.toml");
        let cli = Cli::parse_from(["envelope_server", "-c", sample.to_str().unwrap(), "--peer-public-key", "AAAA"]);
        let s = Settings::from_cli(&cli).unwrap();

        assert_eq!(s.port, DEFAULT_PORT);
        assert_eq!(s.key_wrap, KeyWrap::Pkcs1v15);
        assert_eq!(s.server_config().shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
    }

    #[test]
    fn missing_peer_key_is_an_error() {
        let cli = Cli::parse_from(["envelope_server"]);
        // unless the environment provides it
        if std::env::var_os("ENVELOPE_SERVER_PEER_PUBLIC_KEY").is_none() {
            assert!(Settings::from_cli(&cli).is_err());
        }
    }
}
