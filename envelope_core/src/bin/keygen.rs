//! RSA key pair generation for envelope endpoints.
//!
//! `generate` writes `<prefix>_private.pem` / `<prefix>_public.pem` and prints
//! the base64 public key to paste into the peer's `peer_public_key` setting.
//! `export` prints that base64 form for an existing public key file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use envelope_core::keys::{self, DEFAULT_KEY_BITS};
use rsa::RsaPublicKey;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keygen")]
#[command(about = "RSA key pairs for the envelope client and server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new key pair as PEM files
    Generate {
        /// Directory to write the PEM files into
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// File name prefix, e.g. `client` or `server`
        #[arg(short, long)]
        prefix: String,

        #[arg(short, long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,
    },

    /// Print the base64 DER form of a PEM public key
    Export {
        public: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("envelope_core=info".parse()?))
        .compact()
        .init();

    match Cli::parse().command {
        Commands::Generate { dir, prefix, bits } => {
            info!(bits, "generating RSA key pair");
            let key = keys::generate_key_pair(bits).context("key generation")?;
            let (private_path, public_path) =
                keys::write_key_pair(&dir, &prefix, &key).context("writing PEM files")?;
            info!(private = %private_path.display(), public = %public_path.display(), "written");

            let encoded = keys::encode_public_key_base64(&RsaPublicKey::from(&key))?;
            println!("{encoded}");
        }
        Commands::Export { public } => {
            let key = keys::load_public_key(&public)?;
            println!("{}", keys::encode_public_key_base64(&key)?);
        }
    }
    Ok(())
}
