//! # CLI Interface
//!
//! `desci-node` subcommands: `serve` runs the marketplace node; `seal`,
//! `unseal`, `watermark` and `keygen` are offline artifact tools that
//! never touch a ledger.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use desci_protocol::config::{KdfParams, DEFAULT_PBKDF2_ITERATIONS, DEFAULT_STEGO_STRENGTH};
use desci_protocol::watermark::WatermarkPosition;

use crate::logging::LogFormat;

/// DeSci model marketplace node.
#[derive(Parser, Debug)]
#[command(name = "desci-node", about = "DeSci model marketplace node", version, propagate_version = true)]
pub struct DesciNodeCli {
    /// Log output format.
    #[arg(long, global = true, env = "DESCI_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the marketplace API against an in-process devnet ledger.
    Serve(ServeArgs),
    /// Seal an artifact: optional watermark, passphrase envelope, optional
    /// recipient wrap. Writes the payload and a JSON layer manifest.
    Seal(SealArgs),
    /// Undo the layers recorded in a manifest.
    Unseal(UnsealArgs),
    /// Embed or check a watermark.
    #[command(subcommand)]
    Watermark(WatermarkCommand),
    /// Generate an account keypair (Ed25519) or a recipient keypair (X25519).
    Keygen(KeygenArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Directory for the sled database.
    #[arg(long, short = 'd', env = "DESCI_DATA_DIR", default_value = ".desci")]
    pub data_dir: PathBuf,

    /// Keep everything in a temporary database that vanishes on exit.
    #[arg(long, env = "DESCI_EPHEMERAL")]
    pub ephemeral: bool,

    #[arg(long, env = "DESCI_API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    #[arg(long, env = "DESCI_METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,

    /// Address to bind both listeners on.
    #[arg(long, env = "DESCI_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    #[command(flatten)]
    pub kdf: KdfArgs,

    /// Gap between confirmation polls, in milliseconds.
    #[arg(long, env = "DESCI_POLL_INTERVAL_MS", default_value_t = 1_000)]
    pub poll_interval_ms: u64,

    /// Poll budget for a single confirmation, in seconds.
    #[arg(long, env = "DESCI_CONFIRMATION_TIMEOUT_SECS", default_value_t = 30)]
    pub confirmation_timeout_secs: u64,

    /// Pending escrows older than this are failed by the sweeper.
    #[arg(long, env = "DESCI_ESCROW_MAX_AGE_HOURS", default_value_t = 24)]
    pub escrow_max_age_hours: u64,

    /// Seconds between sweeps.
    #[arg(long, env = "DESCI_SWEEP_INTERVAL_SECS", default_value_t = 900)]
    pub sweep_interval_secs: u64,

    /// Allow `POST /devnet/fund`.
    #[arg(long, env = "DESCI_FAUCET")]
    pub faucet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KdfKind {
    Pbkdf2,
    Scrypt,
}

/// Key-derivation choice for the passphrase envelope.
#[derive(Args, Debug, Clone)]
pub struct KdfArgs {
    #[arg(long, env = "DESCI_KDF", value_enum, default_value_t = KdfKind::Pbkdf2)]
    pub kdf: KdfKind,

    /// PBKDF2 iteration count.
    #[arg(long, env = "DESCI_PBKDF2_ITERATIONS", default_value_t = DEFAULT_PBKDF2_ITERATIONS)]
    pub iterations: u32,
}

impl KdfArgs {
    pub fn params(&self) -> KdfParams {
        match self.kdf {
            KdfKind::Pbkdf2 => KdfParams::Pbkdf2Sha512 {
                iterations: self.iterations,
            },
            KdfKind::Scrypt => KdfParams::scrypt_default(),
        }
    }
}

#[derive(Args, Debug)]
pub struct SealArgs {
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    #[arg(long, short = 'o')]
    pub output: PathBuf,

    /// Manifest path. Defaults to `<output>.manifest.json`.
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Passphrase for the envelope. When omitted a random key is generated
    /// and printed once.
    #[arg(long, env = "DESCI_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Watermark owner. Skips the watermark layer when absent.
    #[arg(long)]
    pub watermark: Option<String>,

    #[arg(long, default_value = "start")]
    pub position: WatermarkPosition,

    /// Hex X25519 public key to wrap the payload for.
    #[arg(long)]
    pub recipient: Option<String>,

    #[command(flatten)]
    pub kdf: KdfArgs,
}

#[derive(Args, Debug)]
pub struct UnsealArgs {
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    #[arg(long, short = 'o')]
    pub output: PathBuf,

    /// Manifest path. Defaults to `<input>.manifest.json`.
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    #[arg(long, env = "DESCI_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,

    /// Hex X25519 secret key for a wrapped payload.
    #[arg(long, env = "DESCI_RECIPIENT_SECRET", hide_env_values = true)]
    pub recipient_secret: Option<String>,

    /// Leave the watermark in place.
    #[arg(long)]
    pub keep_watermark: bool,
}

#[derive(Subcommand, Debug)]
pub enum WatermarkCommand {
    Embed(WatermarkEmbedArgs),
    Verify(WatermarkVerifyArgs),
}

#[derive(Args, Debug)]
pub struct WatermarkEmbedArgs {
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    #[arg(long, short = 'o')]
    pub output: PathBuf,

    #[arg(long)]
    pub owner: String,

    #[arg(long, default_value = "start")]
    pub position: WatermarkPosition,

    /// Hide the mark in float32 LSBs instead of inserting it.
    #[arg(long)]
    pub steganographic: bool,

    #[arg(long, default_value_t = DEFAULT_STEGO_STRENGTH)]
    pub strength: f64,
}

#[derive(Args, Debug)]
pub struct WatermarkVerifyArgs {
    #[arg(long, short = 'i')]
    pub input: PathBuf,

    #[arg(long)]
    pub owner: String,

    /// Check exactly at this offset instead of searching.
    #[arg(long, conflicts_with = "steganographic")]
    pub offset: Option<usize>,

    /// Expected watermark string, as printed by `embed`.
    #[arg(long)]
    pub expected: Option<String>,

    #[arg(long)]
    pub steganographic: bool,

    #[arg(long, default_value_t = DEFAULT_STEGO_STRENGTH)]
    pub strength: f64,

    /// Seed printed by a steganographic embed.
    #[arg(long, requires = "steganographic")]
    pub seed: Option<u64>,
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Generate an X25519 recipient keypair instead of an account.
    #[arg(long)]
    pub recipient: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        DesciNodeCli::command().debug_assert();
    }

    #[test]
    fn parses_watermark_verify() {
        let cli = DesciNodeCli::try_parse_from([
            "desci-node",
            "watermark",
            "verify",
            "-i",
            "model.bin",
            "--owner",
            "alice",
            "--offset",
            "0",
        ])
        .unwrap();
        match cli.command {
            Commands::Watermark(WatermarkCommand::Verify(args)) => {
                assert_eq!(args.owner, "alice");
                assert_eq!(args.offset, Some(0));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn scrypt_kdf_uses_defaults() {
        let cli = DesciNodeCli::try_parse_from(["desci-node", "serve", "--ephemeral", "--kdf", "scrypt"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert!(args.ephemeral);
        assert_eq!(args.kdf.params(), KdfParams::scrypt_default());
    }
}
