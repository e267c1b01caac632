// Copyright (c) 2026 DeSciChain Contributors. MIT License.
// See LICENSE for details.

//! # DeSci Marketplace Node
//!
//! Entry point for the `desci-node` binary.
//!
//! - `serve`: marketplace API + metrics + escrow sweeper on a devnet ledger
//! - `seal`: layer an artifact (watermark, envelope, recipient wrap)
//! - `unseal`: undo a manifest's layers
//! - `watermark`: embed or verify an owner mark
//! - `keygen`: account or recipient keypair
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

use desci_contracts::SimulatedLedger;
use desci_protocol::config::{EscrowConfig, MarketConfig};
use desci_protocol::crypto::hybrid::parse_public_key;
use desci_protocol::crypto::kdf::validate as validate_kdf;
use desci_protocol::crypto::layers::unseal_through;
use desci_protocol::crypto::{AccountKeypair, EncryptionKey, EncryptionPlan, HybridKeypair, LayerRecord, LayeredEnvelope, UnsealKeys};
use desci_protocol::market::Marketplace;
use desci_protocol::storage::{content_id, MarketDb};
use desci_protocol::watermark;

use cli::{Commands, DesciNodeCli, WatermarkCommand};
use logging::DEFAULT_DIRECTIVES;
use metrics::{MetricsState, NodeMetrics};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = DesciNodeCli::parse();
    logging::init_logging(DEFAULT_DIRECTIVES, cli.log_format);

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Seal(args) => seal(args).await,
        Commands::Unseal(args) => unseal(args).await,
        Commands::Watermark(WatermarkCommand::Embed(args)) => watermark_embed(args),
        Commands::Watermark(WatermarkCommand::Verify(args)) => watermark_verify(args),
        Commands::Keygen(args) => keygen(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn serve(args: cli::ServeArgs) -> Result<()> {
    tracing::info!(
        api_port = args.api_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        ephemeral = args.ephemeral,
        "starting desci-node"
    );

    // --- Storage ---
    let db = if args.ephemeral {
        Arc::new(MarketDb::open_temporary().context("failed to open temporary database")?)
    } else {
        let db_path = args.data_dir.join("db");
        std::fs::create_dir_all(&db_path)
            .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
        let db = MarketDb::open(&db_path).with_context(|| format!("failed to open database at {}", db_path.display()))?;
        tracing::info!(path = %db_path.display(), escrows = db.escrow_count(), "database opened");
        Arc::new(db)
    };

    // --- Ledger + marketplace ---
    let ledger = Arc::new(SimulatedLedger::devnet());
    let kdf = args.kdf.params();
    validate_kdf(&kdf).context("invalid KDF parameters")?;

    let confirmation_timeout = Duration::from_secs(args.confirmation_timeout_secs);
    let mut protocol = ledger.protocol_config();
    protocol.poll_interval = Duration::from_millis(args.poll_interval_ms);
    protocol.confirmation_timeout = confirmation_timeout;
    let config = MarketConfig {
        kdf,
        protocol,
        escrow: EscrowConfig {
            max_age_hours: args.escrow_max_age_hours,
            monitor_timeout: confirmation_timeout,
            settlement_timeout: confirmation_timeout,
        },
    };
    let market = Arc::new(Marketplace::new(
        db.clone(),
        db.clone(),
        db.clone(),
        ledger.clone(),
        config,
    ));

    // --- Sweeper ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(
        market
            .escrow()
            .clone()
            .run_sweeper(Duration::from_secs(args.sweep_interval_secs), shutdown_rx),
    );

    // --- API server ---
    let node_metrics = Arc::new(NodeMetrics::new());
    let app_state = api::AppState {
        version: env!("CARGO_PKG_VERSION").to_string(),
        network: ledger.config().genesis_id.clone(),
        market: market.clone(),
        ledger,
        metrics: node_metrics.clone(),
        faucet: args.faucet,
    };
    let api_router = api::create_router(app_state);
    let api_addr = format!("{}:{}", args.bind, args.api_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind API listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(MetricsState {
            metrics: node_metrics,
            market,
        });
    let metrics_addr = format!("{}:{}", args.bind, args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "sweeper task ended abnormally");
    }
    db.flush().context("failed to flush database")?;
    tracing::info!("desci-node stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// seal / unseal
// ---------------------------------------------------------------------------

fn manifest_path(explicit: Option<PathBuf>, payload: &Path) -> PathBuf {
    explicit.unwrap_or_else(|| {
        let mut name = payload.as_os_str().to_owned();
        name.push(".manifest.json");
        PathBuf::from(name)
    })
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn write(path: &Path, bytes: &[u8]) -> Result<()> {
    std::fs::write(path, bytes).with_context(|| format!("failed to write {}", path.display()))
}

async fn seal(args: cli::SealArgs) -> Result<()> {
    let data = read(&args.input)?;
    let kdf = args.kdf.params();
    validate_kdf(&kdf).context("invalid KDF parameters")?;

    let mut plan = EncryptionPlan::new();
    if let Some(owner) = &args.watermark {
        plan = plan.with_watermark(owner.clone(), args.position);
    }
    plan = plan.with_symmetric(kdf);
    if let Some(recipient) = &args.recipient {
        plan = plan.with_hybrid(parse_public_key(recipient).context("invalid recipient public key")?);
    }

    let (passphrase, generated) = match args.passphrase {
        Some(p) => (p, false),
        None => (EncryptionKey::generate().to_hex(), true),
    };

    // KDF runs on the blocking pool.
    let sealed = {
        let passphrase = passphrase.clone();
        tokio::task::spawn_blocking(move || plan.seal(&data, Some(passphrase.as_bytes())))
            .await
            .context("sealing task failed")?
            .context("sealing failed")?
    };

    let manifest = manifest_path(args.manifest, &args.output);
    write(&args.output, &sealed.payload)?;
    write(&manifest, &serde_json::to_vec_pretty(&sealed.layers)?)?;
    tracing::info!(
        output = %args.output.display(),
        manifest = %manifest.display(),
        layers = sealed.layers.len(),
        "artifact sealed"
    );

    let watermark = sealed.watermark().and_then(|record| match record {
        LayerRecord::Watermark { watermark, offset, .. } => Some(serde_json::json!({ "value": watermark, "offset": offset })),
        _ => None,
    });
    let mut summary = serde_json::json!({
        "cid": content_id(&sealed.payload),
        "payload": args.output,
        "manifest": manifest,
        "watermark": watermark,
    });
    if generated {
        summary["key"] = serde_json::Value::String(passphrase);
    }
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn unseal(args: cli::UnsealArgs) -> Result<()> {
    let payload = read(&args.input)?;
    let manifest = manifest_path(args.manifest, &args.input);
    let layers: Vec<LayerRecord> =
        serde_json::from_slice(&read(&manifest)?).with_context(|| format!("malformed manifest {}", manifest.display()))?;

    let recipient = args
        .recipient_secret
        .as_deref()
        .map(HybridKeypair::from_secret_hex)
        .transpose()
        .context("invalid recipient secret key")?;

    let envelope = LayeredEnvelope { payload, layers };
    let innermost_watermark = matches!(envelope.layers.first(), Some(LayerRecord::Watermark { .. }));
    let count = if args.keep_watermark && innermost_watermark {
        envelope.layers.len() - 1
    } else {
        envelope.layers.len()
    };

    let passphrase = args.passphrase;
    let data = tokio::task::spawn_blocking(move || {
        let keys = UnsealKeys {
            passphrase: passphrase.as_deref().map(str::as_bytes),
            recipient: recipient.as_ref(),
        };
        unseal_through(&envelope, count, &keys)
    })
    .await
    .context("unsealing task failed")?
    .context("unsealing failed")?;

    write(&args.output, &data)?;
    tracing::info!(output = %args.output.display(), bytes = data.len(), "artifact unsealed");
    Ok(())
}

// ---------------------------------------------------------------------------
// watermark
// ---------------------------------------------------------------------------

fn watermark_embed(args: cli::WatermarkEmbedArgs) -> Result<()> {
    let data = read(&args.input)?;
    let summary = if args.steganographic {
        let embedded = watermark::embed_steganographic(&data, &args.owner, args.strength)?;
        write(&args.output, &embedded.data)?;
        serde_json::json!({
            "watermark": embedded.watermark,
            "seed": embedded.seed,
            "modified_samples": embedded.modified,
        })
    } else {
        let embedded = watermark::embed(&data, &args.owner, args.position);
        write(&args.output, &embedded.data)?;
        serde_json::json!({
            "watermark": embedded.watermark,
            "position": embedded.position,
            "offset": embedded.offset,
        })
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn watermark_verify(args: cli::WatermarkVerifyArgs) -> Result<()> {
    let data = read(&args.input)?;
    let verification = if args.steganographic {
        watermark::verify_steganographic(&data, &args.owner, args.strength, args.seed)?
    } else if let Some(offset) = args.offset {
        watermark::verify_at(&data, &args.owner, offset)
    } else {
        watermark::verify(&data, &args.owner, args.expected.as_deref())
    };
    println!("{}", serde_json::to_string_pretty(&verification)?);
    if !verification.is_valid {
        bail!("no watermark for '{}' (confidence {:.2})", args.owner, verification.confidence);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// keygen / version
// ---------------------------------------------------------------------------

fn keygen(args: cli::KeygenArgs) -> Result<()> {
    let summary = if args.recipient {
        let keypair = HybridKeypair::generate();
        serde_json::json!({
            "kind": "x25519",
            "public_key": keypair.public_hex(),
            "secret_key": keypair.secret_hex(),
        })
    } else {
        let keypair = AccountKeypair::generate();
        serde_json::json!({
            "kind": "ed25519",
            "address": keypair.address(),
            "secret_key": keypair.secret_hex(),
        })
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn print_version() {
    println!("desci-node {}", env!("CARGO_PKG_VERSION"));
    println!("rustc      {}", option_env!("RUSTC_VERSION").unwrap_or("unknown"));
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
