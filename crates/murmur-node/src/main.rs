//! Murmur Node -- single binary gossip node.
//!
//! Usage:
//!   murmur-node --config config.ini            # Run the node
//!   murmur-node --config config.ini keygen     # Provision the RSA keys
//!   murmur-node --config config.ini identity   # Print the trust-dir name

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use murmur_crypto::identity::{HostIdentity, HOST_KEY_BITS};
use murmur_node::bus::CentralMsg;
use murmur_node::config::Config;

#[derive(Parser)]
#[command(name = "murmur-node", about = "Murmur P2P gossip node")]
struct Cli {
    /// Path to the INI config file
    #[arg(short, long, default_value = "config.ini")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Run,
    /// Generate the RSA key pair at the configured paths
    Keygen {
        /// Overwrite existing key files
        #[arg(long)]
        force: bool,
    },
    /// Print this node's identity (the trust-directory file name)
    Identity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "murmur_node=info,murmur_transport=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    match cli.command {
        Some(Commands::Keygen { force }) => keygen(&config, force),
        Some(Commands::Identity) => {
            let identity = HostIdentity::load(&config.hostkey, &config.pubkey)?;
            println!("{}", identity.identity_hex());
            Ok(())
        }
        Some(Commands::Run) | None => run(config).await,
    }
}

fn keygen(config: &Config, force: bool) -> anyhow::Result<()> {
    if !force && (config.hostkey.exists() || config.pubkey.exists()) {
        anyhow::bail!(
            "key files already exist at {} / {} (use --force to overwrite)",
            config.hostkey.display(),
            config.pubkey.display()
        );
    }
    eprintln!("generating a {HOST_KEY_BITS}-bit RSA key pair, this takes a while...");
    let identity = HostIdentity::generate(HOST_KEY_BITS)?;
    identity.write_pem(&config.hostkey, &config.pubkey)?;
    println!("{}", identity.identity_hex());
    eprintln!(
        "wrote {} and {}",
        config.hostkey.display(),
        config.pubkey.display()
    );
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    check_paths(&config)?;

    let node = murmur_node::start(config).await?;

    // The interrupt signal triggers the graceful closure path.
    let close_tx = node.central_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, closing");
            let _ = close_tx.send(CentralMsg::Close).await;
        }
    });

    match node.join.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(crash)) => {
            tracing::error!(error = %crash, "central controller crashed");
            std::process::exit(1);
        }
        Err(join_err) => {
            tracing::error!(error = %join_err, "central controller panicked");
            std::process::exit(1);
        }
    }
}

fn check_paths(config: &Config) -> anyhow::Result<()> {
    for (name, path) in [("hostkey", &config.hostkey), ("pubkey", &config.pubkey)] {
        if !Path::new(path).is_file() {
            anyhow::bail!(
                "{name} {} does not exist (run `murmur-node keygen` first)",
                path.display()
            );
        }
    }
    if !config.trusted_identities_path.is_dir() {
        anyhow::bail!(
            "trusted_identities_path {} is not a directory",
            config.trusted_identities_path.display()
        );
    }
    Ok(())
}
