use anyhow::{anyhow, Result};
use clap::{value_parser, Arg, Command};
use meshvault_core::model::credentials::UserCredentials;
use meshvault_core::model::tree::PermissionType;
use meshvault_core::network::memory::MemoryDataManager;
use meshvault_core::network::messages::PeerAddress;
use meshvault_core::processes::recover::VersionSelector;
use meshvault_core::{Client, FileConfiguration, TimeToLive};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Always restores the newest-but-one version; good enough for a demo.
struct PreviousVersionSelector;

impl VersionSelector for PreviousVersionSelector {
    fn select(&self, versions: &[meshvault_core::model::meta_file::FileVersion]) -> Option<usize> {
        if versions.len() < 2 {
            return None;
        }
        versions.get(versions.len() - 2).map(|v| v.index)
    }
}

fn cli() -> Command {
    Command::new("meshvault")
        .about("Decentralized, encrypted file sharing and synchronization")
        .subcommand_required(true)
        .subcommand(
            Command::new("demo")
                .about("Run a two-user walkthrough on the in-process overlay")
                .arg(
                    Arg::new("chunk-size")
                        .long("chunk-size")
                        .value_parser(value_parser!(usize))
                        .default_value("1024")
                        .help("Chunk size in bytes for the demo files"),
                ),
        )
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("demo", sub)) => {
            let chunk_size = *sub
                .get_one::<usize>("chunk-size")
                .ok_or_else(|| anyhow!("missing chunk size"))?;
            run_demo(chunk_size)
        }
        _ => unreachable!("subcommand is required"),
    }
}

fn run_demo(chunk_size: usize) -> Result<()> {
    let config = FileConfiguration {
        chunk_size,
        max_num_of_versions: 3,
        rsa_user_key_bits: 1024,
        rsa_file_key_bits: 1024,
        rsa_chunk_key_bits: 1024,
        ..FileConfiguration::default()
    };
    let overlay = MemoryDataManager::new();

    let alice_root = tempfile::tempdir()?;
    let bob_root = tempfile::tempdir()?;
    let alice = UserCredentials::new("alice", "password-a", "1111");
    let bob = UserCredentials::new("bob", "password-b", "2222");

    let client_a = Client::new(
        Arc::new(overlay.clone()),
        PeerAddress::new("alice-1"),
        config.clone(),
        TimeToLive::default(),
    );
    let client_b = Client::new(
        Arc::new(overlay.clone()),
        PeerAddress::new("bob-1"),
        config,
        TimeToLive::default(),
    );

    info!("registering users");
    client_a.register(&alice)?.into_result().map_err(|e| anyhow!(e))?;
    client_b.register(&bob)?.into_result().map_err(|e| anyhow!(e))?;

    client_a
        .login(&alice, alice_root.path())?
        .into_result()
        .map_err(|e| anyhow!(e))?;
    client_b
        .login(&bob, bob_root.path())?
        .into_result()
        .map_err(|e| anyhow!(e))?;

    info!("alice shares a folder with bob");
    std::fs::create_dir(alice_root.path().join("shared"))?;
    std::fs::write(alice_root.path().join("shared/notes.txt"), b"first draft")?;
    client_a.add_file("shared")?.into_result().map_err(|e| anyhow!(e))?;
    client_a
        .add_file("shared/notes.txt")?
        .into_result()
        .map_err(|e| anyhow!(e))?;
    client_a
        .share_folder("shared", "bob", PermissionType::Write)?
        .into_result()
        .map_err(|e| anyhow!(e))?;

    info!("bob downloads and updates the shared file");
    client_b
        .download_file("shared/notes.txt")?
        .into_result()
        .map_err(|e| anyhow!(e))?;
    std::fs::write(bob_root.path().join("shared/notes.txt"), b"second draft")?;
    client_b
        .update_file("shared/notes.txt")?
        .into_result()
        .map_err(|e| anyhow!(e))?;

    info!("alice recovers the previous version");
    client_a
        .download_file("shared/notes.txt")?
        .into_result()
        .map_err(|e| anyhow!(e))?;
    let (outcome, recovered) =
        client_a.recover_file("shared/notes.txt", Arc::new(PreviousVersionSelector))?;
    outcome.into_result().map_err(|e| anyhow!(e))?;
    if let Some(recovered) = recovered {
        info!(recovered = %recovered.display(), "previous version restored");
        let content = std::fs::read_to_string(&recovered)?;
        info!(content = %content, "recovered content");
    }

    client_a.logout()?.into_result().map_err(|e| anyhow!(e))?;
    client_b.logout()?.into_result().map_err(|e| anyhow!(e))?;
    info!("demo finished");
    Ok(())
}
