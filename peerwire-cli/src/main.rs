use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use peerwire_core::peer::Capabilities;
use peerwire_core::storage::FileStorage;
use peerwire_core::tracker::generate_peer_id;
use peerwire_core::{Conf, Metainfo, Session};

fn cli() -> Command {
    Command::new("peerwire")
        .version("0.1.0")
        .about("Download a torrent over the peer-wire exchange subsystem")
        .subcommand(
            Command::new("download")
                .about("Download a single-file torrent")
                .arg(
                    Arg::new("torrent-file")
                        .help("Path to the .torrent file")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::new("output")
                        .help("Destination file for the downloaded dataset")
                        .required(true)
                        .index(2),
                )
                .arg(
                    Arg::new("dht")
                        .long("dht")
                        .help("Advertise DHT support in the handshake")
                        .action(ArgAction::SetTrue),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("download", matches)) => {
            let torrent_path = matches.get_one::<String>("torrent-file").expect("required");
            let output_path = matches.get_one::<String>("output").expect("required");
            let dht = matches.get_flag("dht");
            download(torrent_path, output_path, dht).await
        }
        _ => {
            cli().print_help()?;
            println!();
            Ok(())
        }
    }
}

async fn download(torrent_path: &str, output_path: &str, dht: bool) -> Result<()> {
    let bytes = tokio::fs::read(torrent_path)
        .await
        .with_context(|| format!("failed to read {torrent_path}"))?;
    let metainfo = Metainfo::parse(&bytes).map_err(|e| anyhow::anyhow!("invalid torrent file: {e}"))?;
    tracing::info!(name = %metainfo.info.name, pieces = metainfo.total_pieces(), "parsed torrent");

    let storage = FileStorage::create(
        PathBuf::from(output_path),
        metainfo.info.length as u64,
        metainfo.info.piece_length as u64,
        metainfo.total_pieces(),
    )
    .await
    .context("failed to allocate output file")?;

    let our_peer_id = generate_peer_id();
    let mut capabilities = Capabilities::default().with_fast();
    if dht {
        capabilities = capabilities.with_dht();
    }

    let (session, handle) =
        Session::new(our_peer_id, capabilities, Arc::new(metainfo), Arc::new(storage), Conf::new());

    let run_handle = tokio::spawn(session.start());

    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;
        let progress = handle.progress().await?;
        tracing::info!(downloaded = progress.downloaded, left = progress.left, "progress");
        if progress.left == 0 {
            break;
        }
    }

    handle.stop().await;
    run_handle.await.context("session task panicked")?;
    println!("download complete: {output_path}");
    Ok(())
}
