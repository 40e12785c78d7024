use clap::{Arg, ArgAction, Command};
use std::error::Error;

use meshsync::config::{self, AppConfig};
use meshsync::engine::SyncEngine;
use meshsync::logging::{self, SyncLog};
use meshsync::peers::PeerRegistry;
use meshsync::scan::FolderScanner;
use meshsync::{connect, ExclusionEngine, FastCdc};

/// Device identity comes from the keypair collaborator; until it is wired
/// in, an explicit --peer-id or a generated one names this device
fn resolve_peer_id(explicit: Option<&String>) -> String {
	match explicit {
		Some(id) => id.clone(),
		None => {
			let generated: String = uuid::Uuid::new_v4()
				.simple()
				.to_string()
				.chars()
				.filter(|c| c.is_ascii_alphanumeric() && !"0OIl".contains(*c))
				.collect();
			format!("Qm{}", generated)
		}
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	logging::init_tracing();

	let matches = Command::new("meshsync")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Serverless peer-to-peer folder replication")
		.subcommand_required(true)
		.arg(
			Arg::new("peer-id")
				.long("peer-id")
				.value_name("ID")
				.help("Base58 peer identity for this device"),
		)
		.subcommand(
			Command::new("run")
				.about("Run the sync engine")
				.arg(
					Arg::new("bind")
						.long("bind")
						.value_name("ADDR")
						.default_value("0.0.0.0:44100")
						.help("Listen address for peer connections"),
				)
				.arg(
					Arg::new("peer")
						.long("peer")
						.value_name("ADDR")
						.action(ArgAction::Append)
						.help("Peer address to dial (repeatable)"),
				),
		)
		.subcommand(
			Command::new("status").about("Show configured folders and their statistics"),
		)
		.subcommand(
			Command::new("chunks")
				.about("Chunk a file and print its chunk hashes")
				.arg(Arg::new("file").required(true)),
		)
		.get_matches();

	let data_dir = config::data_dir()?;
	let app = AppConfig::load(&data_dir).await?;

	if let Some(sub) = matches.subcommand_matches("run") {
		let peer_id = resolve_peer_id(matches.get_one::<String>("peer-id"));
		tracing::info!(peer_id = %peer_id, data_dir = %data_dir.display(), "starting engine");

		let sync_log = SyncLog::new(&app.logs_dir());
		let engine = SyncEngine::new(peer_id, Some(std::sync::Arc::new(sync_log)));
		for folder in &app.folders {
			engine.attach_folder(&app, folder).await?;
			tracing::info!(
				sync_id = %folder.sync_id,
				path = %folder.path.display(),
				"folder attached"
			);
		}

		let registry = PeerRegistry::open(&app.peers_path()).await?;
		if let Some(addrs) = sub.get_many::<String>("peer") {
			for addr in addrs {
				match connect::connect(&engine, addr).await {
					Ok(handle) => {
						let _ = registry
							.record(
								handle.peer_id(),
								Some(addr),
								&engine.folder_ids().await,
							)
							.await;
					}
					Err(e) => tracing::warn!(addr = %addr, "dial failed: {}", e),
				}
			}
		}

		let bind = sub.get_one::<String>("bind").map(|s| s.as_str()).unwrap_or("0.0.0.0:44100");
		let listen_engine = engine.clone();
		let listen = tokio::spawn(connect::listen(listen_engine, bind.to_string()));

		tokio::signal::ctrl_c().await?;
		tracing::info!("shutting down");
		listen.abort();
		engine.flush_all().await?;
	} else if matches.subcommand_matches("status").is_some() {
		if app.folders.is_empty() {
			println!("no folders configured ({})", data_dir.join("folders.json").display());
		}
		for folder in &app.folders {
			let exclusion =
				std::sync::Arc::new(ExclusionEngine::new(&folder.path, &folder.exclude)?);
			let scanner = FolderScanner::new(&folder.path, exclusion, None);
			match scanner.stats().await {
				Ok(stats) => println!(
					"{}  {}  [{:?}]  {} files, {} dirs, {} bytes",
					folder.sync_id,
					folder.path.display(),
					folder.mode,
					stats.files,
					stats.dirs,
					stats.bytes
				),
				Err(e) => println!(
					"{}  {}  [unavailable: {}]",
					folder.sync_id,
					folder.path.display(),
					e
				),
			}
		}
	} else if let Some(sub) = matches.subcommand_matches("chunks") {
		let file = sub.get_one::<String>("file").expect("required arg");
		let chunks = FastCdc::default().chunk_file(std::path::Path::new(file)).await?;
		for chunk in &chunks {
			println!("{}  offset={}  len={}", chunk.hash, chunk.offset, chunk.data.len());
		}
		println!("{} chunks", chunks.len());
	}

	Ok(())
}

// vim: ts=4
