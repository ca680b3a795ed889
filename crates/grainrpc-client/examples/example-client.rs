use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use grainrpc_client::client::Client;
use grainrpc_common::config::RpcConfig;
use grainrpc_common::directory::HttpDirectoryClient;
use grainrpc_common::ids::PlayerId;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use url::Url;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
	#[clap(long)]
	directory_url: Url,
	#[clap(long)]
	player_name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
	color_eyre::install()?;

	let env_filter = EnvFilter::builder()
		.with_default_directive(LevelFilter::INFO.into())
		.from_env_lossy();

	tracing_subscriber::fmt()
		.with_target(true)
		.with_level(true)
		.with_env_filter(env_filter)
		.init();

	let args = Args::parse();

	let directory = Arc::new(HttpDirectoryClient::new(args.directory_url));
	let config = Arc::new(RpcConfig::from_env());
	let player_id = PlayerId::random();

	let client = Client::connect(directory, config, player_id, &args.player_name, None)
		.await
		.wrap_err("failed to bootstrap connection to an action server")?;
	info!(server_id = %client.current_server_id().await, "connected");

	let world_state = client
		.proxy()
		.await
		.get_world_state(Duration::from_secs(2))
		.await
		.wrap_err("GetWorldState failed")?;
	info!(entities = world_state.entities.len(), sequence_number = world_state.sequence_number, "received world state");

	client.close().await;
	Ok(())
}
