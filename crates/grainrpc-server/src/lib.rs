mod args;
mod error;
pub mod grain;
mod handshake;
pub mod listener;
mod manifest;
mod session;

use std::sync::Arc;

use color_eyre::Result;
use grainrpc_common::config::RpcConfig;
use grainrpc_common::directory::HttpDirectoryClient;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

pub use args::Args;
use grain::GameGrain;

/// Runs one grainrpc action server until the process is torn down: binds the UDP
/// listener, wires up the directory client, and dispatches connections against one
/// `GameGrain` instance for the zone this server was launched for.
pub async fn main(args: Args) -> Result<()> {
	color_eyre::install()?;
	let env_filter = EnvFilter::builder().with_default_directive(LevelFilter::INFO.into()).from_env_lossy();
	tracing_subscriber::fmt().with_target(true).with_level(true).with_env_filter(env_filter).init();

	let directory: Arc<dyn grainrpc_common::directory::DirectoryClient> = Arc::new(HttpDirectoryClient::new(args.directory_url.clone()));
	let grain = Arc::new(GameGrain::new());
	let config = Arc::new(RpcConfig::from_env());

	let local_addr = listener::run(args.bind_addr, directory, grain, config).await?;
	tracing::info!(server_id = %args.server_id, zone_x = args.zone_x, zone_y = args.zone_y, addr = %local_addr, "grainrpc action server ready");

	std::future::pending::<()>().await;
	Ok(())
}
