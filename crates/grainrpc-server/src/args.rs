use std::net::SocketAddr;

use clap::Parser;
use url::Url;

/// Runs a grainrpc action server: the authoritative side of the symmetric
/// protocol, owning one zone of the world and the players currently
/// connected to it.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
	/// UDP address to bind the RPC listener on. Port 0 lets the OS pick.
	#[clap(long, default_value = "0.0.0.0:0")]
	pub bind_addr: SocketAddr,

	/// Identifier this server reports to the directory and to connecting clients.
	#[clap(long)]
	pub server_id: String,

	/// Base URL of the directory HTTP API.
	#[clap(long)]
	pub directory_url: Url,

	/// X coordinate of the GridSquare this server is authoritative for.
	#[clap(long, default_value_t = 0)]
	pub zone_x: i64,

	/// Y coordinate of the GridSquare this server is authoritative for.
	#[clap(long, default_value_t = 0)]
	pub zone_y: i64,
}
