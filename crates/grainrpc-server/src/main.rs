use clap::Parser;
use grainrpc_server::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	let args = Args::parse();
	grainrpc_server::main(args).await
}
