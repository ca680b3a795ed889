//! HTTP client for the directory service. The directory itself (the
//! Orleans-style cluster membership, grain directory, and silo placement it fronts)
//! is an external collaborator; the core only consumes these four endpoints.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::BootstrapError;
use crate::ids::{GridSquare, Role};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerInfo {
	pub player_id: Uuid,
	pub name: String,
	pub position: Position,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
	pub x: f64,
	pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
	pub server_id: String,
	pub ip_address: String,
	pub udp_port: u16,
	pub http_endpoint: String,
	pub rpc_port: u16,
	pub assigned_square: GridSquareDto,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GridSquareDto {
	pub x: i64,
	pub y: i64,
}

impl From<GridSquareDto> for GridSquare {
	fn from(dto: GridSquareDto) -> Self {
		GridSquare::new(dto.x, dto.y)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
	pub player_info: PlayerInfo,
	pub action_server: ServerInfo,
	pub session_key: String,
	pub session_expires_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
	player_id: Uuid,
	name: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValidateRequest<'a> {
	player_id: Uuid,
	provided_key: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidateResponse {
	pub ok: bool,
	pub role: Role,
}

/// The four operations the core requires from the directory, plus the
/// server-side PSK validation endpoint specified "for symmetry". A trait so
/// handshake/transition tests can substitute a fake without standing up HTTP.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
	async fn register(&self, player_id: Uuid, name: &str) -> Result<RegisterResponse, BootstrapError>;
	async fn server_for_player(&self, player_id: Uuid) -> Result<Option<ServerInfo>, BootstrapError>;
	async fn list_action_servers(&self) -> Result<Vec<ServerInfo>, BootstrapError>;
	async fn disconnect_player(&self, player_id: Uuid) -> Result<bool, BootstrapError>;

	/// Used by an action server's handshake responder to confirm that the base64
	/// session key a connecting client presented in HELLO is the one the directory
	/// actually minted for that player.
	async fn validate_session(&self, player_id: Uuid, provided_key_b64: &str) -> Result<ValidateResponse, BootstrapError>;
}

#[derive(Debug, Clone)]
pub struct HttpDirectoryClient {
	client: reqwest::Client,
	base_url: Url,
}

impl HttpDirectoryClient {
	pub fn new(base_url: Url) -> Self {
		Self { client: reqwest::Client::new(), base_url }
	}

	pub fn with_client(client: reqwest::Client, base_url: Url) -> Self {
		Self { client, base_url }
	}

	fn url(&self, path: &str) -> Url {
		self.base_url.join(path).expect("directory paths are static and valid")
	}
}

#[async_trait]
impl DirectoryClient for HttpDirectoryClient {
	async fn register(&self, player_id: Uuid, name: &str) -> Result<RegisterResponse, BootstrapError> {
		let response = self
			.client
			.post(self.url("/api/world/players/register"))
			.json(&RegisterRequest { player_id, name })
			.send()
			.await
			.map_err(BootstrapError::DirectoryUnreachable)?;

		if !response.status().is_success() {
			let status = response.status();
			let body = response.text().await.unwrap_or_default();
			return Err(BootstrapError::RegistrationRefused(format!("{status}: {body}")));
		}
		response.json().await.map_err(BootstrapError::DirectoryUnreachable)
	}

	async fn server_for_player(&self, player_id: Uuid) -> Result<Option<ServerInfo>, BootstrapError> {
		let response = self
			.client
			.get(self.url(&format!("/api/world/players/{player_id}/server")))
			.send()
			.await
			.map_err(BootstrapError::DirectoryUnreachable)?;

		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !response.status().is_success() {
			let status = response.status();
			let body = response.text().await.unwrap_or_default();
			return Err(BootstrapError::RequestFailed(format!("{status}: {body}")));
		}
		response.json().await.map(Some).map_err(BootstrapError::DirectoryUnreachable)
	}

	async fn list_action_servers(&self) -> Result<Vec<ServerInfo>, BootstrapError> {
		let response = self
			.client
			.get(self.url("/api/world/action-servers"))
			.send()
			.await
			.map_err(BootstrapError::DirectoryUnreachable)?;
		response.json().await.map_err(BootstrapError::DirectoryUnreachable)
	}

	async fn disconnect_player(&self, player_id: Uuid) -> Result<bool, BootstrapError> {
		let response = self
			.client
			.delete(self.url(&format!("/api/world/disconnect-player/{player_id}")))
			.send()
			.await
			.map_err(BootstrapError::DirectoryUnreachable)?;
		Ok(response.status().is_success())
	}

	async fn validate_session(&self, player_id: Uuid, provided_key_b64: &str) -> Result<ValidateResponse, BootstrapError> {
		let response = self
			.client
			.post(self.url("/session/validate"))
			.json(&ValidateRequest { player_id, provided_key: provided_key_b64 })
			.send()
			.await
			.map_err(BootstrapError::DirectoryUnreachable)?;
		response.json().await.map_err(BootstrapError::DirectoryUnreachable)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_grid_square_dto_conversion() {
		let dto = GridSquareDto { x: 3, y: -2 };
		let square: GridSquare = dto.into();
		assert_eq!(square, GridSquare::new(3, -2));
	}
}
