//! C4: the application frame format carried inside the security layer's decrypted
//! payload, and the per-session manifest table it depends on.

pub mod frame;
pub mod manifest;

pub use frame::{ControlKind, Frame, RequestStatus};
pub use manifest::{InterfaceManifest, Manifest, ManifestMethod};
