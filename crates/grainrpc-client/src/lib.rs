//! Client-side connection lifecycle, RPC session multiplexing, grain proxies, and
//! zone transition runtime.

pub mod client;
pub mod connection;
pub mod handshake;
pub mod observer;
pub mod proxy;
pub mod session;
pub mod zone;
