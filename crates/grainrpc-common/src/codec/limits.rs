//! Default codec limits: depth 100, collection 10 000 elements,
//! single string 1 MiB, total message size 10 MiB.

#[derive(Debug, Clone, Copy)]
pub struct Limits {
	pub max_depth: usize,
	pub max_collection_len: usize,
	pub max_string_bytes: usize,
	pub max_message_bytes: usize,
}

impl Default for Limits {
	fn default() -> Self {
		Self {
			max_depth: 100,
			max_collection_len: 10_000,
			max_string_bytes: 1024 * 1024,
			max_message_bytes: 10 * 1024 * 1024,
		}
	}
}
