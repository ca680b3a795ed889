//! LEB128-style varint helpers used throughout the wire codec.

use bytes::{Buf, BufMut};

use super::CodecError;

pub fn write_uvarint(buf: &mut impl BufMut, mut v: u64) {
	loop {
		let byte = (v & 0x7f) as u8;
		v >>= 7;
		if v == 0 {
			buf.put_u8(byte);
			break;
		}
		buf.put_u8(byte | 0x80);
	}
}

pub fn read_uvarint(buf: &mut impl Buf) -> Result<u64, CodecError> {
	let mut result: u64 = 0;
	let mut shift = 0u32;
	loop {
		if !buf.has_remaining() {
			return Err(CodecError::TruncatedFrame);
		}
		if shift >= 64 {
			return Err(CodecError::Malformed("varint too long".into()));
		}
		let byte = buf.get_u8();
		result |= ((byte & 0x7f) as u64) << shift;
		if byte & 0x80 == 0 {
			break;
		}
		shift += 7;
	}
	Ok(result)
}

pub fn zigzag_encode(v: i64) -> u64 {
	((v << 1) ^ (v >> 63)) as u64
}

pub fn zigzag_decode(v: u64) -> i64 {
	((v >> 1) as i64) ^ -((v & 1) as i64)
}

#[cfg(test)]
mod test {
	use super::*;
	use bytes::BytesMut;

	#[test]
	fn test_uvarint_roundtrip() {
		for v in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
			let mut buf = BytesMut::new();
			write_uvarint(&mut buf, v);
			let mut frozen = buf.freeze();
			assert_eq!(read_uvarint(&mut frozen).unwrap(), v);
			assert!(!frozen.has_remaining());
		}
	}

	#[test]
	fn test_zigzag_roundtrip() {
		for v in [0i64, 1, -1, 2, -2, i32::MIN as i64, i32::MAX as i64, i64::MIN, i64::MAX] {
			assert_eq!(zigzag_decode(zigzag_encode(v)), v);
		}
	}

	#[test]
	fn test_truncated_varint() {
		let mut buf = bytes::Bytes::from_static(&[0x80]);
		assert!(matches!(read_uvarint(&mut buf), Err(CodecError::TruncatedFrame)));
	}
}
