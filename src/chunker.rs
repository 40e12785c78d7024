//! Content-defined chunking (FastCDC)
//!
//! Splits byte streams into variable-size chunks whose boundaries depend on
//! content, not position, so an insertion near the start of a file shifts at
//! most a bounded neighborhood of boundaries. All peers must agree on the
//! boundaries bit-for-bit: the gear table is derived at compile time from a
//! fixed seed and the cut masks from the average target size.

use crate::error::ChunkError;
use crate::types::Chunk;
use crate::util::sha256_hex;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Default minimum chunk size (4 KiB)
pub const MIN_CHUNK_SIZE: usize = 4096;

/// Default average chunk size (16 KiB)
pub const AVG_CHUNK_SIZE: usize = 16384;

/// Default maximum chunk size (64 KiB)
pub const MAX_CHUNK_SIZE: usize = 65536;

/// Seed for the gear table; identical on every peer, never change it
const GEAR_SEED: u64 = 0x6d65_7368_7379_6e63;

/// 256 gear constants generated from GEAR_SEED with splitmix64
const GEAR: [u64; 256] = build_gear();

const fn build_gear() -> [u64; 256] {
	let mut table = [0u64; 256];
	let mut state = GEAR_SEED;
	let mut i = 0;
	while i < 256 {
		state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
		let mut z = state;
		z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
		z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
		table[i] = z ^ (z >> 31);
		i += 1;
	}
	table
}

/// FastCDC cutter with fixed parameters
#[derive(Debug, Clone, Copy)]
pub struct FastCdc {
	min: usize,
	avg: usize,
	max: usize,
	mask_small: u64,
	mask_large: u64,
}

impl Default for FastCdc {
	fn default() -> Self {
		// Defaults are part of the wire contract
		FastCdc::new(MIN_CHUNK_SIZE, AVG_CHUNK_SIZE, MAX_CHUNK_SIZE)
			.unwrap_or(FastCdc {
				min: MIN_CHUNK_SIZE,
				avg: AVG_CHUNK_SIZE,
				max: MAX_CHUNK_SIZE,
				mask_small: (1 << 16) - 1,
				mask_large: (1 << 12) - 1,
			})
	}
}

impl FastCdc {
	/// Create a cutter; `avg` must be a power of two with `min < avg < max`
	pub fn new(min: usize, avg: usize, max: usize) -> Result<Self, ChunkError> {
		if min == 0 || !(min < avg && avg < max) || !avg.is_power_of_two() {
			return Err(ChunkError::InvalidConfig {
				message: format!("bad min/avg/max {}/{}/{}", min, avg, max),
			});
		}
		let bits = avg.ilog2();
		// Normalized chunking: a harder mask below avg, an easier one above
		let mask_small = (1u64 << (bits + 2)) - 1;
		let mask_large = (1u64 << (bits - 2)) - 1;
		Ok(FastCdc { min, avg, max, mask_small, mask_large })
	}

	pub fn min(&self) -> usize {
		self.min
	}

	pub fn max(&self) -> usize {
		self.max
	}

	/// Length of the next chunk starting at `data[0]`
	///
	/// `data` holds everything known from the current position; only the
	/// first `max` bytes are examined. Returns `data.len()` at EOF when no
	/// cut point fires.
	pub fn cut(&self, data: &[u8]) -> usize {
		let len = data.len();
		if len <= self.min {
			return len;
		}
		let cap = len.min(self.max);
		let mut fp: u64 = 0;
		for (i, byte) in data[..cap].iter().enumerate() {
			fp = (fp << 1).wrapping_add(GEAR[*byte as usize]);
			let length = i + 1;
			if length < self.min {
				continue;
			}
			let mask = if length < self.avg { self.mask_small } else { self.mask_large };
			if fp & mask == 0 {
				return length;
			}
		}
		cap
	}

	/// Split a byte slice into hashed chunks covering it exactly
	pub fn chunk_bytes(&self, data: &[u8]) -> Vec<Chunk> {
		let mut chunks = Vec::new();
		let mut offset = 0usize;
		while offset < data.len() {
			let len = self.cut(&data[offset..]);
			let slice = &data[offset..offset + len];
			chunks.push(Chunk {
				hash: sha256_hex(slice),
				offset: offset as u64,
				data: slice.to_vec(),
			});
			offset += len;
		}
		chunks
	}

	/// Chunk a file without loading it whole, yielding between chunks
	pub async fn chunk_file(&self, path: &Path) -> Result<Vec<Chunk>, ChunkError> {
		let mut file = tokio::fs::File::open(path)
			.await
			.map_err(|e| ChunkError::ReadFailed { source: e })?;
		let mut chunks = Vec::new();
		let mut buf: Vec<u8> = Vec::with_capacity(self.max * 2);
		let mut read_buf = vec![0u8; self.max];
		let mut offset = 0u64;
		let mut eof = false;

		loop {
			// Keep at least max bytes buffered so cut() sees a full window
			while !eof && buf.len() < self.max {
				let n = file
					.read(&mut read_buf)
					.await
					.map_err(|e| ChunkError::ReadFailed { source: e })?;
				if n == 0 {
					eof = true;
				} else {
					buf.extend_from_slice(&read_buf[..n]);
				}
			}
			if buf.is_empty() {
				break;
			}
			let len = self.cut(&buf);
			let slice = &buf[..len];
			chunks.push(Chunk { hash: sha256_hex(slice), offset, data: slice.to_vec() });
			offset += len as u64;
			buf.drain(..len);
			tokio::task::yield_now().await;
		}
		Ok(chunks)
	}
}


// vim: ts=4
