/*!
 * Core Module
 * Shared types, constants, and error handling
 */

pub mod errors;
pub mod types;

pub use errors::{StoreError, StoreResult};
pub use types::{
    ChunkNo, Offset, Size, StoreStats, CHUNK_SIZE, DEFAULT_CAPACITY, FILE_CHUNKS,
    MAX_SEGMENT_SIZE, MAX_SMALL_SIZE, SEGMENT_FILE_SIZE, STATE_FORMAT_VERSION, STORE_VERSION,
};
