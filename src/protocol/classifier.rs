//! Chunk chain classification.
//!
//! One pass over the chain yields a bitmap of the chunk ids seen and the total
//! number of chunks. Callers use the three-valued [`Occurrence`] rather than
//! raw counts to enforce "must be the only chunk" rules.

use crate::core::chunk::{id, ChunkIter, RawChunk};
use crate::core::param::ParamIter;

/// Bit for a chunk id; ids above 30 share bit 31.
#[inline]
pub const fn bit_for(chunk_id: u8) -> u32 {
    if chunk_id > 30 {
        1 << 31
    } else {
        1 << chunk_id
    }
}

/// Result of scanning a chunk chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkTypes {
    bitmap: u32,
    total: usize,
    complete: bool,
}

/// How a chunk type appears in a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Occurrence {
    Absent = 0,
    /// Present and the only chunk in the packet
    Sole = 1,
    /// Present alongside other chunks
    Among = 2,
}

impl ChunkTypes {
    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// Chunks walked before the scan ended
    pub fn total(&self) -> usize {
        self.total
    }

    /// `false` when the scan stopped on a structural violation
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn contains(&self, chunk_id: u8) -> bool {
        self.bitmap & bit_for(chunk_id) != 0
    }

    pub fn occurrences(&self, chunk_id: u8) -> Occurrence {
        if !self.contains(chunk_id) {
            Occurrence::Absent
        } else if self.total == 1 {
            Occurrence::Sole
        } else {
            Occurrence::Among
        }
    }
}

/// Walk a chunk chain. A structural violation ends the scan and the partial
/// result is returned with `is_complete() == false`.
pub fn classify(chain: &[u8]) -> ChunkTypes {
    let mut types = ChunkTypes {
        complete: true,
        ..ChunkTypes::default()
    };
    for chunk in ChunkIter::new(chain) {
        match chunk {
            Ok(chunk) => {
                types.bitmap |= bit_for(chunk.chunk_id());
                types.total += 1;
            }
            Err(_) => {
                types.complete = false;
                break;
            }
        }
    }
    types
}

/// First chunk with the given id.
pub fn first_of(chain: &[u8], chunk_id: u8) -> Option<RawChunk<'_>> {
    ChunkIter::new(chain)
        .map_while(|c| c.ok())
        .find(|c| c.chunk_id() == chunk_id)
}

/// `true` when any ERROR chunk in the chain carries the cause code.
pub fn contains_error_cause(chain: &[u8], code: u16) -> bool {
    ChunkIter::new(chain)
        .map_while(|c| c.ok())
        .filter(|c| c.chunk_id() == id::ERROR)
        .any(|c| {
            ParamIter::new(c.value)
                .map_while(|cause| cause.ok())
                .any(|cause| cause.param_type == code)
        })
}
