use bytes::Bytes;

/// A request for a byte range of a piece, as carried by Request, Cancel and
/// Reject messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }
}

/// A block of piece data, as carried by a Piece message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    pub fn new(index: u32, begin: u32, data: Bytes) -> Self {
        Self { index, begin, data }
    }

    /// The request this block answers.
    pub fn request(&self) -> BlockRequest {
        BlockRequest {
            index: self.index,
            begin: self.begin,
            length: self.data.len() as u32,
        }
    }
}
