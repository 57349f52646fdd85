use bytes::Bytes;

/// A bitfield representing which pieces a peer has.
///
/// Piece `i * 8 + k` lives in bit `k` of byte `i`, where bit 0 is the
/// least-significant bit. Bits past `piece_count` in the last byte are kept clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: usize,
}

impl Bitfield {
    /// Creates a new empty bitfield for the given number of pieces.
    pub fn new(piece_count: usize) -> Self {
        Self {
            bits: vec![0; piece_count.div_ceil(8)],
            piece_count,
        }
    }

    /// Creates a bitfield from raw bytes, padding or truncating to `piece_count`.
    pub fn from_bytes(bytes: &[u8], piece_count: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(piece_count.div_ceil(8), 0);

        let mut bf = Self { bits, piece_count };
        bf.clear_spare_bits();
        bf
    }

    /// Creates a bitfield covering every bit of a wire payload.
    ///
    /// The payload does not say how many pieces the torrent has, so the piece
    /// count is `payload.len() * 8`.
    pub fn from_payload(payload: &[u8]) -> Self {
        Self {
            bits: payload.to_vec(),
            piece_count: payload.len() * 8,
        }
    }

    /// Creates a full bitfield (all pieces available).
    pub fn full(piece_count: usize) -> Self {
        let mut bf = Self {
            bits: vec![0xFF; piece_count.div_ceil(8)],
            piece_count,
        };
        bf.clear_spare_bits();
        bf
    }

    /// Returns true if the piece at the given index is available.
    pub fn has(&self, index: usize) -> bool {
        if index >= self.piece_count {
            return false;
        }
        (self.bits[index / 8] >> (index % 8)) & 1 == 1
    }

    /// Sets the bit for the piece at the given index. Out of range is ignored.
    pub fn set(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] |= 1 << (index % 8);
        }
    }

    /// Clears the bit for the piece at the given index. Out of range is ignored.
    pub fn clear(&mut self, index: usize) {
        if index < self.piece_count {
            self.bits[index / 8] &= !(1 << (index % 8));
        }
    }

    /// Returns the number of pieces that are available.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.count() == self.piece_count
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Returns the total number of pieces.
    pub fn len(&self) -> usize {
        self.piece_count
    }

    /// Returns the raw bytes of the bitfield, as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    /// Iterates over every piece's availability in index order.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.piece_count).map(|i| self.has(i))
    }

    /// Returns indices of all available pieces.
    pub fn available_pieces(&self) -> Vec<usize> {
        (0..self.piece_count).filter(|&i| self.has(i)).collect()
    }

    /// Grows or shrinks the bitfield to `piece_count` pieces. New pieces are
    /// unset; pieces past the new end are dropped.
    pub fn resize(&mut self, piece_count: usize) {
        self.bits.resize(piece_count.div_ceil(8), 0);
        self.piece_count = piece_count;
        self.clear_spare_bits();
    }

    /// Clears any spare bits in the last byte that don't correspond to pieces.
    fn clear_spare_bits(&mut self) {
        let spare = (self.bits.len() * 8) - self.piece_count;
        if spare > 0 && spare < 8 {
            let last = self.bits.len() - 1;
            self.bits[last] &= 0xFFu8 >> spare;
        }
    }
}
