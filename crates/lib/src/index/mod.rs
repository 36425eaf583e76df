//! Hash-position index: an open-addressing multimap from 32-bit hashes to
//! slot positions.
//!
//! The index is a single fixed array of `u64` cells sized at construction.
//! Each occupied cell packs `(normalized_hash << 32) | (position + 1)`, so a
//! zero cell is always empty no matter which hash it would have held.
//! Collisions are resolved by linear probing; removal uses backward-shift
//! deletion so that no probe chain is ever broken by a hole.
//!
//! Duplicate hashes are allowed, duplicate `(hash, position)` pairs are not.
//! The index never stores key or value data; positions refer back into the
//! owning segment's slots.
//!
//! Lookups use an explicit [`SearchCursor`] returned by
//! [`HashPosIndex::start_search`], and full-table walks use [`ScanCursor`]s
//! from [`HashPosIndex::first_pos`]. Neither cursor borrows the index, so
//! the caller decides how long a search lives; the segment lock that guards
//! the index also guards every cursor walking it.

/// Substitute used when a caller's hash is zero.
const HASH_INSTEAD_OF_ZERO: u32 = 0x9E37_79B9;

/// Minimum number of cells allocated.
const MIN_CAPACITY: usize = 8;

const EMPTY: u64 = 0;

/// Normalize a 32-bit hash into the form stored in the index.
pub fn normalize(hash: u32) -> u32 {
    if hash == 0 { HASH_INSTEAD_OF_ZERO } else { hash }
}

/// Fold a 64-bit hash down to a normalized 32-bit hash.
pub fn normalize_wide(hash: u64) -> u32 {
    normalize((hash ^ (hash >> 32)) as u32)
}

#[inline]
fn pack(hash: u32, pos: u32) -> u64 {
    ((hash as u64) << 32) | (pos as u64 + 1)
}

#[inline]
fn cell_hash(cell: u64) -> u32 {
    (cell >> 32) as u32
}

#[inline]
fn cell_pos(cell: u64) -> u32 {
    ((cell & 0xFFFF_FFFF) - 1) as u32
}

/// State of a single-hash probe started by [`HashPosIndex::start_search`].
#[derive(Debug, Clone)]
pub struct SearchCursor {
    hash: u32,
    cell: usize,
    probed: usize,
    exhausted: bool,
}

impl SearchCursor {
    /// The normalized hash this search probes for. Reuse it for follow-up
    /// `put`/`remove` calls on the same logical key.
    pub fn normalized_hash(&self) -> u32 {
        self.hash
    }
}

/// Position reached by a full-table scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    cell: usize,
    hash: u32,
    pos: u32,
}

impl ScanCursor {
    pub fn hash(&self) -> u32 {
        self.hash
    }

    pub fn pos(&self) -> u32 {
        self.pos
    }
}

/// Fixed-capacity open-addressing multimap of `(hash, position)` pairs.
#[derive(Debug, Clone)]
pub struct HashPosIndex {
    cells: Box<[u64]>,
    mask: usize,
    len: usize,
}

impl HashPosIndex {
    /// Create an index able to hold `positions` pairs while staying at most
    /// half full.
    pub fn with_capacity(positions: usize) -> Self {
        let capacity = positions
            .saturating_mul(2)
            .max(MIN_CAPACITY)
            .next_power_of_two();
        Self {
            cells: vec![EMPTY; capacity].into_boxed_slice(),
            mask: capacity - 1,
            len: 0,
        }
    }

    /// Number of cells in the table.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Number of stored pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn home(&self, hash: u32) -> usize {
        hash as usize & self.mask
    }

    /// Insert a pair. Inserting a pair that is already present is a no-op.
    ///
    /// Returns whether the pair was newly inserted.
    pub fn put(&mut self, hash: u32, pos: u32) -> bool {
        let hash = normalize(hash);
        let packed = pack(hash, pos);
        let mut cell = self.home(hash);
        for _ in 0..self.cells.len() {
            match self.cells[cell] {
                EMPTY => {
                    self.cells[cell] = packed;
                    self.len += 1;
                    return true;
                }
                existing if existing == packed => return false,
                _ => cell = (cell + 1) & self.mask,
            }
        }
        debug_assert!(false, "hash-position index is full");
        false
    }

    /// Remove a pair, returning whether it was present.
    pub fn remove(&mut self, hash: u32, pos: u32) -> bool {
        let hash = normalize(hash);
        let packed = pack(hash, pos);
        let mut cell = self.home(hash);
        for _ in 0..self.cells.len() {
            match self.cells[cell] {
                EMPTY => return false,
                existing if existing == packed => {
                    self.shift_back_from(cell);
                    self.len -= 1;
                    return true;
                }
                _ => cell = (cell + 1) & self.mask,
            }
        }
        false
    }

    /// Backward-shift deletion starting at the cell being vacated.
    fn shift_back_from(&mut self, vacated: usize) {
        let mut hole = vacated;
        let mut cell = (vacated + 1) & self.mask;
        loop {
            let current = self.cells[cell];
            if current == EMPTY {
                break;
            }
            let home = self.home(cell_hash(current));
            // An entry may move into the hole only if its home is not
            // cyclically within (hole, cell].
            let home_after_hole = if hole <= cell {
                hole < home && home <= cell
            } else {
                hole < home || home <= cell
            };
            if !home_after_hole {
                self.cells[hole] = current;
                hole = cell;
            }
            cell = (cell + 1) & self.mask;
        }
        self.cells[hole] = EMPTY;
    }

    /// Begin a probe for `hash`.
    pub fn start_search(&self, hash: u32) -> SearchCursor {
        let hash = normalize(hash);
        SearchCursor {
            hash,
            cell: self.home(hash),
            probed: 0,
            exhausted: false,
        }
    }

    /// Begin a probe for a 64-bit hash, folded to 32 bits.
    pub fn start_search_wide(&self, hash: u64) -> SearchCursor {
        self.start_search(normalize_wide(hash))
    }

    /// Next position stored under the cursor's hash, or `None` once the probe
    /// reaches an empty cell.
    pub fn next_pos(&self, cursor: &mut SearchCursor) -> Option<u32> {
        while !cursor.exhausted && cursor.probed < self.cells.len() {
            let current = self.cells[cursor.cell];
            if current == EMPTY {
                cursor.exhausted = true;
                return None;
            }
            cursor.cell = (cursor.cell + 1) & self.mask;
            cursor.probed += 1;
            if cell_hash(current) == cursor.hash {
                return Some(cell_pos(current));
            }
        }
        cursor.exhausted = true;
        None
    }

    /// First occupied cell in table order.
    pub fn first_pos(&self) -> Option<ScanCursor> {
        self.scan_from(0, None)
    }

    /// Continue a full scan after `from`, skipping cells holding the same
    /// hash as `from`.
    pub fn next_different_hash_non_empty_position(&self, from: &ScanCursor) -> Option<ScanCursor> {
        self.scan_from(from.cell + 1, Some(from.hash))
    }

    fn scan_from(&self, start: usize, skip_hash: Option<u32>) -> Option<ScanCursor> {
        self.cells
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, cell)| **cell != EMPTY && Some(cell_hash(**cell)) != skip_hash)
            .map(|(cell, packed)| ScanCursor {
                cell,
                hash: cell_hash(*packed),
                pos: cell_pos(*packed),
            })
    }

    /// Every position stored under `hash`, in probe order.
    pub fn positions(&self, hash: u32) -> Vec<u32> {
        let mut cursor = self.start_search(hash);
        let mut found = Vec::new();
        while let Some(pos) = self.next_pos(&mut cursor) {
            found.push(pos);
        }
        found
    }

    /// Remove every pair.
    pub fn clear(&mut self) {
        self.cells.fill(EMPTY);
        self.len = 0;
    }
}
