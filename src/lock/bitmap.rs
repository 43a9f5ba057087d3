use bit_vec::BitVec;

/// Positions representable without spilling to the heap.
const INLINE_BITS: u32 = 128;

/// Heap-position bit set of a record lock.
///
/// One allocation covers most pages: positions below 128 live in two inline
/// words; larger pages spill to a growable `BitVec`. This keeps the
/// one-allocation-per-lock-object density of the classic layout while making
/// the size explicit.
#[derive(Debug, Clone, PartialEq)]
pub struct Bitmap {
    repr: Repr,
}

#[derive(Debug, Clone, PartialEq)]
enum Repr {
    Inline([u64; 2]),
    Spilled(BitVec),
}

impl Bitmap {
    pub fn new() -> Self {
        Self {
            repr: Repr::Inline([0, 0]),
        }
    }

    /// Create a bitmap with a single position set.
    pub fn single(pos: u32) -> Self {
        let mut bitmap = Self::new();
        bitmap.set(pos);
        bitmap
    }

    pub fn set(&mut self, pos: u32) {
        if pos >= INLINE_BITS {
            self.spill(pos + 1);
        }

        match &mut self.repr {
            Repr::Inline(words) => {
                words[(pos / 64) as usize] |= 1u64 << (pos % 64);
            }
            Repr::Spilled(bits) => {
                if (pos as usize) >= bits.len() {
                    bits.grow(pos as usize + 1 - bits.len(), false);
                }
                bits.set(pos as usize, true);
            }
        }
    }

    pub fn clear(&mut self, pos: u32) {
        match &mut self.repr {
            Repr::Inline(words) => {
                if pos < INLINE_BITS {
                    words[(pos / 64) as usize] &= !(1u64 << (pos % 64));
                }
            }
            Repr::Spilled(bits) => {
                if (pos as usize) < bits.len() {
                    bits.set(pos as usize, false);
                }
            }
        }
    }

    pub fn contains(&self, pos: u32) -> bool {
        match &self.repr {
            Repr::Inline(words) => {
                pos < INLINE_BITS && words[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0
            }
            Repr::Spilled(bits) => bits.get(pos as usize).unwrap_or(false),
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.repr {
            Repr::Inline(words) => words[0] == 0 && words[1] == 0,
            Repr::Spilled(bits) => bits.none(),
        }
    }

    pub fn count(&self) -> usize {
        match &self.repr {
            Repr::Inline(words) => (words[0].count_ones() + words[1].count_ones()) as usize,
            Repr::Spilled(bits) => bits.iter().filter(|b| *b).count(),
        }
    }

    /// The single set position, if exactly one bit is set.
    ///
    /// Waiting locks identify one queue position, so their bitmaps must
    /// satisfy this.
    pub fn single_bit(&self) -> Option<u32> {
        let mut positions = self.positions();
        match (positions.next(), positions.next()) {
            (Some(pos), None) => Some(pos),
            _ => None,
        }
    }

    pub fn positions(&self) -> impl Iterator<Item = u32> + '_ {
        let upper = match &self.repr {
            Repr::Inline(_) => INLINE_BITS,
            Repr::Spilled(bits) => bits.len() as u32,
        };
        (0..upper).filter(move |pos| self.contains(*pos))
    }

    pub fn clear_all(&mut self) {
        self.repr = Repr::Inline([0, 0]);
    }

    /// Take the bitmap, leaving an empty one in place.
    pub fn take(&mut self) -> Bitmap {
        std::mem::replace(self, Bitmap::new())
    }

    fn spill(&mut self, capacity: u32) {
        if let Repr::Inline(words) = self.repr {
            let mut bits = BitVec::from_elem(capacity.max(INLINE_BITS) as usize, false);
            for pos in 0..INLINE_BITS {
                if words[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0 {
                    bits.set(pos as usize, true);
                }
            }
            self.repr = Repr::Spilled(bits);
        }
    }
}

impl Default for Bitmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_test() {
        let mut bitmap = Bitmap::new();
        assert!(bitmap.is_empty());

        bitmap.set(0);
        bitmap.set(5);
        bitmap.set(127);
        assert!(bitmap.contains(5));
        assert!(!bitmap.contains(6));
        assert_eq!(bitmap.count(), 3);
        assert_eq!(bitmap.positions().collect::<Vec<u32>>(), vec![0, 5, 127]);

        bitmap.clear(5);
        assert!(!bitmap.contains(5));
        assert_eq!(bitmap.count(), 2);
    }

    #[test]
    fn spill_test() {
        let mut bitmap = Bitmap::new();
        bitmap.set(3);
        bitmap.set(500);

        // inline contents survive the spill
        assert!(bitmap.contains(3));
        assert!(bitmap.contains(500));
        assert!(!bitmap.contains(499));
        assert_eq!(bitmap.count(), 2);

        bitmap.clear(500);
        bitmap.clear(3);
        assert!(bitmap.is_empty());
    }

    #[test]
    fn single_bit_test() {
        let mut bitmap = Bitmap::single(7);
        assert_eq!(bitmap.single_bit(), Some(7));

        bitmap.set(9);
        assert_eq!(bitmap.single_bit(), None);

        bitmap.clear_all();
        assert_eq!(bitmap.single_bit(), None);
    }
}
