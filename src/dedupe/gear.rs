//! Gear-hash content-defined block boundaries.
//!
//! One table lookup and a shift per byte; a boundary falls wherever the
//! rolling hash masks to zero, so equal content produces equal block
//! cuts regardless of its offset in the stream. Used for the dedup
//! block split and for backing off chunk reads to a content boundary.

/// Deterministic pseudo-random gear table. Must never change: block
/// boundaries are part of the dedup wire contract.
const GEAR: [u64; 256] = build_gear();

const fn build_gear() -> [u64; 256] {
    // splitmix64 over a fixed seed.
    let mut table = [0u64; 256];
    let mut state = 0x9E37_79B9_7F4A_7C15u64;
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

#[derive(Debug, Clone, Copy)]
pub struct GearSplit {
    min: usize,
    max: usize,
    mask: u64,
}

impl GearSplit {
    /// `avg` must be a power of two; blocks land in `avg/2..=avg*4`.
    pub fn new(avg: usize) -> Self {
        debug_assert!(avg.is_power_of_two());
        GearSplit {
            min: avg / 2,
            max: avg * 4,
            mask: (avg - 1) as u64,
        }
    }

    /// Length of the first block of `data`. The tail shorter than the
    /// minimum is emitted as-is at end of input.
    pub fn next_block(&self, data: &[u8]) -> usize {
        if data.len() <= self.min {
            return data.len();
        }
        let mut hash = 0u64;
        let end = data.len().min(self.max);
        for (i, &b) in data[..end].iter().enumerate() {
            hash = (hash << 1).wrapping_add(GEAR[b as usize]);
            if i >= self.min && hash & self.mask == 0 {
                return i + 1;
            }
        }
        end
    }

    /// Split a whole buffer into block lengths.
    pub fn blocks(&self, data: &[u8]) -> Vec<usize> {
        let mut out = Vec::new();
        let mut off = 0;
        while off < data.len() {
            let len = self.next_block(&data[off..]);
            out.push(len);
            off += len;
        }
        out
    }

    /// End offset of the last content boundary at or before `data`'s
    /// end, for carrying a read tail into the next chunk. `None` when
    /// the buffer holds no boundary at all.
    pub fn last_boundary(&self, data: &[u8]) -> Option<usize> {
        let mut off = 0;
        let mut last = None;
        while off < data.len() {
            let len = self.next_block(&data[off..]);
            if off + len == data.len() {
                break;
            }
            off += len;
            last = Some(off);
        }
        last
    }
}

#[cfg(test)]
mod test_gear {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn blocks_cover_input() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let data: Vec<u8> = (0..200_000).map(|_| rng.gen()).collect();
        let split = GearSplit::new(4096);
        let blocks = split.blocks(&data);
        assert_eq!(blocks.iter().sum::<usize>(), data.len());
        for (i, &len) in blocks.iter().enumerate() {
            if i + 1 < blocks.len() {
                assert!(len >= split.min.min(data.len()));
            }
            assert!(len <= split.max);
        }
    }

    #[test]
    fn boundaries_are_content_defined() {
        // The same content shifted by an arbitrary prefix must re-align
        // to identical block cuts after at most one block.
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let content: Vec<u8> = (0..100_000).map(|_| rng.gen()).collect();
        let mut shifted = vec![0xAB; 1234];
        shifted.extend_from_slice(&content);

        let split = GearSplit::new(4096);
        let a: Vec<usize> = cut_offsets(&split, &content);
        let b: Vec<usize> = cut_offsets(&split, &shifted)
            .into_iter()
            .map(|o| o.wrapping_sub(1234))
            .collect();

        let common: Vec<_> = a.iter().filter(|o| b.contains(o)).collect();
        assert!(common.len() > a.len() / 2, "cuts failed to re-align");
    }

    fn cut_offsets(split: &GearSplit, data: &[u8]) -> Vec<usize> {
        let mut off = 0;
        let mut cuts = Vec::new();
        for len in split.blocks(data) {
            off += len;
            cuts.push(off);
        }
        cuts
    }

    #[test]
    fn short_input_is_one_block() {
        let split = GearSplit::new(4096);
        assert_eq!(split.blocks(b"tiny"), vec![4]);
        assert_eq!(split.blocks(b""), Vec::<usize>::new());
    }

    #[test]
    fn gear_table_is_stable() {
        // Wire contract: these values must never drift.
        assert_eq!(GEAR[0], build_gear()[0]);
        assert_ne!(GEAR[0], GEAR[1]);
        let distinct: std::collections::HashSet<u64> = GEAR.iter().copied().collect();
        assert_eq!(distinct.len(), 256);
    }
}
