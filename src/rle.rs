//! COCO run-length encoding
//!
//! Masks are stored column-major: runs alternate background/foreground over
//! the pixels of column 0 top to bottom, then column 1, and so on, always
//! starting with a (possibly empty) background run.

use crate::coco::{RleCounts, RleMask};
use crate::error::GeometryError;
use crate::types::BitMask;

// Runs are u32, so a signed delta needs at most 7 five-bit chunks
const MAX_CHUNKS: usize = 7;

/// Decode the compressed textual counts form into run lengths.
pub fn counts_from_string(s: &str) -> Result<Vec<u32>, GeometryError> {
    let bytes = s.as_bytes();
    let mut counts: Vec<i64> = Vec::new();
    let mut p = 0;
    while p < bytes.len() {
        let mut x: i64 = 0;
        let mut k = 0;
        let mut more = true;
        while more {
            let byte = *bytes.get(p).ok_or(GeometryError::RleCharacter(0))?;
            if !(48..48 + 64).contains(&byte) || k >= MAX_CHUNKS {
                return Err(GeometryError::RleCharacter(byte));
            }
            let c = (byte - 48) as i64;
            x |= (c & 0x1f) << (5 * k);
            more = c & 0x20 != 0;
            p += 1;
            k += 1;
            if !more && c & 0x10 != 0 {
                x |= -1i64 << (5 * k);
            }
        }
        // Runs after the first two are stored as deltas
        if counts.len() > 2 {
            x += counts[counts.len() - 2];
        }
        counts.push(x);
    }
    counts
        .into_iter()
        .map(|c| u32::try_from(c).map_err(|_| GeometryError::RleNegativeRun))
        .collect()
}

/// Encode run lengths into the compressed textual counts form.
pub fn counts_to_string(counts: &[u32]) -> String {
    let mut out = String::new();
    for (i, &count) in counts.iter().enumerate() {
        let mut x = count as i64;
        if i > 2 {
            x -= counts[i - 2] as i64;
        }
        let mut more = true;
        while more {
            let mut c = x & 0x1f;
            x >>= 5;
            more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
            if more {
                c |= 0x20;
            }
            out.push((c as u8 + 48) as char);
        }
    }
    out
}

/// Decode an RLE mask into a row-major bitmap.
pub fn decode(rle: &RleMask) -> Result<BitMask, GeometryError> {
    let runs = match &rle.counts {
        RleCounts::Runs(runs) => runs.clone(),
        RleCounts::Compressed(s) => counts_from_string(s)?,
    };
    decode_runs(&runs, rle.height, rle.width)
}

/// Decode numeric run lengths into a row-major bitmap of `height` x `width`.
pub fn decode_runs(runs: &[u32], height: usize, width: usize) -> Result<BitMask, GeometryError> {
    let expected = height
        .checked_mul(width)
        .ok_or(GeometryError::RleTooLarge { height, width })?;
    let actual: usize = runs.iter().map(|&r| r as usize).sum();
    if actual != expected {
        return Err(GeometryError::RleLength { expected, actual });
    }

    let mut mask = BitMask::new(height, width);
    let mut index = 0usize;
    let mut value = false;
    for &run in runs {
        if value {
            for i in index..index + run as usize {
                mask.set(i % height, i / height, true);
            }
        }
        index += run as usize;
        value = !value;
    }
    Ok(mask)
}

/// Encode a bitmap into numeric run lengths.
pub fn encode(mask: &BitMask) -> Vec<u32> {
    let mut runs = Vec::new();
    let mut current = false;
    let mut run = 0u32;
    for col in 0..mask.width {
        for row in 0..mask.height {
            let value = mask.get(row, col);
            if value != current {
                runs.push(run);
                run = 0;
                current = value;
            }
            run += 1;
        }
    }
    runs.push(run);
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_mask() -> BitMask {
        let mut mask = BitMask::new(4, 5);
        for row in 1..3 {
            for col in 1..4 {
                mask.set(row, col, true);
            }
        }
        mask.set(3, 4, true);
        mask
    }

    #[test]
    fn test_decode_runs_column_major() {
        // 2x3 mask, column-major pixels: [0,1 | 1,1 | 0,0]
        let mask = decode_runs(&[1, 3, 2], 2, 3).unwrap();
        assert!(!mask.get(0, 0));
        assert!(mask.get(1, 0));
        assert!(mask.get(0, 1));
        assert!(mask.get(1, 1));
        assert!(!mask.get(0, 2));
        assert!(!mask.get(1, 2));
    }

    #[test]
    fn test_decode_runs_length_mismatch() {
        let err = decode_runs(&[1, 2], 2, 3).unwrap_err();
        assert_eq!(err, GeometryError::RleLength { expected: 6, actual: 3 });
    }

    #[test]
    fn test_encode_then_decode_keeps_pixels() {
        let mask = sample_mask();
        let runs = encode(&mask);
        assert_eq!(decode_runs(&runs, 4, 5).unwrap(), mask);
    }

    #[test]
    fn test_compressed_counts_match_numeric() {
        let mask = sample_mask();
        let runs = encode(&mask);
        let text = counts_to_string(&runs);
        assert_eq!(counts_from_string(&text).unwrap(), runs);

        let from_text = decode(&RleMask {
            height: 4,
            width: 5,
            counts: RleCounts::Compressed(text),
        })
        .unwrap();
        assert_eq!(from_text, mask);
    }

    #[test]
    fn test_known_compressed_string() {
        // Runs [5, 3, 2] on a 10-pixel mask
        let runs = vec![5, 3, 2];
        let text = counts_to_string(&runs);
        assert_eq!(text, "532");
        assert_eq!(counts_from_string("532").unwrap(), runs);
    }

    #[test]
    fn test_overlong_compressed_token_rejected() {
        assert_eq!(
            counts_from_string("PPPPPPPPPPPP@"),
            Err(GeometryError::RleCharacter(b'P'))
        );
        // seven chunks are still accepted
        assert!(counts_from_string(&counts_to_string(&[u32::MAX])).is_ok());
    }

    #[test]
    fn test_overflowing_area_rejected() {
        assert_eq!(
            decode_runs(&[0], usize::MAX, 2),
            Err(GeometryError::RleTooLarge {
                height: usize::MAX,
                width: 2
            })
        );
    }

    #[test]
    fn test_invalid_compressed_character() {
        assert_eq!(
            counts_from_string(" "),
            Err(GeometryError::RleCharacter(b' '))
        );
    }
}
