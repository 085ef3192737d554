//! Bit-level sign codec.
//!
//! Signs are packed 32 to a `u32`. A flat vector of length `n` is padded
//! to a multiple of 32 and viewed as 32 rows of `cols = padded / 32`;
//! word `j` holds column `j`, bit `k` set iff element `k * cols + j` is
//! negative. Zero and positive values decode as `+1`.

use crate::error::{GradwireError, Result};
use crate::tensor::Tensor;

const WORD_BITS: usize = 32;

/// Sign under the codec's convention: `-1` for negative values, else `+1`.
#[inline]
pub fn sign_of(x: f32) -> f32 {
    if x < 0.0 { -1.0 } else { 1.0 }
}

/// Packed signs of one tensor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedSigns {
    pub words: Vec<u32>,
    pub shape: Vec<usize>,
}

/// Packs `±1` signs into dense bit words.
///
/// Only available with the `sign-codec` feature; otherwise
/// [`SignCompressor::new`] fails with [`GradwireError::Unavailable`].
#[derive(Debug, Clone, Copy)]
pub struct SignCompressor {
    _private: (),
}

impl SignCompressor {
    #[cfg(feature = "sign-codec")]
    pub fn new() -> Result<Self> {
        Ok(Self { _private: () })
    }

    #[cfg(not(feature = "sign-codec"))]
    pub fn new() -> Result<Self> {
        Err(GradwireError::Unavailable {
            component: "sign codec",
        })
    }

    /// Number of words needed for `len` signs.
    pub fn words_for(len: usize) -> usize {
        len.div_ceil(WORD_BITS)
    }

    pub fn compress(&self, tensor: &Tensor) -> PackedSigns {
        PackedSigns {
            words: self.compress_slice(tensor.data()),
            shape: tensor.shape().to_vec(),
        }
    }

    pub fn uncompress(&self, packed: &PackedSigns) -> Result<Tensor> {
        let len = packed.shape.iter().product();
        let values = self.uncompress_slice(&packed.words, len)?;
        Tensor::new(packed.shape.clone(), values)
    }

    /// Pack the signs of a flat slice.
    pub fn compress_slice(&self, values: &[f32]) -> Vec<u32> {
        let cols = Self::words_for(values.len());
        let mut words = vec![0u32; cols];
        for (e, &v) in values.iter().enumerate() {
            if v < 0.0 {
                let (k, j) = (e / cols, e % cols);
                words[j] |= 1 << k;
            }
        }
        words
    }

    /// Unpack `len` signs as `±1.0`.
    pub fn uncompress_slice(&self, words: &[u32], len: usize) -> Result<Vec<f32>> {
        let cols = Self::words_for(len);
        if words.len() != cols {
            return Err(GradwireError::BufferSizeMismatch {
                expected: cols,
                actual: words.len(),
            });
        }
        Ok((0..len)
            .map(|e| {
                let (k, j) = (e / cols, e % cols);
                if words[j] >> k & 1 == 1 { -1.0 } else { 1.0 }
            })
            .collect())
    }

    /// Per-coordinate majority over several workers' packed signs.
    ///
    /// A coordinate is negative iff strictly more than half of the workers
    /// voted negative; ties resolve to `+1`.
    pub fn majority_vote(&self, worker_words: &[Vec<u32>], len: usize) -> Result<Vec<u32>> {
        let cols = Self::words_for(len);
        let n = worker_words.len();
        let mut negatives = vec![0usize; len];
        for words in worker_words {
            if words.len() != cols {
                return Err(GradwireError::BufferSizeMismatch {
                    expected: cols,
                    actual: words.len(),
                });
            }
            for (e, count) in negatives.iter_mut().enumerate() {
                let (k, j) = (e / cols, e % cols);
                *count += (words[j] >> k & 1) as usize;
            }
        }
        let mut voted = vec![0u32; cols];
        for (e, &count) in negatives.iter().enumerate() {
            if 2 * count > n {
                let (k, j) = (e / cols, e % cols);
                voted[j] |= 1 << k;
            }
        }
        Ok(voted)
    }
}

#[cfg(all(test, feature = "sign-codec"))]
mod tests {
    use super::*;

    fn codec() -> SignCompressor {
        SignCompressor::new().unwrap()
    }

    #[test]
    fn test_roundtrip_matches_codec_sign() {
        let c = codec();
        for len in [1usize, 5, 31, 32, 33, 64, 100] {
            let values: Vec<f32> = (0..len)
                .map(|i| match i % 3 {
                    0 => -(i as f32) - 0.5,
                    1 => 0.0,
                    _ => i as f32,
                })
                .collect();
            let words = c.compress_slice(&values);
            assert_eq!(words.len(), len.div_ceil(32));
            let back = c.uncompress_slice(&words, len).unwrap();
            let expected: Vec<f32> = values.iter().map(|&v| sign_of(v)).collect();
            assert_eq!(back, expected, "len {len}");
        }
    }

    #[test]
    fn test_bit_layout() {
        // 40 elements: cols = 2, element k*2 + j lands in word j bit k.
        let mut values = vec![1.0f32; 40];
        values[0] = -1.0; // word 0 bit 0
        values[3] = -1.0; // word 1 bit 1
        values[38] = -1.0; // word 0 bit 19
        let words = codec().compress_slice(&values);
        assert_eq!(words, vec![1 | 1 << 19, 1 << 1]);
    }

    #[test]
    fn test_tensor_roundtrip_keeps_shape() {
        let c = codec();
        let t = Tensor::new([3, 3], vec![-1.0, 2.0, 0.0, -0.1, 4.0, -5.0, 6.0, 0.0, -8.0]).unwrap();
        let packed = c.compress(&t);
        let back = c.uncompress(&packed).unwrap();
        assert_eq!(back.shape(), &[3, 3]);
        assert_eq!(back.data(), &[-1.0, 1.0, 1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0]);
    }

    #[test]
    fn test_majority_vote_ties_positive() {
        let c = codec();
        let a = c.compress_slice(&[-1.0, -1.0, 1.0]);
        let b = c.compress_slice(&[-1.0, 1.0, 1.0]);
        let d = c.compress_slice(&[-1.0, 1.0, -1.0]);

        let two = c.majority_vote(&[a.clone(), b.clone()], 3).unwrap();
        assert_eq!(c.uncompress_slice(&two, 3).unwrap(), vec![-1.0, 1.0, 1.0]);

        let three = c.majority_vote(&[a, b, d], 3).unwrap();
        assert_eq!(c.uncompress_slice(&three, 3).unwrap(), vec![-1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_uncompress_rejects_wrong_word_count() {
        assert!(codec().uncompress_slice(&[0, 0], 10).is_err());
    }
}
