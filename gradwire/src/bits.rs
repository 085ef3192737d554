//! Communicated-bits accounting.

use crate::types::Element;

/// Bits placed on the wire by sending `values`: `8 * len * element_size`.
pub fn n_bits<T: Element>(values: &[T]) -> u64 {
    8 * values.len() as u64 * T::DTYPE.size_in_bytes() as u64
}
