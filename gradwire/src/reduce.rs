//! Element-wise summation used by the collective algorithms.

use crate::error::{GradwireError, Result};

/// Types that can be summed element-wise across workers.
pub trait Summable: Copy + 'static {
    fn sum(a: Self, b: Self) -> Self;
}

macro_rules! impl_summable {
    (int: $($ty:ty),*) => {
        $(
            impl Summable for $ty {
                #[inline]
                fn sum(a: Self, b: Self) -> Self {
                    a.wrapping_add(b)
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Summable for $ty {
                #[inline]
                fn sum(a: Self, b: Self) -> Self {
                    a + b
                }
            }
        )*
    };
}

impl_summable!(int: i32, i64, u32);
impl_summable!(float: f32, f64);

/// `dst[i] = dst[i] + src[i]` for every element.
pub(crate) fn sum_into<T: Summable>(dst: &mut [T], src: &[T]) -> Result<()> {
    if dst.len() != src.len() {
        return Err(GradwireError::BufferSizeMismatch {
            expected: dst.len(),
            actual: src.len(),
        });
    }
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = T::sum(*d, s);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_into_f32() {
        let mut dst = vec![1.0f32, 2.0, 3.0];
        sum_into(&mut dst, &[0.5, 0.5, -3.0]).unwrap();
        assert_eq!(dst, vec![1.5, 2.5, 0.0]);
    }

    #[test]
    fn test_sum_into_wraps_integers() {
        let mut dst = vec![u32::MAX, 1];
        sum_into(&mut dst, &[1, 1]).unwrap();
        assert_eq!(dst, vec![0, 2]);
    }

    #[test]
    fn test_sum_into_length_mismatch() {
        let mut dst = vec![0i64; 3];
        let err = sum_into(&mut dst, &[1, 2]).unwrap_err();
        assert!(matches!(
            err,
            GradwireError::BufferSizeMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }
}
