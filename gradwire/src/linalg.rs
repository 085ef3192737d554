//! Small dense linear algebra on row-major `f32` slices.
//!
//! Matrices are passed as flat slices plus their dimensions. Products
//! accumulate in `f64`.

/// Column-norm epsilon used by [`orthogonalize`].
pub const ORTHOGONALIZE_EPS: f32 = 1e-8;

/// Maximum Jacobi sweeps before [`svd`] stops rotating.
const SVD_MAX_SWEEPS: usize = 60;

/// `out (n×m) = a (n×k) · b (k×m)`.
pub fn matmul(a: &[f32], b: &[f32], out: &mut [f32], n: usize, k: usize, m: usize) {
    debug_assert_eq!(a.len(), n * k);
    debug_assert_eq!(b.len(), k * m);
    debug_assert_eq!(out.len(), n * m);
    let mut row = vec![0.0f64; m];
    for i in 0..n {
        row.fill(0.0);
        for (l, &a_il) in a[i * k..(i + 1) * k].iter().enumerate() {
            if a_il == 0.0 {
                continue;
            }
            let a_il = a_il as f64;
            for (acc, &b_lj) in row.iter_mut().zip(&b[l * m..(l + 1) * m]) {
                *acc += a_il * b_lj as f64;
            }
        }
        for (o, &acc) in out[i * m..(i + 1) * m].iter_mut().zip(&row) {
            *o = acc as f32;
        }
    }
}

/// `out (n×m) = aᵀ · b` with `a (k×n)` and `b (k×m)`.
pub fn matmul_tn(a: &[f32], b: &[f32], out: &mut [f32], k: usize, n: usize, m: usize) {
    debug_assert_eq!(a.len(), k * n);
    debug_assert_eq!(b.len(), k * m);
    debug_assert_eq!(out.len(), n * m);
    let mut acc = vec![0.0f64; n * m];
    for l in 0..k {
        let a_row = &a[l * n..(l + 1) * n];
        let b_row = &b[l * m..(l + 1) * m];
        for (i, &a_li) in a_row.iter().enumerate() {
            if a_li == 0.0 {
                continue;
            }
            let a_li = a_li as f64;
            for (dst, &b_lj) in acc[i * m..(i + 1) * m].iter_mut().zip(b_row) {
                *dst += a_li * b_lj as f64;
            }
        }
    }
    for (o, v) in out.iter_mut().zip(acc) {
        *o = v as f32;
    }
}

/// `out (n×m) = a · bᵀ` with `a (n×k)` and `b (m×k)`.
pub fn matmul_nt(a: &[f32], b: &[f32], out: &mut [f32], n: usize, k: usize, m: usize) {
    debug_assert_eq!(a.len(), n * k);
    debug_assert_eq!(b.len(), m * k);
    debug_assert_eq!(out.len(), n * m);
    for i in 0..n {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..m {
            let b_row = &b[j * k..(j + 1) * k];
            let dot: f64 = a_row
                .iter()
                .zip(b_row)
                .map(|(&x, &y)| x as f64 * y as f64)
                .sum();
            out[i * m + j] = dot as f32;
        }
    }
}

/// Orthonormalize the columns of `matrix (rows×cols)` in place.
///
/// Modified Gram-Schmidt, one pass left to right: column `i` is divided by
/// its L2 norm plus [`ORTHOGONALIZE_EPS`], then its projection is removed
/// from every later column.
pub fn orthogonalize(matrix: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(matrix.len(), rows * cols);
    for i in 0..cols {
        let norm = (0..rows)
            .map(|r| {
                let v = matrix[r * cols + i] as f64;
                v * v
            })
            .sum::<f64>()
            .sqrt() as f32;
        let scale = norm + ORTHOGONALIZE_EPS;
        for r in 0..rows {
            matrix[r * cols + i] /= scale;
        }
        for j in i + 1..cols {
            let dot = (0..rows)
                .map(|r| matrix[r * cols + i] as f64 * matrix[r * cols + j] as f64)
                .sum::<f64>() as f32;
            for r in 0..rows {
                matrix[r * cols + j] -= dot * matrix[r * cols + i];
            }
        }
    }
}

/// Thin singular value decomposition `A = U · diag(S) · Vᵀ`.
#[derive(Debug, Clone)]
pub struct Svd {
    /// `rows × k`, row-major.
    pub u: Vec<f32>,
    /// `k` singular values, descending.
    pub s: Vec<f32>,
    /// `cols × k`, row-major.
    pub v: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
    /// `min(rows, cols)`.
    pub k: usize,
}

impl Svd {
    /// Keep the leading `rank` triples.
    pub fn truncate(&self, rank: usize) -> Svd {
        let r = rank.min(self.k);
        Svd {
            u: take_columns(&self.u, self.rows, self.k, &(0..r).collect::<Vec<_>>()),
            s: self.s[..r].to_vec(),
            v: take_columns(&self.v, self.cols, self.k, &(0..r).collect::<Vec<_>>()),
            rows: self.rows,
            cols: self.cols,
            k: r,
        }
    }
}

/// Compute the thin SVD of `a (rows×cols)` with one-sided Jacobi rotations.
pub fn svd(a: &[f32], rows: usize, cols: usize) -> Svd {
    debug_assert_eq!(a.len(), rows * cols);
    if rows >= cols {
        let (u, s, v) = jacobi_svd(a, rows, cols);
        Svd {
            u,
            s,
            v,
            rows,
            cols,
            k: cols,
        }
    } else {
        let at = transpose(a, rows, cols);
        let (u_t, s, v_t) = jacobi_svd(&at, cols, rows);
        Svd {
            u: v_t,
            s,
            v: u_t,
            rows,
            cols,
            k: rows,
        }
    }
}

/// One-sided Jacobi on a tall matrix (`n >= m`). Returns `(U n×m, S, V m×m)`.
fn jacobi_svd(a: &[f32], n: usize, m: usize) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut w: Vec<f64> = a.iter().map(|&x| x as f64).collect();
    let mut v = vec![0.0f64; m * m];
    for i in 0..m {
        v[i * m + i] = 1.0;
    }

    for _ in 0..SVD_MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..m {
            for q in p + 1..m {
                let (mut alpha, mut beta, mut gamma) = (0.0f64, 0.0f64, 0.0f64);
                for i in 0..n {
                    let x = w[i * m + p];
                    let y = w[i * m + q];
                    alpha += x * x;
                    beta += y * y;
                    gamma += x * y;
                }
                if gamma.abs() <= 1e-15 * (alpha * beta).sqrt() || gamma == 0.0 {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (2.0 * gamma);
                let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
                let c = 1.0 / (1.0 + t * t).sqrt();
                let s = c * t;
                for i in 0..n {
                    let x = w[i * m + p];
                    let y = w[i * m + q];
                    w[i * m + p] = c * x - s * y;
                    w[i * m + q] = s * x + c * y;
                }
                for i in 0..m {
                    let x = v[i * m + p];
                    let y = v[i * m + q];
                    v[i * m + p] = c * x - s * y;
                    v[i * m + q] = s * x + c * y;
                }
            }
        }
        if !rotated {
            break;
        }
    }

    let norms: Vec<f64> = (0..m)
        .map(|j| (0..n).map(|i| w[i * m + j] * w[i * m + j]).sum::<f64>().sqrt())
        .collect();
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&x, &y| norms[y].total_cmp(&norms[x]));

    let mut u_out = vec![0.0f32; n * m];
    let mut s_out = vec![0.0f32; m];
    let mut v_out = vec![0.0f32; m * m];
    for (dst, &src) in order.iter().enumerate() {
        let sigma = norms[src];
        s_out[dst] = sigma as f32;
        if sigma > f64::EPSILON {
            for i in 0..n {
                u_out[i * m + dst] = (w[i * m + src] / sigma) as f32;
            }
        }
        for i in 0..m {
            v_out[i * m + dst] = v[i * m + src] as f32;
        }
    }
    (u_out, s_out, v_out)
}

/// `U (rows×k) · diag(s) · V (cols×k)ᵀ`.
pub fn reconstruct(u: &[f32], s: &[f32], v: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let k = s.len();
    debug_assert_eq!(u.len(), rows * k);
    debug_assert_eq!(v.len(), cols * k);
    let mut scaled = u.to_vec();
    for i in 0..rows {
        for (x, &sigma) in scaled[i * k..(i + 1) * k].iter_mut().zip(s) {
            *x *= sigma;
        }
    }
    let mut out = vec![0.0f32; rows * cols];
    matmul_nt(&scaled, v, &mut out, rows, k, cols);
    out
}

/// Gather columns `indices` of `matrix (rows×cols)` into a `rows × indices.len()` matrix.
pub fn take_columns(matrix: &[f32], rows: usize, cols: usize, indices: &[usize]) -> Vec<f32> {
    let k = indices.len();
    let mut out = vec![0.0f32; rows * k];
    for i in 0..rows {
        for (dst, &src) in indices.iter().enumerate() {
            out[i * k + dst] = matrix[i * cols + src];
        }
    }
    out
}

/// Transpose `a (rows×cols)` into `cols × rows`.
pub fn transpose(a: &[f32], rows: usize, cols: usize) -> Vec<f32> {
    let mut t = vec![0.0f32; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            t[j * rows + i] = a[i * cols + j];
        }
    }
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn random_matrix(rows: usize, cols: usize, seed: u64) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..rows * cols).map(|_| rng.sample(StandardNormal)).collect()
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter()
            .zip(b)
            .map(|(x, y)| (x - y).abs())
            .fold(0.0, f32::max)
    }

    #[test]
    fn test_matmul_small() {
        // [1 2; 3 4] · [5 6; 7 8] = [19 22; 43 50]
        let mut out = vec![0.0; 4];
        matmul(&[1.0, 2.0, 3.0, 4.0], &[5.0, 6.0, 7.0, 8.0], &mut out, 2, 2, 2);
        assert_eq!(out, vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_variants_agree() {
        let a = random_matrix(5, 3, 1);
        let b = random_matrix(3, 4, 2);
        let mut direct = vec![0.0; 20];
        matmul(&a, &b, &mut direct, 5, 3, 4);

        let at = transpose(&a, 5, 3);
        let mut via_tn = vec![0.0; 20];
        matmul_tn(&at, &b, &mut via_tn, 3, 5, 4);

        let bt = transpose(&b, 3, 4);
        let mut via_nt = vec![0.0; 20];
        matmul_nt(&a, &bt, &mut via_nt, 5, 3, 4);

        assert!(max_abs_diff(&direct, &via_tn) < 1e-5);
        assert!(max_abs_diff(&direct, &via_nt) < 1e-5);
    }

    #[test]
    fn test_orthogonalize_gives_orthonormal_columns() {
        let (rows, cols) = (20, 4);
        let mut p = random_matrix(rows, cols, 7);
        orthogonalize(&mut p, rows, cols);

        let mut gram = vec![0.0; cols * cols];
        matmul_tn(&p, &p, &mut gram, rows, cols, cols);
        for i in 0..cols {
            for j in 0..cols {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (gram[i * cols + j] - expected).abs() < 1e-4,
                    "gram[{i},{j}] = {}",
                    gram[i * cols + j]
                );
            }
        }
    }

    #[test]
    fn test_orthogonalize_zero_column_stays_finite() {
        let mut p = vec![0.0; 6];
        orthogonalize(&mut p, 3, 2);
        assert!(p.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_svd_reconstructs_tall_and_wide() {
        for (rows, cols) in [(6, 4), (3, 7), (5, 5)] {
            let a = random_matrix(rows, cols, (rows * 10 + cols) as u64);
            let d = svd(&a, rows, cols);
            assert_eq!(d.k, rows.min(cols));
            let back = reconstruct(&d.u, &d.s, &d.v, rows, cols);
            assert!(max_abs_diff(&a, &back) < 1e-4, "{rows}x{cols}");
            for w in d.s.windows(2) {
                assert!(w[0] >= w[1]);
            }
        }
    }

    #[test]
    fn test_svd_truncate_rank_one() {
        // Outer product of [1, 2, 3] and [1, -1] has a single singular value.
        let a = vec![1.0, -1.0, 2.0, -2.0, 3.0, -3.0];
        let d = svd(&a, 3, 2).truncate(1);
        assert_eq!(d.k, 1);
        let back = reconstruct(&d.u, &d.s, &d.v, 3, 2);
        assert!(max_abs_diff(&a, &back) < 1e-5);
        let expected_sigma = (14.0f32 * 2.0).sqrt();
        assert!((d.s[0] - expected_sigma).abs() < 1e-4);
    }

    #[test]
    fn test_take_columns() {
        let m = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(take_columns(&m, 2, 3, &[2, 0]), vec![3.0, 1.0, 6.0, 4.0]);
    }
}
