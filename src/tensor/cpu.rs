//! Matrix kernels on the CPU.

/// Compute `c = alpha * op(a) * op(b) + beta * c` on row-major matrices.
///
/// `op(a)` is `m x k` and `op(b)` is `k x n`. When `trans_a` is set, `a` is stored as a `k x m`
/// matrix and transposed on the fly, likewise for `trans_b` with `b` stored as `n x k`.
#[allow(clippy::too_many_arguments)]
pub fn gemm(
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f64,
    a: &[f64],
    b: &[f64],
    beta: f64,
    c: &mut [f64],
) {
    assert_eq!(a.len(), m * k, "matrix A has {} entries, expected {}", a.len(), m * k);
    assert_eq!(b.len(), k * n, "matrix B has {} entries, expected {}", b.len(), k * n);
    assert_eq!(c.len(), m * n, "matrix C has {} entries, expected {}", c.len(), m * n);

    if beta == 0.0 {
        c.iter_mut().for_each(|x| *x = 0.0);
    } else if beta != 1.0 {
        c.iter_mut().for_each(|x| *x *= beta);
    }
    if m == 0 || n == 0 || k == 0 || alpha == 0.0 {
        return;
    }

    let a_at = |i: usize, p: usize| if trans_a { a[p * m + i] } else { a[i * k + p] };
    for i in 0..m {
        let row = &mut c[i * n..(i + 1) * n];
        for p in 0..k {
            let av = alpha * a_at(i, p);
            if av == 0.0 {
                continue;
            }
            if trans_b {
                for (j, out) in row.iter_mut().enumerate() {
                    *out += av * b[j * k + p];
                }
            } else {
                let b_row = &b[p * n..(p + 1) * n];
                for (out, bv) in row.iter_mut().zip(b_row) {
                    *out += av * bv;
                }
            }
        }
    }
}

/// Compute `log(exp(a) + exp(b))` without overflow.
pub fn add_logs(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + ((a - max).exp() + (b - max).exp()).ln()
}

/// Compute the derivatives of [`add_logs`] with respect to both arguments, scaled by `upstream`.
pub fn add_logs_deriv(a: f64, b: f64, upstream: f64) -> (f64, f64) {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        return (0.0, 0.0);
    }
    let (ea, eb) = ((a - max).exp(), (b - max).exp());
    let norm = upstream / (ea + eb);
    (ea * norm, eb * norm)
}

/// Compute `log(sum(exp(x)))` over a slice.
pub fn log_sum_exp(x: &[f64]) -> f64 {
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return max;
    }
    max + x.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive(trans_a: bool, trans_b: bool, m: usize, n: usize, k: usize, a: &[f64], b: &[f64]) -> Vec<f64> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                for p in 0..k {
                    let av = if trans_a { a[p * m + i] } else { a[i * k + p] };
                    let bv = if trans_b { b[j * k + p] } else { b[p * n + j] };
                    c[i * n + j] += av * bv;
                }
            }
        }
        c
    }

    #[test]
    fn gemm_all_transposes() {
        let (m, n, k) = (3, 4, 2);
        let a: Vec<f64> = (0..m * k).map(|x| x as f64 - 2.5).collect();
        let b: Vec<f64> = (0..k * n).map(|x| (x as f64) * 0.5).collect();
        for trans_a in [false, true] {
            for trans_b in [false, true] {
                let mut c = vec![0.0; m * n];
                gemm(trans_a, trans_b, m, n, k, 1.0, &a, &b, 0.0, &mut c);
                assert_eq!(c, naive(trans_a, trans_b, m, n, k, &a, &b));
            }
        }
    }

    #[test]
    fn gemm_accumulates_with_beta() {
        let a = [1.0, 2.0];
        let b = [3.0, 4.0];
        let mut c = [1.0];
        gemm(false, false, 1, 1, 2, 2.0, &a, &b, 3.0, &mut c);
        assert_eq!(c, [3.0 + 2.0 * 11.0]);
    }

    #[test]
    fn log_helpers() {
        assert!((add_logs(0.0, 0.0) - 2f64.ln()).abs() < 1e-12);
        assert_eq!(add_logs(f64::NEG_INFINITY, f64::NEG_INFINITY), f64::NEG_INFINITY);
        let (da, db) = add_logs_deriv(1.0, 1.0, 2.0);
        assert!((da - 1.0).abs() < 1e-12 && (db - 1.0).abs() < 1e-12);
        assert!((log_sum_exp(&[1.0, 2.0, 3.0]) - 3.4076059644443806).abs() < 1e-12);
    }
}
