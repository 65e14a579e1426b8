//! Matrix kernels for the attention hot paths.
//!
//! Products above [`GEMM_THRESHOLD`] on the inner dimension go through
//! ndarray's `general_mat_mul` (BLAS-backed when the `blas` feature is on);
//! smaller products use plain loops, which beat the dispatch overhead at
//! these sizes. The scalar path is always available.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use tracing::debug;

/// Inner-dimension threshold above which GEMM dispatch pays off.
pub const GEMM_THRESHOLD: usize = 64;

static BACKEND_LOGGED: Lazy<()> = Lazy::new(|| {
    if cfg!(feature = "blas") {
        debug!("matrix kernels: BLAS-backed ndarray");
    } else {
        debug!("matrix kernels: pure-Rust fallback");
    }
});

/// `A · B` with automatic kernel selection.
pub fn matmul(a: ArrayView2<'_, f32>, b: ArrayView2<'_, f32>) -> Array2<f32> {
    Lazy::force(&BACKEND_LOGGED);
    debug_assert_eq!(a.ncols(), b.nrows(), "matmul inner dimension mismatch");

    if a.ncols() >= GEMM_THRESHOLD {
        let mut out = Array2::zeros((a.nrows(), b.ncols()));
        ndarray::linalg::general_mat_mul(1.0, &a, &b, 0.0, &mut out);
        return out;
    }

    let mut out = Array2::zeros((a.nrows(), b.ncols()));
    for i in 0..a.nrows() {
        for k in 0..a.ncols() {
            let aik = a[[i, k]];
            if aik == 0.0 {
                continue;
            }
            for j in 0..b.ncols() {
                out[[i, j]] += aik * b[[k, j]];
            }
        }
    }
    out
}

/// `M · v` with automatic kernel selection.
pub fn matvec(m: ArrayView2<'_, f32>, v: ArrayView1<'_, f32>) -> Array1<f32> {
    Lazy::force(&BACKEND_LOGGED);
    debug_assert_eq!(m.ncols(), v.len(), "matvec inner dimension mismatch");

    if m.ncols() >= GEMM_THRESHOLD {
        return m.dot(&v);
    }

    let mut out = Array1::zeros(m.nrows());
    for i in 0..m.nrows() {
        let mut acc = 0.0;
        for j in 0..m.ncols() {
            acc += m[[i, j]] * v[j];
        }
        out[i] = acc;
    }
    out
}

/// Rank-one update target: `a ⊗ b`.
pub fn outer(a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> Array2<f32> {
    let mut out = Array2::zeros((a.len(), b.len()));
    for i in 0..a.len() {
        let ai = a[i];
        if ai == 0.0 {
            continue;
        }
        for j in 0..b.len() {
            out[[i, j]] = ai * b[j];
        }
    }
    out
}

/// Xavier/Glorot uniform initialization for a `rows × cols` matrix.
pub fn xavier_uniform(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f32> {
    let bound = (6.0 / (rows + cols) as f32).sqrt();
    let dist = Uniform::new_inclusive(-bound, bound);
    Array2::from_shape_fn((rows, cols), |_| dist.sample(rng))
}

/// Small uniform initialization for attention vectors.
pub fn small_uniform(len: usize, rng: &mut StdRng) -> Array1<f32> {
    let dist = Uniform::new_inclusive(-0.1, 0.1);
    Array1::from_shape_fn(len, |_| dist.sample(rng))
}

/// Deterministic generator for parameter initialization.
pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

/// In-place Fisher–Yates shuffle.
pub fn fisher_yates<T>(items: &mut [T], rng: &mut impl Rng) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Numerically stable softmax over a slice.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Softmax backward: `dS = s ⊙ (dA − Σ s·dA)`.
pub fn softmax_backward(s: &[f32], da: &[f32]) -> Vec<f32> {
    debug_assert_eq!(s.len(), da.len());
    let dot: f32 = s.iter().zip(da.iter()).map(|(si, dai)| si * dai).sum();
    s.iter()
        .zip(da.iter())
        .map(|(si, dai)| si * (dai - dot))
        .collect()
}

/// ELU (α = 1).
pub fn elu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        x.exp() - 1.0
    }
}

/// Derivative of ELU (α = 1) at the pre-activation.
pub fn elu_prime(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        x.exp()
    }
}

/// LeakyReLU with the GAT slope of 0.2.
pub fn leaky_relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        0.2 * x
    }
}

/// Derivative of LeakyReLU at the pre-activation.
pub fn leaky_relu_prime(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.2
    }
}

/// Logistic sigmoid.
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Inverse sigmoid.
pub fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}
