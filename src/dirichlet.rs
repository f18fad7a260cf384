//! Dirichlet sampling for the weighted splitting strategies.
//!
//! Gamma variates use the Marsaglia–Tsang method; the symmetric
//! Dirichlet(1, …, 1) draw is the normalized vector of Γ(1, 1) samples.

use rand::Rng;
use std::f64::consts::PI;

/// Smallest gamma-sample sum we normalize directly; below this the
/// scaled sampling path is taken to avoid a 0/0 result.
const SUM_UNDERFLOW: f64 = 1.4916681462400413e-154;

/// Draw θ ~ Dirichlet(1, …, 1) of dimension `k`.
///
/// Components are non-negative and sum to 1 (up to floating-point error).
pub(crate) fn sample<R>(rng: &mut R, k: usize) -> Vec<f64>
where
    R: Rng + ?Sized,
{
    debug_assert!(k > 0);

    let alpha = vec![1.0; k];
    let mut theta = alpha
        .iter()
        .map(|a| sample_gamma(rng, *a))
        .collect::<Vec<_>>();

    let norm = theta.iter().sum::<f64>();

    if norm < SUM_UNDERFLOW {
        return sample_small(rng, &alpha);
    }

    for t in &mut theta {
        *t /= norm;
    }

    theta
}

/// Underflow-safe fallback: scale the variates in log-space so the ratio
/// survives even when every Γ sample underflows to ~0.
fn sample_small<R>(rng: &mut R, alpha: &[f64]) -> Vec<f64>
where
    R: Rng + ?Sized,
{
    let mut theta = alpha
        .iter()
        .map(|a| uniform_pos(rng).ln() / a)
        .collect::<Vec<_>>();

    let umax = theta.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    for (t, a) in theta.iter_mut().zip(alpha) {
        *t = (*t - umax).exp() * sample_gamma(rng, a + 1.0);
    }

    let norm = theta.iter().sum::<f64>();
    for t in &mut theta {
        *t /= norm;
    }

    theta
}

/// Γ(a, 1) via Marsaglia–Tsang, with the boosting step for a < 1.
fn sample_gamma<R>(rng: &mut R, a: f64) -> f64
where
    R: Rng + ?Sized,
{
    debug_assert!(a > 0.0);

    if a < 1.0 {
        let u = uniform_pos(rng);
        return sample_gamma(rng, 1.0 + a) * u.powf(1.0 / a);
    }

    let d = a - 1.0 / 3.0;
    let c = (1.0 / 3.0) / d.sqrt();

    loop {
        let mut x;
        let mut v;

        loop {
            x = sample_standard_normal(rng);
            v = 1.0 + c * x;

            if v > 0.0 {
                break;
            }
        }

        v = v * v * v;
        let u = uniform_pos(rng);

        if u < 1.0 - 0.0331 * x * x * x * x {
            return d * v;
        }

        if u.ln() < 0.5 * x * x + d * (1.0 - v + v.ln()) {
            return d * v;
        }
    }
}

/// Standard normal via the Box–Muller transform.
fn sample_standard_normal<R>(rng: &mut R) -> f64
where
    R: Rng + ?Sized,
{
    let u1 = uniform_pos(rng);
    let u2 = rng.gen::<f64>();

    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// Uniform sample from the open interval (0, 1].
fn uniform_pos<R>(rng: &mut R) -> f64
where
    R: Rng + ?Sized,
{
    loop {
        let x = rng.gen::<f64>();

        if x > 0.0 {
            return x;
        }
    }
}
