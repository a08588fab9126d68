//! Rotary position embedding tables
//!
//! Rotation angles depend only on position and pair index, so the
//! `(cos, sin)` factors are precomputed once per model. The table is indexed
//! `pos * (head_size / 2) + pair`; rotation itself happens inside attention
//! over half-dimension pairs `(i, i + head_size / 2)`.

/// Precomputed `(cos, sin)` factors for every `(position, pair)` slot.
///
/// `dim` is the per-head width (pairs span `dim / 2`), `end` the maximum
/// position, `theta` the frequency base, `scaling` a linear position-
/// interpolation divisor (1.0 for none).
#[must_use]
pub fn precompute_freqs_cis(dim: usize, end: usize, theta: f64, scaling: f64) -> Vec<(f32, f32)> {
    let half = dim / 2;
    let mut freqs = vec![0.0f64; half];
    let mut step = 0.0f64;
    for f in &mut freqs {
        *f = (1.0 / theta.powf(step / dim as f64)) / scaling;
        step += 2.0;
    }

    let mut table = Vec::with_capacity(end * half);
    for pos in 0..end {
        for &f in &freqs {
            let angle = pos as f64 * f;
            table.push((angle.cos() as f32, angle.sin() as f32));
        }
    }
    table
}
