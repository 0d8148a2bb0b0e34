//! Server-side vector kernels.
//!
//! Every kernel splits its work into fixed-size chunks on the rayon
//! pool; op batches already execute under the server lock, so the
//! kernels themselves are free of synchronization.

use rayon::prelude::*;

const CHUNK: usize = 4096;

pub fn reset(dst: &mut [f32], value: f32) {
    dst.par_chunks_mut(CHUNK)
        .for_each(|chunk| chunk.fill(value));
}

pub fn copy(dst: &mut [f32], src: &[f32]) {
    dst.par_chunks_mut(CHUNK)
        .zip(src.par_chunks(CHUNK))
        .for_each(|(d, s)| d.copy_from_slice(s));
}

/// dst *= k
pub fn scale(dst: &mut [f32], k: f32) {
    dst.par_chunks_mut(CHUNK)
        .for_each(|chunk| chunk.iter_mut().for_each(|d| *d *= k));
}

/// dst = k * src
pub fn scale_into(dst: &mut [f32], src: &[f32], k: f32) {
    dst.par_chunks_mut(CHUNK)
        .zip(src.par_chunks(CHUNK))
        .for_each(|(d, s)| d.iter_mut().zip(s).for_each(|(d, s)| *d = k * s));
}

/// dst += k * src
pub fn add_mult(dst: &mut [f32], src: &[f32], k: f32) {
    dst.par_chunks_mut(CHUNK)
        .zip(src.par_chunks(CHUNK))
        .for_each(|(d, s)| d.iter_mut().zip(s).for_each(|(d, s)| *d += k * s));
}

/// dst = a + k * b
pub fn add_mult_into(dst: &mut [f32], a: &[f32], b: &[f32], k: f32) {
    dst.par_chunks_mut(CHUNK)
        .zip(a.par_chunks(CHUNK).zip(b.par_chunks(CHUNK)))
        .for_each(|(d, (a, b))| {
            d.iter_mut()
                .zip(a.iter().zip(b))
                .for_each(|(d, (a, b))| *d = a + k * b)
        });
}

pub fn dot(a: &[f32], b: &[f32]) -> f64 {
    a.par_chunks(CHUNK)
        .zip(b.par_chunks(CHUNK))
        .map(|(a, b)| {
            a.iter()
                .zip(b)
                .map(|(x, y)| (*x as f64) * (*y as f64))
                .sum::<f64>()
        })
        .sum()
}

/// Regularized objective: base + l1 * |x|_1 + 0.5 * l2 * |x|^2.
///
/// The l2 term is folded into the gradient here so the OWLQN
/// pseudo-gradient only has to account for the l1 term.
pub fn cost(x: &[f32], grad: &mut [f32], l1: f32, l2: f32, base: f64) -> f64 {
    if l2 != 0.0 {
        add_mult(grad, x, l2);
    }
    let reg: f64 = x
        .par_chunks(CHUNK)
        .map(|chunk| {
            chunk
                .iter()
                .map(|&v| {
                    let v = v as f64;
                    l1 as f64 * v.abs() + 0.5 * l2 as f64 * v * v
                })
                .sum::<f64>()
        })
        .sum();
    base + reg
}

/// Steepest descent direction of the l1-regularized objective
/// (negated soft-thresholded pseudo-gradient).
pub fn make_steepest_desc_dir(dir: &mut [f32], grad: &[f32], x: &[f32], l1: f32) {
    dir.par_chunks_mut(CHUNK)
        .zip(grad.par_chunks(CHUNK).zip(x.par_chunks(CHUNK)))
        .for_each(|(d, (g, x))| {
            for ((d, &g), &x) in d.iter_mut().zip(g).zip(x) {
                *d = if x > 0.0 {
                    -(g + l1)
                } else if x < 0.0 {
                    -(g - l1)
                } else if g + l1 < 0.0 {
                    -(g + l1)
                } else if g - l1 > 0.0 {
                    -(g - l1)
                } else {
                    0.0
                };
            }
        });
}

/// Zeroes every component of `dir` that disagrees in sign with the
/// steepest descent direction (OWLQN orthant projection).
pub fn fix_dir_signs(dir: &mut [f32], steepest: &[f32]) {
    dir.par_chunks_mut(CHUNK)
        .zip(steepest.par_chunks(CHUNK))
        .for_each(|(d, s)| {
            d.iter_mut().zip(s).for_each(|(d, s)| {
                if *d * s <= 0.0 {
                    *d = 0.0;
                }
            })
        });
}

/// Zeroes every component of `newx` that crossed the orthant of `x`.
pub fn fix_omega_signs(newx: &mut [f32], x: &[f32]) {
    newx.par_chunks_mut(CHUNK)
        .zip(x.par_chunks(CHUNK))
        .for_each(|(n, x)| {
            n.iter_mut().zip(x).for_each(|(n, x)| {
                if *x != 0.0 && *n * x < 0.0 {
                    *n = 0.0;
                }
            })
        });
}

/// Directional derivative of the l1-regularized objective along `dir`.
pub fn dir_deriv(dir: &[f32], grad: &[f32], x: &[f32], l1: f32) -> f64 {
    dir.par_chunks(CHUNK)
        .zip(grad.par_chunks(CHUNK).zip(x.par_chunks(CHUNK)))
        .map(|(d, (g, x))| {
            let mut acc = 0.0f64;
            for ((&d, &g), &x) in d.iter().zip(g).zip(x) {
                if d == 0.0 {
                    continue;
                }
                acc += if x > 0.0 {
                    d as f64 * (g + l1) as f64
                } else if x < 0.0 {
                    d as f64 * (g - l1) as f64
                } else if d > 0.0 {
                    d as f64 * (g + l1) as f64
                } else {
                    d as f64 * (g - l1) as f64
                };
            }
            acc
        })
        .sum()
}

/// value -= lr * (grad + grad_sum); grad is cleared by the caller's
/// round-consumption rule.
pub fn sgd(value: &mut [f32], grad: &[f32], grad_sum: &[f32], lr: f32) {
    value
        .par_chunks_mut(CHUNK)
        .zip(grad.par_chunks(CHUNK).zip(grad_sum.par_chunks(CHUNK)))
        .for_each(|(v, (g, s))| {
            v.iter_mut()
                .zip(g.iter().zip(s))
                .for_each(|(v, (g, s))| *v -= lr * (g + s))
        });
}
