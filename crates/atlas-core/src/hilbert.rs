//! Hilbert-curve linear keys
//!
//! Maps a projected coordinate to a `u64` position along an n-dimensional
//! Hilbert curve (Skilling's transpose algorithm). Points that are close on
//! the curve are close in space, so sorting by key clusters neighbours into
//! the same leaves and keeps sequential scans local.
//!
//! Each axis is quantized to `64 / axes` bits inside a fixed frame. Values
//! outside the frame are clamped to its faces.

use crate::geometry::{Aabb, Coord, MAX_AXES};

/// Bits of precision per axis for a given axis count.
#[inline]
pub fn bits_per_axis(axes: usize) -> u32 {
    match axes {
        0 | 1 => 32,
        n => (64 / n as u32).min(31),
    }
}

/// Linear key of `point` within `frame`.
pub fn hilbert_key(point: &Coord, frame: &Aabb) -> u64 {
    let axes = point.axes();
    let bits = bits_per_axis(axes);
    let cells = (1u64 << bits) - 1;

    let mut grid = [0u32; MAX_AXES];
    for axis in 0..axes {
        let extent = frame.extent(axis);
        let t = if extent > 0.0 {
            ((point.get(axis) - frame.min[axis]) / extent).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let t = if t.is_finite() { t } else { 0.0 };
        grid[axis] = (t as f64 * cells as f64).round() as u32;
    }
    hilbert_index(&mut grid[..axes], bits)
}

/// Hilbert index of an integer grid cell. `cell` is consumed as scratch space.
pub fn hilbert_index(cell: &mut [u32], bits: u32) -> u64 {
    axes_to_transpose(cell, bits);
    let mut key = 0u64;
    for bit in (0..bits).rev() {
        for x in cell.iter() {
            key = (key << 1) | ((*x >> bit) & 1) as u64;
        }
    }
    key
}

fn axes_to_transpose(x: &mut [u32], bits: u32) {
    let n = x.len();
    if n == 0 || bits == 0 {
        return;
    }
    let m = 1u32 << (bits - 1);

    // Inverse undo
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }

    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u32;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }
}
