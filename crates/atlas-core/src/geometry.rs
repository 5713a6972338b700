//! Low-dimensional geometry for projected coordinates

use serde::{Deserialize, Serialize};

/// Maximum number of projected axes.
pub const MAX_AXES: usize = 4;

/// Minimum number of projected axes.
pub const MIN_AXES: usize = 2;

/// A projected coordinate with 2–4 axes, stored inline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    axes: u8,
    values: [f32; MAX_AXES],
}

impl Coord {
    /// Builds a coordinate from a slice of 2–4 values.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        if values.len() < MIN_AXES || values.len() > MAX_AXES {
            return None;
        }
        let mut out = [0.0f32; MAX_AXES];
        out[..values.len()].copy_from_slice(values);
        Some(Self {
            axes: values.len() as u8,
            values: out,
        })
    }

    pub(crate) fn from_array(axes: usize, values: [f32; MAX_AXES]) -> Self {
        Self {
            axes: axes as u8,
            values,
        }
    }

    #[inline]
    pub fn axes(&self) -> usize {
        self.axes as usize
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.values[..self.axes as usize]
    }

    #[inline]
    pub fn get(&self, axis: usize) -> f32 {
        self.values[axis]
    }

    pub fn is_finite(&self) -> bool {
        self.as_slice().iter().all(|v| v.is_finite())
    }

    /// Squared Euclidean distance to another coordinate with the same axis count.
    #[inline]
    pub fn distance_squared(&self, other: &Coord) -> f32 {
        self.as_slice()
            .iter()
            .zip(other.as_slice())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    #[inline]
    pub fn distance(&self, other: &Coord) -> f32 {
        self.distance_squared(other).sqrt()
    }
}

/// Axis-aligned bounding box over coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aabb {
    axes: u8,
    pub min: [f32; MAX_AXES],
    pub max: [f32; MAX_AXES],
}

impl Aabb {
    /// An empty box that absorbs the first point it is extended with.
    pub fn empty(axes: usize) -> Self {
        Self {
            axes: axes as u8,
            min: [f32::INFINITY; MAX_AXES],
            max: [f32::NEG_INFINITY; MAX_AXES],
        }
    }

    pub fn from_point(point: &Coord) -> Self {
        let mut out = Self::empty(point.axes());
        out.extend(point);
        out
    }

    pub fn from_bounds(min: &[f32], max: &[f32]) -> Option<Self> {
        if min.len() != max.len() || min.len() < MIN_AXES || min.len() > MAX_AXES {
            return None;
        }
        let mut out = Self::empty(min.len());
        out.min[..min.len()].copy_from_slice(min);
        out.max[..max.len()].copy_from_slice(max);
        Some(out)
    }

    /// Cube of side `2 * radius` centered on `center`.
    pub fn around(center: &Coord, radius: f32) -> Self {
        let mut out = Self::empty(center.axes());
        for axis in 0..center.axes() {
            out.min[axis] = center.get(axis) - radius;
            out.max[axis] = center.get(axis) + radius;
        }
        out
    }

    #[inline]
    pub fn axes(&self) -> usize {
        self.axes as usize
    }

    pub fn is_empty(&self) -> bool {
        (0..self.axes()).any(|a| self.min[a] > self.max[a])
    }

    pub fn extend(&mut self, point: &Coord) {
        for axis in 0..self.axes() {
            let v = point.get(axis);
            self.min[axis] = self.min[axis].min(v);
            self.max[axis] = self.max[axis].max(v);
        }
    }

    pub fn union(&mut self, other: &Aabb) {
        for axis in 0..self.axes() {
            self.min[axis] = self.min[axis].min(other.min[axis]);
            self.max[axis] = self.max[axis].max(other.max[axis]);
        }
    }

    /// Grows every side by `fraction` of its extent (at least `floor`).
    pub fn expanded(&self, fraction: f32, floor: f32) -> Self {
        let mut out = *self;
        for axis in 0..self.axes() {
            let pad = ((self.max[axis] - self.min[axis]) * fraction).max(floor);
            out.min[axis] -= pad;
            out.max[axis] += pad;
        }
        out
    }

    #[inline]
    pub fn contains_point(&self, point: &Coord) -> bool {
        (0..self.axes()).all(|a| {
            let v = point.get(a);
            v >= self.min[a] && v <= self.max[a]
        })
    }

    #[inline]
    pub fn contains_box(&self, other: &Aabb) -> bool {
        (0..self.axes()).all(|a| other.min[a] >= self.min[a] && other.max[a] <= self.max[a])
    }

    #[inline]
    pub fn intersects(&self, other: &Aabb) -> bool {
        (0..self.axes()).all(|a| self.min[a] <= other.max[a] && self.max[a] >= other.min[a])
    }

    /// Squared distance from `point` to the nearest point of the box (0 inside).
    #[inline]
    pub fn min_distance_squared(&self, point: &Coord) -> f32 {
        let mut sum = 0.0f32;
        for axis in 0..self.axes() {
            let v = point.get(axis);
            let d = if v < self.min[axis] {
                self.min[axis] - v
            } else if v > self.max[axis] {
                v - self.max[axis]
            } else {
                0.0
            };
            sum += d * d;
        }
        sum
    }

    /// Squared distance from `point` to the farthest corner of the box.
    pub fn max_distance_squared(&self, point: &Coord) -> f32 {
        let mut sum = 0.0f32;
        for axis in 0..self.axes() {
            let v = point.get(axis);
            let d = (v - self.min[axis]).abs().max((self.max[axis] - v).abs());
            sum += d * d;
        }
        sum
    }

    pub fn diagonal(&self) -> f32 {
        (0..self.axes())
            .map(|a| {
                let d = self.max[a] - self.min[a];
                d * d
            })
            .sum::<f32>()
            .sqrt()
    }

    pub fn extent(&self, axis: usize) -> f32 {
        self.max[axis] - self.min[axis]
    }
}
