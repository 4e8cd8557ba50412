use serde::{Deserialize, Serialize};

/// A glide dislocation in the unit periodic cell.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Dislocation {
    pub x: f64,
    pub y: f64,
    /// Signed Burgers value, +1 or -1 in practice.
    pub b: f64,
}

impl Dislocation {
    pub fn new(x: f64, y: f64, b: f64) -> Self {
        Self { x, y, b }
    }
}

/// A static pinning site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointDefect {
    pub x: f64,
    pub y: f64,
}

impl PointDefect {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Reduces a coordinate difference into `[-0.5, 0.5)`.
pub fn normalize(mut d: f64) -> f64 {
    while d < -0.5 {
        d += 1.0;
    }
    while d >= 0.5 {
        d -= 1.0;
    }
    d
}

/// Periodic displacement `a - b` in both directions.
pub fn displacement(ax: f64, ay: f64, bx: f64, by: f64) -> (f64, f64) {
    (normalize(ax - bx), normalize(ay - by))
}

/// Plastic strain produced by moving from `old` to `new`.
pub fn strain_increment(old: &[Dislocation], new: &[Dislocation]) -> f64 {
    old.iter()
        .zip(new)
        .map(|(before, after)| before.b * (after.x - before.x))
        .sum()
}
