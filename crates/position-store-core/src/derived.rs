//! Derived computations over stored samples.
//!
//! Nothing here calls back into the external computation: relationships and
//! relative values are produced from set-oriented joins in the hot store
//! (see [`crate::hot_store`]) plus the angle arithmetic in this module.
//!
//! Angles live on a circle of configurable size (360 by default). Pairs whose
//! stored values are unusable are skipped and counted rather than reported
//! as errors.

pub mod relationships;
pub mod relative;

pub use relationships::{
    Relationship, RelationshipDefinition, RelationshipReport, compute_relationships,
    default_definitions,
};
pub use relative::{
    RelativeOptions, RelativeReport, RelativeSample, query_relative, query_relative_linked,
};

/// `value` reduced into `[0, circle)`.
pub fn normalize_angle(value: f64, circle: f64) -> f64 {
    let r = value.rem_euclid(circle);
    // rem_euclid may round up to `circle` for tiny negative inputs.
    if r >= circle { 0.0 } else { r }
}

/// Shortest angular distance between `a` and `b`, in `[0, circle / 2]`.
pub fn separation(a: f64, b: f64, circle: f64) -> f64 {
    let d = normalize_angle(b - a, circle);
    d.min(circle - d)
}

/// `to - from` wrapped into `(-circle / 2, circle / 2]`.
pub fn signed_delta(from: f64, to: f64, circle: f64) -> f64 {
    let d = normalize_angle(to - from, circle);
    if d > circle / 2.0 { d - circle } else { d }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separation_wraps_around_zero() {
        assert_eq!(separation(350.0, 10.0, 360.0), 20.0);
        assert_eq!(separation(10.0, 350.0, 360.0), 20.0);
        assert_eq!(separation(0.0, 180.0, 360.0), 180.0);
        assert_eq!(separation(0.0, 120.0, 360.0), 120.0);
    }

    #[test]
    fn signed_delta_is_half_open() {
        assert_eq!(signed_delta(170.0, 200.0, 360.0), 30.0);
        assert_eq!(signed_delta(200.0, 170.0, 360.0), -30.0);
        assert_eq!(signed_delta(0.0, 180.0, 360.0), 180.0);
        assert_eq!(signed_delta(180.0, 0.0, 360.0), 180.0);
    }

    #[test]
    fn normalize_never_returns_the_circle() {
        assert_eq!(normalize_angle(-1e-20, 360.0), 0.0);
        assert_eq!(normalize_angle(725.0, 360.0), 5.0);
    }
}
