//! Pairwise relationship ("aspect") detection within one series.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    derived::{normalize_angle, separation},
    error::{InvalidDefinitionSnafu, StoreResult},
    hot_store::{HotStore, PairRow},
};

/// Slack applied to orb comparisons so exact boundaries survive rounding.
const ORB_EPSILON: f64 = 1e-9;

/// A named target separation and the tolerance around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    /// Name reported on matches.
    pub name: String,
    /// Target separation.
    pub exact_angle: f64,
    /// Largest accepted `|separation - exact_angle|`.
    pub max_orb: f64,
}

impl RelationshipDefinition {
    /// Build a definition.
    pub fn new(name: impl Into<String>, exact_angle: f64, max_orb: f64) -> Self {
        Self {
            name: name.into(),
            exact_angle,
            max_orb,
        }
    }

    /// Reject names and angles that can never match.
    pub fn validate(&self, circle: f64) -> StoreResult<()> {
        ensure!(
            !self.name.trim().is_empty(),
            InvalidDefinitionSnafu {
                name: self.name.clone(),
                message: "name must not be empty",
            }
        );
        ensure!(
            self.exact_angle.is_finite() && (0.0..=circle / 2.0).contains(&self.exact_angle),
            InvalidDefinitionSnafu {
                name: self.name.clone(),
                message: format!(
                    "exact_angle must lie in [0, {}], got {}",
                    circle / 2.0,
                    self.exact_angle
                ),
            }
        );
        ensure!(
            self.max_orb.is_finite() && self.max_orb >= 0.0,
            InvalidDefinitionSnafu {
                name: self.name.clone(),
                message: format!("max_orb must be non-negative, got {}", self.max_orb),
            }
        );
        Ok(())
    }
}

/// The five classical definitions used when a caller supplies none.
pub fn default_definitions() -> Vec<RelationshipDefinition> {
    vec![
        RelationshipDefinition::new("conjunction", 0.0, 8.0),
        RelationshipDefinition::new("sextile", 60.0, 6.0),
        RelationshipDefinition::new("square", 90.0, 8.0),
        RelationshipDefinition::new("trine", 120.0, 8.0),
        RelationshipDefinition::new("opposition", 180.0, 8.0),
    ]
}

/// One definition matched by one object pair at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Instant of the pair.
    pub timestamp: DateTime<Utc>,
    /// Lexicographically smaller object id.
    pub from: String,
    /// Lexicographically larger object id.
    pub to: String,
    /// Name of the matched definition.
    pub definition_name: String,
    /// Separation in `[0, circle / 2]`.
    pub measured_angle: f64,
    /// `|measured_angle - exact_angle|`.
    pub orb: f64,
    /// Target separation of the definition.
    pub exact_angle: f64,
    /// Orb shrinking; `None` when either speed is unknown.
    pub applying: Option<bool>,
    /// Orb growing; `None` when either speed is unknown.
    pub separating: Option<bool>,
}

/// Matches plus the number of pairs that could not be evaluated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelationshipReport {
    /// Ordered by `(timestamp, from, to, definition_name)`.
    pub relationships: Vec<Relationship>,
    /// Pairs skipped because a stored value was missing or not finite.
    pub skipped_pairs: u64,
}

/// Rate of change of the separation, given both signed speeds.
fn separation_rate(from_value: f64, to_value: f64, from_speed: f64, to_speed: f64, circle: f64) -> f64 {
    let d = normalize_angle(to_value - from_value, circle);
    let relative = to_speed - from_speed;
    let half = circle / 2.0;
    if d == 0.0 || d == half {
        // At either extreme the separation can only move inward.
        if d == 0.0 { relative.abs() } else { -relative.abs() }
    } else if d < half {
        relative
    } else {
        -relative
    }
}

fn motion(pair: &PairRow, from_value: f64, to_value: f64, measured: f64, exact: f64, circle: f64) -> (Option<bool>, Option<bool>) {
    let (Some(vf), Some(vt)) = (pair.from_speed, pair.to_speed) else {
        return (None, None);
    };
    if !(vf.is_finite() && vt.is_finite()) {
        return (None, None);
    }
    let rate = separation_rate(from_value, to_value, vf, vt, circle);
    let orb_rate = if measured > exact {
        rate
    } else if measured < exact {
        -rate
    } else {
        rate.abs()
    };
    (Some(orb_rate < 0.0), Some(orb_rate > 0.0))
}

/// Evaluate `definitions` for every unordered object pair of `series_id`.
///
/// With `at` set only that instant is considered. An empty `definitions`
/// slice means [`default_definitions`].
pub fn compute_relationships(
    hot: &HotStore,
    series_id: &str,
    at: Option<DateTime<Utc>>,
    definitions: &[RelationshipDefinition],
    circle: f64,
) -> StoreResult<RelationshipReport> {
    let defaults;
    let definitions = if definitions.is_empty() {
        defaults = default_definitions();
        defaults.as_slice()
    } else {
        definitions
    };
    for def in definitions {
        def.validate(circle)?;
    }

    let mut sorted: Vec<&RelationshipDefinition> = definitions.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut report = RelationshipReport::default();
    for pair in hot.pair_rows(series_id, at)? {
        let (Some(from_value), Some(to_value)) = (pair.from_value, pair.to_value) else {
            report.skipped_pairs += 1;
            continue;
        };
        if !(from_value.is_finite() && to_value.is_finite()) {
            report.skipped_pairs += 1;
            continue;
        }

        let measured = separation(from_value, to_value, circle);
        for def in &sorted {
            let orb = (measured - def.exact_angle).abs();
            if orb > def.max_orb + ORB_EPSILON {
                continue;
            }
            let (applying, separating) = motion(&pair, from_value, to_value, measured, def.exact_angle, circle);
            report.relationships.push(Relationship {
                timestamp: pair.timestamp,
                from: pair.from_object.clone(),
                to: pair.to_object.clone(),
                definition_name: def.name.clone(),
                measured_angle: measured,
                orb,
                exact_angle: def.exact_angle,
                applying,
                separating,
            });
        }
    }

    debug!(
        "relationships for {series_id:?}: {} matches, {} pairs skipped",
        report.relationships.len(),
        report.skipped_pairs
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sample::SecondaryValues;
    use crate::test_util::*;
    use tempfile::TempDir;

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    fn with_speed(series: &str, object: &str, value: f64, speed: f64) -> crate::sample::Sample {
        sample_at(series, minute(0), object, value).with_secondary(SecondaryValues {
            speed: Some(speed),
            ..SecondaryValues::default()
        })
    }

    #[test]
    fn overlapping_orbs_all_match() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        hot.upsert_batch(&[sample_at("s1", minute(0), "a", 0.0), sample_at("s1", minute(0), "b", 75.0)])?;

        let defs = [
            RelationshipDefinition::new("sextile", 60.0, 16.0),
            RelationshipDefinition::new("square", 90.0, 16.0),
        ];
        let report = compute_relationships(&hot, "s1", None, &defs, 360.0)?;

        let names: Vec<_> = report.relationships.iter().map(|r| r.definition_name.as_str()).collect();
        assert_eq!(names, vec!["sextile", "square"]);
        assert!(report.relationships.iter().all(|r| r.applying.is_none() && r.separating.is_none()));
        Ok(())
    }

    #[test]
    fn applying_and_separating_follow_speeds() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        // Separation 115, closing toward the 120 trine.
        hot.upsert_batch(&[with_speed("s1", "a", 0.0, 0.0), with_speed("s1", "b", 115.0, 1.0)])?;
        let defs = [RelationshipDefinition::new("trine", 120.0, 8.0)];

        let report = compute_relationships(&hot, "s1", Some(minute(0)), &defs, 360.0)?;
        assert_eq!(report.relationships.len(), 1);
        assert_eq!(report.relationships[0].applying, Some(true));
        assert_eq!(report.relationships[0].separating, Some(false));

        hot.upsert(&with_speed("s1", "b", 115.0, -1.0))?;
        let report = compute_relationships(&hot, "s1", Some(minute(0)), &defs, 360.0)?;
        assert_eq!(report.relationships[0].applying, Some(false));
        assert_eq!(report.relationships[0].separating, Some(true));
        Ok(())
    }

    #[test]
    fn wrapped_separation_reverses_rate() {
        // b sits 250 ahead of a, i.e. 110 behind it: b moving forward closes the gap.
        let rate = separation_rate(0.0, 250.0, 0.0, 1.0, 360.0);
        assert_eq!(rate, -1.0);
        assert_eq!(separation_rate(0.0, 180.0, 0.0, 1.0, 360.0), -1.0);
        assert_eq!(separation_rate(10.0, 10.0, 0.0, -2.0, 360.0), 2.0);
    }

    #[test]
    fn default_definitions_apply_when_none_given() -> TestResult {
        let tmp = TempDir::new()?;
        let mut hot = open_store(&tmp)?;
        hot.upsert_batch(&[sample_at("s1", minute(0), "a", 10.0), sample_at("s1", minute(0), "b", 188.0)])?;

        let report = compute_relationships(&hot, "s1", None, &[], 360.0)?;
        assert_eq!(report.relationships.len(), 1);
        assert_eq!(report.relationships[0].definition_name, "opposition");
        assert!((report.relationships[0].orb - 2.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn invalid_definition_is_rejected() -> TestResult {
        let tmp = TempDir::new()?;
        let hot = open_store(&tmp)?;
        let defs = [RelationshipDefinition::new("odd", 200.0, 1.0)];

        let err = compute_relationships(&hot, "s1", None, &defs, 360.0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        Ok(())
    }
}
