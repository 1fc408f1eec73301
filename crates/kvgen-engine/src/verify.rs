//! Tolerance checks for equivalence testing.
//!
//! Prefill strategies, cache-ownership modes and session compositions are
//! expected to agree numerically; these helpers turn a disagreement into a
//! typed error that names where it happened.

use std::collections::BTreeMap;

use kvgen_kv::KvTensor;

/// Two results that should match differ by more than the allowed tolerance.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{context}: max abs diff {max_diff} exceeds tolerance {tolerance}")]
pub struct NumericToleranceExceeded {
    pub max_diff: f32,
    pub tolerance: f32,
    pub context: String,
}

/// Largest element-wise difference between two row sets, or `None` when
/// their shapes differ.
pub fn max_abs_diff(a: &[Vec<f32>], b: &[Vec<f32>]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let mut max = 0.0f32;
    for (ra, rb) in a.iter().zip(b) {
        if ra.len() != rb.len() {
            return None;
        }
        for (x, y) in ra.iter().zip(rb) {
            let d = (x - y).abs();
            if d.is_nan() {
                return Some(f32::INFINITY);
            }
            max = max.max(d);
        }
    }
    Some(max)
}

/// Fail unless every element of `a` is within `tolerance` of `b`.
///
/// A shape mismatch counts as an infinite difference.
pub fn ensure_within(
    a: &[Vec<f32>],
    b: &[Vec<f32>],
    tolerance: f32,
    context: impl Into<String>,
) -> Result<(), NumericToleranceExceeded> {
    check(max_abs_diff(a, b), tolerance, context)
}

/// Compare two cache snapshots tensor by tensor.
pub fn ensure_snapshots_within(
    a: &BTreeMap<String, KvTensor>,
    b: &BTreeMap<String, KvTensor>,
    tolerance: f32,
    context: impl Into<String>,
) -> Result<(), NumericToleranceExceeded> {
    let context = context.into();
    if a.len() != b.len() {
        return check(None, tolerance, context);
    }
    for (name, ta) in a {
        let diff = b.get(name).and_then(|tb| ta.max_abs_diff(tb));
        check(diff, tolerance, format!("{context} ({name})"))?;
    }
    Ok(())
}

fn check(
    diff: Option<f32>,
    tolerance: f32,
    context: impl Into<String>,
) -> Result<(), NumericToleranceExceeded> {
    let max_diff = diff.unwrap_or(f32::INFINITY);
    if max_diff <= tolerance {
        Ok(())
    } else {
        Err(NumericToleranceExceeded {
            max_diff,
            tolerance,
            context: context.into(),
        })
    }
}
