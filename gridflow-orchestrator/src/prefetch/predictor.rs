//! Stride predictor over range reads.
//!
//! Looks at the recent range reads of a resource that share the latest read's
//! sheet, shape and arguments. If the step between consecutive reads
//! ("rows 0-9, then 10-19, then 20-29") repeats, the next ranges along that
//! step are predicted.

use gridflow_core::{GridRange, Operation, OperationKind, Origin, Priority, Target};
use std::time::Instant;

use super::tracker::AccessEvent;

/// Consecutive pairs that must share the stride before anything is predicted.
const MIN_MATCHING_PAIRS: usize = 2;

/// Confidence multiplier per extra step of lookahead.
const LOOKAHEAD_DECAY: f64 = 0.8;

/// A predicted read, queued for background execution.
#[derive(Debug, Clone)]
pub struct PrefetchCandidate {
    pub operation: Operation,
    /// 0.0 - 1.0
    pub confidence: f64,
    pub created_at: Instant,
}

impl PrefetchCandidate {
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

#[derive(Debug, Default)]
pub struct PrefetchPredictor;

impl PrefetchPredictor {
    pub fn new() -> Self {
        Self
    }

    /// Predict follow-up reads from a resource's history (oldest first).
    pub fn predict(&self, history: &[AccessEvent], lookahead: usize) -> Vec<PrefetchCandidate> {
        let Some(latest) = history.iter().rev().find(|e| e.kind == OperationKind::Read) else {
            return Vec::new();
        };
        let Target::Range(last) = &latest.target else {
            return Vec::new();
        };

        let ranges: Vec<&GridRange> = history
            .iter()
            .filter(|e| e.kind == OperationKind::Read && e.args == latest.args && e.scope == latest.scope)
            .filter_map(|e| e.target.as_range())
            .filter(|r| r.sheet == last.sheet && r.height() == last.height() && r.width() == last.width())
            .collect();
        if ranges.len() < MIN_MATCHING_PAIRS + 1 {
            return Vec::new();
        }

        let strides: Vec<(i64, i64)> = ranges.windows(2).map(|w| stride(w[0], w[1])).collect();
        let Some(&current) = strides.last() else {
            return Vec::new();
        };
        if current == (0, 0) {
            return Vec::new();
        }
        let matching = strides.iter().filter(|s| **s == current).count();
        if matching < MIN_MATCHING_PAIRS {
            return Vec::new();
        }
        let base = matching as f64 / strides.len() as f64;

        let mut candidates = Vec::new();
        let mut confidence = base;
        for step in 1..=lookahead as i64 {
            let Some(next) = last.shifted(current.0 * step, current.1 * step) else {
                break;
            };
            let mut operation = Operation::read(latest.resource_id.clone(), next)
                .with_scope(latest.scope.clone())
                .with_priority(Priority::Low)
                .with_origin(Origin::Prefetch);
            for (key, value) in &latest.args {
                operation = operation.with_arg(key.clone(), value.clone());
            }
            candidates.push(PrefetchCandidate { operation, confidence, created_at: Instant::now() });
            confidence *= LOOKAHEAD_DECAY;
        }
        candidates
    }
}

fn stride(from: &GridRange, to: &GridRange) -> (i64, i64) {
    (
        to.start_row as i64 - from.start_row as i64,
        to.start_col as i64 - from.start_col as i64,
    )
}
