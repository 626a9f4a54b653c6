//! Adaptive per-kind concurrency tuning.
//!
//! Outcomes are recorded per (kind, complexity) bucket over a moving
//! window. Between plan executions, a kind whose recent operations
//! succeed reliably and quickly earns one more permit (capped at twice
//! its configured limit); a kind that fails often or runs slow loses one
//! (floored at one). Limits never change mid-plan.

use std::collections::{BTreeMap, VecDeque};

use crate::config::{ExecutorConfig, TuningConfig};
use models::{Complexity, SourceKind};

#[derive(Debug, Clone, Copy)]
struct Sample {
    ok: bool,
    duration: f64,
}

#[derive(Debug, Default)]
pub struct Tuner {
    windows: BTreeMap<(SourceKind, Complexity), VecDeque<Sample>>,
    overrides: BTreeMap<SourceKind, usize>,
}

impl Tuner {
    pub fn record(
        &mut self,
        kind: SourceKind,
        complexity: Complexity,
        ok: bool,
        duration: f64,
        window: usize,
    ) {
        let samples = self.windows.entry((kind, complexity)).or_default();
        samples.push_back(Sample { ok, duration });
        while samples.len() > window.max(1) {
            samples.pop_front();
        }
    }

    /// The effective limit for `kind`: a tuned override, else the
    /// configured default.
    pub fn limit_for(&self, kind: SourceKind, config: &ExecutorConfig) -> usize {
        self.overrides
            .get(&kind)
            .copied()
            .unwrap_or_else(|| config.limit_for(Some(kind)))
    }

    /// Re-evaluates every kind's limit from its recorded windows. Called
    /// between plan executions, never during one.
    pub fn retune(&mut self, config: &ExecutorConfig, tuning: &TuningConfig) {
        let mut per_kind: BTreeMap<SourceKind, (usize, usize, f64)> = BTreeMap::new();
        for ((kind, _), samples) in &self.windows {
            let entry = per_kind.entry(*kind).or_insert((0, 0, 0.0));
            entry.0 += samples.len();
            entry.1 += samples.iter().filter(|s| s.ok).count();
            entry.2 += samples.iter().map(|s| s.duration).sum::<f64>();
        }

        for (kind, (total, ok, duration_sum)) in per_kind {
            if total < tuning.min_samples {
                continue;
            }
            let success_rate = ok as f64 / total as f64;
            let avg_duration = duration_sum / total as f64;
            let default_limit = config.limit_for(Some(kind));
            let current = self.limit_for(kind, config);

            let next = if success_rate > 0.95 && avg_duration < tuning.target_duration_seconds {
                (current + 1).min(default_limit * 2)
            } else if success_rate < 0.80
                || avg_duration > tuning.target_duration_seconds * 3.0
            {
                current.saturating_sub(1).max(1)
            } else {
                current
            };

            if next != current {
                tracing::info!(
                    kind = %kind,
                    current,
                    next,
                    success_rate,
                    avg_duration,
                    "adjusting backend concurrency limit"
                );
                self.overrides.insert(kind, next);
            }
        }
    }
}
