use std::collections::{BTreeSet, HashMap, HashSet};

use log::{debug, warn};
use serde_yaml::Value;

use super::{pattern, Phase, PhaseSpec, RawSchedule, Schedule, ScheduleDocument};
use crate::error::{FtsErr, Result};

/// Validates user-supplied schedules against a model's parameter names.
pub struct Validator<'n> {
    names: &'n [String],
}

/// A phase entry after structural decoding, before pattern resolution.
struct Decoded {
    depth: usize,
    patterns: Vec<String>,
    lr: Option<Value>,
    max_transition_epoch: Option<i64>,
}

impl<'n> Validator<'n> {
    /// Creates a new `Validator`.
    ///
    /// # Arguments
    /// * `names` - Every parameter name of the target model.
    pub fn new(names: &'n [String]) -> Self {
        Self { names }
    }

    /// Validates `raw`, failing on the first violation in this order:
    /// integer keys, contiguous zero-based keys, unique keys, resolvable
    /// patterns, disjoint phases, well-formed `lr` values.
    ///
    /// # Returns
    /// The validated, immutable `Schedule`.
    ///
    /// # Errors
    /// Returns the `FtsErr` describing the first violation.
    pub fn validate(&self, raw: &RawSchedule) -> Result<Schedule> {
        let depths = depth_keys(raw)?;

        let mut ordered: Vec<(usize, &Value)> = depths
            .into_iter()
            .zip(raw.entries().iter().map(|(_, phase)| phase))
            .collect();
        ordered.sort_by_key(|(depth, _)| *depth);

        let decoded = ordered
            .into_iter()
            .map(|(depth, phase)| decode_phase(depth, phase))
            .collect::<Result<Vec<_>>>()?;

        let resolved = decoded
            .iter()
            .map(|phase| self.resolve_phase(phase))
            .collect::<Result<Vec<_>>>()?;

        check_disjoint(&resolved)?;

        let mut phases = Vec::with_capacity(decoded.len());
        for (phase, params) in decoded.into_iter().zip(resolved) {
            let lr = phase_lr(phase.depth, phase.lr.as_ref())?;
            phases.push(Phase {
                patterns: phase.patterns,
                params,
                lr,
                max_transition_epoch: phase.max_transition_epoch,
            });
        }

        debug!("validated a schedule of {} phase(s)", phases.len());
        Schedule::from_phases(phases)
    }

    /// Builds a corrected candidate for a schedule whose only problems are
    /// auto-correctable: depth keys are renumbered from 0 in numeric order
    /// and unresolvable patterns are dropped, together with phases left empty.
    ///
    /// # Returns
    /// `None` if nothing needed correcting or the document is too malformed to correct.
    pub fn correct(&self, raw: &RawSchedule) -> Option<ScheduleDocument> {
        let mut changed = depth_keys(raw).is_err();

        let mut entries: Vec<(f64, &Value)> = raw
            .entries()
            .iter()
            .map(|(key, phase)| (numeric_key(key), phase))
            .collect();
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut doc = ScheduleDocument::new();
        for (position, (_, phase)) in entries.into_iter().enumerate() {
            let decoded = decode_phase(position, phase).ok()?;
            let written = decoded.patterns.len();
            let patterns: Vec<String> = decoded
                .patterns
                .into_iter()
                .filter(|p| !pattern::resolve(p, self.names).is_empty())
                .collect();

            changed |= patterns.len() != written;
            if patterns.is_empty() {
                continue;
            }

            let spec = PhaseSpec {
                params: patterns,
                max_transition_epoch: decoded.max_transition_epoch,
                lr: decoded.lr.as_ref().and_then(lr_value),
            };
            doc.insert(doc.len(), spec);
        }

        (changed && !doc.is_empty()).then_some(doc)
    }

    fn resolve_phase(&self, phase: &Decoded) -> Result<Vec<String>> {
        let mut params = Vec::new();
        let mut seen = HashSet::new();

        for pat in &phase.patterns {
            let matched = pattern::resolve(pat, self.names);
            if matched.is_empty() {
                return Err(FtsErr::UnresolvedPattern {
                    depth: phase.depth,
                    pattern: pat.clone(),
                });
            }

            for name in matched {
                if seen.insert(name) {
                    params.push(name.to_string());
                }
            }
        }

        Ok(params)
    }
}

/// Checks the depth keys and returns them as depths, in file order.
fn depth_keys(raw: &RawSchedule) -> Result<Vec<usize>> {
    if raw.is_empty() {
        return Err(FtsErr::MalformedSchedule {
            detail: "the schedule defines no phases".into(),
        });
    }

    let mut keys = Vec::with_capacity(raw.len());
    for (key, _) in raw.entries() {
        let depth = integer_key(key).ok_or_else(|| FtsErr::NonIntegerDepth {
            key: key_repr(key),
        })?;
        keys.push(depth);
    }

    let unique: BTreeSet<i64> = keys.iter().copied().collect();
    if unique.iter().copied().ne(0..unique.len() as i64) {
        return Err(FtsErr::NonContiguousDepths {
            keys: unique.into_iter().collect(),
        });
    }

    let mut seen = HashSet::with_capacity(keys.len());
    if let Some(&depth) = keys.iter().find(|&&key| !seen.insert(key)) {
        return Err(FtsErr::DuplicateDepth { depth });
    }

    // Contiguity from 0 guarantees every key is non-negative.
    Ok(keys.into_iter().map(|key| key as usize).collect())
}

fn integer_key(key: &Value) -> Option<i64> {
    match key {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn numeric_key(key: &Value) -> f64 {
    match key {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .unwrap_or(f64::INFINITY)
}

fn key_repr(value: &Value) -> String {
    match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| format!("{other:?}")),
    }
}

fn decode_phase(depth: usize, phase: &Value) -> Result<Decoded> {
    let malformed = |detail: &str| FtsErr::MalformedPhase {
        depth,
        detail: detail.to_string(),
    };

    let Value::Mapping(fields) = phase else {
        return Err(malformed("a phase must be a mapping with a `params` list"));
    };

    let patterns = match fields.get("params") {
        Some(Value::Sequence(items)) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| malformed("`params` must only contain strings"))?,
        Some(_) => return Err(malformed("`params` must be a list")),
        None => return Err(malformed("missing `params`")),
    };

    if patterns.is_empty() {
        return Err(malformed("`params` must not be empty"));
    }

    let max_transition_epoch = match fields.get("max_transition_epoch") {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_i64() {
            Some(epoch) if epoch >= -1 => Some(epoch),
            _ => {
                return Err(FtsErr::InvalidTransitionEpoch {
                    depth,
                    value: key_repr(value),
                })
            }
        },
    };

    for key in fields.keys() {
        if !matches!(key.as_str(), Some("params" | "lr" | "max_transition_epoch")) {
            warn!("ignoring unknown key `{}` at depth {depth}", key_repr(key));
        }
    }

    Ok(Decoded {
        depth,
        patterns,
        lr: fields.get("lr").filter(|lr| !lr.is_null()).cloned(),
        max_transition_epoch,
    })
}

fn check_disjoint(resolved: &[Vec<String>]) -> Result<()> {
    let mut claimed: HashMap<&str, usize> = HashMap::new();

    for (depth, params) in resolved.iter().enumerate() {
        for param in params {
            if let Some(&claimed_by) = claimed.get(param.as_str()) {
                return Err(FtsErr::OverlappingPhases {
                    depth,
                    param: param.clone(),
                    claimed_by,
                });
            }
        }

        claimed.extend(params.iter().map(|p| (p.as_str(), depth)));
    }

    Ok(())
}

fn lr_value(value: &Value) -> Option<f64> {
    let lr = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;

    (lr.is_finite() && lr > 0.0).then_some(lr)
}

fn phase_lr(depth: usize, value: Option<&Value>) -> Result<Option<f64>> {
    let Some(value) = value else {
        return Ok(None);
    };

    if depth == 0 {
        return Err(FtsErr::LrAtDepthZero {
            lr: key_repr(value),
        });
    }

    lr_value(value)
        .map(Some)
        .ok_or_else(|| FtsErr::InvalidLr {
            depth,
            value: key_repr(value),
        })
}
