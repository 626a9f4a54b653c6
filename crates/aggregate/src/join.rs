use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::coerce::join_key;
use crate::coerce::JoinKey;
use crate::merge::SourceResult;
use crate::AggregateError;
use models::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

/// Per-source join keys: a single field per source, or a field tuple for
/// composite keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySpec {
    Single(BTreeMap<String, String>),
    Composite(BTreeMap<String, Vec<String>>),
}

impl KeySpec {
    pub fn fields_for(&self, source_id: &str) -> Option<Vec<String>> {
        match self {
            KeySpec::Single(map) => map.get(source_id).map(|f| vec![f.clone()]),
            KeySpec::Composite(map) => map.get(source_id).cloned(),
        }
    }
}

/// Per-source field type overrides applied during key comparison.
pub type TypeMappings = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub join_type: JoinType,
    pub keys: KeySpec,
    #[serde(default)]
    pub type_mappings: TypeMappings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinMetrics {
    pub duration_seconds: f64,
    pub rows_per_second: f64,
    pub probe_rows: usize,
    pub build_rows: usize,
    /// Approximate bytes held by the in-memory build indexes.
    pub index_bytes_estimate: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinOutput {
    pub success: bool,
    pub sources_joined: usize,
    pub join_type: JoinType,
    pub total_rows: usize,
    pub rows: Vec<Row>,
    pub metrics: JoinMetrics,
}

/// Namespaces `field` of `source_id` in a joined row.
fn namespaced(source_id: &str, field: &str) -> String {
    format!("{source_id}_{field}")
}

fn key_of(
    row: &Row,
    fields: &[String],
    source_id: &str,
    mappings: &TypeMappings,
) -> Option<Vec<JoinKey>> {
    let source_mapping = mappings.get(source_id);
    fields
        .iter()
        .map(|field| {
            row.get(field).map(|value| {
                let target = source_mapping
                    .and_then(|m| m.get(field))
                    .map(String::as_str);
                join_key(value, target)
            })
        })
        .collect()
}

struct BuildSide<'a> {
    source_id: &'a str,
    fields: Vec<String>,
    rows: &'a [Row],
    index: HashMap<Vec<JoinKey>, Vec<usize>>,
    matched: Vec<bool>,
}

/// Hash join across two or more sources.
///
/// The largest source streams as the probe side for inner joins; outer
/// joins probe the first source so that LEFT keeps the declared-left rows
/// and RIGHT/FULL emit unmatched rows of the remaining sources. Build
/// indexes are held in memory, which bounds join size to what fits; see
/// the crate docs. When several build rows share a key, the first one in
/// input order joins.
pub fn join(inputs: &[SourceResult], spec: &JoinSpec) -> Result<JoinOutput, AggregateError> {
    let start = Instant::now();

    let mut joinable: Vec<&SourceResult> = Vec::new();
    for input in inputs.iter().filter(|i| i.success) {
        if spec.keys.fields_for(&input.source_id).is_none() {
            return Err(AggregateError::MissingKeySpec(input.source_id.clone()));
        }
        joinable.push(input);
    }
    if joinable.len() < 2 {
        return Err(AggregateError::NotEnoughSources(joinable.len()));
    }

    let probe_idx = match spec.join_type {
        JoinType::Inner => joinable
            .iter()
            .enumerate()
            .max_by_key(|(_, input)| input.rows.len())
            .map(|(i, _)| i)
            .unwrap_or(0),
        _ => 0,
    };
    let probe = joinable.remove(probe_idx);
    let probe_fields = spec
        .keys
        .fields_for(&probe.source_id)
        .unwrap_or_default();

    let mut index_bytes = 0usize;
    let mut builds: Vec<BuildSide> = joinable
        .iter()
        .map(|input| {
            let fields = spec.keys.fields_for(&input.source_id).unwrap_or_default();
            let mut index: HashMap<Vec<JoinKey>, Vec<usize>> = HashMap::new();
            for (i, row) in input.rows.iter().enumerate() {
                if let Some(key) = key_of(row, &fields, &input.source_id, &spec.type_mappings) {
                    index.entry(key).or_default().push(i);
                }
                index_bytes += serde_json::to_string(row).map(|s| s.len()).unwrap_or(0);
            }
            BuildSide {
                source_id: input.source_id.as_str(),
                fields,
                rows: &input.rows,
                index,
                matched: vec![false; input.rows.len()],
            }
        })
        .collect();

    let mut rows: Vec<Row> = Vec::new();

    for probe_row in &probe.rows {
        let key = key_of(
            probe_row,
            &probe_fields,
            &probe.source_id,
            &spec.type_mappings,
        );

        let mut first_matches: Vec<Option<usize>> = Vec::with_capacity(builds.len());
        for build in &mut builds {
            let mut hit = None;
            if let Some(key) = key.as_ref() {
                if let Some(indexes) = build.index.get(key) {
                    for &i in indexes {
                        build.matched[i] = true;
                    }
                    hit = Some(indexes[0]);
                }
            }
            first_matches.push(hit);
        }
        let all_matched = first_matches.iter().all(Option::is_some);

        let emit = match spec.join_type {
            JoinType::Inner | JoinType::Right => all_matched,
            JoinType::Left | JoinType::Full => true,
        };
        if !emit {
            continue;
        }

        let mut joined = Row::new();
        for (field, value) in probe_row {
            joined.insert(namespaced(&probe.source_id, field), value.clone());
        }
        for (build, hit) in builds.iter().zip(&first_matches) {
            match hit {
                Some(i) => {
                    for (field, value) in &build.rows[*i] {
                        joined.insert(namespaced(build.source_id, field), value.clone());
                    }
                }
                None => {
                    // The absent side contributes nulls for its key fields.
                    for field in &build.fields {
                        joined.insert(namespaced(build.source_id, field), Value::Null);
                    }
                }
            }
        }
        rows.push(joined);
    }

    if matches!(spec.join_type, JoinType::Right | JoinType::Full) {
        for build in &builds {
            for (i, row) in build.rows.iter().enumerate() {
                if build.matched[i] {
                    continue;
                }
                let mut joined = Row::new();
                for field in &probe_fields {
                    joined.insert(namespaced(&probe.source_id, field), Value::Null);
                }
                for other in &builds {
                    if other.source_id != build.source_id {
                        for field in &other.fields {
                            joined.insert(namespaced(other.source_id, field), Value::Null);
                        }
                    }
                }
                for (field, value) in row {
                    joined.insert(namespaced(build.source_id, field), value.clone());
                }
                rows.push(joined);
            }
        }
    }

    let duration = start.elapsed().as_secs_f64();
    let metrics = JoinMetrics {
        duration_seconds: duration,
        rows_per_second: if duration > 0.0 {
            rows.len() as f64 / duration
        } else {
            0.0
        },
        probe_rows: probe.rows.len(),
        build_rows: builds.iter().map(|b| b.rows.len()).sum(),
        index_bytes_estimate: index_bytes,
    };
    tracing::debug!(
        join_type = ?spec.join_type,
        rows = rows.len(),
        probe = probe.rows.len(),
        "hash join complete"
    );

    Ok(JoinOutput {
        success: true,
        sources_joined: builds.len() + 1,
        join_type: spec.join_type,
        total_rows: rows.len(),
        rows,
        metrics,
    })
}

/// Pairwise join under a caller-supplied predicate, for conditions the
/// key specs cannot express. Runs as a nested loop: both sides must fit
/// in memory.
pub fn join_with_predicate(
    left: &SourceResult,
    right: &SourceResult,
    join_type: JoinType,
    predicate: impl Fn(&Row, &Row) -> bool,
) -> JoinOutput {
    let start = Instant::now();
    let mut rows = Vec::new();
    let mut right_matched = vec![false; right.rows.len()];

    for left_row in &left.rows {
        let mut hit = None;
        for (i, right_row) in right.rows.iter().enumerate() {
            if predicate(left_row, right_row) {
                right_matched[i] = true;
                if hit.is_none() {
                    hit = Some(i);
                }
            }
        }

        let emit = match join_type {
            JoinType::Inner | JoinType::Right => hit.is_some(),
            JoinType::Left | JoinType::Full => true,
        };
        if !emit {
            continue;
        }

        let mut joined = Row::new();
        for (field, value) in left_row {
            joined.insert(namespaced(&left.source_id, field), value.clone());
        }
        if let Some(i) = hit {
            for (field, value) in &right.rows[i] {
                joined.insert(namespaced(&right.source_id, field), value.clone());
            }
        }
        rows.push(joined);
    }

    if matches!(join_type, JoinType::Right | JoinType::Full) {
        for (i, row) in right.rows.iter().enumerate() {
            if right_matched[i] {
                continue;
            }
            let mut joined = Row::new();
            for (field, value) in row {
                joined.insert(namespaced(&right.source_id, field), value.clone());
            }
            rows.push(joined);
        }
    }

    let duration = start.elapsed().as_secs_f64();
    JoinOutput {
        success: true,
        sources_joined: 2,
        join_type,
        total_rows: rows.len(),
        metrics: JoinMetrics {
            duration_seconds: duration,
            rows_per_second: if duration > 0.0 {
                rows.len() as f64 / duration
            } else {
                0.0
            },
            probe_rows: left.rows.len(),
            build_rows: right.rows.len(),
            index_bytes_estimate: 0,
        },
        rows,
    }
}
