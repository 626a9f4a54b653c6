use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::coerce::{join_key, value_cmp, JoinKey};
use models::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Median,
    Stddev,
}

impl AggregationFunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationFunction::Count => "count",
            AggregationFunction::Sum => "sum",
            AggregationFunction::Avg => "avg",
            AggregationFunction::Min => "min",
            AggregationFunction::Max => "max",
            AggregationFunction::Median => "median",
            AggregationFunction::Stddev => "stddev",
        }
    }

    fn needs_numeric(&self) -> bool {
        matches!(
            self,
            AggregationFunction::Sum
                | AggregationFunction::Avg
                | AggregationFunction::Median
                | AggregationFunction::Stddev
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub function: AggregationFunction,
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_field: Option<String>,
}

impl AggregationSpec {
    fn output_name(&self) -> String {
        self.output_field
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.function.as_str(), self.field))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupByOutput {
    pub rows: Vec<Row>,
    pub warnings: Vec<String>,
}

/// Numeric interpretation used by sum/avg/median/stddev: numbers and
/// numeric strings count, everything else does not.
fn to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Default)]
struct Accum {
    /// Non-null values seen.
    count: u64,
    numeric: Vec<f64>,
    saw_non_numeric: bool,
    min: Option<Value>,
    max: Option<Value>,
}

impl Accum {
    fn update(&mut self, value: &Value) {
        if value.is_null() {
            return;
        }
        self.count += 1;
        match to_f64(value) {
            Some(f) => self.numeric.push(f),
            None => self.saw_non_numeric = true,
        }
        if self
            .min
            .as_ref()
            .map_or(true, |m| value_cmp(value, m).is_lt())
        {
            self.min = Some(value.clone());
        }
        if self
            .max
            .as_ref()
            .map_or(true, |m| value_cmp(value, m).is_gt())
        {
            self.max = Some(value.clone());
        }
    }

    fn finalize(&self, spec: &AggregationSpec, warnings: &mut BTreeSet<String>) -> Value {
        if self.count == 0 {
            return Value::Null;
        }
        if spec.function.needs_numeric() && self.saw_non_numeric {
            warnings.insert(format!(
                "cannot apply {} to non-numeric values in field {:?}",
                spec.function.as_str(),
                spec.field
            ));
            return Value::Null;
        }
        match spec.function {
            AggregationFunction::Count => Value::from(self.count),
            AggregationFunction::Sum => Value::from(self.numeric.iter().sum::<f64>()),
            AggregationFunction::Avg => {
                // Nulls were never accumulated, so the denominator counts
                // only present numeric values.
                Value::from(self.numeric.iter().sum::<f64>() / self.numeric.len() as f64)
            }
            AggregationFunction::Min => self.min.clone().unwrap_or(Value::Null),
            AggregationFunction::Max => self.max.clone().unwrap_or(Value::Null),
            AggregationFunction::Median => {
                let mut sorted = self.numeric.clone();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    Value::from((sorted[mid - 1] + sorted[mid]) / 2.0)
                } else {
                    Value::from(sorted[mid])
                }
            }
            AggregationFunction::Stddev => {
                let n = self.numeric.len() as f64;
                let mean = self.numeric.iter().sum::<f64>() / n;
                let variance =
                    self.numeric.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
                Value::from(variance.sqrt())
            }
        }
    }
}

struct Group {
    /// First-seen raw values of the group keys, for output.
    key_values: Vec<Value>,
    accums: Vec<Accum>,
}

/// Incremental single-pass hash aggregation. Feed rows with [`update`],
/// then [`finalize`]; the streaming variant updates chunk by chunk.
///
/// [`update`]: GroupByState::update
/// [`finalize`]: GroupByState::finalize
pub struct GroupByState {
    keys: Vec<String>,
    aggregations: Vec<AggregationSpec>,
    groups: BTreeMap<Vec<JoinKey>, Group>,
}

impl GroupByState {
    pub fn new(keys: Vec<String>, aggregations: Vec<AggregationSpec>) -> Self {
        Self {
            keys,
            aggregations,
            groups: BTreeMap::new(),
        }
    }

    pub fn update(&mut self, rows: &[Row]) {
        for row in rows {
            // Rows missing a group key do not participate.
            let Some(raw) = self
                .keys
                .iter()
                .map(|k| row.get(k))
                .collect::<Option<Vec<&Value>>>()
            else {
                continue;
            };
            let key: Vec<JoinKey> = raw.iter().map(|v| join_key(v, None)).collect();
            let group = self.groups.entry(key).or_insert_with(|| Group {
                key_values: raw.iter().map(|v| (*v).clone()).collect(),
                accums: self.aggregations.iter().map(|_| Accum::default()).collect(),
            });
            for (accum, spec) in group.accums.iter_mut().zip(&self.aggregations) {
                accum.update(row.get(&spec.field).unwrap_or(&Value::Null));
            }
        }
    }

    pub fn finalize(self) -> GroupByOutput {
        let mut warnings = BTreeSet::new();
        let rows = self
            .groups
            .into_values()
            .map(|group| {
                let mut row = Row::new();
                for (key, value) in self.keys.iter().zip(&group.key_values) {
                    row.insert(key.clone(), value.clone());
                }
                for (accum, spec) in group.accums.iter().zip(&self.aggregations) {
                    row.insert(spec.output_name(), accum.finalize(spec, &mut warnings));
                }
                row
            })
            .collect();
        GroupByOutput {
            rows,
            warnings: warnings.into_iter().collect(),
        }
    }
}

/// Single-pass GROUP BY over in-memory rows.
pub fn group_by(
    rows: &[Row],
    keys: Vec<String>,
    aggregations: Vec<AggregationSpec>,
) -> GroupByOutput {
    let mut state = GroupByState::new(keys, aggregations);
    state.update(rows);
    state.finalize()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::merge::rows_of;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn spec(function: AggregationFunction, field: &str) -> AggregationSpec {
        AggregationSpec {
            function,
            field: field.to_string(),
            output_field: None,
        }
    }

    fn sales() -> Vec<Row> {
        rows_of(&json!([
            {"region": "eu", "amount": 10, "qty": 1},
            {"region": "eu", "amount": 30, "qty": null},
            {"region": "us", "amount": 5, "qty": 2},
            {"region": "us", "amount": 15, "qty": 4},
            {"region": "us", "amount": 10, "qty": 3},
        ]))
    }

    #[test]
    fn groups_and_aggregates() {
        let output = group_by(
            &sales(),
            vec!["region".to_string()],
            vec![
                spec(AggregationFunction::Count, "amount"),
                spec(AggregationFunction::Sum, "amount"),
                spec(AggregationFunction::Avg, "amount"),
                spec(AggregationFunction::Min, "amount"),
                spec(AggregationFunction::Max, "amount"),
                spec(AggregationFunction::Median, "amount"),
            ],
        );
        assert!(output.warnings.is_empty());
        assert_eq!(output.rows.len(), 2);

        let eu = &output.rows[0];
        assert_eq!(eu["region"], json!("eu"));
        assert_eq!(eu["count_amount"], json!(2));
        assert_eq!(eu["sum_amount"], json!(40.0));
        assert_eq!(eu["avg_amount"], json!(20.0));

        let us = &output.rows[1];
        assert_eq!(us["min_amount"], json!(5));
        assert_eq!(us["max_amount"], json!(15));
        assert_eq!(us["median_amount"], json!(10.0));
    }

    #[test]
    fn avg_skips_nulls_in_the_denominator() {
        let output = group_by(
            &sales(),
            vec!["region".to_string()],
            vec![spec(AggregationFunction::Avg, "qty")],
        );
        let eu = &output.rows[0];
        // One null qty in eu: denominator is 1, not 2.
        assert_eq!(eu["avg_qty"], json!(1.0));
    }

    #[test]
    fn non_numeric_under_numeric_aggregation_warns_and_nulls() {
        let rows = rows_of(&json!([
            {"region": "eu", "amount": "not-a-number"},
            {"region": "eu", "amount": 10},
        ]));
        let output = group_by(
            &rows,
            vec!["region".to_string()],
            vec![spec(AggregationFunction::Sum, "amount")],
        );
        assert_eq!(output.rows[0]["sum_amount"], Value::Null);
        assert_eq!(output.warnings.len(), 1);
        assert!(output.warnings[0].contains("amount"));
    }

    #[test]
    fn numeric_strings_are_numeric() {
        let rows = rows_of(&json!([
            {"g": 1, "v": "2"},
            {"g": 1, "v": "4.5"},
        ]));
        let output = group_by(
            &rows,
            vec!["g".to_string()],
            vec![spec(AggregationFunction::Sum, "v")],
        );
        assert_eq!(output.rows[0]["sum_v"], json!(6.5));
    }

    #[test]
    fn stddev_is_population_stddev() {
        let rows = rows_of(&json!([
            {"g": 1, "v": 2},
            {"g": 1, "v": 4},
            {"g": 1, "v": 4},
            {"g": 1, "v": 4},
            {"g": 1, "v": 5},
            {"g": 1, "v": 5},
            {"g": 1, "v": 7},
            {"g": 1, "v": 9},
        ]));
        let output = group_by(
            &rows,
            vec!["g".to_string()],
            vec![spec(AggregationFunction::Stddev, "v")],
        );
        assert_eq!(output.rows[0]["stddev_v"], json!(2.0));
    }

    #[test]
    fn composite_group_keys() {
        let rows = rows_of(&json!([
            {"a": 1, "b": "x", "v": 1},
            {"a": 1, "b": "x", "v": 2},
            {"a": 1, "b": "y", "v": 4},
        ]));
        let output = group_by(
            &rows,
            vec!["a".to_string(), "b".to_string()],
            vec![spec(AggregationFunction::Sum, "v")],
        );
        assert_eq!(output.rows.len(), 2);
        assert_eq!(output.rows[0]["sum_v"], json!(3.0));
        assert_eq!(output.rows[1]["sum_v"], json!(4.0));
    }

    #[test]
    fn rows_missing_group_keys_are_skipped() {
        let rows = rows_of(&json!([
            {"g": 1, "v": 1},
            {"v": 2},
        ]));
        let output = group_by(
            &rows,
            vec!["g".to_string()],
            vec![spec(AggregationFunction::Count, "v")],
        );
        assert_eq!(output.rows.len(), 1);
        assert_eq!(output.rows[0]["count_v"], json!(1));
    }

    #[test]
    fn output_field_override() {
        let rows = rows_of(&json!([{"g": 1, "v": 1}]));
        let output = group_by(
            &rows,
            vec!["g".to_string()],
            vec![AggregationSpec {
                function: AggregationFunction::Count,
                field: "v".to_string(),
                output_field: Some("n".to_string()),
            }],
        );
        assert!(output.rows[0].contains_key("n"));
    }

    #[test]
    fn deterministic_for_a_fixed_input() {
        let a = group_by(
            &sales(),
            vec!["region".to_string()],
            vec![spec(AggregationFunction::Sum, "amount")],
        );
        let b = group_by(
            &sales(),
            vec!["region".to_string()],
            vec![spec(AggregationFunction::Sum, "amount")],
        );
        assert_eq!(
            serde_json::to_value(&a.rows).unwrap(),
            serde_json::to_value(&b.rows).unwrap()
        );
    }
}
