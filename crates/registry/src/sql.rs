//! Structural SQL checks: extract the objects a statement references so
//! they can be resolved against the registry. This is intentionally not a
//! SQL parser.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

lazy_static! {
    static ref TABLE_REF: Regex =
        Regex::new(r#"(?i)\b(?:FROM|JOIN|INTO|UPDATE)\s+("?[A-Za-z_][\w.]*"?)"#)
            .expect("table reference pattern compiles");
}

/// Table names referenced by `sql`, lower-cased, with quoting and schema
/// qualifiers stripped. Subqueries contribute their inner references;
/// derived-table aliases are not distinguished from tables.
pub fn referenced_tables(sql: &str) -> BTreeSet<String> {
    TABLE_REF
        .captures_iter(sql)
        .filter_map(|cap| {
            let raw = cap.get(1)?.as_str().trim_matches('"');
            let name = raw.rsplit('.').next().unwrap_or(raw);
            if name.is_empty() {
                None
            } else {
                Some(name.to_ascii_lowercase())
            }
        })
        .collect()
}
