//! Gateway payload builders: connect, attributes and telemetry.

use crate::config::{CsvConfig, NonNumericPolicy};
use crate::domain::{Identity, Row};
use crate::replay::catalog::ColumnCatalog;
use crate::replay::identity::IdentityResolver;
use serde_json::{json, Map as JsonMap, Number as JsonNumber, Value as JsonValue};
use std::collections::HashSet;

// integers beyond 2^53 lose precision as JSON numbers in most consumers
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Everything resolved for one data column of a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedColumn {
    pub index: usize,
    pub name: String,
    pub identity: Identity,
    pub property: String,
    pub type_name: String,
    pub model: Option<String>,
    pub title: Option<String>,
    pub description: String,
    pub manufacturer: Option<String>,
    pub category: Option<String>,
}

/// Data columns of a header with their identities resolved, in header order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnPlan {
    header: Vec<String>,
    columns: Vec<PlannedColumn>,
}

impl ColumnPlan {
    pub fn build(
        row: &Row,
        csv: &CsvConfig,
        resolver: &IdentityResolver,
        catalog: &ColumnCatalog,
    ) -> Self {
        let header = row.column_names().map(str::to_string).collect();
        let columns = row
            .iter()
            .filter(|(_, name, _)| csv.is_data_column(name))
            .map(|(index, name, _)| {
                let meta = catalog.get(index).cloned().unwrap_or_default();
                PlannedColumn {
                    index,
                    name: name.to_string(),
                    identity: resolver.resolve(name, index, catalog),
                    property: meta.property_name.unwrap_or_else(|| name.to_string()),
                    type_name: resolver.type_of(index, catalog),
                    model: resolver.model(index, catalog).map(str::to_string),
                    title: meta.title,
                    description: meta.description.unwrap_or_else(|| name.to_string()),
                    manufacturer: meta.manufacturer,
                    category: meta.category,
                }
            })
            .collect();

        Self { header, columns }
    }

    /// True when `row` has exactly the header this plan was built from.
    pub fn matches(&self, row: &Row) -> bool {
        row.len() == self.header.len()
            && row
                .column_names()
                .zip(&self.header)
                .all(|(name, expected)| name == expected)
    }

    pub fn columns(&self) -> &[PlannedColumn] {
        &self.columns
    }

    /// Columns whose identity was not already claimed by an earlier column.
    pub fn first_per_identity(&self) -> impl Iterator<Item = &PlannedColumn> {
        let mut seen = HashSet::new();
        self.columns
            .iter()
            .filter(move |column| seen.insert(column.identity.clone()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MessageAssembler {
    non_numeric: NonNumericPolicy,
}

impl MessageAssembler {
    pub fn new(non_numeric: NonNumericPolicy) -> Self {
        Self { non_numeric }
    }

    /// One `{device, type}` record per distinct identity.
    pub fn connect(&self, plan: &ColumnPlan) -> Vec<JsonValue> {
        plan.first_per_identity()
            .map(|column| {
                json!({
                    "device": column.identity.as_str(),
                    "type": column.type_name,
                })
            })
            .collect()
    }

    /// Static metadata keyed by identity; the first column sharing an identity wins.
    pub fn attributes(&self, plan: &ColumnPlan) -> JsonValue {
        let mut root = JsonMap::new();
        for column in plan.first_per_identity() {
            let mut metadata = JsonMap::new();
            metadata.insert("title".to_string(), optional_string(&column.title));
            metadata.insert(
                "description".to_string(),
                JsonValue::String(column.description.clone()),
            );
            metadata.insert(
                "manufacturer".to_string(),
                optional_string(&column.manufacturer),
            );
            metadata.insert("category".to_string(), optional_string(&column.category));

            let mut entry = JsonMap::new();
            entry.insert("thing-model".to_string(), optional_string(&column.model));
            entry.insert("thing-metadata".to_string(), JsonValue::Object(metadata));

            root.insert(column.identity.to_string(), JsonValue::Object(entry));
        }
        JsonValue::Object(root)
    }

    /// Values grouped per identity. `timestamp` switches to the `{ts, values}` entry form.
    /// Returns `None` when no column produced a value.
    pub fn telemetry(
        &self,
        row: &Row,
        plan: &ColumnPlan,
        timestamp: Option<i64>,
    ) -> Option<JsonValue> {
        let mut grouped: Vec<(&Identity, JsonMap<String, JsonValue>)> = Vec::new();

        for column in plan.columns() {
            let raw = row.value_at(column.index).unwrap_or("");
            let value = match (coerce_numeric(raw), self.non_numeric) {
                (Some(number), _) => JsonValue::Number(number),
                (None, NonNumericPolicy::Null) => JsonValue::Null,
                (None, NonNumericPolicy::Drop) => continue,
            };

            let position = match grouped.iter().position(|(id, _)| *id == &column.identity) {
                Some(position) => position,
                None => {
                    grouped.push((&column.identity, JsonMap::new()));
                    grouped.len() - 1
                }
            };
            grouped[position]
                .1
                .entry(column.property.clone())
                .or_insert(value);
        }

        if grouped.is_empty() {
            return None;
        }

        let mut root = JsonMap::new();
        for (identity, values) in grouped {
            let entry = match timestamp {
                Some(ts) => json!({ "ts": ts, "values": values }),
                None => JsonValue::Object(values),
            };
            root.insert(identity.to_string(), JsonValue::Array(vec![entry]));
        }
        Some(JsonValue::Object(root))
    }
}

/// Strict numeric parse. Integral values become JSON integers; `NaN`, infinities and
/// non-numeric text yield `None`.
pub fn coerce_numeric(raw: &str) -> Option<JsonNumber> {
    let value = raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    if value.fract() == 0.0 && value.abs() <= MAX_SAFE_INTEGER {
        return Some(JsonNumber::from(value as i64));
    }
    JsonNumber::from_f64(value)
}

fn optional_string(value: &Option<String>) -> JsonValue {
    value
        .as_ref()
        .map(|text| JsonValue::String(text.clone()))
        .unwrap_or(JsonValue::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csv() -> CsvConfig {
        CsvConfig {
            timestamp_column: "Time".to_string(),
            ignore_columns: vec!["Unnamed: 0".to_string()],
            ..CsvConfig::default()
        }
    }

    fn plan_for(row: &Row, catalog: &ColumnCatalog) -> ColumnPlan {
        let resolver = IdentityResolver::new("tenant-a", None);
        ColumnPlan::build(row, &csv(), &resolver, catalog)
    }

    #[test]
    fn plan_skips_timestamp_and_ignored_columns() {
        let row = Row::from_pairs(
            1,
            [("Unnamed: 0", "0"), ("Time", "08:00:00"), ("Watts", "3")],
        );
        let plan = plan_for(&row, &ColumnCatalog::default());

        let names: Vec<_> = plan.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Watts"]);
        assert_eq!(plan.columns()[0].index, 2);
        assert_eq!(plan.columns()[0].description, "Watts");
        assert!(plan.matches(&row));
        assert!(!plan.matches(&Row::from_pairs(2, [("Time", "x"), ("Watts", "1")])));
    }

    #[test]
    fn shared_identity_merges_telemetry_and_keeps_first_attributes() {
        let catalog = ColumnCatalog::load([
            ("COLUMN_1_ID", "plug-1"),
            ("COLUMN_1_TITLE", "First"),
            ("COLUMN_1_PROPERTY_NAME", "power"),
            ("COLUMN_2_ID", "plug-1"),
            ("COLUMN_2_TITLE", "Second"),
            ("COLUMN_2_PROPERTY_NAME", "voltage"),
        ]);
        let row = Row::from_pairs(1, [("Time", "08:00:00"), ("P", "120"), ("V", "230.5")]);
        let plan = plan_for(&row, &catalog);
        let assembler = MessageAssembler::new(NonNumericPolicy::Drop);

        let attributes = assembler.attributes(&plan);
        let entries = attributes.as_object().expect("object");
        assert_eq!(entries.len(), 1);
        assert_eq!(attributes["plug-1"]["thing-metadata"]["title"], "First");
        assert_eq!(attributes["plug-1"]["thing-model"], JsonValue::Null);

        assert_eq!(assembler.connect(&plan).len(), 1);

        let telemetry = assembler.telemetry(&row, &plan, None).expect("telemetry");
        assert_eq!(
            telemetry,
            json!({ "plug-1": [{ "power": 120, "voltage": 230.5 }] })
        );
    }

    #[test]
    fn historical_entries_carry_original_timestamp() {
        let row = Row::from_pairs(1, [("Time", "08:00:00"), ("Watts", "7")]);
        let catalog = ColumnCatalog::load([("COLUMN_1_ID", "meter")]);
        let plan = plan_for(&row, &catalog);
        let assembler = MessageAssembler::new(NonNumericPolicy::Drop);

        let telemetry = assembler
            .telemetry(&row, &plan, Some(1_584_432_000_000))
            .expect("telemetry");
        assert_eq!(
            telemetry,
            json!({ "meter": [{ "ts": 1_584_432_000_000_i64, "values": { "Watts": 7 } }] })
        );
    }

    #[test]
    fn non_numeric_values_follow_policy() {
        let row = Row::from_pairs(1, [("Time", "08:00:00"), ("A", "n/a"), ("B", "NaN")]);
        let catalog = ColumnCatalog::load([("COLUMN_1_ID", "dev"), ("COLUMN_2_ID", "dev")]);
        let plan = plan_for(&row, &catalog);

        let dropped = MessageAssembler::new(NonNumericPolicy::Drop).telemetry(&row, &plan, None);
        assert_eq!(dropped, None);

        let nulled = MessageAssembler::new(NonNumericPolicy::Null)
            .telemetry(&row, &plan, None)
            .expect("telemetry");
        assert_eq!(nulled, json!({ "dev": [{ "A": null, "B": null }] }));
    }

    #[test]
    fn numeric_coercion_is_strict() {
        assert_eq!(coerce_numeric("120"), Some(JsonNumber::from(120)));
        assert_eq!(coerce_numeric(" 45 "), Some(JsonNumber::from(45)));
        assert_eq!(coerce_numeric("0.5"), JsonNumber::from_f64(0.5));
        assert_eq!(coerce_numeric("-3.0"), Some(JsonNumber::from(-3)));
        assert_eq!(coerce_numeric(""), None);
        assert_eq!(coerce_numeric("12abc"), None);
        assert_eq!(coerce_numeric("inf"), None);
    }
}
