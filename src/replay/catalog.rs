use std::collections::BTreeMap;

const KEY_PREFIX: &str = "COLUMN_";

/// Operator overrides for one column position. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub identifier: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub model: Option<String>,
    pub manufacturer: Option<String>,
    pub category: Option<String>,
    pub property_name: Option<String>,
    pub type_name: Option<String>,
}

impl ColumnMetadata {
    fn set(&mut self, field: &str, value: String) -> bool {
        let slot = match field {
            "id" => &mut self.identifier,
            "title" => &mut self.title,
            "description" => &mut self.description,
            "model" => &mut self.model,
            "manufacturer" => &mut self.manufacturer,
            "category" => &mut self.category,
            "property_name" => &mut self.property_name,
            "type" => &mut self.type_name,
            _ => return false,
        };
        *slot = Some(value);
        true
    }
}

/// Sparse table of [`ColumnMetadata`] keyed by column position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnCatalog {
    entries: BTreeMap<usize, ColumnMetadata>,
}

impl ColumnCatalog {
    /// Builds the catalog from `COLUMN_<index>_<FIELD>` keys. Keys match case-insensitively,
    /// later duplicates win, empty values and unknown fields are ignored.
    pub fn load<I, K, V>(source: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut entries: BTreeMap<usize, ColumnMetadata> = BTreeMap::new();

        for (key, value) in source {
            let Some((index, field)) = parse_key(key.as_ref()) else {
                continue;
            };
            let value = value.into();
            if value.is_empty() {
                continue;
            }

            let mut candidate = entries.get(&index).cloned().unwrap_or_default();
            if candidate.set(&field, value) {
                entries.insert(index, candidate);
            }
        }

        Self { entries }
    }

    pub fn get(&self, index: usize) -> Option<&ColumnMetadata> {
        self.entries.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ColumnMetadata)> {
        self.entries.iter().map(|(index, meta)| (*index, meta))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_key(key: &str) -> Option<(usize, String)> {
    let upper = key.to_ascii_uppercase();
    let rest = upper.strip_prefix(KEY_PREFIX)?;
    let (index, field) = rest.split_once('_')?;
    if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) || field.is_empty() {
        return None;
    }
    let index = index.parse::<usize>().ok()?;
    Some((index, field.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_indices_collect_all_known_fields() {
        let catalog = ColumnCatalog::load([
            ("COLUMN_1_ID", "sensor-42"),
            ("COLUMN_1_TITLE", "Kitchen plug"),
            ("COLUMN_1_PROPERTY_NAME", "power"),
            ("COLUMN_7_MANUFACTURER", "DFKI"),
            ("COLUMN_7_TYPE", "plug"),
            ("PATH", "/usr/bin"),
        ]);

        assert_eq!(catalog.len(), 2);
        let first = catalog.get(1).expect("index 1");
        assert_eq!(first.identifier.as_deref(), Some("sensor-42"));
        assert_eq!(first.title.as_deref(), Some("Kitchen plug"));
        assert_eq!(first.property_name.as_deref(), Some("power"));
        assert_eq!(catalog.get(7).and_then(|m| m.type_name.as_deref()), Some("plug"));
        assert!(catalog.get(2).is_none());
    }

    #[test]
    fn unknown_fields_and_malformed_keys_are_ignored() {
        let catalog = ColumnCatalog::load([
            ("COLUMN_3_COLOUR", "red"),
            ("COLUMN_-1_ID", "negative"),
            ("COLUMN_X_ID", "no-index"),
            ("COLUMN_4", "no-field"),
            ("COLUMN_5_ID", ""),
        ]);
        assert!(catalog.is_empty());
    }

    #[test]
    fn keys_match_case_insensitively_and_later_wins() {
        let catalog = ColumnCatalog::load([
            ("column_2_description", "from file"),
            ("COLUMN_2_DESCRIPTION", "from env"),
        ]);
        assert_eq!(
            catalog.get(2).and_then(|m| m.description.as_deref()),
            Some("from env")
        );
    }
}
