use crate::domain::Identity;
use crate::replay::catalog::ColumnCatalog;
use sha2::{Digest, Sha256};
use url::Url;

/// Type tag used when no thing-model reference is configured.
pub const DEFAULT_TYPE: &str = "default";

const TYPE_HASH_CHARS: usize = 8;

/// Resolves per-column device identities and type tags.
#[derive(Debug, Clone)]
pub struct IdentityResolver {
    salt: String,
    default_model: Option<String>,
}

impl IdentityResolver {
    pub fn new(salt: impl Into<String>, default_model: Option<String>) -> Self {
        Self {
            salt: salt.into(),
            default_model: default_model.filter(|model| !model.trim().is_empty()),
        }
    }

    /// Explicit `COLUMN_<index>_ID` wins; otherwise the identity is derived from name and salt.
    pub fn resolve(&self, column: &str, index: usize, catalog: &ColumnCatalog) -> Identity {
        match catalog.get(index).and_then(|meta| meta.identifier.as_deref()) {
            Some(explicit) => Identity::new(explicit),
            None => derive_identity(column, &self.salt),
        }
    }

    pub fn model<'a>(&'a self, index: usize, catalog: &'a ColumnCatalog) -> Option<&'a str> {
        catalog
            .get(index)
            .and_then(|meta| meta.model.as_deref())
            .or(self.default_model.as_deref())
    }

    pub fn type_of(&self, index: usize, catalog: &ColumnCatalog) -> String {
        if let Some(explicit) = catalog.get(index).and_then(|meta| meta.type_name.as_deref()) {
            return explicit.to_string();
        }
        type_of(self.model(index, catalog))
    }
}

/// Lowercase hex SHA-256 over `"<column>:<salt>"`.
pub fn derive_identity(column: &str, salt: &str) -> Identity {
    let mut hasher = Sha256::new();
    hasher.update(column.as_bytes());
    hasher.update(b":");
    hasher.update(salt.as_bytes());
    Identity::new(hex::encode(hasher.finalize()))
}

/// `<basename>-<hash prefix>` of a model reference, or [`DEFAULT_TYPE`].
pub fn type_of(model: Option<&str>) -> String {
    let Some(model) = model.map(str::trim).filter(|model| !model.is_empty()) else {
        return DEFAULT_TYPE.to_string();
    };

    let digest = hex::encode(Sha256::digest(model.as_bytes()));
    format!("{}-{}", basename(model), &digest[..TYPE_HASH_CHARS])
}

fn basename(model: &str) -> String {
    let from_url = Url::parse(model).ok().and_then(|url| {
        url.path_segments()
            .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
            .map(str::to_string)
    });

    from_url
        .or_else(|| {
            model
                .rsplit('/')
                .find(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "model".to_string())
}
