//! Model registry and validation.
//!
//! Every console tool validates its `model`, `column`, and
//! `association` parameters against a registry pre-computed from the
//! extracted metadata, before any query text is built. Unknown names
//! are validation errors carrying the full list of known alternatives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use atlas_core::error::{AtlasError, AtlasResult};
use atlas_core::store::MetadataStore;
use atlas_core::types::UnitType;

/// One association reflected from a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociationInfo {
    /// Association kind: `has_many`, `belongs_to`, `has_one`.
    pub kind: String,
    /// Table the association points at.
    pub table: String,
    /// Foreign-key column on the association's table (for has_many)
    /// or on the owning table (for belongs_to).
    pub foreign_key: String,
}

/// Registry entry for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Backing table name.
    pub table: String,
    /// Primary key column.
    pub primary_key: String,
    /// Known column names.
    pub columns: Vec<String>,
    /// Reflected associations by name.
    #[serde(default)]
    pub associations: BTreeMap<String, AssociationInfo>,
}

/// Pre-computed registry of known model names and their columns.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelInfo>,
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one model (tests and embedded fixtures).
    pub fn insert(&mut self, name: impl Into<String>, info: ModelInfo) {
        self.models.insert(name.into(), info);
    }

    /// Build from the extracted model units in the metadata store.
    ///
    /// Reads `metadata.table_name`, `metadata.columns`,
    /// `metadata.primary_key`, and `metadata.associations` from each
    /// model unit.
    pub fn from_metadata(store: &dyn MetadataStore) -> AtlasResult<Self> {
        let mut registry = Self::new();

        for unit in store.find_by_type(UnitType::Model)? {
            let table = unit
                .metadata
                .get("table_name")
                .and_then(|v| v.as_str())
                .map_or_else(|| derive_table_name(&unit.identifier), str::to_string);
            let primary_key = unit
                .metadata
                .get("primary_key")
                .and_then(|v| v.as_str())
                .unwrap_or("id")
                .to_string();
            let columns: Vec<String> = unit
                .metadata
                .get("columns")
                .and_then(|v| v.as_array())
                .map(|list| {
                    list.iter()
                        .filter_map(|c| c.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            let mut associations = BTreeMap::new();
            if let Some(list) = unit.metadata.get("associations").and_then(|v| v.as_array()) {
                for assoc in list {
                    let (Some(name), Some(kind), Some(table)) = (
                        assoc.get("name").and_then(|v| v.as_str()),
                        assoc.get("kind").and_then(|v| v.as_str()),
                        assoc.get("table").and_then(|v| v.as_str()),
                    ) else {
                        continue;
                    };
                    let foreign_key = assoc
                        .get("foreign_key")
                        .and_then(|v| v.as_str())
                        .map_or_else(
                            || format!("{}_id", singularize(&derive_table_name(&unit.identifier))),
                            str::to_string,
                        );
                    associations.insert(
                        name.to_string(),
                        AssociationInfo {
                            kind: kind.to_string(),
                            table: table.to_string(),
                            foreign_key,
                        },
                    );
                }
            }

            registry.insert(
                unit.identifier.clone(),
                ModelInfo { table, primary_key, columns, associations },
            );
        }

        tracing::info!(models = registry.models.len(), "model registry built");
        Ok(registry)
    }

    /// Sorted known model names.
    pub fn model_names(&self) -> Vec<&str> {
        self.models.keys().map(String::as_str).collect()
    }

    /// Validate a model name.
    pub fn validate_model(&self, name: &str) -> AtlasResult<&ModelInfo> {
        self.models.get(name).ok_or_else(|| {
            AtlasError::validation(format!(
                "Unknown model: {name}. Available: {}",
                self.model_names().join(", ")
            ))
        })
    }

    /// Validate a column on a model.
    pub fn validate_column<'a>(&self, model: &str, column: &'a str) -> AtlasResult<&'a str> {
        let info = self.validate_model(model)?;
        if info.columns.iter().any(|c| c == column) {
            Ok(column)
        } else {
            Err(AtlasError::validation(format!(
                "Unknown column: {column} on {model}. Available: {}",
                info.columns.join(", ")
            )))
        }
    }

    /// Validate an association on a model.
    pub fn validate_association<'a>(
        &'a self,
        model: &str,
        association: &str,
    ) -> AtlasResult<&'a AssociationInfo> {
        let info = self.validate_model(model)?;
        info.associations.get(association).ok_or_else(|| {
            AtlasError::validation(format!(
                "Unknown association: {association} on {model}. Available: {}",
                info.associations.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })
    }
}

/// `UserAccount` -> `user_accounts`. Only used when the extractor did
/// not record a table name.
fn derive_table_name(identifier: &str) -> String {
    let base = identifier.rsplit("::").next().unwrap_or(identifier);
    let mut snake = String::new();
    for (i, c) in base.chars().enumerate() {
        if c.is_uppercase() && i > 0 {
            snake.push('_');
        }
        snake.push(c.to_ascii_lowercase());
    }
    format!("{snake}s")
}

fn singularize(table: &str) -> String {
    table.strip_suffix('s').unwrap_or(table).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::store::memory::InMemoryMetadataStore;
    use atlas_core::types::ExtractedUnit;
    use serde_json::json;

    fn seeded_registry() -> ModelRegistry {
        let store = InMemoryMetadataStore::new();

        let mut user = ExtractedUnit::new(UnitType::Model, "User", "app/models/user.rb");
        user.metadata.insert("table_name".into(), json!("users"));
        user.metadata.insert("columns".into(), json!(["id", "email", "name", "created_at"]));
        user.metadata.insert(
            "associations".into(),
            json!([{"name": "posts", "kind": "has_many", "table": "posts", "foreign_key": "user_id"}]),
        );
        store.store(&user).expect("store");

        let mut post = ExtractedUnit::new(UnitType::Model, "Post", "app/models/post.rb");
        post.metadata.insert("table_name".into(), json!("posts"));
        post.metadata.insert("columns".into(), json!(["id", "user_id", "title", "created_at"]));
        store.store(&post).expect("store");

        ModelRegistry::from_metadata(&store).expect("registry")
    }

    #[test]
    fn test_unknown_model_message_lists_available() {
        let registry = seeded_registry();
        let err = registry.validate_model("Hacker").expect_err("unknown");
        assert_eq!(err.to_string(), "Unknown model: Hacker. Available: Post, User");
        assert_eq!(err.kind(), atlas_core::ErrorKind::Validation);
    }

    #[test]
    fn test_validate_column() {
        let registry = seeded_registry();
        assert!(registry.validate_column("User", "email").is_ok());
        let err = registry.validate_column("User", "ssn").expect_err("unknown column");
        assert!(err.to_string().contains("Unknown column: ssn on User"));
    }

    #[test]
    fn test_validate_association() {
        let registry = seeded_registry();
        let assoc = registry.validate_association("User", "posts").expect("posts");
        assert_eq!(assoc.table, "posts");
        assert_eq!(assoc.foreign_key, "user_id");
        assert!(registry.validate_association("User", "invoices").is_err());
    }

    #[test]
    fn test_table_name_fallback() {
        assert_eq!(derive_table_name("UserAccount"), "user_accounts");
        assert_eq!(derive_table_name("Billing::Invoice"), "invoices");
    }

    #[test]
    fn test_non_models_ignored() {
        let store = InMemoryMetadataStore::new();
        store
            .store(&ExtractedUnit::new(
                UnitType::Controller,
                "PostsController",
                "app/controllers/posts_controller.rb",
            ))
            .expect("store");
        let registry = ModelRegistry::from_metadata(&store).expect("registry");
        assert!(registry.model_names().is_empty());
    }
}
