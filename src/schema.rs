//! Entity schema registry: required and sensitive payload fields
//!
//! Sensitive fields (PHI-equivalent) get stricter handling everywhere:
//! mutations touching them are flagged in the audit log, reads of records
//! holding them are audited, and the conflict resolver refuses to pick a
//! side when both replicas changed one.

use crate::error::{ComplianceError, Result};
use crate::types::OpType;
use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

/// Field rules for one entity type
#[derive(Debug, Clone, Default)]
pub struct EntitySchema {
    /// Entity type identifier (e.g., "patient")
    pub entity_type: String,

    /// Top-level fields a `create` payload must carry
    pub required_fields: Vec<String>,

    /// Top-level fields holding PHI-equivalent data
    pub sensitive_fields: Vec<String>,
}

impl EntitySchema {
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            ..Default::default()
        }
    }

    pub fn required(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn sensitive(mut self, fields: &[&str]) -> Self {
        self.sensitive_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// Registry of entity schemas
pub trait SchemaRegistry: Send + Sync {
    /// Register or replace the schema for an entity type
    fn register(&self, schema: EntitySchema) -> Result<()>;

    /// Get the schema for an entity type
    fn get(&self, entity_type: &str) -> Result<Option<EntitySchema>>;

    /// Validate a mutation payload
    ///
    /// Payloads must be JSON objects (deletes may carry `null`). Entity
    /// types without a schema only get the shape check.
    fn validate(&self, entity_type: &str, op_type: OpType, payload: &serde_json::Value) -> Result<()>;

    /// Sensitive fields declared for an entity type
    fn sensitive_fields(&self, entity_type: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .get(entity_type)?
            .map(|s| s.sensitive_fields.into_iter().collect())
            .unwrap_or_default())
    }

    /// Whether a payload carries any sensitive field
    fn touches_sensitive(&self, entity_type: &str, payload: &serde_json::Value) -> Result<bool> {
        let sensitive = self.sensitive_fields(entity_type)?;
        Ok(match payload.as_object() {
            Some(map) => map.keys().any(|k| sensitive.contains(k)),
            None => false,
        })
    }
}

/// In-memory schema registry
#[derive(Default)]
pub struct MemorySchemaRegistry {
    schemas: RwLock<HashMap<String, EntitySchema>>,
}

impl MemorySchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SchemaRegistry for MemorySchemaRegistry {
    fn register(&self, schema: EntitySchema) -> Result<()> {
        if schema.entity_type.is_empty() {
            return Err(ComplianceError::Config(
                "Entity type cannot be empty".to_string(),
            ));
        }

        let mut schemas = self.schemas.write().map_err(|e| {
            ComplianceError::Config(format!("Schema registry lock poisoned: {}", e))
        })?;
        tracing::debug!(
            entity_type = %schema.entity_type,
            sensitive = ?schema.sensitive_fields,
            "Entity schema registered"
        );
        schemas.insert(schema.entity_type.clone(), schema);
        Ok(())
    }

    fn get(&self, entity_type: &str) -> Result<Option<EntitySchema>> {
        let schemas = self.schemas.read().map_err(|e| {
            ComplianceError::Config(format!("Schema registry lock poisoned: {}", e))
        })?;
        Ok(schemas.get(entity_type).cloned())
    }

    fn validate(&self, entity_type: &str, op_type: OpType, payload: &serde_json::Value) -> Result<()> {
        if entity_type.is_empty() {
            return Err(ComplianceError::SchemaValidation {
                entity_type: String::new(),
                reason: "Entity type cannot be empty".to_string(),
            });
        }

        let map = match payload {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null if op_type == OpType::Delete => return Ok(()),
            _ => {
                return Err(ComplianceError::SchemaValidation {
                    entity_type: entity_type.to_string(),
                    reason: "Payload must be a JSON object".to_string(),
                })
            }
        };

        if op_type != OpType::Create {
            return Ok(());
        }

        if let Some(schema) = self.get(entity_type)? {
            for field in &schema.required_fields {
                if !map.contains_key(field) {
                    return Err(ComplianceError::SchemaValidation {
                        entity_type: entity_type.to_string(),
                        reason: format!("Missing required field '{}'", field),
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> MemorySchemaRegistry {
        let registry = MemorySchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("patient")
                    .required(&["name"])
                    .sensitive(&["diagnosis", "ssn"]),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_create_requires_fields() {
        let registry = registry();
        assert!(registry
            .validate("patient", OpType::Create, &serde_json::json!({"name": "A"}))
            .is_ok());

        let err = registry
            .validate("patient", OpType::Create, &serde_json::json!({"ssn": "1"}))
            .unwrap_err();
        assert!(matches!(err, ComplianceError::SchemaValidation { .. }));
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn test_update_skips_required_check() {
        let registry = registry();
        assert!(registry
            .validate("patient", OpType::Update, &serde_json::json!({"ssn": "1"}))
            .is_ok());
    }

    #[test]
    fn test_payload_must_be_object() {
        let registry = registry();
        assert!(registry
            .validate("patient", OpType::Update, &serde_json::json!([1, 2]))
            .is_err());
        assert!(registry
            .validate("patient", OpType::Delete, &serde_json::Value::Null)
            .is_ok());
        assert!(registry
            .validate("untyped", OpType::Create, &serde_json::json!("text"))
            .is_err());
    }

    #[test]
    fn test_unregistered_type_passes() {
        let registry = registry();
        assert!(registry
            .validate("note", OpType::Create, &serde_json::json!({}))
            .is_ok());
        assert!(registry.sensitive_fields("note").unwrap().is_empty());
    }

    #[test]
    fn test_touches_sensitive() {
        let registry = registry();
        assert!(registry
            .touches_sensitive("patient", &serde_json::json!({"diagnosis": "x"}))
            .unwrap());
        assert!(!registry
            .touches_sensitive("patient", &serde_json::json!({"name": "x"}))
            .unwrap());
    }

    #[test]
    fn test_register_empty_type_fails() {
        let registry = MemorySchemaRegistry::new();
        assert!(registry.register(EntitySchema::new("")).is_err());
    }
}
