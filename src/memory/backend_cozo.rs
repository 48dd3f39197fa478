use anyhow::{anyhow, Context, Result};
use cozo::{DataValue, DbInstance, NamedRows, ScriptMutability};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{error, info, warn};

pub struct CozoBackend {
    pub db: DbInstance,
}

impl CozoBackend {
    /// Opens (or creates) the RocksDB-backed store under `path`.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create store directory {}", path.display()))?;
        let db_path = path.join("cozo.db");
        let db_path_str = db_path.to_str().context("Invalid UTF-8 in database path")?;

        let mut retries = 0;
        let max_retries = 10;
        let db = loop {
            match DbInstance::new("rocksdb", db_path_str, "{}") {
                Ok(db) => break db,
                Err(e)
                    if retries < max_retries
                        && e.to_string().contains("Resource temporarily unavailable") =>
                {
                    retries += 1;
                    warn!(retries, max_retries, "knowledge store is locked, retrying");
                    std::thread::sleep(std::time::Duration::from_millis(1000));
                }
                Err(e) => return Err(anyhow!("Failed to open CozoDB at {}: {}", db_path_str, e)),
            }
        };

        let backend = Self { db };
        backend.initialize_schema()?;
        info!(path = %db_path.display(), "knowledge store opened");
        Ok(backend)
    }

    /// Volatile store, used by tests and ad-hoc runs.
    pub fn in_memory() -> Result<Self> {
        let db = DbInstance::new("mem", "", Default::default())
            .map_err(|e| anyhow!("Failed to open in-memory CozoDB: {}", e))?;
        let backend = Self { db };
        backend.initialize_schema()?;
        Ok(backend)
    }

    fn initialize_schema(&self) -> Result<()> {
        let create_entities = "
            :create entities {
                project: String,
                entity_type: String,
                id: String
                =>
                properties: String
            }
        ";
        self.run_schema_script(create_entities, "entities")?;

        let create_relationships = "
            :create relationships {
                project: String,
                subject: String,
                predicate: String,
                object: String
            }
        ";
        self.run_schema_script(create_relationships, "relationships")?;

        Ok(())
    }

    fn run_schema_script(&self, script: &str, name: &str) -> Result<()> {
        match self.db.run_script(script, Default::default(), ScriptMutability::Mutable) {
            Ok(_) => Ok(()),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("conflicts with an existing one") || msg.contains("already exists") {
                    return Ok(());
                }
                error!(relation = name, error = %msg, "knowledge store schema initialisation failed");
                Err(anyhow!("Failed to create relation {}: {}", name, msg))
            }
        }
    }

    pub fn run_script(
        &self,
        script: &str,
        params: BTreeMap<String, DataValue>,
        mutability: ScriptMutability,
    ) -> Result<NamedRows> {
        self.db
            .run_script(script, params, mutability)
            .map_err(|e| anyhow!("CozoDB Error: {}", e))
    }
}

pub fn params<const N: usize>(pairs: [(&str, DataValue); N]) -> BTreeMap<String, DataValue> {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

pub fn datavalue_to_json(value: &DataValue) -> Value {
    match value {
        DataValue::Null => Value::Null,
        DataValue::Bool(b) => Value::Bool(*b),
        DataValue::Str(s) => Value::String(s.to_string()),
        DataValue::List(items) => Value::Array(items.iter().map(datavalue_to_json).collect()),
        other => {
            if let Some(i) = other.get_int() {
                json!(i)
            } else if let Some(f) = other.get_float() {
                json!(f)
            } else {
                Value::String(format!("{:?}", other))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_is_reentrant() -> Result<()> {
        let backend = CozoBackend::in_memory()?;
        backend.initialize_schema()?;
        Ok(())
    }

    #[test]
    fn test_schema_failure_is_reported() -> Result<()> {
        let backend = CozoBackend::in_memory()?;
        assert!(backend.run_schema_script(":create broken {", "broken").is_err());
        Ok(())
    }
}
