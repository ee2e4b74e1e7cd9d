use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::store::AggregateStore;
use crate::model::RuleDefinition;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    rule_uuid: Uuid,
    component_id: String,
}

/// Owns the on-disk aggregation stores, one directory per (rule, component).
/// Opens lazily, caches handles, and garbage-collects directories whose rule
/// or component no longer exists.
pub struct AggregateStoreManager {
    base_dir: PathBuf,
    stores: DashMap<StoreKey, Arc<AggregateStore>>,
}

impl AggregateStoreManager {
    pub fn new(base_dir: PathBuf) -> Self {
        Self {
            base_dir,
            stores: DashMap::new(),
        }
    }

    /// Get the open store for a rule's aggregating component, opening (and
    /// creating on disk) if needed. Errors for rules whose kind does not
    /// aggregate.
    pub fn get_or_create(&self, rule: &RuleDefinition) -> Result<Arc<AggregateStore>> {
        let component_id = rule
            .kind
            .component_id()
            .ok_or_else(|| anyhow!("Rule {} has no aggregating component", rule.identity()))?;

        let key = StoreKey {
            rule_uuid: rule.uuid,
            component_id: component_id.to_string(),
        };
        let entry = self.stores.entry(key).or_try_insert_with(|| {
            let path = self.store_path(rule.uuid, component_id);
            std::fs::create_dir_all(&path)?;
            let store = AggregateStore::open(&path, rule.uuid, component_id)?;
            info!(
                rule = %rule.uuid,
                component = component_id,
                path = %path.display(),
                "Opened aggregation store"
            );
            Ok::<_, anyhow::Error>(Arc::new(store))
        })?;
        Ok(entry.value().clone())
    }

    pub fn store_path(&self, rule_uuid: Uuid, component_id: &str) -> PathBuf {
        self.base_dir.join(store_dir_name(rule_uuid, component_id))
    }

    /// Delete store directories that no longer correspond to any current
    /// aggregating rule. Cached handles for stale keys are dropped first so
    /// the directories are unlocked before removal.
    pub fn delete_old_stores(&self, current_rules: &[RuleDefinition]) -> Result<()> {
        let expected: HashSet<String> = current_rules
            .iter()
            .filter_map(|rule| {
                rule.kind
                    .component_id()
                    .map(|component| store_dir_name(rule.uuid, component))
            })
            .collect();

        self.stores
            .retain(|key, _| expected.contains(&store_dir_name(key.rule_uuid, &key.component_id)));

        if !self.base_dir.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if expected.contains(&name) {
                continue;
            }
            info!(dir = %name, "Deleting unused aggregation store");
            if let Err(e) = remove_dir(&entry.path()) {
                warn!(dir = %name, error = ?e, "Failed to delete aggregation store");
            }
        }
        Ok(())
    }
}

fn remove_dir(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

/// Filesystem-safe directory name for a store: `{rule_uuid}_{component_id}`
/// with every non-alphanumeric character replaced by `_`.
fn store_dir_name(rule_uuid: Uuid, component_id: &str) -> String {
    format!("{rule_uuid}_{component_id}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DuplicateSuppression, FilterExpr, PipelineRef, ProcessConfig, RuleKind,
    };
    use tempfile::TempDir;

    fn table_rule(uuid: Uuid) -> RuleDefinition {
        RuleDefinition {
            uuid,
            name: "rule".to_string(),
            version: "1".to_string(),
            description: String::new(),
            pipeline: PipelineRef {
                uuid: Uuid::new_v4(),
                name: "pipe".to_string(),
            },
            filter: FilterExpr::default(),
            process: ProcessConfig::default(),
            kind: RuleKind::TableBuilder {
                component_id: "table-1".to_string(),
            },
            suppression: DuplicateSuppression::default(),
        }
    }

    #[test]
    fn dir_name_is_normalized() {
        let uuid = Uuid::nil();
        let name = store_dir_name(uuid, "table/1 a");
        assert_eq!(
            name,
            "00000000_0000_0000_0000_000000000000_table_1_a"
        );
    }

    #[test]
    fn get_or_create_returns_same_store() {
        let dir = TempDir::new().unwrap();
        let manager = AggregateStoreManager::new(dir.path().to_path_buf());
        let rule = table_rule(Uuid::new_v4());

        let a = manager.get_or_create(&rule).unwrap();
        let b = manager.get_or_create(&rule).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(manager.store_path(rule.uuid, "table-1").exists());
    }

    #[test]
    fn delete_old_stores_removes_stale_directories() {
        let dir = TempDir::new().unwrap();
        let manager = AggregateStoreManager::new(dir.path().to_path_buf());
        let keep = table_rule(Uuid::new_v4());
        let stale = table_rule(Uuid::new_v4());

        manager.get_or_create(&keep).unwrap();
        {
            let store = manager.get_or_create(&stale).unwrap();
            drop(store);
        }

        manager.delete_old_stores(std::slice::from_ref(&keep)).unwrap();

        assert!(manager.store_path(keep.uuid, "table-1").exists());
        assert!(!manager.store_path(stale.uuid, "table-1").exists());
    }

    #[test]
    fn recreated_store_starts_empty() {
        let dir = TempDir::new().unwrap();
        let manager = AggregateStoreManager::new(dir.path().to_path_buf());
        let rule = table_rule(Uuid::new_v4());

        {
            let store = manager.get_or_create(&rule).unwrap();
            store
                .put_row(&crate::aggregate::AggregateRow {
                    stream_id: 1,
                    event_id: Some(1),
                    event_time_ms: 1_000,
                    values: vec![],
                })
                .unwrap();
            store.record_progress(1, None).unwrap();
        }
        manager.delete_old_stores(&[]).unwrap();

        let store = manager.get_or_create(&rule).unwrap();
        assert!(store.sync().unwrap().is_none());
        assert_eq!(store.row_count().unwrap(), 0);
    }
}
