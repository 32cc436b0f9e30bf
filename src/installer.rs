/*
📌 Installer / Trigger Registry
✅ Persists compiled trigger sets in the live schema (__policy_triggers__)
✅ Idempotent install/replace with drift detection against stored definitions
✅ Lazy event-table creation on first install
✅ Destructive uninstall gated behind an explicit confirmation flag
*/

use serde::{Deserialize, Serialize};
use sled::Db;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{PolicyError, PolicyResult};
use crate::history;
use crate::policy::compiler::CompiledTableSet;
use crate::policy::primitive::{Operation, Timing};
use crate::schema::SchemaManager;

const TRIGGER_TREE: &str = "__policy_triggers__";

/// Stored beside the compiled set so drift checks do not recompute it
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredTableSet {
    definition: String,
    set: CompiledTableSet,
}

/// Introspection record for one installed trigger
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerDescriptor {
    pub name: String,
    pub timing: Timing,
    pub operation: Operation,
    pub policies: Vec<String>,
}

/// Result of an install call
#[derive(Debug, Clone, PartialEq)]
pub struct InstallReport {
    pub table: String,
    pub created: bool,
    pub replaced: bool,
    pub trigger_count: usize,
    pub event_table: Option<String>,
}

pub struct PolicyInstaller {
    db: Arc<Db>,
    schemas: Arc<SchemaManager>,
    installed: Arc<Mutex<HashMap<String, CompiledTableSet>>>,
    // Serializes install/uninstall so concurrent setup cannot race itself
    install_lock: Mutex<()>,
}

impl PolicyInstaller {
    pub fn new(db: Arc<Db>, schemas: Arc<SchemaManager>) -> PolicyResult<Self> {
        let installer = Self {
            db,
            schemas,
            installed: Arc::new(Mutex::new(HashMap::new())),
            install_lock: Mutex::new(()),
        };
        installer.load_installed()?;
        Ok(installer)
    }

    fn load_installed(&self) -> PolicyResult<()> {
        let tree = self.db.open_tree(TRIGGER_TREE)?;
        let mut installed = self.installed.lock().unwrap();
        for entry in tree.iter() {
            let (key, value) = entry?;
            let table = String::from_utf8_lossy(&key).to_string();
            let stored: StoredTableSet = serde_json::from_slice(&value)?;
            installed.insert(table, stored.set);
        }
        if !installed.is_empty() {
            log::info!("loaded {} installed trigger sets", installed.len());
        }
        Ok(())
    }

    /// Shared handle the executor uses to look up triggers on the write path
    pub fn installed_sets(&self) -> Arc<Mutex<HashMap<String, CompiledTableSet>>> {
        Arc::clone(&self.installed)
    }

    /// Idempotently create or replace the trigger objects for a table.
    /// A differing stored definition is reported as `replaced` and logged;
    /// reinstalling an identical set is a no-op.
    pub fn install(&self, set: CompiledTableSet) -> PolicyResult<InstallReport> {
        let _guard = self.install_lock.lock().unwrap();

        if !self.schemas.has_table(&set.table) {
            return Err(PolicyError::schema(
                Some(&set.table),
                "cannot install triggers on an unknown table",
            ));
        }

        let definition = set.definition()?;
        let tree = self.db.open_tree(TRIGGER_TREE)?;
        let existing = tree.get(set.table.as_bytes())?;

        let (created, replaced) = match &existing {
            None => (true, false),
            Some(value) => {
                let stored: StoredTableSet = serde_json::from_slice(value)?;
                if stored.definition == definition {
                    // Identical definition already installed
                    (false, false)
                } else {
                    log::warn!(
                        "replacing drifted trigger definition for table '{}'",
                        set.table
                    );
                    (false, true)
                }
            }
        };

        // Lazily create the satellite event table on first install
        let event_table = match &set.event_table {
            Some(schema) => {
                self.schemas.create_table(schema.clone())?;
                Some(schema.name.clone())
            }
            None => None,
        };

        if created || replaced {
            let stored = StoredTableSet {
                definition,
                set: set.clone(),
            };
            tree.insert(set.table.as_bytes(), serde_json::to_vec(&stored)?)?;
        }

        let report = InstallReport {
            table: set.table.clone(),
            created,
            replaced,
            trigger_count: set.triggers.len(),
            event_table,
        };

        self.installed
            .lock()
            .unwrap()
            .insert(set.table.clone(), set);

        Ok(report)
    }

    /// Compare the stored definition against a freshly compiled set.
    /// Drift is reported, never self-healed; call `install` to reinstall.
    pub fn verify(&self, expected: &CompiledTableSet) -> PolicyResult<()> {
        let tree = self.db.open_tree(TRIGGER_TREE)?;
        let value = tree.get(expected.table.as_bytes())?.ok_or_else(|| {
            PolicyError::drift(
                &expected.table,
                "",
                "no trigger definition installed for this table",
            )
        })?;
        let stored: StoredTableSet = serde_json::from_slice(&value)?;
        let definition = expected.definition()?;
        if stored.definition != definition {
            let trigger = stored
                .set
                .triggers
                .iter()
                .zip(expected.triggers.iter())
                .find(|(a, b)| a != b)
                .map(|(a, _)| a.name.clone())
                .unwrap_or_else(|| expected.table.clone());
            return Err(PolicyError::drift(
                &expected.table,
                &trigger,
                "stored definition no longer matches the compiled one",
            ));
        }
        Ok(())
    }

    /// Remove all triggers for a table. Dropping the history table is
    /// destructive and requires the explicit flag.
    pub fn uninstall(&self, table: &str, drop_history: bool) -> PolicyResult<()> {
        let _guard = self.install_lock.lock().unwrap();

        let tree = self.db.open_tree(TRIGGER_TREE)?;
        let removed = tree.remove(table.as_bytes())?;
        let set = self.installed.lock().unwrap().remove(table);

        if removed.is_none() && set.is_none() {
            return Err(PolicyError::schema(
                Some(table),
                "no triggers installed for this table",
            ));
        }

        if drop_history {
            let event_table = history::event_table_name(table);
            if self.schemas.has_table(&event_table) {
                self.schemas.drop_table(&event_table)?;
                log::warn!("dropped history table '{}'", event_table);
            }
        }

        log::info!("uninstalled triggers for table '{}'", table);
        Ok(())
    }

    /// Trigger descriptors for introspection and tests
    pub fn list_installed(&self, table: &str) -> Vec<TriggerDescriptor> {
        self.installed
            .lock()
            .unwrap()
            .get(table)
            .map(|set| {
                set.triggers
                    .iter()
                    .map(|trigger| TriggerDescriptor {
                        name: trigger.name.clone(),
                        timing: trigger.timing,
                        operation: trigger.operation,
                        policies: trigger.policies.iter().map(|p| p.name.clone()).collect(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn installed_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.installed.lock().unwrap().keys().cloned().collect();
        tables.sort();
        tables
    }
}
