/*
📌 Policy Runtime - wiring for schema, compiler, installer and executor
✅ One facade owning the shared sled database
✅ declare(): compile + install the policies for one table
✅ Session handles for suppression scoping
*/

use sled::Db;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RuntimeConfig;
use crate::error::PolicyResult;
use crate::executor::PolicyExecutor;
use crate::history::HistoryMode;
use crate::installer::{InstallReport, PolicyInstaller};
use crate::policy::compiler::{self, CompiledTableSet, TablePolicies};
use crate::schema::{SchemaManager, TableSchema};
use crate::storage::Storage;
use crate::suppression::{SuppressionGuard, SuppressionRegistry};

pub struct PolicyRuntime {
    schemas: Arc<SchemaManager>,
    installer: PolicyInstaller,
    executor: PolicyExecutor,
    suppression: SuppressionRegistry,
}

impl PolicyRuntime {
    /// Open (or create) a runtime over the database named in the config
    pub fn open(config: &RuntimeConfig) -> PolicyResult<Self> {
        let db = Arc::new(sled::open(&config.db_path)?);
        Self::with_db(db, config.history_mode)
    }

    /// Build a runtime over an already-open database
    pub fn with_db(db: Arc<Db>, history_mode: HistoryMode) -> PolicyResult<Self> {
        let schemas = Arc::new(SchemaManager::new(Arc::clone(&db)));
        let installer = PolicyInstaller::new(Arc::clone(&db), Arc::clone(&schemas))?;
        let suppression = SuppressionRegistry::new();
        let executor = PolicyExecutor::new(
            Storage::new(Arc::clone(&db)),
            Arc::clone(&schemas),
            suppression.clone(),
            installer.installed_sets(),
            history_mode,
        );
        Ok(Self {
            schemas,
            installer,
            executor,
            suppression,
        })
    }

    /// Register a table schema with the runtime
    pub fn create_table(&self, schema: TableSchema) -> PolicyResult<()> {
        self.schemas.create_table(schema)
    }

    /// Compile the declared policies against the table schema and install the
    /// resulting triggers
    pub fn declare(&self, policies: TablePolicies) -> PolicyResult<InstallReport> {
        let set = self.compile(&policies)?;
        self.installer.install(set)
    }

    /// Compile without installing (drift checks, tests)
    pub fn compile(&self, policies: &TablePolicies) -> PolicyResult<CompiledTableSet> {
        let schema = self.schemas.get_schema(&policies.table).ok_or_else(|| {
            crate::error::PolicyError::schema(Some(&policies.table), "schema not found")
        })?;
        compiler::compile_table(&schema, policies)
    }

    /// New session id for suppression scoping
    pub fn new_session(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Suppress (table, policy) for this session until the guard drops
    pub fn suppress(&self, session: &str, table: &str, policy: &str) -> SuppressionGuard {
        self.suppression.suppress(session, table, policy)
    }

    pub fn executor(&self) -> &PolicyExecutor {
        &self.executor
    }

    pub fn installer(&self) -> &PolicyInstaller {
        &self.installer
    }

    pub fn schemas(&self) -> &SchemaManager {
        &self.schemas
    }

    pub fn suppression(&self) -> &SuppressionRegistry {
        &self.suppression
    }
}
