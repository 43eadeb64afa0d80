//! Job classes perform the actual row mutation for one sub-batch.
//!
//! The orchestrator treats a job class as opaque: it hands over a key range
//! plus the migration's arguments and only looks at whether the call
//! returned an error.

use crate::error::{MigrationError, Result};
use crate::models::normalize_class_name;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One sub-batch of a job, as handed to a [`JobClass`]
#[derive(Debug, Clone, Copy)]
pub struct SubBatch<'a> {
    pub migration_id: i64,
    pub job_id: i64,
    pub table_name: &'a str,
    pub column_name: &'a str,
    pub start_id: i64,
    pub end_id: i64,
    pub sub_batch_size: i32,
    pub job_arguments: &'a Value,
}

#[async_trait]
pub trait JobClass: Send + Sync {
    /// Name migrations refer to in `job_class_name`
    fn name(&self) -> &'static str;

    /// Mutate the rows in `[start_id, end_id]`. Each call should be its own short transaction.
    async fn process_sub_batch(&self, sub_batch: &SubBatch<'_>) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct JobClassRegistry {
    classes: RwLock<HashMap<String, Arc<dyn JobClass>>>,
}

impl JobClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, job_class: Arc<dyn JobClass>) {
        debug!(job_class_name = job_class.name(), "Registering job class");
        self.classes
            .write()
            .insert(job_class.name().to_string(), job_class);
    }

    /// Register a job class under an additional name
    pub fn register_as(&self, name: impl AsRef<str>, job_class: Arc<dyn JobClass>) {
        self.classes
            .write()
            .insert(normalize_class_name(name.as_ref()), job_class);
    }

    pub fn resolve(&self, job_class_name: &str) -> Result<Arc<dyn JobClass>> {
        let name = normalize_class_name(job_class_name);
        self.classes
            .read()
            .get(&name)
            .cloned()
            .ok_or(MigrationError::UnknownJobClass(name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.classes.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for JobClassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClassRegistry")
            .field("classes", &self.names())
            .finish()
    }
}

/// Job class that touches nothing; useful for dry runs
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJobClass;

#[async_trait]
impl JobClass for NoopJobClass {
    fn name(&self) -> &'static str {
        "NoopJob"
    }

    async fn process_sub_batch(&self, _sub_batch: &SubBatch<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}
