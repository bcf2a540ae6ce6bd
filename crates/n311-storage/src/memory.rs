//! In-memory warehouse used by tests and dry runs.
//!
//! Mirrors the Postgres semantics the pipeline relies on: upsert-or-ignore by
//! `unique_key`, all-or-nothing staging batches, range routing of partitioned
//! rows, and rejection of overlapping partitions.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use n311_core::{
    CleanRecord, PartitionSpec, PartitionedRow, RowOutcome, PARTITIONED_TABLE, STAGING_TABLE,
};
use tokio::sync::RwLock;

use crate::{Warehouse, WarehouseError};

#[derive(Debug, Default)]
struct MemoryState {
    staging_table: bool,
    staging: BTreeMap<i64, CleanRecord>,
    partitioned_table: bool,
    partitions: BTreeMap<String, PartitionSpec>,
    partition_creations: usize,
    partitioned: BTreeMap<i64, PartitionedRow>,
    // fault injection
    failing_staging_keys: HashSet<i64>,
    rejected_partitioned_keys: HashSet<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Any staging batch containing `key` fails as a whole.
    pub async fn fail_staging_key(&self, key: i64) {
        self.state.write().await.failing_staging_keys.insert(key);
    }

    /// Inserts of `key` into the partitioned table fail as a constraint violation would.
    pub async fn reject_partitioned_key(&self, key: i64) {
        self.state.write().await.rejected_partitioned_keys.insert(key);
    }

    pub async fn table_names(&self) -> Vec<String> {
        let state = self.state.read().await;
        let mut names = Vec::new();
        if state.staging_table {
            names.push(STAGING_TABLE.to_string());
        }
        if state.partitioned_table {
            names.push(PARTITIONED_TABLE.to_string());
        }
        names.extend(state.partitions.keys().cloned());
        names
    }

    pub async fn staging_rows(&self) -> Vec<CleanRecord> {
        self.state.read().await.staging.values().cloned().collect()
    }

    pub async fn partitioned_rows(&self) -> Vec<PartitionedRow> {
        self.state.read().await.partitioned.values().cloned().collect()
    }

    pub async fn partition_names(&self) -> Vec<String> {
        self.state.read().await.partitions.keys().cloned().collect()
    }

    pub async fn partition_creations(&self) -> usize {
        self.state.read().await.partition_creations
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn ensure_staging_table(&self) -> Result<(), WarehouseError> {
        self.state.write().await.staging_table = true;
        Ok(())
    }

    async fn insert_staging_batch(&self, records: &[CleanRecord]) -> Result<u64, WarehouseError> {
        let mut state = self.state.write().await;
        if !state.staging_table {
            return Err(WarehouseError::MissingTable(STAGING_TABLE));
        }
        if let Some(bad) = records
            .iter()
            .find(|r| state.failing_staging_keys.contains(&r.unique_key))
        {
            return Err(WarehouseError::BatchWrite {
                rows: records.len(),
                reason: format!("simulated failure on unique_key={}", bad.unique_key),
            });
        }

        let mut inserted = 0;
        for record in records {
            if !state.staging.contains_key(&record.unique_key) {
                state.staging.insert(record.unique_key, record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn ensure_partitioned_table(&self) -> Result<(), WarehouseError> {
        self.state.write().await.partitioned_table = true;
        Ok(())
    }

    async fn partition_exists(&self, name: &str) -> Result<bool, WarehouseError> {
        Ok(self.state.read().await.partitions.contains_key(name))
    }

    async fn create_partition(&self, spec: &PartitionSpec) -> Result<(), WarehouseError> {
        let mut state = self.state.write().await;
        if !state.partitioned_table {
            return Err(WarehouseError::MissingTable(PARTITIONED_TABLE));
        }
        if state.partitions.contains_key(&spec.name) {
            return Ok(());
        }
        if let Some(existing) = state
            .partitions
            .values()
            .find(|p| p.start < spec.end && spec.start < p.end)
        {
            return Err(WarehouseError::PartitionOverlap {
                name: spec.name.clone(),
                existing: existing.name.clone(),
            });
        }
        state.partitions.insert(spec.name.clone(), spec.clone());
        state.partition_creations += 1;
        Ok(())
    }

    async fn insert_partitioned_rows(
        &self,
        rows: &[PartitionedRow],
    ) -> Result<Vec<RowOutcome>, WarehouseError> {
        let mut state = self.state.write().await;
        if !state.partitioned_table {
            return Err(WarehouseError::MissingTable(PARTITIONED_TABLE));
        }

        let mut outcomes = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.record.unique_key;
            let routed = state.partitions.values().any(|p| p.contains(row.load_date));
            // An existing key selects no row to insert, so routing is never consulted.
            let outcome = if state.rejected_partitioned_keys.contains(&key) {
                RowOutcome::Failed(format!("simulated constraint violation on unique_key={key}"))
            } else if state.partitioned.contains_key(&key) {
                RowOutcome::Ignored
            } else if !routed {
                RowOutcome::Failed(format!(
                    "no partition of relation \"{PARTITIONED_TABLE}\" found for row"
                ))
            } else {
                state.partitioned.insert(key, row.clone());
                RowOutcome::Inserted
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}
