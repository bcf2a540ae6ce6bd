//! Backend contract plus the three write steps built on it: staging upsert,
//! partition provisioning and the tolerant partitioned upsert.

use async_trait::async_trait;
use chrono::NaiveDate;
use n311_core::{
    validate_identifier, CleanRecord, ConfigError, PartitionGranularity, PartitionSpec,
    PartitionedRow, RowOutcome, WriteReport,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("staging batch of {rows} rows rolled back: {reason}")]
    BatchWrite { rows: usize, reason: String },
    #[error("table {0} does not exist")]
    MissingTable(&'static str),
    #[error("partition {name} overlaps existing partition {existing}")]
    PartitionOverlap { name: String, existing: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Statements the pipeline issues against the relational store. Each call
/// acquires its own connection and releases it before returning.
#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn ensure_staging_table(&self) -> Result<(), WarehouseError>;

    /// Upsert-or-ignore every record inside one transaction. Returns the number
    /// of rows actually inserted; any failure rolls the whole batch back.
    async fn insert_staging_batch(&self, records: &[CleanRecord]) -> Result<u64, WarehouseError>;

    /// Parent table range-partitioned by `load_date`, plus its index.
    async fn ensure_partitioned_table(&self) -> Result<(), WarehouseError>;

    async fn partition_exists(&self, name: &str) -> Result<bool, WarehouseError>;

    /// Child table and its `load_date` index. A no-op when the table exists.
    async fn create_partition(&self, spec: &PartitionSpec) -> Result<(), WarehouseError>;

    /// One outcome per row, in input order, committed once after all attempts.
    async fn insert_partitioned_rows(
        &self,
        rows: &[PartitionedRow],
    ) -> Result<Vec<RowOutcome>, WarehouseError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StagingReport {
    pub attempted: usize,
    pub inserted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionOutcome {
    pub spec: PartitionSpec,
    pub created: bool,
}

pub async fn write_staging<W: Warehouse + ?Sized>(
    warehouse: &W,
    records: &[CleanRecord],
) -> Result<StagingReport, WarehouseError> {
    warehouse.ensure_staging_table().await?;
    let inserted = warehouse.insert_staging_batch(records).await?;
    info!(
        attempted = records.len(),
        inserted,
        "staging batch committed"
    );
    Ok(StagingReport {
        attempted: records.len(),
        inserted,
    })
}

pub async fn ensure_partition<W: Warehouse + ?Sized>(
    warehouse: &W,
    run_date: NaiveDate,
    granularity: PartitionGranularity,
) -> Result<PartitionOutcome, WarehouseError> {
    warehouse.ensure_partitioned_table().await?;

    let spec = PartitionSpec::for_date(run_date, granularity)?;
    validate_identifier(&spec.name)?;
    validate_identifier(&spec.index_name())?;

    if warehouse.partition_exists(&spec.name).await? {
        info!(partition = %spec.name, "partition already present");
        return Ok(PartitionOutcome {
            spec,
            created: false,
        });
    }

    warehouse.create_partition(&spec).await?;
    info!(
        partition = %spec.name,
        start = %spec.start,
        end = %spec.end,
        "partition created"
    );
    Ok(PartitionOutcome {
        spec,
        created: true,
    })
}

/// Every row gets the same `load_date` regardless of its own `created_date`.
pub async fn write_partitioned<W: Warehouse + ?Sized>(
    warehouse: &W,
    records: &[CleanRecord],
    load_date: NaiveDate,
) -> Result<WriteReport, WarehouseError> {
    let rows = records
        .iter()
        .cloned()
        .map(|r| r.with_load_date(load_date))
        .collect::<Vec<_>>();

    let outcomes = warehouse.insert_partitioned_rows(&rows).await?;

    let mut report = WriteReport::default();
    for (row, outcome) in rows.iter().zip(outcomes) {
        if let RowOutcome::Failed(reason) = &outcome {
            warn!(
                unique_key = row.record.unique_key,
                %reason,
                "failed to insert partitioned row"
            );
        }
        report.record(row.record.unique_key, outcome);
    }

    info!(
        total = report.total,
        inserted = report.inserted,
        ignored = report.ignored,
        failed = report.failed,
        %load_date,
        "partitioned insert complete"
    );
    Ok(report)
}
