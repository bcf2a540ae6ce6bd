//! PostgreSQL warehouse backed by a sqlx pool.

use std::time::Duration;

use async_trait::async_trait;
use n311_core::{
    validate_identifier, CleanRecord, PartitionSpec, PartitionedRow, RowOutcome,
    PARTITIONED_TABLE,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Connection, PgPool};

use crate::{Warehouse, WarehouseError};

const CREATE_STAGING_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stg_nyc_311 (
    unique_key BIGINT PRIMARY KEY,
    created_date TIMESTAMP,
    complaint_type VARCHAR(100),
    descriptor VARCHAR(100),
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION
)
"#;

const INSERT_STAGING: &str = r#"
INSERT INTO stg_nyc_311 (unique_key, created_date, complaint_type, descriptor, latitude, longitude)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (unique_key) DO NOTHING
"#;

// Postgres requires the partition key in every unique constraint, so the
// primary key is (unique_key, load_date); the insert below keeps keys unique
// across partitions.
const CREATE_PARTITIONED_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS stg_nyc_311_partitioned (
    unique_key BIGINT NOT NULL,
    created_date TIMESTAMP,
    complaint_type VARCHAR(100),
    descriptor VARCHAR(100),
    latitude DOUBLE PRECISION,
    longitude DOUBLE PRECISION,
    load_date DATE NOT NULL,
    PRIMARY KEY (unique_key, load_date)
) PARTITION BY RANGE (load_date)
"#;

const CREATE_PARTITIONED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_stg_nyc_311_load_date
    ON stg_nyc_311_partitioned (load_date)
"#;

const PARTITION_EXISTS: &str = r#"
SELECT EXISTS (
    SELECT 1 FROM pg_tables
     WHERE schemaname = current_schema()
       AND tablename = $1
)
"#;

// Held until commit. Partitioned loads from concurrent runs take turns, so a
// run stamping another load_date sees the committed rows in its NOT EXISTS
// check instead of adding a second copy of a key in another partition.
const LOCK_PARTITIONED_LOAD: &str =
    "SELECT pg_advisory_xact_lock(hashtext('stg_nyc_311_partitioned'))";

const INSERT_PARTITIONED: &str = r#"
INSERT INTO stg_nyc_311_partitioned (
    unique_key, created_date, complaint_type, descriptor, latitude, longitude, load_date
)
SELECT $1::BIGINT, $2::TIMESTAMP, $3::VARCHAR, $4::VARCHAR, $5::DOUBLE PRECISION,
       $6::DOUBLE PRECISION, $7::DATE
 WHERE NOT EXISTS (SELECT 1 FROM stg_nyc_311_partitioned WHERE unique_key = $1::BIGINT)
ON CONFLICT (unique_key, load_date) DO NOTHING
"#;

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
}

impl PgWarehouse {
    /// Connections are opened on first use, so a run that skips before any
    /// write never touches the database.
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn ensure_staging_table(&self) -> Result<(), WarehouseError> {
        sqlx::query(CREATE_STAGING_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_staging_batch(&self, records: &[CleanRecord]) -> Result<u64, WarehouseError> {
        let batch_error = |err: sqlx::Error| WarehouseError::BatchWrite {
            rows: records.len(),
            reason: err.to_string(),
        };

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for record in records {
            // On error `tx` is dropped unfinished, which rolls the batch back.
            inserted += sqlx::query(INSERT_STAGING)
                .bind(record.unique_key)
                .bind(record.created_date)
                .bind(&record.complaint_type)
                .bind(&record.descriptor)
                .bind(record.latitude)
                .bind(record.longitude)
                .execute(&mut *tx)
                .await
                .map_err(batch_error)?
                .rows_affected();
        }
        tx.commit().await.map_err(batch_error)?;
        Ok(inserted)
    }

    async fn ensure_partitioned_table(&self) -> Result<(), WarehouseError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(CREATE_PARTITIONED_TABLE)
            .execute(&mut *conn)
            .await?;
        sqlx::query(CREATE_PARTITIONED_INDEX)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    async fn partition_exists(&self, name: &str) -> Result<bool, WarehouseError> {
        let exists = sqlx::query_scalar::<_, bool>(PARTITION_EXISTS)
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn create_partition(&self, spec: &PartitionSpec) -> Result<(), WarehouseError> {
        // Identifiers and DDL literals cannot be bound; both come from
        // PartitionSpec and are re-checked against the allowlist here.
        let table = validate_identifier(&spec.name)?;
        let index_name = spec.index_name();
        let index = validate_identifier(&index_name)?;
        let start = spec.start.format("%Y-%m-%d");
        let end = spec.end.format("%Y-%m-%d");

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} PARTITION OF {PARTITIONED_TABLE} \
             FOR VALUES FROM ('{start}') TO ('{end}')"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} (load_date)"
        ))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_partitioned_rows(
        &self,
        rows: &[PartitionedRow],
    ) -> Result<Vec<RowOutcome>, WarehouseError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(LOCK_PARTITIONED_LOAD).execute(&mut *tx).await?;
        let mut outcomes = Vec::with_capacity(rows.len());

        for row in rows {
            // A failed statement poisons the transaction; a savepoint per row
            // keeps the rest of the batch usable.
            let mut savepoint = tx.begin().await?;
            let record = &row.record;
            let result = sqlx::query(INSERT_PARTITIONED)
                .bind(record.unique_key)
                .bind(record.created_date)
                .bind(&record.complaint_type)
                .bind(&record.descriptor)
                .bind(record.latitude)
                .bind(record.longitude)
                .bind(row.load_date)
                .execute(&mut *savepoint)
                .await;

            match result {
                Ok(done) => {
                    savepoint.commit().await?;
                    outcomes.push(if done.rows_affected() == 0 {
                        RowOutcome::Ignored
                    } else {
                        RowOutcome::Inserted
                    });
                }
                Err(err) => {
                    savepoint.rollback().await?;
                    outcomes.push(RowOutcome::Failed(err.to_string()));
                }
            }
        }

        tx.commit().await?;
        Ok(outcomes)
    }
}
