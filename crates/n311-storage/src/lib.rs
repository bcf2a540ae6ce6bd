//! HTTP fetch utilities, the open-data source, and the relational warehouse.

mod memory;
mod postgres;
mod source;
mod warehouse;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;
pub use source::{where_clause, IncidentSource, OpenDataSource, DEFAULT_SOURCE_URL};
pub use warehouse::{
    ensure_partition, write_partitioned, write_staging, PartitionOutcome, StagingReport,
    Warehouse, WarehouseError,
};

use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "n311-storage";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Thin reqwest wrapper. Any non-success response is returned as an error
/// straight away; retrying is left to whoever schedules the run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        run_id: Uuid,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        async move {
            let resp = self.client.get(url).query(query).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.bytes().await?;
            tracing::debug!(bytes = body.len(), "response received");
            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: final_url,
                source,
            })
        }
        .instrument(span)
        .await
    }
}
