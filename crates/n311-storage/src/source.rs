use async_trait::async_trait;
use n311_core::{FetchWindow, RawRecord};
use tracing::info;
use uuid::Uuid;

use crate::{FetchError, HttpFetcher};

pub const DEFAULT_SOURCE_URL: &str = "https://data.cityofnewyork.us/resource/erm2-nwe9.json";

const SOQL_TIMESTAMP: &str = "%Y-%m-%dT%H:%M:%S";

#[async_trait]
pub trait IncidentSource: Send + Sync {
    /// Records created inside `window`. An empty result is valid.
    async fn fetch(&self, run_id: Uuid, window: &FetchWindow) -> Result<Vec<RawRecord>, FetchError>;
}

/// SoQL predicate selecting `[since, until)` on the creation timestamp.
pub fn where_clause(window: &FetchWindow) -> String {
    format!(
        "created_date >= '{}' AND created_date < '{}'",
        window.since.format(SOQL_TIMESTAMP),
        window.until.format(SOQL_TIMESTAMP)
    )
}

/// Socrata-style open-data endpoint returning a JSON array of objects.
#[derive(Debug, Clone)]
pub struct OpenDataSource {
    http: HttpFetcher,
    base_url: String,
    page_size: Option<u32>,
}

impl OpenDataSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            page_size: None,
        }
    }

    /// Page through the window with `$limit`/`$offset`, ordered by key, until a
    /// short page comes back. Without it a single unbounded request is made.
    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size.filter(|n| *n > 0);
        self
    }
}

#[async_trait]
impl IncidentSource for OpenDataSource {
    async fn fetch(&self, run_id: Uuid, window: &FetchWindow) -> Result<Vec<RawRecord>, FetchError> {
        let predicate = where_clause(window);

        let Some(limit) = self.page_size else {
            let records: Vec<RawRecord> = self
                .http
                .fetch_json(run_id, &self.base_url, &[("$where", predicate)])
                .await?;
            info!(%run_id, records = records.len(), "fetched records from source");
            return Ok(records);
        };

        let mut records = Vec::new();
        let mut offset = 0u64;
        loop {
            let page: Vec<RawRecord> = self
                .http
                .fetch_json(
                    run_id,
                    &self.base_url,
                    &[
                        ("$where", predicate.clone()),
                        ("$order", "unique_key".to_string()),
                        ("$limit", limit.to_string()),
                        ("$offset", offset.to_string()),
                    ],
                )
                .await?;
            let page_len = page.len();
            records.extend(page);
            if page_len < limit as usize {
                break;
            }
            offset += u64::from(limit);
        }

        info!(%run_id, records = records.len(), page_size = limit, "fetched records from source");
        Ok(records)
    }
}
