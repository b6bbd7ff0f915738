// Metadata HTTP Client
//
// Fetches a table's partition assignment from the storage service over
// HTTP, bounded by the configured query timeout.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{parse_response, MetadataSource, QueryFailure};
use crate::config::MetadataConfig;
use crate::state::{OnlineAssignment, TableRef};

const META_PATH: &str = "/db/meta";

/// Queries `GET /db/meta?database_name=..&table_name=..` on the storage service.
#[derive(Debug, Clone)]
pub struct HttpMetadataClient {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpMetadataClient {
    pub fn new(config: &MetadataConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.query_timeout)
            .connect_timeout(config.query_timeout)
            .build()?;
        Ok(Self {
            url: format!("http://{}:{}{META_PATH}", config.host, config.port),
            client,
            timeout: config.query_timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn transport_failure(&self, err: reqwest::Error) -> QueryFailure {
        if err.is_timeout() {
            QueryFailure::Timeout(self.timeout)
        } else {
            QueryFailure::Transport(err.to_string())
        }
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataClient {
    async fn fetch_online_partitions(
        &self,
        table: &TableRef,
    ) -> Result<OnlineAssignment, QueryFailure> {
        let response = self
            .client
            .get(&self.url)
            .query(&[
                ("database_name", table.database.as_str()),
                ("table_name", table.table.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.transport_failure(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueryFailure::HttpStatus(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_failure(e))?;
        let online = parse_response(&body, table)?;
        debug!(%table, online = ?online.ids(), "online partitions");
        Ok(online)
    }
}
