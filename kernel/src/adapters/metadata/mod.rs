// Metadata Service Adapter
//
// Parses the storage service's `/db/meta` response and exposes the
// partitions it assigns to this node. Any response that is not an
// explicit success is a `QueryFailure`, never an empty assignment.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::state::{OnlineAssignment, PartitionId, TableRef};

mod http;

pub use http::HttpMetadataClient;

/// Embedded status code the service uses for success.
pub const SUCCESS_CODE: i64 = 0;

/// Why the online assignment for a table is unknown.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryFailure {
    #[error("metadata service unreachable: {0}")]
    Transport(String),

    #[error("metadata query timed out after {0:?}")]
    Timeout(Duration),

    #[error("metadata service returned HTTP {0}")]
    HttpStatus(u16),

    #[error("metadata service reported code {code}: {message}")]
    Service { code: i64, message: String },

    #[error("malformed metadata response: {0}")]
    Malformed(String),
}

/// Authoritative source of partition assignments.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Partitions currently assigned to this node for `table`.
    async fn fetch_online_partitions(
        &self,
        table: &TableRef,
    ) -> Result<OnlineAssignment, QueryFailure>;
}

/// Response envelope shared by every endpoint of the service.
///
/// `Code` is mandatory. `Data` is only inspected on success.
#[derive(Debug, Deserialize)]
pub struct MetaResponse {
    #[serde(rename = "Code")]
    pub code: i64,

    #[serde(rename = "Error", default)]
    pub error: String,

    #[serde(rename = "Data", default)]
    pub data: Option<serde_json::Value>,
}

/// Subset of the table metadata we care about.
///
/// `Partitions` has no default: a success without it is rejected.
#[derive(Debug, Deserialize)]
pub struct TableMeta {
    #[serde(rename = "Partitions")]
    pub partitions: Vec<PartitionDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct PartitionDescriptor {
    #[serde(rename = "PartitionId")]
    pub partition_id: u32,

    #[serde(rename = "DatabaseName", default)]
    pub database_name: Option<String>,

    #[serde(rename = "TableName", default)]
    pub table_name: Option<String>,
}

impl MetaResponse {
    /// Convert the envelope into the assignment for `table`.
    pub fn into_assignment(self, table: &TableRef) -> Result<OnlineAssignment, QueryFailure> {
        if self.code != SUCCESS_CODE {
            return Err(QueryFailure::Service {
                code: self.code,
                message: self.error,
            });
        }

        let data = self
            .data
            .filter(|data| !data.is_null())
            .ok_or_else(|| QueryFailure::Malformed("success response without `Data`".into()))?;
        let meta: TableMeta = serde_json::from_value(data)
            .map_err(|e| QueryFailure::Malformed(format!("invalid `Data`: {e}")))?;

        let mut ids = Vec::with_capacity(meta.partitions.len());
        for partition in meta.partitions {
            partition.ensure_belongs_to(table)?;
            ids.push(PartitionId(partition.partition_id));
        }
        Ok(OnlineAssignment::new(ids))
    }
}

impl PartitionDescriptor {
    fn ensure_belongs_to(&self, table: &TableRef) -> Result<(), QueryFailure> {
        let mismatch = |field: &str, got: &str, want: &str| {
            QueryFailure::Malformed(format!(
                "partition {} reports {field} `{got}`, queried `{want}`",
                self.partition_id
            ))
        };
        if let Some(database) = self.database_name.as_deref() {
            if database != table.database {
                return Err(mismatch("database", database, &table.database));
            }
        }
        if let Some(name) = self.table_name.as_deref() {
            if name != table.table {
                return Err(mismatch("table", name, &table.table));
            }
        }
        Ok(())
    }
}

/// Parse a raw `/db/meta` body into the assignment for `table`.
pub fn parse_response(body: &[u8], table: &TableRef) -> Result<OnlineAssignment, QueryFailure> {
    let response: MetaResponse = serde_json::from_slice(body)
        .map_err(|e| QueryFailure::Malformed(format!("invalid envelope: {e}")))?;
    response.into_assignment(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clicks() -> TableRef {
        TableRef::new("ads", "clicks")
    }

    #[test]
    fn parse_table_meta_json() {
        let json = r#"
        {
          "Code": 0,
          "Error": "",
          "Data": {
            "GroupName": "default",
            "NodeId": 1,
            "Partitions": [
              { "Role": "LEADER", "PartitionId": 0, "DatabaseName": "ads", "TableName": "clicks", "Hash": 1 },
              { "Role": "FOLLOWER", "PartitionId": 2, "DatabaseName": "ads", "TableName": "clicks", "Hash": 2 }
            ]
          }
        }
        "#;

        let online = parse_response(json.as_bytes(), &clicks()).unwrap();
        assert_eq!(online, OnlineAssignment::new([PartitionId(0), PartitionId(2)]));
    }

    #[test]
    fn empty_partition_list_is_a_successful_empty_assignment() {
        let json = r#"{ "Code": 0, "Error": "", "Data": { "Partitions": [] } }"#;
        let online = parse_response(json.as_bytes(), &clicks()).unwrap();
        assert!(online.is_empty());
    }

    #[test]
    fn non_zero_code_is_a_failure() {
        let json = r#"{ "Code": 10002, "Error": "table not found", "Data": {} }"#;
        let err = parse_response(json.as_bytes(), &clicks()).unwrap_err();
        assert_eq!(
            err,
            QueryFailure::Service {
                code: 10002,
                message: "table not found".into()
            }
        );
    }

    #[test]
    fn missing_code_is_malformed() {
        let json = r#"{ "Data": { "Partitions": [] } }"#;
        let err = parse_response(json.as_bytes(), &clicks()).unwrap_err();
        assert!(matches!(err, QueryFailure::Malformed(_)));
    }

    #[test]
    fn missing_partitions_is_malformed() {
        for json in [
            r#"{ "Code": 0, "Data": { "GroupName": "g" } }"#,
            r#"{ "Code": 0, "Data": null }"#,
            r#"{ "Code": 0 }"#,
            r#"{ "Code": 0, "Data": { "Partitions": null } }"#,
        ] {
            let err = parse_response(json.as_bytes(), &clicks()).unwrap_err();
            assert!(matches!(err, QueryFailure::Malformed(_)), "{json}");
        }
    }

    #[test]
    fn invalid_partition_ids_are_malformed() {
        for json in [
            r#"{ "Code": 0, "Data": { "Partitions": [ { "PartitionId": -1 } ] } }"#,
            r#"{ "Code": 0, "Data": { "Partitions": [ { "PartitionId": "3" } ] } }"#,
            r#"{ "Code": 0, "Data": { "Partitions": [ { "Role": "LEADER" } ] } }"#,
        ] {
            let err = parse_response(json.as_bytes(), &clicks()).unwrap_err();
            assert!(matches!(err, QueryFailure::Malformed(_)), "{json}");
        }
    }

    #[test]
    fn partitions_of_another_table_are_rejected() {
        let json = r#"
        { "Code": 0, "Data": { "Partitions": [
            { "PartitionId": 0, "DatabaseName": "ads", "TableName": "views" }
        ] } }
        "#;
        let err = parse_response(json.as_bytes(), &clicks()).unwrap_err();
        assert!(err.to_string().contains("views"));
    }

    #[test]
    fn non_json_body_is_malformed() {
        let err = parse_response(b"<html>bad gateway</html>", &clicks()).unwrap_err();
        assert!(matches!(err, QueryFailure::Malformed(_)));
    }
}
