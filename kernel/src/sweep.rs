// Node Partition Sweep
//
// Runs one full garbage-collection pass over a node:
// databases → tables → online assignment → local partitions
// → reconcile → retire orphans.
//
// Table and partition failures are recorded in the report. Only an
// unusable node root or quarantine root aborts the sweep.

use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::adapters::metadata::{MetadataSource, QueryFailure};
use crate::config::ReaperConfig;
use crate::inventory::{InventoryScanner, ScanError};
use crate::liveness::LivenessGuard;
use crate::retention::{RetentionExecutor, RetentionMode, RetireOutcome};
use crate::state::reconcile::{missing_locally, reconcile};
use crate::state::{OnlineAssignment, PartitionId, SweepId, TableOutcome, TableRef};

/// Conditions that abort a whole sweep before anything is retired.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("node data root is unusable: {0}")]
    NodeRoot(#[source] ScanError),

    #[error("cannot create quarantine root {}: {source}", path.display())]
    QuarantineRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What happened to one orphaned partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionResult {
    Completed(RetireOutcome),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionReport {
    pub partition: PartitionId,
    pub result: PartitionResult,
}

/// Result of sweeping a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableReport {
    pub database: String,
    pub table: String,
    pub outcome: TableOutcome,
    pub local: BTreeSet<PartitionId>,
    /// `None` when the metadata query failed.
    pub online: Option<BTreeSet<PartitionId>>,
    pub orphans: BTreeSet<PartitionId>,
    /// Assigned to this node but not on disk.
    pub missing: BTreeSet<PartitionId>,
    pub partitions: Vec<PartitionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TableReport {
    fn skipped_no_metadata(table: TableRef, failure: &QueryFailure) -> Self {
        Self {
            database: table.database,
            table: table.table,
            outcome: TableOutcome::SkippedNoMetadata,
            local: BTreeSet::new(),
            online: None,
            orphans: BTreeSet::new(),
            missing: BTreeSet::new(),
            partitions: Vec::new(),
            error: Some(failure.to_string()),
        }
    }
}

/// Totals across all tables of a sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub tables_scanned: usize,
    pub tables_skipped_no_metadata: usize,
    pub tables_skipped_empty: usize,
    pub tables_reconciled: usize,
    /// Table directory existed but could not be listed.
    pub tables_unreadable: usize,
    pub partitions_retired: usize,
    pub partitions_busy: usize,
    pub partitions_already_absent: usize,
    pub partitions_would_retire: usize,
    pub partitions_failed: usize,
}

impl SweepSummary {
    fn record(&mut self, table: &TableReport) {
        self.tables_scanned += 1;
        match table.outcome {
            TableOutcome::SkippedNoMetadata => self.tables_skipped_no_metadata += 1,
            TableOutcome::SkippedEmpty => self.tables_skipped_empty += 1,
            TableOutcome::Reconciled => self.tables_reconciled += 1,
        }
        if table.error.is_some() && !matches!(table.outcome, TableOutcome::SkippedNoMetadata) {
            self.tables_unreadable += 1;
        }
        for partition in &table.partitions {
            match &partition.result {
                PartitionResult::Completed(outcome) => match outcome {
                    RetireOutcome::Quarantined { .. } | RetireOutcome::Deleted => {
                        self.partitions_retired += 1
                    }
                    RetireOutcome::Busy { .. } => self.partitions_busy += 1,
                    RetireOutcome::AlreadyAbsent => self.partitions_already_absent += 1,
                    RetireOutcome::WouldRetire { .. } => self.partitions_would_retire += 1,
                },
                PartitionResult::Failed(_) => self.partitions_failed += 1,
            }
        }
    }
}

/// Result of one full node sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepReport {
    pub sweep_id: SweepId,
    pub dry_run: bool,
    pub summary: SweepSummary,
    pub tables: Vec<TableReport>,
    pub duration_ms: u64,
}

impl SweepReport {
    fn new(sweep_id: SweepId, dry_run: bool, mut tables: Vec<TableReport>, elapsed: Duration) -> Self {
        tables.sort_by(|a, b| (&a.database, &a.table).cmp(&(&b.database, &b.table)));
        let mut summary = SweepSummary::default();
        for table in &tables {
            summary.record(table);
        }
        Self {
            sweep_id,
            dry_run,
            summary,
            tables,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    /// Some table or partition needs another sweep.
    pub fn has_failures(&self) -> bool {
        self.summary.tables_skipped_no_metadata > 0
            || self.summary.tables_unreadable > 0
            || self.summary.partitions_failed > 0
    }

    pub fn table(&self, table: &TableRef) -> Option<&TableReport> {
        self.tables
            .iter()
            .find(|t| t.database == table.database && t.table == table.table)
    }
}

/// Drives node sweeps against a metadata source.
pub struct Sweeper<M> {
    scanner: InventoryScanner,
    metadata: M,
    executor: RetentionExecutor,
    workers: usize,
    query_timeout: Duration,
    dry_run: bool,
}

impl<M: MetadataSource + 'static> Sweeper<M> {
    pub fn new(config: &ReaperConfig, metadata: M, guard: LivenessGuard) -> Self {
        Self {
            scanner: InventoryScanner::new(&config.node_dir),
            metadata,
            executor: RetentionExecutor::from_config(config, guard),
            workers: config.workers.max(1),
            query_timeout: config.metadata.query_timeout,
            dry_run: config.dry_run,
        }
    }

    /// Run one full sweep.
    ///
    /// Safe to run repeatedly: partitions retired earlier are skipped and
    /// partitions left behind by failures are picked up again.
    pub async fn run(&self) -> Result<SweepReport, SweepError> {
        let sweep_id = SweepId::new();
        let span = info_span!("sweep", %sweep_id);
        self.run_sweep(sweep_id).instrument(span).await
    }

    async fn run_sweep(&self, sweep_id: SweepId) -> Result<SweepReport, SweepError> {
        let started = Instant::now();
        info!(
            node_dir = %self.scanner.node_dir().display(),
            workers = self.workers,
            dry_run = self.dry_run,
            "starting sweep"
        );

        self.prepare_quarantine_root().await?;

        let scanner = self.scanner.clone();
        let tables = blocking(move || local_tables(&scanner)).await?;

        let reports: Vec<TableReport> = stream::iter(tables)
            .map(|table| {
                let span = info_span!("table", %table);
                self.sweep_table(table).instrument(span)
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let report = SweepReport::new(sweep_id, self.dry_run, reports, started.elapsed());
        let summary = &report.summary;
        info!(
            tables = summary.tables_scanned,
            skipped_no_metadata = summary.tables_skipped_no_metadata,
            unreadable = summary.tables_unreadable,
            retired = summary.partitions_retired,
            busy = summary.partitions_busy,
            failed = summary.partitions_failed,
            duration_ms = report.duration_ms,
            "sweep finished"
        );
        Ok(report)
    }

    async fn prepare_quarantine_root(&self) -> Result<(), SweepError> {
        let RetentionMode::Quarantine { dest_dir } = self.executor.mode() else {
            return Ok(());
        };
        if self.dry_run {
            return Ok(());
        }
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| SweepError::QuarantineRoot {
                path: dest_dir.clone(),
                source,
            })
    }

    async fn sweep_table(&self, table: TableRef) -> TableReport {
        let online = match tokio::time::timeout(
            self.query_timeout,
            self.metadata.fetch_online_partitions(&table),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(QueryFailure::Timeout(self.query_timeout)),
        };

        let online = match online {
            Ok(online) => online,
            Err(failure) => {
                warn!(error = %failure, "online partitions unavailable, skipping table");
                return TableReport::skipped_no_metadata(table, &failure);
            }
        };

        let scanner = self.scanner.clone();
        let executor = self.executor.clone();
        blocking(move || reconcile_table(&scanner, &executor, table, online)).await
    }
}

/// Every table directory on the node. Only the node root is fatal.
fn local_tables(scanner: &InventoryScanner) -> Result<Vec<TableRef>, SweepError> {
    let databases = scanner.list_databases().map_err(SweepError::NodeRoot)?;

    let mut tables = Vec::new();
    for database in databases {
        match scanner.list_tables(&database) {
            Ok(names) => tables.extend(names.into_iter().map(|name| TableRef::new(&database, name))),
            Err(err) => warn!(database = %database, error = %err, "cannot list database, skipping it"),
        }
    }
    Ok(tables)
}

fn reconcile_table(
    scanner: &InventoryScanner,
    executor: &RetentionExecutor,
    table: TableRef,
    online: OnlineAssignment,
) -> TableReport {
    let mut scan_error = None;
    let local = match scanner.list_partitions(&table) {
        Ok(local) => local,
        Err(err) if err.is_not_found() => {
            debug!(error = %err, "table directory vanished");
            BTreeSet::new()
        }
        Err(err) => {
            warn!(error = %err, "cannot list table, treating as empty");
            scan_error = Some(err.to_string());
            BTreeSet::new()
        }
    };

    let outcome = TableOutcome::classify(Some(&online), &local);
    let orphans = match outcome {
        TableOutcome::Reconciled => reconcile(&local, &online),
        _ => BTreeSet::new(),
    };

    let mut partitions = Vec::with_capacity(orphans.len());
    for &id in &orphans {
        let result = match executor.retire(&table, id) {
            Ok(outcome) => PartitionResult::Completed(outcome),
            Err(failure) => {
                error!(partition = %id, error = %failure, "failed to retire partition");
                PartitionResult::Failed(failure.to_string())
            }
        };
        partitions.push(PartitionReport {
            partition: id,
            result,
        });
    }

    info!(
        ?outcome,
        local = ?local,
        online = ?online.ids(),
        orphans = ?orphans,
        "table swept"
    );

    TableReport {
        database: table.database,
        table: table.table,
        outcome,
        missing: missing_locally(&local, &online),
        local,
        online: Some(online.ids().clone()),
        orphans,
        partitions,
        error: scan_error,
    }
}

/// Run blocking filesystem work off the async workers, inside the caller's span.
async fn blocking<T, F>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    match tokio::task::spawn_blocking(move || span.in_scope(f)).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetadataConfig;
    use crate::liveness::{Liveness, LivenessCheck};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    /// Metadata source answering from a fixed table of responses.
    #[derive(Default)]
    struct StaticSource {
        responses: HashMap<TableRef, Result<OnlineAssignment, QueryFailure>>,
        delay: Option<Duration>,
    }

    impl StaticSource {
        fn online(mut self, database: &str, table: &str, ids: &[u32]) -> Self {
            self.responses.insert(
                TableRef::new(database, table),
                Ok(OnlineAssignment::new(ids.iter().copied().map(PartitionId))),
            );
            self
        }

        fn failing(mut self, database: &str, table: &str, failure: QueryFailure) -> Self {
            self.responses
                .insert(TableRef::new(database, table), Err(failure));
            self
        }
    }

    #[async_trait]
    impl MetadataSource for StaticSource {
        async fn fetch_online_partitions(
            &self,
            table: &TableRef,
        ) -> Result<OnlineAssignment, QueryFailure> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.responses.get(table).cloned().unwrap_or_else(|| {
                Err(QueryFailure::Service {
                    code: 10001,
                    message: format!("unknown table {table}"),
                })
            })
        }
    }

    /// Fails for partitions whose directory name is listed.
    struct FailFor(&'static [&'static str]);

    impl LivenessCheck for FailFor {
        fn name(&self) -> &'static str {
            "fail-for"
        }

        fn check(&self, partition_dir: &Path) -> io::Result<Liveness> {
            let name = partition_dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if self.0.contains(&name) {
                Err(io::Error::new(io::ErrorKind::Other, "lsof unavailable"))
            } else {
                Ok(Liveness::Idle)
            }
        }
    }

    struct Node {
        root: TempDir,
    }

    impl Node {
        fn new(partitions: &[&str]) -> Self {
            let root = TempDir::new().unwrap();
            fs::create_dir_all(root.path().join("node")).unwrap();
            for partition in partitions {
                fs::create_dir_all(root.path().join("node").join(partition)).unwrap();
            }
            Self { root }
        }

        fn node(&self) -> PathBuf {
            self.root.path().join("node")
        }

        fn dest(&self) -> PathBuf {
            self.root.path().join("trash")
        }

        fn config(&self) -> ReaperConfig {
            ReaperConfig {
                node_dir: self.node(),
                dest_dir: self.dest(),
                workers: 4,
                metadata: MetadataConfig {
                    host: "127.0.0.1".into(),
                    port: 10022,
                    query_timeout: Duration::from_secs(2),
                },
                ..ReaperConfig::default()
            }
        }

        fn exists(&self, partition: &str) -> bool {
            self.node().join(partition).is_dir()
        }
    }

    fn ids(raw: &[u32]) -> BTreeSet<PartitionId> {
        raw.iter().copied().map(PartitionId).collect()
    }

    #[tokio::test]
    async fn orphans_are_quarantined_end_to_end() {
        let node = Node::new(&["ads/clicks/0", "ads/clicks/1", "ads/clicks/2", "ads/clicks/3"]);
        let source = StaticSource::default().online("ads", "clicks", &[0, 2]);

        let report = Sweeper::new(&node.config(), source, LivenessGuard::new())
            .run()
            .await
            .unwrap();

        assert!(node.exists("ads/clicks/0"));
        assert!(node.exists("ads/clicks/2"));
        assert!(!node.exists("ads/clicks/1"));
        assert!(!node.exists("ads/clicks/3"));
        assert!(node.dest().join("ads/clicks/1").is_dir());
        assert!(node.dest().join("ads/clicks/3").is_dir());

        assert_eq!(report.summary.partitions_retired, 2);
        assert_eq!(report.summary.partitions_failed, 0);
        assert!(!report.has_failures());

        let clicks = report.table(&TableRef::new("ads", "clicks")).unwrap();
        assert_eq!(clicks.outcome, TableOutcome::Reconciled);
        assert_eq!(clicks.orphans, ids(&[1, 3]));
    }

    #[tokio::test]
    async fn orphans_are_deleted_without_quarantine() {
        let node = Node::new(&["ads/clicks/0", "ads/clicks/1"]);
        let mut config = node.config();
        config.quarantine = false;
        let source = StaticSource::default().online("ads", "clicks", &[0]);

        let report = Sweeper::new(&config, source, LivenessGuard::new())
            .run()
            .await
            .unwrap();

        assert!(node.exists("ads/clicks/0"));
        assert!(!node.exists("ads/clicks/1"));
        assert!(!node.dest().exists());
        assert_eq!(report.summary.partitions_retired, 1);
    }

    #[tokio::test]
    async fn failed_queries_retire_nothing() {
        let node = Node::new(&[
            "ads/clicks/0",
            "ads/clicks/1",
            "ads/clicks/2",
            "ads/views/0",
            "ads/views/1",
            "ads/views/2",
            "ads/shows/0",
        ]);
        let source = StaticSource::default()
            .failing("ads", "clicks", QueryFailure::HttpStatus(500))
            .failing("ads", "views", QueryFailure::Malformed("truncated".into()));

        let report = Sweeper::new(&node.config(), source, LivenessGuard::new())
            .run()
            .await
            .unwrap();

        for partition in ["ads/clicks/0", "ads/clicks/1", "ads/clicks/2", "ads/views/0", "ads/shows/0"] {
            assert!(node.exists(partition), "{partition} was retired");
        }
        assert_eq!(report.summary.tables_skipped_no_metadata, 3);
        assert_eq!(report.summary.partitions_retired, 0);
        assert!(report.has_failures());

        let clicks = report.table(&TableRef::new("ads", "clicks")).unwrap();
        assert_eq!(clicks.online, None);
        assert!(clicks.error.as_deref().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn slow_metadata_source_times_out_and_skips() {
        let node = Node::new(&["ads/clicks/0", "ads/clicks/1"]);
        let mut config = node.config();
        config.metadata.query_timeout = Duration::from_millis(50);
        let source = StaticSource {
            delay: Some(Duration::from_secs(5)),
            ..StaticSource::default().online("ads", "clicks", &[])
        };

        let report = Sweeper::new(&config, source, LivenessGuard::new())
            .run()
            .await
            .unwrap();

        assert!(node.exists("ads/clicks/0"));
        assert!(node.exists("ads/clicks/1"));
        let clicks = report.table(&TableRef::new("ads", "clicks")).unwrap();
        assert_eq!(clicks.outcome, TableOutcome::SkippedNoMetadata);
    }

    #[tokio::test]
    async fn successful_empty_assignment_retires_everything() {
        let node = Node::new(&["ads/clicks/0", "ads/clicks/1", "ads/clicks/tmp"]);
        let source = StaticSource::default().online("ads", "clicks", &[]);

        let report = Sweeper::new(&node.config(), source, LivenessGuard::new())
            .run()
            .await
            .unwrap();

        assert_eq!(report.summary.partitions_retired, 2);
        assert!(node.exists("ads/clicks/tmp"));
    }

    #[tokio::test]
    async fn empty_tables_are_skipped() {
        let node = Node::new(&["ads/clicks", "ads/views/0"]);
        let source = StaticSource::default()
            .online("ads", "clicks", &[])
            .online("ads", "views", &[0, 1]);

        let report = Sweeper::new(&node.config(), source, LivenessGuard::new())
            .run()
            .await
            .unwrap();

        let clicks = report.table(&TableRef::new("ads", "clicks")).unwrap();
        assert_eq!(clicks.outcome, TableOutcome::SkippedEmpty);
        let views = report.table(&TableRef::new("ads", "views")).unwrap();
        assert_eq!(views.outcome, TableOutcome::Reconciled);
        assert_eq!(views.missing, ids(&[1]));
        assert_eq!(report.summary.tables_skipped_empty, 1);
        assert_eq!(report.summary.tables_reconciled, 1);
    }

    #[test]
    fn unreadable_table_is_reported() {
        let node = Node::new(&["ads"]);
        fs::write(node.node().join("ads/clicks"), b"not a directory").unwrap();
        let config = node.config();
        let scanner = InventoryScanner::new(&config.node_dir);
        let executor = RetentionExecutor::from_config(&config, LivenessGuard::new());

        let table = reconcile_table(
            &scanner,
            &executor,
            TableRef::new("ads", "clicks"),
            OnlineAssignment::new([PartitionId(0)]),
        );

        assert!(table.local.is_empty());
        assert!(table.orphans.is_empty());
        assert!(table.error.as_deref().is_some_and(|e| e.contains("clicks")));

        let report = SweepReport::new(SweepId::new(), false, vec![table], Duration::ZERO);
        assert_eq!(report.summary.tables_unreadable, 1);
        assert!(report.has_failures());
    }

    #[tokio::test]
    async fn retention_failure_is_isolated() {
        let node = Node::new(&[
            "ads/clicks/0",
            "ads/clicks/1",
            "ads/clicks/3",
            "ads/views/5",
        ]);
        let source = StaticSource::default()
            .online("ads", "clicks", &[0])
            .online("ads", "views", &[]);
        let mut guard = LivenessGuard::new();
        guard.register(FailFor(&["1"]));

        let report = Sweeper::new(&node.config(), source, guard)
            .run()
            .await
            .unwrap();

        assert!(node.exists("ads/clicks/1"));
        assert!(!node.exists("ads/clicks/3"));
        assert!(!node.exists("ads/views/5"));
        assert_eq!(report.summary.partitions_failed, 1);
        assert_eq!(report.summary.partitions_retired, 2);

        let clicks = report.table(&TableRef::new("ads", "clicks")).unwrap();
        let failed: Vec<_> = clicks
            .partitions
            .iter()
            .filter(|p| matches!(p.result, PartitionResult::Failed(_)))
            .map(|p| p.partition)
            .collect();
        assert_eq!(failed, vec![PartitionId(1)]);
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching_disk() {
        let node = Node::new(&["ads/clicks/0", "ads/clicks/1"]);
        let mut config = node.config();
        config.dry_run = true;
        let source = StaticSource::default().online("ads", "clicks", &[0]);

        let report = Sweeper::new(&config, source, LivenessGuard::new())
            .run()
            .await
            .unwrap();

        assert!(report.dry_run);
        assert!(node.exists("ads/clicks/1"));
        assert!(!node.dest().exists());
        assert_eq!(report.summary.partitions_would_retire, 1);
        assert_eq!(report.summary.partitions_retired, 0);
    }

    #[tokio::test]
    async fn second_sweep_finds_nothing_left() {
        let node = Node::new(&["ads/clicks/0", "ads/clicks/1"]);
        let sweeper = Sweeper::new(
            &node.config(),
            StaticSource::default().online("ads", "clicks", &[0]),
            LivenessGuard::new(),
        );

        let first = sweeper.run().await.unwrap();
        let second = sweeper.run().await.unwrap();

        assert_ne!(first.sweep_id, second.sweep_id);
        assert_eq!(first.summary.partitions_retired, 1);
        assert_eq!(second.summary.partitions_retired, 0);
        assert!(second.table(&TableRef::new("ads", "clicks")).unwrap().orphans.is_empty());
    }

    #[tokio::test]
    async fn missing_node_root_is_fatal() {
        let node = Node::new(&[]);
        let mut config = node.config();
        config.node_dir = node.root.path().join("absent");

        let err = Sweeper::new(&config, StaticSource::default(), LivenessGuard::new())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, SweepError::NodeRoot(_)));
    }

    #[tokio::test]
    async fn unusable_quarantine_root_is_fatal() {
        let node = Node::new(&["ads/clicks/1"]);
        fs::write(node.dest(), b"not a directory").unwrap();

        let err = Sweeper::new(
            &node.config(),
            StaticSource::default().online("ads", "clicks", &[]),
            LivenessGuard::new(),
        )
        .run()
        .await
        .unwrap_err();

        assert!(matches!(err, SweepError::QuarantineRoot { .. }));
        assert!(node.exists("ads/clicks/1"));
    }

    #[tokio::test]
    async fn report_serializes_to_json() {
        let node = Node::new(&["ads/clicks/0", "ads/clicks/1"]);
        let source = StaticSource::default().online("ads", "clicks", &[0]);

        let report = Sweeper::new(&node.config(), source, LivenessGuard::new())
            .run()
            .await
            .unwrap();
        let value = serde_json::to_value(&report).unwrap();

        assert_eq!(value["summary"]["partitions_retired"], 1);
        assert_eq!(value["tables"][0]["outcome"], "reconciled");
        assert_eq!(
            value["tables"][0]["partitions"][0]["result"]["completed"]["result"],
            "quarantined"
        );
    }
}
