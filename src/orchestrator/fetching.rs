//! Bounded concurrent dispatch of fetch tasks

use futures::FutureExt;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PartitionFilter;
use crate::error::FetchError;
use crate::fetcher::ResourceFetcher;
use crate::summary::{TaskFailure, TaskSuccess};
use crate::types::{FetchTask, PartitionKey};

/// What came back from one dispatch round
#[derive(Debug, Default)]
pub(crate) struct FetchRound {
    pub successes: Vec<TaskSuccess>,
    pub failures: Vec<TaskFailure>,
    pub cancelled: bool,
}

/// Tasks ready for dispatch plus the ones rejected before any fetch
#[derive(Debug, Default)]
pub(crate) struct PreparedTasks {
    pub tasks: Vec<FetchTask>,
    pub rejected: Vec<TaskFailure>,
}

/// Apply the partition filter, drop duplicate partitions (the last task wins) and
/// reject tasks whose filename is already claimed
///
/// `reserved` holds filenames that are already settled for this run, such as
/// resources carried over by a resume. Among tasks that derive the same filename the
/// first one keeps it and the others become `filename_collision` failures, so no two
/// fetches ever write the same staging path.
pub(crate) fn prepare_tasks(
    tasks: Vec<FetchTask>,
    filter: Option<&PartitionFilter>,
    dataset: &str,
    reserved: &BTreeSet<String>,
) -> PreparedTasks {
    let mut order: Vec<PartitionKey> = Vec::new();
    let mut by_partition: HashMap<PartitionKey, FetchTask> = HashMap::new();
    let mut filtered = 0usize;

    for task in tasks {
        if filter.is_some_and(|f| !f.allows(&task.partition)) {
            filtered += 1;
            continue;
        }
        if by_partition.contains_key(&task.partition) {
            warn!(partition = %task.partition, "duplicate task for partition, keeping the last one");
        } else {
            order.push(task.partition.clone());
        }
        by_partition.insert(task.partition.clone(), task);
    }

    if filtered > 0 {
        debug!(filtered, "tasks excluded by partition filter");
    }

    let mut prepared = PreparedTasks::default();
    let mut claimed: HashMap<String, Option<PartitionKey>> =
        reserved.iter().map(|f| (f.clone(), None)).collect();
    for task in order.into_iter().filter_map(|p| by_partition.remove(&p)) {
        let filename = task.filename(dataset);
        match claimed.get(&filename) {
            Some(owner) => {
                warn!(
                    partition = %task.partition,
                    filename,
                    "filename already claimed by another partition, task rejected"
                );
                prepared
                    .rejected
                    .push(TaskFailure::filename_collision(task, &filename, owner.as_ref()));
            }
            None => {
                claimed.insert(filename, Some(task.partition.clone()));
                prepared.tasks.push(task);
            }
        }
    }
    prepared
}

/// Fetch every task with at most `limit` in flight
///
/// Once `cancel` fires no further task is started; tasks already in flight run to
/// completion and the rest are recorded as cancelled failures with zero attempts.
pub(crate) async fn dispatch(
    fetcher: Arc<ResourceFetcher>,
    tasks: Vec<FetchTask>,
    limit: usize,
    cancel: &CancellationToken,
) -> FetchRound {
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut in_flight = JoinSet::new();
    let mut round = FetchRound::default();
    let total = tasks.len();
    let mut pending = tasks.into_iter();

    info!(tasks = total, concurrency = limit, "dispatching fetch tasks");

    for task in pending.by_ref() {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = semaphore.clone().acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            round.cancelled = true;
            round.failures.push(TaskFailure::cancelled(task));
            break;
        };

        let fetcher = fetcher.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let result = AssertUnwindSafe(fetcher.fetch(&task))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| {
                    error!(partition = %task.partition, "fetch task panicked");
                    Err(FetchError {
                        partition: task.partition.clone(),
                        cause: "fetch task panicked".to_string(),
                        code: "panic".to_string(),
                        attempts: 1,
                    })
                });
            (task, result)
        });
    }

    if round.cancelled {
        let skipped: Vec<TaskFailure> = pending.map(TaskFailure::cancelled).collect();
        warn!(
            not_started = skipped.len() + 1,
            in_flight = in_flight.len(),
            "run cancelled, waiting for in-flight fetches"
        );
        round.failures.extend(skipped);
    }

    while let Some(joined) = in_flight.join_next().await {
        match joined {
            Ok((task, Ok(resource))) => round.successes.push(TaskSuccess { task, resource }),
            Ok((task, Err(e))) => round.failures.push(TaskFailure::from_fetch_error(task, &e)),
            // Panics are caught inside the task; only an abort lands here
            Err(e) => error!(error = %e, "fetch task did not complete"),
        }
    }

    info!(
        succeeded = round.successes.len(),
        failed = round.failures.len(),
        cancelled = round.cancelled,
        "fetch round complete"
    );
    round
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fetcher::staging::StagingArea;
    use crate::types::PartitionKey;
    use tempfile::tempdir;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task(year: i64, url: &str) -> FetchTask {
        FetchTask::file(PartitionKey::single("year", year), url, "csv")
    }

    async fn fetcher(root: &std::path::Path) -> Arc<ResourceFetcher> {
        let mut config = Config::for_dataset("ds");
        config.min_free_space = 0;
        config.retry.max_attempts = 0;
        let staging = StagingArea::create(root, "ds", "run").await.unwrap();
        Arc::new(ResourceFetcher::new(&config, staging).unwrap())
    }

    #[test]
    fn duplicates_keep_last_task_and_first_position() {
        let tasks = vec![
            task(2020, "http://a/1"),
            task(2021, "http://a/2"),
            task(2020, "http://a/3"),
        ];
        let prepared = prepare_tasks(tasks, None, "ds", &BTreeSet::new()).tasks;

        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].partition, PartitionKey::single("year", 2020));
        assert_eq!(prepared[0], task(2020, "http://a/3"));
    }

    #[test]
    fn tasks_sharing_a_filename_are_rejected() {
        let mut int_year = task(2020, "http://a/1");
        int_year.partition = PartitionKey::single("year", 2020);
        let mut text_year = task(2020, "http://a/2");
        text_year.partition = PartitionKey::single("year", "2020");
        assert_ne!(int_year.partition, text_year.partition);

        let prepared = prepare_tasks(
            vec![int_year.clone(), text_year, task(2021, "http://a/3")],
            None,
            "ds",
            &BTreeSet::new(),
        );

        assert_eq!(prepared.tasks, vec![int_year, task(2021, "http://a/3")]);
        assert_eq!(prepared.rejected.len(), 1);
        let rejected = &prepared.rejected[0];
        assert_eq!(rejected.code, "filename_collision");
        assert_eq!(rejected.attempts, 0);
        assert!(rejected.cause.contains("ds-year=2020.csv"), "{}", rejected.cause);
    }

    #[test]
    fn reserved_filenames_reject_new_tasks() {
        let reserved: BTreeSet<String> = ["ds-year=2020.csv".to_string()].into();
        let prepared = prepare_tasks(
            vec![task(2020, "http://a/1"), task(2021, "http://a/2")],
            None,
            "ds",
            &reserved,
        );
        assert_eq!(prepared.tasks, vec![task(2021, "http://a/2")]);
        assert_eq!(prepared.rejected[0].code, "filename_collision");
    }

    #[test]
    fn filter_drops_unselected_partitions() {
        let filter = PartitionFilter::only("year", [2021]);
        let prepared = prepare_tasks(
            vec![task(2020, "http://a/1"), task(2021, "http://a/2")],
            Some(&filter),
            "ds",
            &BTreeSet::new(),
        );
        assert_eq!(prepared.tasks, vec![task(2021, "http://a/2")]);
    }

    #[tokio::test]
    async fn every_task_is_accounted_for() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/ok/.*"))
            .respond_with(ResponseTemplate::new(200).set_body_string("a,b\n1,2\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex("^/gone/.*"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let tasks: Vec<FetchTask> = (2010..2020)
            .map(|year| {
                let prefix = if year % 3 == 0 { "gone" } else { "ok" };
                task(year, &format!("{}/{prefix}/{year}.csv", server.uri()))
            })
            .collect();

        let round = dispatch(fetcher(dir.path()).await, tasks, 3, &CancellationToken::new()).await;

        assert!(!round.cancelled);
        assert_eq!(round.successes.len() + round.failures.len(), 10);
        // 2010, 2013, 2016 and 2019
        assert_eq!(round.failures.len(), 4);
        assert!(round.failures.iter().all(|f| f.code == "http_error"));
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let dir = tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let tasks = vec![task(2020, "http://127.0.0.1:9/a"), task(2021, "http://127.0.0.1:9/b")];
        let round = dispatch(fetcher(dir.path()).await, tasks, 2, &cancel).await;

        assert!(round.cancelled);
        assert!(round.successes.is_empty());
        assert_eq!(round.failures.len(), 2);
        assert!(round
            .failures
            .iter()
            .all(|f| f.cause == "cancelled" && f.attempts == 0));
    }
}
