//! Job store tests against a real MongoDB via testcontainers
//!
//! Run with `cargo test -p domain_jobs -- --ignored` (requires Docker).

use chrono::{Duration, Utc};
use domain_jobs::{
    HistoryEvent, JobError, JobHistory, JobRepository, JobStatus, JobType, MongoJobRepository,
    ProcessingError, QueueHealth, QueueHealthMetrics, QueueName, SubmitOptions, transitions,
};
use test_utils::{TestDataBuilder, TestMongo, assertions::assert_some};

async fn repository(mongo: &TestMongo, test: &str) -> (MongoJobRepository, TestDataBuilder) {
    let builder = TestDataBuilder::from_test_name(test);
    let repo = MongoJobRepository::new(&mongo.database(&builder.name("db", "jobs")));
    repo.init_indexes().await.unwrap();
    (repo, builder)
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_insert_find_and_save() {
    let mongo = TestMongo::new().await;
    let (repo, builder) = repository(&mongo, "insert_find_save").await;
    let now = Utc::now();

    let mut job = transitions::new_job(
        QueueName::SyncMarketplace,
        "sync-marketplace",
        JobType::MarketplaceSync,
        builder.job_payload(),
        &SubmitOptions::default(),
        now,
    )
    .unwrap();
    repo.insert(&job).await.unwrap();

    let stored = assert_some(repo.find(&job.job_id).await.unwrap(), "job should exist");
    assert_eq!(stored.job_id, job.job_id);
    assert_eq!(stored.status, JobStatus::Queued);
    assert_eq!(stored.data, job.data);
    assert_eq!(stored.user_id, builder.user_id().to_string());

    transitions::start(&mut job, now + Duration::milliseconds(250)).unwrap();
    repo.save(&job).await.unwrap();
    let stored = repo.find(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Processing);
    assert_eq!(stored.queue_wait_time_ms, Some(250));

    assert!(repo.find("nonexistent-id").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_duplicate_job_id_rejected() {
    let mongo = TestMongo::new().await;
    let (repo, builder) = repository(&mongo, "duplicate_job_id").await;

    let job = transitions::new_job(
        QueueName::AiScan,
        "ai-scan",
        JobType::AiProductScan,
        builder.job_payload(),
        &SubmitOptions::default(),
        Utc::now(),
    )
    .unwrap();
    repo.insert(&job).await.unwrap();

    assert!(matches!(
        repo.insert(&job).await,
        Err(JobError::DuplicateJob(id)) if id == job.job_id
    ));
}

#[tokio::test]
#[ignore = "requires docker"]
async fn test_counts_history_and_health() {
    let mongo = TestMongo::new().await;
    let (repo, builder) = repository(&mongo, "counts_history_health").await;
    let now = Utc::now();
    let queue = QueueName::SyncProducts;

    let make = |options: SubmitOptions| {
        transitions::new_job(
            queue,
            queue.alias(),
            JobType::ProductSync,
            builder.job_payload(),
            &options,
            now,
        )
        .unwrap()
    };

    let waiting = make(SubmitOptions::default());
    repo.insert(&waiting).await.unwrap();
    repo.insert(&make(
        SubmitOptions::default().with_delay(std::time::Duration::from_secs(600)),
    ))
    .await
    .unwrap();

    let mut failed = make(SubmitOptions::default().with_max_attempts(1));
    transitions::start(&mut failed, now).unwrap();
    transitions::fail_attempt(&mut failed, &ProcessingError::permanent("bad"), now).unwrap();
    repo.insert(&failed).await.unwrap();

    assert_eq!(
        repo.count_by_status(queue.physical(), JobStatus::Queued)
            .await
            .unwrap(),
        2
    );
    assert_eq!(repo.count_delayed(queue.physical(), now).await.unwrap(), 1);
    let finished = repo
        .finished_since(queue.physical(), now - Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].job_id, failed.job_id);

    repo.append_history(&transitions::created(&waiting))
        .await
        .unwrap();
    repo.append_history(&JobHistory::new(&waiting, HistoryEvent::Started))
        .await
        .unwrap();
    let history = repo.history(&waiting.job_id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].event, HistoryEvent::Created);

    for (offset, healthy) in [(2, false), (1, true)] {
        repo.record_health(&QueueHealth {
            queue_name: queue.physical().to_string(),
            is_healthy: healthy,
            metrics: QueueHealthMetrics::default(),
            timestamp: now - Duration::minutes(offset),
        })
        .await
        .unwrap();
    }
    let latest = assert_some(
        repo.latest_health(queue.physical()).await.unwrap(),
        "health snapshot should exist",
    );
    assert!(latest.is_healthy);
}
