//! Integration tests for the repository layer against a real Postgres
//! instance, covering the scenarios named in the system's worked
//! examples: the happy path, a concurrent claim race, and ingestion
//! idempotence.

use compression_tasker::config::{DbConfig, DbType};
use compression_tasker::db;
use compression_tasker::db::models::{TestCase, TestResultStatus};
use compression_tasker::repository::{NewTest, Repository};
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::{ContainerAsync, runners::AsyncRunner};

async fn setup() -> (ContainerAsync<Postgres>, Repository) {
    let container = Postgres::default()
        .start()
        .await
        .expect("failed to start postgres container");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get container port");

    let config = DbConfig {
        db_type: DbType::Postgres,
        host: "127.0.0.1".to_owned(),
        port,
        username: "postgres".to_owned(),
        password: "postgres".to_owned(),
        database: "postgres".to_owned(),
        ssl: false,
        synchronize: true,
    };

    let pool = db::connect(&config).await.expect("failed to connect to test database");
    let repo = Repository::new(pool);
    (container, repo)
}

async fn insert_test_user(repo: &Repository) {
    repo.insert_admin_user("owner", "owner@example.com", "hash")
        .await
        .expect("failed to insert test user");
}

fn sample_payload() -> String {
    TestCase {
        task: "What color is the sky on a clear day?".to_owned(),
        options: vec!["blue".to_owned(), "green".to_owned()],
        correct_answer: "blue".to_owned(),
    }
    .to_payload()
    .unwrap()
}

async fn insert_attempt(repo: &Repository, login: &str, model: &str) -> i64 {
    let pool = repo.pool_for_tests();
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO attempts (compressing_prompt, model, login) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind("Summarize tersely.")
    .bind(model)
    .bind(login)
    .fetch_one(pool)
    .await
    .expect("failed to insert attempt");
    row.0
}

#[tokio::test]
async fn test_upsert_tests_is_idempotent() {
    let (_container, repo) = setup().await;
    let rows = vec![NewTest {
        model: "eval-model".to_owned(),
        payload: sample_payload(),
        is_active: true,
        total_tokens: Some(100),
    }];

    let first = repo.upsert_tests(&rows).await.unwrap();
    let second = repo.upsert_tests(&rows).await.unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 0);
}

#[tokio::test]
async fn test_happy_path_single_test_completes_attempt() {
    let (_container, repo) = setup().await;
    insert_test_user(&repo).await;

    repo.upsert_tests(&[NewTest {
        model: "eval-model".to_owned(),
        payload: sample_payload(),
        is_active: true,
        total_tokens: Some(100),
    }])
    .await
    .unwrap();

    let attempt_id = insert_attempt(&repo, "owner", "compress-model").await;

    let attempt = repo.next_attempt_with_pending_work().await.unwrap();
    assert_eq!(attempt.unwrap().id, attempt_id);

    let tests = repo.unfinished_active_tests(attempt_id).await.unwrap();
    assert_eq!(tests.len(), 1);
    let test = &tests[0];

    assert!(repo.claim_test_result(attempt_id, test.id).await.unwrap());
    repo.finalize_test_result(
        attempt_id,
        test.id,
        TestResultStatus::Valid,
        Some("compressed"),
        Some(2.5),
        Some("{}"),
    )
    .await
    .unwrap();
    repo.mark_attempt_complete(attempt_id, 2.5).await.unwrap();

    let attempt = repo.next_attempt_with_pending_work().await.unwrap();
    assert!(attempt.is_none(), "completed attempt should no longer be eligible");
}

#[tokio::test]
async fn test_claim_is_exclusive_between_workers() {
    let (_container, repo) = setup().await;
    insert_test_user(&repo).await;

    repo.upsert_tests(&[NewTest {
        model: "eval-model".to_owned(),
        payload: sample_payload(),
        is_active: true,
        total_tokens: Some(100),
    }])
    .await
    .unwrap();
    let attempt_id = insert_attempt(&repo, "owner", "compress-model").await;
    let tests = repo.unfinished_active_tests(attempt_id).await.unwrap();
    let test_id = tests[0].id;

    let first_claim = repo.claim_test_result(attempt_id, test_id).await.unwrap();
    let second_claim = repo.claim_test_result(attempt_id, test_id).await.unwrap();
    assert!(first_claim);
    assert!(!second_claim, "a second worker must not also claim the same slot");
}

#[tokio::test]
async fn test_crashed_worker_pending_row_is_swept_up() {
    let (_container, repo) = setup().await;
    insert_test_user(&repo).await;

    repo.upsert_tests(&[NewTest {
        model: "eval-model".to_owned(),
        payload: sample_payload(),
        is_active: true,
        total_tokens: Some(100),
    }])
    .await
    .unwrap();
    let attempt_id = insert_attempt(&repo, "owner", "compress-model").await;
    let tests = repo.unfinished_active_tests(attempt_id).await.unwrap();
    let test_id = tests[0].id;

    // Simulate a worker that claimed the slot and crashed before finalizing.
    repo.claim_test_result(attempt_id, test_id).await.unwrap();

    let still_unfinished = repo.unfinished_active_tests(attempt_id).await.unwrap();
    assert_eq!(still_unfinished.len(), 1, "the PENDING row must be swept up again");
}

#[tokio::test]
async fn test_attempt_with_zero_active_tests_completes_immediately_with_zero_average() {
    let (_container, repo) = setup().await;
    insert_test_user(&repo).await;

    let attempt_id = insert_attempt(&repo, "owner", "compress-model").await;
    let tests = repo.unfinished_active_tests(attempt_id).await.unwrap();
    assert!(tests.is_empty());

    // An attempt with zero active tests is still eligible the first time
    // it's selected, so it can be driven straight to completion.
    let attempt = repo.next_attempt_with_pending_work().await.unwrap();
    assert_eq!(attempt.unwrap().id, attempt_id);

    repo.mark_attempt_complete(attempt_id, 0.0).await.unwrap();

    let attempt = repo.next_attempt_with_pending_work().await.unwrap();
    assert!(attempt.is_none(), "completed attempt should no longer be eligible");
}

#[tokio::test]
async fn test_failed_result_makes_attempt_ineligible() {
    let (_container, repo) = setup().await;
    insert_test_user(&repo).await;

    repo.upsert_tests(&[NewTest {
        model: "eval-model".to_owned(),
        payload: sample_payload(),
        is_active: true,
        total_tokens: Some(100),
    }])
    .await
    .unwrap();
    let attempt_id = insert_attempt(&repo, "owner", "compress-model").await;
    let tests = repo.unfinished_active_tests(attempt_id).await.unwrap();
    let test_id = tests[0].id;

    repo.claim_test_result(attempt_id, test_id).await.unwrap();
    repo.finalize_test_result(attempt_id, test_id, TestResultStatus::Failed, None, None, None)
        .await
        .unwrap();

    let attempt = repo.next_attempt_with_pending_work().await.unwrap();
    assert!(attempt.is_none(), "a FAILED test_result must hide the attempt");
}
