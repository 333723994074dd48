//! The polling scheduler: claims eligible Attempts and drives each one
//! through its per-test evaluation cycle until it completes or a test
//! fails.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::db::models::{Attempt, Test, TestCase, TestResultStatus};
use crate::evaluator::evaluate_compression;
use crate::llm::Gateway;
use crate::llm::canonical::to_canonical_string;
use crate::prelude::*;
use crate::repository::Repository;

/// Run the poll loop until `shutdown` is triggered. Each iteration looks
/// for an eligible Attempt; when none exists, sleeps for `poll_interval`
/// before trying again. The sleep and the inter-test checks both race
/// against `shutdown` so a signal received mid-cycle still lets the
/// in-flight `finalize_test_result` call land before the loop exits.
#[instrument(level = "info", skip_all)]
pub async fn run(
    repo: &Repository,
    gateway: &dyn Gateway,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            info!("tasker loop shutting down");
            return;
        }

        match repo.next_attempt_with_pending_work().await {
            Ok(Some(attempt)) => {
                if let Err(err) = process_attempt(repo, gateway, &attempt, &shutdown).await {
                    error!("error while processing attempt {}: {err:#}", attempt.id);
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => {
                        info!("tasker loop shutting down");
                        return;
                    }
                }
            }
            Err(err) => {
                error!("error polling for pending attempts: {err:#}");
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.cancelled() => {
                        info!("tasker loop shutting down");
                        return;
                    }
                }
            }
        }
    }
}

/// Evaluate every unfinished active test belonging to `attempt`, in
/// ascending `test.id` order, aggregating `average_compression_ratio`
/// from the tests that pass. A FAILED test aborts the cycle: the attempt
/// is left incomplete and is retried on a later poll once the FAILED row
/// is resolved out-of-band (spec's eligibility rule hides it until then).
#[instrument(level = "debug", skip(repo, gateway, shutdown), fields(attempt_id = attempt.id))]
async fn process_attempt(
    repo: &Repository,
    gateway: &dyn Gateway,
    attempt: &Attempt,
    shutdown: &CancellationToken,
) -> Result<()> {
    let tests = repo.unfinished_active_tests(attempt.id).await?;
    if tests.is_empty() {
        repo.mark_attempt_complete(attempt.id, 0.0).await?;
        return Ok(());
    }

    let mut tests_passed: u64 = 0;
    let mut ratio_sum: f64 = 0.0;

    for test in tests {
        if shutdown.is_cancelled() {
            info!(
                "tasker loop shutdown requested mid-attempt {}, leaving it for the next worker",
                attempt.id
            );
            return Ok(());
        }

        if !repo.claim_test_result(attempt.id, test.id).await? {
            debug!("test {} already claimed by another worker, skipping", test.id);
            continue;
        }

        match run_one_test(gateway, attempt, &test).await {
            Ok(outcome) if outcome.passed => {
                repo.finalize_test_result(
                    attempt.id,
                    test.id,
                    TestResultStatus::Valid,
                    Some(&outcome.compressed_prompt),
                    Some(outcome.compression_ratio),
                    Some(&outcome.request_json),
                )
                .await?;

                tests_passed += 1;
                ratio_sum += outcome.compression_ratio;
            }
            Ok(_) => {
                repo.finalize_test_result(attempt.id, test.id, TestResultStatus::Failed, None, None, None)
                    .await?;
                return Ok(());
            }
            Err(err) => {
                warn!("evaluation failed for test {}: {err:#}", test.id);
                repo.finalize_test_result(attempt.id, test.id, TestResultStatus::Failed, None, None, None)
                    .await?;
                return Ok(());
            }
        }
    }

    let average = if tests_passed > 0 { ratio_sum / tests_passed as f64 } else { 0.0 };
    repo.mark_attempt_complete(attempt.id, average).await?;
    Ok(())
}

struct TestOutcome {
    passed: bool,
    compressed_prompt: String,
    compression_ratio: f64,
    request_json: String,
}

async fn run_one_test(gateway: &dyn Gateway, attempt: &Attempt, test: &Test) -> Result<TestOutcome> {
    let test_case = TestCase::from_payload(&test.payload)?;
    let result = evaluate_compression(
        gateway,
        &test_case,
        &attempt.compressing_prompt,
        &attempt.model,
        &test.model,
        test.total_tokens.unwrap_or(0).max(0) as u64,
    )
    .await?;

    Ok(TestOutcome {
        passed: result.evaluation.passed,
        compressed_prompt: result.compressed_task,
        compression_ratio: result.compression_ratio,
        request_json: to_canonical_string(&result.request_json),
    })
}
