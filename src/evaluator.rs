//! Evaluation logic: running a test case against a model, and the
//! compress-then-evaluate pipeline that scores one compressing prompt.
//!
//! Neither operation here touches storage; both are safe to call
//! concurrently for distinct inputs.

use crate::db::models::TestCase;
use crate::llm::canonical::combine_requests;
use crate::llm::{Gateway, TokenUsage};
use crate::prelude::*;

/// Outcome of [`evaluate_prompt`].
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub passed: bool,
    pub usage: TokenUsage,
    pub request_json: Value,
}

/// Outcome of [`evaluate_compression`].
#[derive(Debug, Clone)]
pub struct TestCompressionResult {
    pub test_case: TestCase,
    pub compressed_task: String,
    pub compression_usage: TokenUsage,
    pub compression_ratio: f64,
    pub evaluation: EvaluationResult,
    pub request_json: Value,
}

/// Run `test_case` against `model` up to `attempts` times, never throwing.
/// Stops at the first failing iteration (gateway error or a mismatched
/// answer); usage from every attempted iteration, including the failing
/// one, is accumulated into the returned result.
#[instrument(level = "debug", skip(gateway, test_case), fields(model))]
pub async fn evaluate_prompt(
    gateway: &dyn Gateway,
    test_case: &TestCase,
    model: &str,
    attempts: u32,
) -> EvaluationResult {
    let mut usage = TokenUsage::default();
    let mut last_request_json = Value::Null;

    for _ in 0..attempts.max(1) {
        let outcome = gateway
            .answer_with_tool(model, ANSWER_SYSTEM_PROMPT, &test_case.task, &test_case.options)
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                warn!("answer_with_tool failed during evaluation: {err:#}");
                return EvaluationResult {
                    passed: false,
                    usage,
                    request_json: last_request_json,
                };
            }
        };

        usage += result.usage.clone();
        last_request_json = result.request_json.clone();

        if !answers_match(&result.answer, &test_case.correct_answer) {
            return EvaluationResult {
                passed: false,
                usage,
                request_json: last_request_json,
            };
        }
    }

    EvaluationResult {
        passed: true,
        usage,
        request_json: last_request_json,
    }
}

fn answers_match(given: &str, expected: &str) -> bool {
    given.trim().eq_ignore_ascii_case(expected.trim())
}

/// System instruction sent alongside every `answer_with_tool` call. The
/// options themselves are pinned into the tool's JSON schema, so this only
/// needs to point the model at the task.
const ANSWER_SYSTEM_PROMPT: &str =
    "Answer the following question by calling the answer_question function with exactly one of the allowed options.";

/// Compress `test_case.task` under `compressing_prompt`, then evaluate the
/// compressed task against `evaluation_model`, producing the compression
/// ratio relative to `uncompressed_total_tokens`.
#[instrument(level = "debug", skip(gateway, test_case), fields(compression_model, evaluation_model))]
pub async fn evaluate_compression(
    gateway: &dyn Gateway,
    test_case: &TestCase,
    compressing_prompt: &str,
    compression_model: &str,
    evaluation_model: &str,
    uncompressed_total_tokens: u64,
) -> Result<TestCompressionResult> {
    let compressed = gateway
        .compress(compression_model, compressing_prompt, &test_case.task)
        .await
        .context("compression call failed")?;

    let derived = TestCase {
        task: compressed.compressed_task.clone(),
        options: test_case.options.clone(),
        correct_answer: test_case.correct_answer.clone(),
    };

    let evaluation = evaluate_prompt(gateway, &derived, evaluation_model, 1).await;

    let compression_ratio = if evaluation.usage.total_tokens > 0 {
        uncompressed_total_tokens as f64 / evaluation.usage.total_tokens as f64
    } else {
        0.0
    };

    let request_json = combine_requests(compressed.request_json.clone(), evaluation.request_json.clone());

    Ok(TestCompressionResult {
        test_case: test_case.clone(),
        compressed_task: compressed.compressed_task,
        compression_usage: compressed.usage,
        compression_ratio,
        evaluation,
        request_json,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{AnswerWithToolResult, CompressResult};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Hand-written stub gateway: scripted answers and compressions, no
    /// mocking framework.
    #[derive(Debug, Default)]
    struct StubGateway {
        answers: Mutex<Vec<Result<AnswerWithToolResult, String>>>,
        compress_result: Mutex<Option<Result<CompressResult, String>>>,
        answer_calls: AtomicUsize,
    }

    #[async_trait]
    impl Gateway for StubGateway {
        async fn answer_with_tool(
            &self,
            _model: &str,
            _system: &str,
            _user: &str,
            _options: &[String],
        ) -> Result<AnswerWithToolResult> {
            self.answer_calls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                return Err(anyhow!("stub gateway exhausted"));
            }
            answers.remove(0).map_err(|msg| anyhow!(msg))
        }

        async fn compress(
            &self,
            _model: &str,
            _compressing_prompt: &str,
            _task: &str,
        ) -> Result<CompressResult> {
            self.compress_result
                .lock()
                .unwrap()
                .take()
                .expect("compress called without a scripted result")
                .map_err(|msg| anyhow!(msg))
        }
    }

    fn usage(total: u64) -> TokenUsage {
        TokenUsage {
            prompt_tokens: total / 2,
            completion_tokens: total - total / 2,
            total_tokens: total,
        }
    }

    fn sample_test_case() -> TestCase {
        TestCase {
            task: "What color is the sky?".to_owned(),
            options: vec!["blue".to_owned(), "green".to_owned()],
            correct_answer: "blue".to_owned(),
        }
    }

    #[tokio::test]
    async fn test_evaluate_prompt_passes_when_every_attempt_matches() {
        let gateway = StubGateway {
            answers: Mutex::new(vec![
                Ok(AnswerWithToolResult {
                    answer: "  Blue ".to_owned(),
                    usage: usage(10),
                    request_json: json!({"n": 1}),
                }),
                Ok(AnswerWithToolResult {
                    answer: "blue".to_owned(),
                    usage: usage(5),
                    request_json: json!({"n": 2}),
                }),
            ]),
            ..Default::default()
        };

        let result = evaluate_prompt(&gateway, &sample_test_case(), "gpt", 2).await;
        assert!(result.passed);
        assert_eq!(result.usage.total_tokens, 15);
        assert_eq!(result.request_json, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_evaluate_prompt_fails_on_mismatch_and_stops_early() {
        let gateway = StubGateway {
            answers: Mutex::new(vec![
                Ok(AnswerWithToolResult {
                    answer: "green".to_owned(),
                    usage: usage(10),
                    request_json: json!({"n": 1}),
                }),
                Ok(AnswerWithToolResult {
                    answer: "blue".to_owned(),
                    usage: usage(5),
                    request_json: json!({"n": 2}),
                }),
            ]),
            ..Default::default()
        };

        let result = evaluate_prompt(&gateway, &sample_test_case(), "gpt", 3).await;
        assert!(!result.passed);
        assert_eq!(result.usage.total_tokens, 10);
        assert_eq!(gateway.answer_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evaluate_prompt_never_throws_on_gateway_error() {
        let gateway = StubGateway::default();
        let result = evaluate_prompt(&gateway, &sample_test_case(), "gpt", 1).await;
        assert!(!result.passed);
        assert_eq!(result.usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn test_evaluate_compression_computes_ratio() {
        let gateway = StubGateway {
            answers: Mutex::new(vec![Ok(AnswerWithToolResult {
                answer: "blue".to_owned(),
                usage: usage(20),
                request_json: json!({"eval": true}),
            })]),
            compress_result: Mutex::new(Some(Ok(CompressResult {
                compressed_task: "Sky color?".to_owned(),
                usage: usage(8),
                request_json: json!({"compress": true}),
            }))),
            ..Default::default()
        };

        let result = evaluate_compression(&gateway, &sample_test_case(), "be brief", "comp", "eval", 100)
            .await
            .unwrap();

        assert!(result.evaluation.passed);
        assert_eq!(result.compression_ratio, 100.0 / 20.0);
        assert_eq!(
            result.request_json,
            json!({"compression_request": {"compress": true}, "evaluation_request": {"eval": true}})
        );
    }

    #[tokio::test]
    async fn test_evaluate_compression_zero_ratio_when_evaluation_has_no_usage() {
        let gateway = StubGateway {
            answers: Mutex::new(vec![]),
            compress_result: Mutex::new(Some(Ok(CompressResult {
                compressed_task: "Sky color?".to_owned(),
                usage: usage(8),
                request_json: json!({"compress": true}),
            }))),
            ..Default::default()
        };

        let result = evaluate_compression(&gateway, &sample_test_case(), "be brief", "comp", "eval", 100)
            .await
            .unwrap();

        assert!(!result.evaluation.passed);
        assert_eq!(result.compression_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_evaluate_compression_propagates_compress_failure() {
        let gateway = StubGateway {
            compress_result: Mutex::new(Some(Err("provider unavailable".to_owned()))),
            ..Default::default()
        };

        let result = evaluate_compression(&gateway, &sample_test_case(), "be brief", "comp", "eval", 100).await;
        assert!(result.is_err());
    }
}
