//! OpenRouter-backed implementation of [`Gateway`], talking to
//! `{OPENROUTER_API_BASE_URL}/chat/completions` through `async-openai`'s
//! OpenAI-compatible client, the same way `prompt-scaler`'s `OpenAiDriver`
//! treats LiteLLM/Ollama as "OpenAI-compatible".

use std::time::Duration;

use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionNamedToolChoice, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestSystemMessageContent,
        ChatCompletionRequestUserMessageArgs, ChatCompletionRequestUserMessageContent,
        ChatCompletionTool, ChatCompletionToolChoiceOption, ChatCompletionToolType,
        CreateChatCompletionRequestArgs, CreateChatCompletionResponse, FunctionName,
        FunctionObjectArgs,
    },
};
use futures::{FutureExt as _, TryFutureExt as _};
use keen_retry::{ExponentialJitter, ResolvedResult};
use reqwest::header::{HeaderMap, HeaderValue};
use tokio::time;

use crate::config::OpenRouterConfig;
use crate::prelude::*;
use crate::retry::{IntoRetryResult as _, IsKnownTransient, retry_result_ok, try_with_retry_result};

use super::{AnswerWithToolResult, CompressResult, Gateway, TokenUsage};

/// Name of the forced tool used by `answer_with_tool`.
const ANSWER_TOOL_NAME: &str = "answer_question";

/// How long we wait for a single chat-completion call before giving up.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// An error which occurred while calling the LLM provider.
#[derive(Debug)]
enum LlmError {
    OpenAI(async_openai::error::OpenAIError),
    Timeout,
}

impl IsKnownTransient for LlmError {
    fn is_known_transient(&self) -> bool {
        match self {
            LlmError::OpenAI(err) => err.is_known_transient(),
            LlmError::Timeout => true,
        }
    }
}

impl std::fmt::Display for LlmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmError::OpenAI(err) => write!(f, "LLM provider error: {err}"),
            LlmError::Timeout => write!(f, "LLM request timed out"),
        }
    }
}

impl std::error::Error for LlmError {}

/// Gateway implementation that talks to OpenRouter (or any OpenAI-compatible
/// chat-completions endpoint).
#[derive(Debug)]
pub struct OpenRouterGateway {
    client: Client<OpenAIConfig>,
    timeout: Duration,
}

impl OpenRouterGateway {
    pub fn new(config: &OpenRouterConfig) -> Result<Self> {
        let client_config = OpenAIConfig::new()
            .with_api_key(config.api_key.clone())
            .with_api_base(config.api_base_url.clone());

        let http_client = build_http_client(config)?;
        let client = Client::with_config(client_config).with_http_client(http_client);

        Ok(Self {
            client,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Run a single chat-completion call, retrying transient transport
    /// failures a bounded number of times with exponential backoff. This is
    /// the only retrying this crate does on the request path; the tasker's
    /// outer claim/finalize loop is deliberately not retried here.
    async fn call_chat_completion(
        &self,
        req: &async_openai::types::CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse> {
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=10_000,
            re_attempts: 3,
            jitter_ratio: 0.2,
        };

        let result = self
            .call_chat_completion_once(req)
            .await
            .retry_with_async(|_| self.call_chat_completion_once(req))
            .with_exponential_jitter(|| jitter)
            .await;

        match result {
            ResolvedResult::Ok { output, .. } => Ok(output),
            ResolvedResult::Recovered {
                output,
                retry_errors,
                ..
            } => {
                warn!(
                    "LLM call succeeded after retrying {} time(s)",
                    retry_errors.len()
                );
                Ok(output)
            }
            ResolvedResult::Fatal { error, .. } => {
                Err(error).context("LLM provider call failed")
            }
            ResolvedResult::GivenUp { fatal_error, .. }
            | ResolvedResult::Unrecoverable { fatal_error, .. } => {
                Err(fatal_error).context("LLM provider call failed after exhausting retries")
            }
        }
    }

    async fn call_chat_completion_once(
        &self,
        req: &async_openai::types::CreateChatCompletionRequest,
    ) -> keen_retry::RetryResult<(), (), CreateChatCompletionResponse, anyhow::Error> {
        let chat = self.client.chat();
        let chat_future = chat.create_byot(req).map_err(LlmError::OpenAI).boxed();
        let timed = time::timeout(self.timeout, chat_future).map(|result| match result {
            Ok(inner) => inner,
            Err(_) => Err(LlmError::Timeout),
        });
        let chat_result: Value = try_with_retry_result!(
            timed.await.into_retry_result(LlmError::is_known_transient).map_err_to_anyhow()
        );
        let response = try_with_retry_result!(
            serde_json::from_value::<CreateChatCompletionResponse>(chat_result)
                .context("error parsing LLM provider response")
                .into_fatal()
        );
        retry_result_ok(response)
    }
}

/// Tiny adapter so `RetryResult<.., LlmError>` can flow through
/// `try_with_retry_result!` into a `RetryResult<.., anyhow::Error>`.
trait MapErrToAnyhow<T> {
    fn map_err_to_anyhow(self) -> keen_retry::RetryResult<(), (), T, anyhow::Error>;
}

impl<T> MapErrToAnyhow<T> for keen_retry::RetryResult<(), (), T, LlmError> {
    fn map_err_to_anyhow(self) -> keen_retry::RetryResult<(), (), T, anyhow::Error> {
        match self {
            keen_retry::RetryResult::Ok {
                reported_input,
                output,
            } => keen_retry::RetryResult::Ok {
                reported_input,
                output,
            },
            keen_retry::RetryResult::Transient { input, error } => {
                keen_retry::RetryResult::Transient {
                    input,
                    error: anyhow!(error.to_string()),
                }
            }
            keen_retry::RetryResult::Fatal { input, error } => keen_retry::RetryResult::Fatal {
                input,
                error: anyhow!(error.to_string()),
            },
        }
    }
}

fn build_http_client(config: &OpenRouterConfig) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if let Some(referer) = &config.http_referer {
        headers.insert("HTTP-Referer", HeaderValue::from_str(referer)?);
    }
    if let Some(title) = &config.x_title {
        headers.insert("X-Title", HeaderValue::from_str(title)?);
    }
    reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .context("failed to build HTTP client")
}

fn system_message(content: String) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestMessage::System(
        ChatCompletionRequestSystemMessageArgs::default()
            .content(ChatCompletionRequestSystemMessageContent::Text(content))
            .build()?,
    ))
}

fn user_message(content: String) -> Result<ChatCompletionRequestMessage> {
    Ok(ChatCompletionRequestMessage::User(
        ChatCompletionRequestUserMessageArgs::default()
            .content(ChatCompletionRequestUserMessageContent::Text(content))
            .build()?,
    ))
}

fn usage_from_response(response: &CreateChatCompletionResponse) -> Option<TokenUsage> {
    response.usage.as_ref().map(|usage| TokenUsage {
        prompt_tokens: u64::from(usage.prompt_tokens),
        completion_tokens: u64::from(usage.completion_tokens),
        total_tokens: u64::from(usage.total_tokens),
    })
}

#[async_trait]
impl Gateway for OpenRouterGateway {
    #[instrument(level = "debug", skip_all)]
    async fn answer_with_tool(
        &self,
        model: &str,
        system: &str,
        user: &str,
        options: &[String],
    ) -> Result<AnswerWithToolResult> {
        let messages = vec![
            system_message(system.to_owned())?,
            user_message(user.to_owned())?,
        ];

        let tool = ChatCompletionTool {
            r#type: ChatCompletionToolType::Function,
            function: FunctionObjectArgs::default()
                .name(ANSWER_TOOL_NAME)
                .description("Answer the question using exactly one of the provided options.")
                .parameters(json!({
                    "type": "object",
                    "properties": {
                        "answer": {
                            "type": "string",
                            "enum": options,
                        }
                    },
                    "required": ["answer"],
                    "additionalProperties": false,
                }))
                .strict(true)
                .build()?,
        };

        let tool_choice = ChatCompletionToolChoiceOption::Named(ChatCompletionNamedToolChoice {
            r#type: ChatCompletionToolType::Function,
            function: FunctionName {
                name: ANSWER_TOOL_NAME.to_owned(),
            },
        });

        let req = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .tools(vec![tool])
            .tool_choice(tool_choice)
            .build()
            .context("error building answer_with_tool request")?;

        let request_json = canonical_request_json(&req)?;

        let response = self.call_chat_completion(&req).await?;
        let usage = usage_from_response(&response)
            .ok_or_else(|| anyhow!("LLM provider response carried no usage counters"))?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| anyhow!("no choices in LLM provider response"))?;
        let tool_calls = choice
            .message
            .tool_calls
            .as_ref()
            .filter(|calls| !calls.is_empty())
            .ok_or_else(|| anyhow!("model did not call {ANSWER_TOOL_NAME}"))?;
        let call = &tool_calls[0];
        let arguments: Value = serde_json::from_str(&call.function.arguments)
            .context("failed to parse tool call arguments as JSON")?;
        let answer = arguments
            .get("answer")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("tool call arguments missing \"answer\" field"))?
            .to_owned();

        Ok(AnswerWithToolResult {
            answer,
            usage,
            request_json,
        })
    }

    #[instrument(level = "debug", skip_all)]
    async fn compress(
        &self,
        model: &str,
        compressing_prompt: &str,
        task: &str,
    ) -> Result<CompressResult> {
        let messages = vec![
            system_message(compressing_prompt.to_owned())?,
            user_message(task.to_owned())?,
        ];

        let req = CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages(messages)
            .build()
            .context("error building compress request")?;

        let request_json = canonical_request_json(&req)?;

        let response = self.call_chat_completion(&req).await?;
        let usage = usage_from_response(&response)
            .ok_or_else(|| anyhow!("LLM provider response carried no usage counters"))?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| anyhow!("no choices in LLM provider response"))?;
        let compressed_task = choice.message.content.as_deref().unwrap_or_default().to_owned();
        if compressed_task.trim().is_empty() {
            return Err(anyhow!("model returned an empty compression reply"));
        }

        Ok(CompressResult {
            compressed_task,
            usage,
            request_json,
        })
    }
}

/// Turn an outbound request into its canonical (key-sorted) JSON
/// representation, for audit storage in `request_json`.
fn canonical_request_json(
    req: &async_openai::types::CreateChatCompletionRequest,
) -> Result<Value> {
    serde_json::to_value(req).context("failed to serialize outbound LLM request")
}
