//! The LLM gateway: a single point of contact with the external
//! chat-completions endpoint.

use crate::prelude::*;

pub mod canonical;
pub mod openrouter;

/// Token usage reported by the provider for one chat-completion call.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Result of [`Gateway::answer_with_tool`].
#[derive(Clone, Debug)]
pub struct AnswerWithToolResult {
    /// The option the model chose, verbatim from the tool call arguments.
    pub answer: String,
    pub usage: TokenUsage,
    /// Canonical serialization of the outbound request.
    pub request_json: Value,
}

/// Result of [`Gateway::compress`].
#[derive(Clone, Debug)]
pub struct CompressResult {
    pub compressed_task: String,
    pub usage: TokenUsage,
    /// Canonical serialization of the outbound request.
    pub request_json: Value,
}

/// Gateway for the two LLM operations the evaluator needs. Implemented by
/// [`openrouter::OpenRouterGateway`] against a real endpoint, and by
/// hand-written stubs in tests.
#[async_trait]
pub trait Gateway: std::fmt::Debug + Send + Sync + 'static {
    /// Force the model to answer via the `answer_question` tool, with
    /// `answer` constrained to `options`. Fails when the model returns no
    /// tool call, returns no usage, or the transport fails.
    async fn answer_with_tool(
        &self,
        model: &str,
        system: &str,
        user: &str,
        options: &[String],
    ) -> Result<AnswerWithToolResult>;

    /// Ask the model to rewrite `task` under the system prompt
    /// `compressing_prompt`. Fails when the reply is empty or usage is
    /// absent.
    async fn compress(
        &self,
        model: &str,
        compressing_prompt: &str,
        task: &str,
    ) -> Result<CompressResult>;
}
