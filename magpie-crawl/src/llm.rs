//! LLM-backed query transform
//!
//! Implements the [`QueryTransform`] seam on top of a generic chat
//! backend. OpenAI-compatible APIs go through `async-openai`; Anthropic's
//! Messages API is called directly.

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use magpie_core::SearchResult;

use crate::providers::{QueryTransform, TransformError};

/// Generic chat-completion backend
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generate a completion with a system prompt
    async fn generate(&self, system: &str, user: &str) -> Result<String, TransformError>;

    /// Model identifier, for logs
    fn model_name(&self) -> &str;
}

/// Thread-safe reference to a backend
pub type SharedBackend = Arc<dyn LlmBackend>;

/// OpenAI-compatible backend configuration
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    /// Override for OpenRouter, local servers, etc.
    pub base_url: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u16,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            max_tokens: 4096,
        }
    }
}

/// OpenAI-compatible backend
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    config: OpenAiConfig,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Self {
        let mut api_config = OpenAIConfig::new().with_api_key(&config.api_key);
        if let Some(base_url) = &config.base_url {
            api_config = api_config.with_api_base(base_url);
        }

        Self {
            client: Client::with_config(api_config),
            config,
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn generate(&self, system: &str, user: &str) -> Result<String, TransformError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .map_err(|e| TransformError::Provider(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()
                    .map_err(|e| TransformError::Provider(e.to_string()))?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.config.model)
            .messages(messages)
            .temperature(self.config.temperature)
            .max_tokens(self.config.max_tokens)
            .build()
            .map_err(|e| TransformError::Provider(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| TransformError::Provider(e.to_string()))?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or(TransformError::EmptyResponse)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Anthropic backend configuration
#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
}

impl AnthropicConfig {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: 4096,
        }
    }
}

/// Anthropic Messages API backend
pub struct AnthropicBackend {
    client: reqwest::Client,
    config: AnthropicConfig,
}

impl AnthropicBackend {
    pub fn new(config: AnthropicConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl LlmBackend for AnthropicBackend {
    async fn generate(&self, system: &str, user: &str) -> Result<String, TransformError> {
        let body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": system,
            "messages": [
                {"role": "user", "content": user}
            ]
        });

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| TransformError::Provider(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(TransformError::RateLimited);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransformError::Provider(format!(
                "Anthropic API error {}: {}",
                status, text
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransformError::Provider(e.to_string()))?;

        json["content"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(|block| block["text"].as_str())
            .map(|s| s.to_string())
            .ok_or(TransformError::EmptyResponse)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Create a shared OpenAI-compatible backend
pub fn create_openai_backend(config: OpenAiConfig) -> SharedBackend {
    Arc::new(OpenAiBackend::new(config))
}

/// Create a shared Anthropic backend
pub fn create_anthropic_backend(config: AnthropicConfig) -> SharedBackend {
    Arc::new(AnthropicBackend::new(config))
}

const REFINE_PROMPT: &str = r#"
You are a Cybercrime Threat Intelligence Expert. Your task is to refine the provided user query that needs to be sent to darkweb search engines.

Rules:
1. Analyze the user query and think about how it can be improved to use as search engine query
2. Refine the user query by adding or removing words so that it returns the best result from dark web search engines
3. Don't use any logical operators (AND, OR, etc.)
4. Output just the refined query and nothing else

INPUT:
"#;

const FILTER_PROMPT: &str = r#"
You are a Cybercrime Threat Intelligence Expert. You are given a dark web search query and a list of search results in the form of index, link and title.
Your task is to select the top {top_n} relevant results that best match the search query for the user to investigate further.

Rules:
1. Output ONLY at most the top {top_n} indices (comma-separated list) that best match the input query

Search Query: {query}
Search Results:
"#;

const SUMMARY_PROMPT: &str = r#"
You are a Cybercrime Threat Intelligence Expert tasked with generating context-based technical investigative insights from dark web OSINT search engine results.

Rules:
1. Analyze the dark web OSINT data provided using links and their raw text.
2. Output the source links referenced for the analysis.
3. Provide a detailed, contextual, evidence-based technical analysis of the data.
4. Provide intelligence artifacts along with their context visible in the data.
5. The artifacts can include indicators like name, email, phone, cryptocurrency addresses, domains, darkweb markets, forum names, threat actor information, malware names, TTPs, etc.
6. Generate 3-5 key insights based on the data.
7. Each insight should be specific, actionable, context-based, and data-driven.
8. Include suggested next steps and queries for investigating more on the topic.
9. Be objective and analytical in your assessment.
10. Ignore not safe for work texts from the analysis.

Output Format:
1. Input Query: {query}
2. Source Links Referenced for Analysis
3. Investigation Artifacts
4. Key Insights
5. Next Steps

Format your response in a structured way with clear section headings.

INPUT:
"#;

/// [`QueryTransform`] backed by a chat model
pub struct LlmTransform {
    backend: SharedBackend,
}

impl LlmTransform {
    pub fn new(backend: SharedBackend) -> Self {
        Self { backend }
    }

    /// Index/link/title lines for the filter prompt. Onion links are cut
    /// at the address so long result paths don't blow the context.
    fn format_results(results: &[SearchResult]) -> String {
        results
            .iter()
            .enumerate()
            .filter_map(|(i, result)| {
                let link: String = match result.link.find(".onion") {
                    Some(pos) => result.link[..pos + 6].to_string(),
                    None => result.link.chars().take(60).collect(),
                };
                let title: String = result
                    .title
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                            c
                        } else {
                            ' '
                        }
                    })
                    .collect();
                let title = title.trim().to_string();
                if link.is_empty() && title.is_empty() {
                    return None;
                }
                Some(format!("{}. {} - {}", i + 1, link, title))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Pull 1-based indices out of a model reply
fn parse_indices(reply: &str, len: usize, top_n: usize) -> Vec<usize> {
    reply
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|s| s.parse::<usize>().ok())
        .filter(|&idx| idx >= 1 && idx <= len)
        .take(top_n)
        .collect()
}

#[async_trait]
impl QueryTransform for LlmTransform {
    async fn refine(&self, query: &str) -> Result<String, TransformError> {
        let refined = self.backend.generate(REFINE_PROMPT, query).await?;
        let refined = refined.trim().to_string();
        if refined.is_empty() {
            return Err(TransformError::EmptyResponse);
        }
        info!("Query refined: {:?} -> {:?}", query, refined);
        Ok(refined)
    }

    async fn filter_relevant(
        &self,
        query: &str,
        results: &[SearchResult],
        top_n: usize,
    ) -> Result<Vec<SearchResult>, TransformError> {
        if results.is_empty() {
            return Ok(Vec::new());
        }

        let system = FILTER_PROMPT
            .replace("{query}", query)
            .replace("{top_n}", &top_n.to_string());
        let listing = Self::format_results(results);

        let reply = self.backend.generate(&system, &listing).await?;
        let indices = parse_indices(&reply, results.len(), top_n);

        if indices.is_empty() {
            warn!("Filter reply had no usable indices, keeping the first {}", top_n);
            return Ok(results.iter().take(top_n).cloned().collect());
        }

        info!("Filtered {} results down to {}", results.len(), indices.len());
        Ok(indices.into_iter().map(|i| results[i - 1].clone()).collect())
    }

    async fn summarize(
        &self,
        query: &str,
        content: &HashMap<String, String>,
    ) -> Result<String, TransformError> {
        if content.is_empty() {
            return Ok(format!(
                "# Investigation Summary\n\n**Query:** {}\n\n**Status:** No content found to analyze.",
                query
            ));
        }

        // Sort by URL so the prompt is reproducible for a given content map
        let mut pages: Vec<(&String, &String)> = content.iter().collect();
        pages.sort_by_key(|(url, _)| url.as_str());

        let content_block = pages
            .iter()
            .take(20)
            .map(|(url, text)| {
                let snippet: String = text.chars().take(2000).collect();
                format!("URL: {}\nContent: {}", url, snippet)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let system = SUMMARY_PROMPT.replace("{query}", query);
        let summary = self.backend.generate(&system, &content_block).await?;
        info!("Summary generated ({} chars)", summary.len());
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubBackend {
        reply: String,
    }

    #[async_trait]
    impl LlmBackend for StubBackend {
        async fn generate(&self, _system: &str, _user: &str) -> Result<String, TransformError> {
            Ok(self.reply.clone())
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn transform(reply: &str) -> LlmTransform {
        LlmTransform::new(Arc::new(StubBackend {
            reply: reply.to_string(),
        }))
    }

    fn results(n: usize) -> Vec<SearchResult> {
        (0..n)
            .map(|i| SearchResult::new(format!("Result {}", i + 1), format!("http://r{}.onion/", i + 1)))
            .collect()
    }

    #[tokio::test]
    async fn test_refine_trims_reply() {
        let t = transform("  stolen credentials marketplace \n");
        let refined = t.refine("stolen credentials").await.unwrap();
        assert_eq!(refined, "stolen credentials marketplace");
    }

    #[tokio::test]
    async fn test_filter_selects_indices_in_reply_order() {
        let t = transform("3, 1");
        let selected = t.filter_relevant("q", &results(4), 20).await.unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].title, "Result 3");
        assert_eq!(selected[1].title, "Result 1");
    }

    #[tokio::test]
    async fn test_filter_garbage_reply_falls_back_to_first_n() {
        let t = transform("no indices here");
        let selected = t.filter_relevant("q", &results(5), 3).await.unwrap();
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].title, "Result 1");
    }

    #[test]
    fn test_parse_indices_bounds() {
        let indices = parse_indices("0, 2, 7, 3", 5, 20);
        assert_eq!(indices, vec![2, 3]);
    }

    #[test]
    fn test_format_results_cuts_onion_paths() {
        let listing = LlmTransform::format_results(&[SearchResult::new(
            "Leaked-DB dump!",
            "http://abcdef.onion/very/long/path?x=1",
        )]);
        assert_eq!(listing, "1. http://abcdef.onion - Leaked-DB dump");
    }

    #[tokio::test]
    async fn test_summarize_empty_content_short_circuits() {
        let t = transform("should not be used");
        let summary = t.summarize("q", &HashMap::new()).await.unwrap();
        assert!(summary.contains("No content found"));
    }
}
