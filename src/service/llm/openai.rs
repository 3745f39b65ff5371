//! Integration with Large Language Model services.
//!
//! This module provides a thin wrapper around the OpenAI chat completions API
//! for answering user messages, optionally letting the model fetch web pages
//! through a tool, and for querying the account balance.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::base::{
    config::Config,
    types::{AiMode, Balance, ChatMessage, Res, Role},
};
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{
        ChatCompletionMessageToolCall, ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestToolMessageArgs, ChatCompletionRequestUserMessageArgs, ChatCompletionResponseMessage, ChatCompletionTool, ChatCompletionToolArgs,
        ChatCompletionToolType, CreateChatCompletionRequest, CreateChatCompletionRequestArgs, FunctionObjectArgs,
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Url, header::LOCATION, redirect::Policy};
use serde::Deserialize;
use serde_with::{TimestampSeconds, serde_as};
use tokio::time::timeout;
use tracing::{info, instrument, warn};

use super::{GenericLlmClient, LlmClient};

/// Maximum number of tool rounds before giving up on a tool-augmented completion.
const MAX_TOOL_ROUNDS: usize = 4;

/// Maximum number of characters of a fetched page handed back to the model.
const MAX_PAGE_CHARS: usize = 12_000;

/// Bound on a single page fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Maximum number of redirects followed by a page fetch.
const MAX_REDIRECTS: usize = 3;

// Extra methods on `LlmClient` applied by the openai implementation.

impl LlmClient {
    pub fn openai(config: &Config) -> Res<Self> {
        let client = OpenAiLlmClient::new(config)?;
        Ok(Self { inner: Arc::new(client) })
    }
}

// Specific implementations.

/// OpenAI LLM client implementation.
#[derive(Clone)]
pub struct OpenAiLlmClient {
    client: Client<OpenAIConfig>,
    http: reqwest::Client,
    config: Config,
}

impl OpenAiLlmClient {
    /// Create a new OpenAI LLM client.
    #[instrument(name = "OpenAiLlmClient::new", skip_all)]
    pub fn new(config: &Config) -> Res<Self> {
        let cfg = OpenAIConfig::new().with_api_key(config.openai_api_key.clone()).with_api_base(config.openai_api_base.clone());

        // Redirects are followed by hand, so every hop goes through `ensure_public_host`.
        let http = reqwest::Client::builder().redirect(Policy::none()).build()?;

        Ok(Self {
            client: Client::with_config(cfg),
            http,
            config: config.clone(),
        })
    }

    /// Build a chat completion request for the history.
    fn build_request(&self, messages: Vec<ChatCompletionRequestMessage>, mode: AiMode, tools: Option<&[ChatCompletionTool]>) -> Res<CreateChatCompletionRequest> {
        let mut request = CreateChatCompletionRequestArgs::default();

        request
            .model(&self.config.openai_model)
            .max_completion_tokens(self.config.openai_max_tokens)
            .temperature(mode.temperature())
            .messages(messages);

        if let Some(tools) = tools {
            request.tools(tools.to_vec());
        }

        Ok(request.build()?)
    }

    /// Helper function to make OpenAI API calls with retry logic and timeout handling.
    ///
    /// Each attempt is bounded by `openai_request_timeout`, which is shorter than the
    /// caller's overall `call_timeout`, so a stalled attempt can still be retried.
    async fn call_openai_api(&self, request: CreateChatCompletionRequest) -> Res<ChatCompletionResponseMessage> {
        const MAX_RETRIES: u32 = 2;
        const RETRY_DELAY_MS: u64 = 1000;

        let mut retries = 0;

        loop {
            let result = timeout(self.config.openai_request_timeout, self.client.chat().create(request.clone())).await;

            match result {
                Ok(Ok(response)) => {
                    info!("OpenAI API call succeeded after {} attempts", retries + 1);

                    let choice = response.choices.into_iter().next().ok_or_else(|| anyhow::anyhow!("OpenAI returned no choices."))?;

                    return Ok(choice.message);
                }
                Ok(Err(err)) => {
                    if retries >= MAX_RETRIES {
                        return Err(anyhow::anyhow!("OpenAI API call failed after {MAX_RETRIES} retries: {err}"));
                    }
                    retries += 1;
                    warn!("OpenAI API call failed, retrying {retries}/{MAX_RETRIES}: {err}");
                }
                Err(_) => {
                    if retries >= MAX_RETRIES {
                        return Err(anyhow::anyhow!("OpenAI API call timed out after {MAX_RETRIES} attempts"));
                    }
                    retries += 1;
                    warn!("OpenAI API call timed out, retrying {retries}/{MAX_RETRIES}");
                }
            }

            let delay = Duration::from_millis(RETRY_DELAY_MS * 2_u64.pow(retries - 1));
            tokio::time::sleep(delay).await;
        }
    }

    /// Run one tool call, returning the text handed back to the model.
    ///
    /// Tool failures are reported to the model rather than failing the completion.
    #[instrument(skip_all, fields(tool = %call.function.name))]
    async fn run_tool(&self, call: &ChatCompletionMessageToolCall) -> String {
        let result = match call.function.name.as_str() {
            "fetch_url" => match serde_json::from_str::<FetchUrlArgs>(&call.function.arguments) {
                Ok(args) => self.fetch_url(&args.url).await,
                Err(err) => Err(anyhow::anyhow!("Invalid arguments: {err}")),
            },
            other => Err(anyhow::anyhow!("Unknown tool `{other}`.")),
        };

        result.unwrap_or_else(|err| {
            warn!("Tool call failed: {err}");
            format!("Error: {err}")
        })
    }

    /// Download a page and reduce it to its text.
    ///
    /// Only public http(s) hosts are fetched; every redirect hop is checked again.
    #[instrument(skip(self))]
    async fn fetch_url(&self, url: &str) -> Res<String> {
        let mut current = Url::parse(url)?;
        let mut hops = 0;

        loop {
            if !matches!(current.scheme(), "http" | "https") {
                return Err(anyhow::anyhow!("Only http(s) URLs can be fetched."));
            }

            ensure_public_host(&current).await?;

            let response = self.http.get(current.clone()).timeout(FETCH_TIMEOUT).send().await?;

            if response.status().is_redirection() {
                if hops >= MAX_REDIRECTS {
                    return Err(anyhow::anyhow!("Too many redirects (max {MAX_REDIRECTS})."));
                }

                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| anyhow::anyhow!("Redirect without a `Location` header."))?;

                current = current.join(location)?;
                hops += 1;
                continue;
            }

            let body = response.error_for_status()?.text().await?;

            return Ok(truncate_chars(&strip_markup(&body), MAX_PAGE_CHARS));
        }
    }
}

#[async_trait]
impl GenericLlmClient for OpenAiLlmClient {
    #[instrument(name = "OpenAiLlmClient::get_balance", skip_all)]
    async fn get_balance(&self) -> Res<Balance> {
        let url = format!("{}/dashboard/billing/credit_grants", self.config.openai_api_base.trim_end_matches('/'));

        let grants = self
            .http
            .get(url)
            .bearer_auth(&self.config.openai_api_key)
            .timeout(self.config.openai_request_timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<CreditGrants>()
            .await?;

        Ok(grants.into())
    }

    #[instrument(name = "OpenAiLlmClient::complete", skip_all)]
    async fn complete(&self, history: &[ChatMessage], mode: AiMode) -> Res<ChatMessage> {
        let request = self.build_request(to_openai_messages(history)?, mode, None)?;
        let message = self.call_openai_api(request).await?;

        into_chat_message(message)
    }

    #[instrument(name = "OpenAiLlmClient::complete_with_tools", skip_all)]
    async fn complete_with_tools(&self, history: &[ChatMessage], mode: AiMode) -> Res<ChatMessage> {
        let tools = get_openai_tools()?;
        let mut messages = to_openai_messages(history)?;

        // Loop until the model answers instead of calling tools.

        for round in 1..=MAX_TOOL_ROUNDS {
            let request = self.build_request(messages.clone(), mode, Some(tools))?;
            let message = self.call_openai_api(request).await?;

            let Some(calls) = message.tool_calls.clone().filter(|calls| !calls.is_empty()) else {
                return into_chat_message(message);
            };

            info!("Round {round}: model requested {} tool calls.", calls.len());

            messages.push(ChatCompletionRequestAssistantMessageArgs::default().tool_calls(calls.clone()).build()?.into());

            let outputs = futures::future::join_all(calls.iter().map(|call| self.run_tool(call))).await;

            for (call, output) in calls.iter().zip(outputs) {
                messages.push(ChatCompletionRequestToolMessageArgs::default().tool_call_id(call.id.clone()).content(output).build()?.into());
            }
        }

        Err(anyhow::anyhow!("The model did not answer within {MAX_TOOL_ROUNDS} tool rounds."))
    }
}

// Wire types.

#[derive(Debug, Deserialize)]
struct FetchUrlArgs {
    url: String,
}

#[derive(Debug, Deserialize)]
struct CreditGrants {
    total_granted: f64,
    total_used: f64,
    total_available: f64,
    #[serde(default)]
    grants: Option<GrantList>,
}

#[derive(Debug, Deserialize)]
struct GrantList {
    #[serde(default)]
    data: Vec<Grant>,
}

#[serde_as]
#[derive(Debug, Deserialize)]
struct Grant {
    #[serde_as(as = "Option<TimestampSeconds<f64>>")]
    #[serde(default)]
    effective_at: Option<DateTime<Utc>>,
    #[serde_as(as = "Option<TimestampSeconds<f64>>")]
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl From<CreditGrants> for Balance {
    fn from(grants: CreditGrants) -> Self {
        let first = grants.grants.and_then(|list| list.data.into_iter().next());

        Balance {
            total_granted: grants.total_granted,
            total_used: grants.total_used,
            total_available: grants.total_available,
            effective_at: first.as_ref().and_then(|g| g.effective_at),
            expires_at: first.as_ref().and_then(|g| g.expires_at),
        }
    }
}

// Page fetch guard.

/// Reject hosts that are, or resolve to, loopback, private, or link-local addresses.
async fn ensure_public_host(url: &Url) -> Res<()> {
    let host = url.host_str().ok_or_else(|| anyhow::anyhow!("URL has no host."))?;

    // IPv6 literals come bracketed.
    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(anyhow::anyhow!("Refusing to fetch `{host}`: private address {ip}."));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port)).await?.collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(anyhow::anyhow!("DNS resolution failed for `{host}`."));
    }

    if let Some(addr) = addrs.iter().find(|addr| is_private_ip(&addr.ip())) {
        return Err(anyhow::anyhow!("Refusing to fetch `{host}`: resolves to private address {}.", addr.ip()));
    }

    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();

            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (CGNAT)
                || (a == 100 && (b & 0xC0) == 64)
                // 192.0.0.0/24
                || (a == 192 && b == 0 && c == 0)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(&IpAddr::V4(v4));
            }

            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
        }
    }
}

// Conversions.

/// Convert a session history into OpenAI request messages.
fn to_openai_messages(history: &[ChatMessage]) -> Res<Vec<ChatCompletionRequestMessage>> {
    history
        .iter()
        .map(|message| {
            Ok(match message.role {
                Role::System => ChatCompletionRequestSystemMessageArgs::default().content(message.content.clone()).build()?.into(),
                Role::User => ChatCompletionRequestUserMessageArgs::default().content(message.content.clone()).build()?.into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default().content(message.content.clone()).build()?.into(),
            })
        })
        .collect()
}

/// Convert the model's final message into a session entry.
fn into_chat_message(message: ChatCompletionResponseMessage) -> Res<ChatMessage> {
    if let Some(refusal) = message.refusal {
        return Err(anyhow::anyhow!("Request refused: {refusal}"));
    }

    let content = message.content.filter(|c| !c.trim().is_empty()).ok_or_else(|| anyhow::anyhow!("OpenAI returned an empty message."))?;

    Ok(ChatMessage::assistant(content))
}

/// Drop markup from an HTML page, keeping the visible text.
fn strip_markup(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let mut in_tag = false;
    let mut skip_until: Option<&str> = None;
    let lower = html.to_ascii_lowercase();

    let mut i = 0;
    while i < html.len() {
        if let Some(end) = skip_until {
            match lower[i..].find(end) {
                Some(offset) => {
                    i += offset + end.len();
                    skip_until = None;
                }
                None => break,
            }
            continue;
        }

        let rest = &lower[i..];
        if rest.starts_with("<script") {
            skip_until = Some("</script>");
            continue;
        }
        if rest.starts_with("<style") {
            skip_until = Some("</style>");
            continue;
        }

        let Some(c) = html[i..].chars().next() else { break };
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
        i += c.len_utf8();
    }

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max` characters, on a char boundary.
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((index, _)) => text[..index].to_string(),
        None => text.to_string(),
    }
}

// Statics.

static OPENAI_TOOLS: OnceLock<Vec<ChatCompletionTool>> = OnceLock::new();

/// Get the tools offered to the model for tool-augmented completions.
fn get_openai_tools() -> Res<&'static [ChatCompletionTool]> {
    if let Some(tools) = OPENAI_TOOLS.get() {
        return Ok(tools.as_slice());
    }

    let tools = vec![
        ChatCompletionToolArgs::default()
            .r#type(ChatCompletionToolType::Function)
            .function(
                FunctionObjectArgs::default()
                    .name("fetch_url")
                    .description("Download a web page and return its visible text.  Use this whenever the user asks about the contents of a URL.")
                    .parameters(serde_json::json!({
                        "type": "object",
                        "properties": {
                            "url": { "type": "string", "description": "Absolute http(s) URL of the page to fetch." },
                        },
                        "required": ["url"],
                        "additionalProperties": false
                    }))
                    .build()?,
            )
            .build()?,
    ];

    Ok(OPENAI_TOOLS.get_or_init(|| tools).as_slice())
}

// Tests.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::{base::config::ConfigInner, interaction::context::CallScope};

    #[test]
    fn test_to_openai_messages_keeps_roles_in_order() {
        let history = vec![ChatMessage::system("sys"), ChatMessage::user("hi"), ChatMessage::assistant("hello")];

        let messages = to_openai_messages(&history).unwrap();

        assert!(matches!(messages[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(messages[2], ChatCompletionRequestMessage::Assistant(_)));
    }

    #[test]
    fn test_strip_markup_keeps_visible_text() {
        let html = "<html><head><style>p { color: red; }</style><script>alert('x')</script></head><body><h1>Title</h1><p>Some  <b>bold</b> text.</p></body></html>";

        assert_eq!(strip_markup(html), "Title Some bold text.");
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn test_credit_grants_convert_to_balance() {
        let grants: CreditGrants = serde_json::from_value(serde_json::json!({
            "object": "credit_summary",
            "total_granted": 18.0,
            "total_used": 2.5,
            "total_available": 15.5,
            "grants": {
                "data": [{ "effective_at": 1672531200.0, "expires_at": 1688169600.0 }]
            }
        }))
        .unwrap();

        let balance = Balance::from(grants);

        assert_eq!(balance.total_available, 15.5);
        assert_eq!(balance.effective_at.unwrap().timestamp(), 1672531200);
        assert_eq!(balance.expires_at.unwrap().timestamp(), 1688169600);
    }

    #[test]
    fn test_openai_tools_are_defined() {
        let tools = get_openai_tools().unwrap();

        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function.name, "fetch_url");
    }

    #[tokio::test]
    async fn test_get_balance_error_handling_unreachable_api() {
        let config = Config {
            inner: Arc::new(ConfigInner {
                openai_api_key: "sk-invalid-key-for-testing".to_string(),
                openai_api_base: "http://127.0.0.1:9".to_string(),
                call_timeout: Duration::from_secs(5),
                ..Default::default()
            }),
        };

        let client = LlmClient::openai(&config).unwrap();

        assert!(client.get_balance().await.is_err(), "Should fail against an unreachable API");
    }

    #[tokio::test]
    async fn test_fetch_url_rejects_non_http() {
        let client = OpenAiLlmClient::new(&Config { inner: Arc::new(ConfigInner::default()) }).unwrap();

        assert!(client.fetch_url("file:///etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_url_rejects_private_hosts() {
        let client = OpenAiLlmClient::new(&Config { inner: Arc::new(ConfigInner::default()) }).unwrap();

        for url in ["http://127.0.0.1:9/", "http://localhost:9/admin", "http://169.254.169.254/latest/meta-data/", "http://[::1]:9/"] {
            let err = client.fetch_url(url).await.unwrap_err();
            assert!(err.to_string().contains("Refusing to fetch"), "{url}: {err}");
        }
    }

    #[test]
    fn test_is_private_ip() {
        let blocked = ["127.0.0.1", "10.0.0.1", "172.16.5.4", "192.168.1.1", "169.254.169.254", "100.64.0.1", "0.0.0.0", "::1", "fd00::1", "fe80::1", "::ffff:127.0.0.1"];
        let allowed = ["93.184.216.34", "8.8.8.8", "2606:4700:4700::1111"];

        for ip in blocked {
            assert!(is_private_ip(&ip.parse().unwrap()), "{ip} should be blocked");
        }
        for ip in allowed {
            assert!(!is_private_ip(&ip.parse().unwrap()), "{ip} should be allowed");
        }
    }

    /// Serve chat completions on a local port, stalling on the first connection only.
    async fn stall_first_then_answer() -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);

                tokio::spawn(async move {
                    read_request(&mut socket).await;

                    if attempt == 0 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }

                    let body = serde_json::json!({
                        "id": "chatcmpl-1",
                        "object": "chat.completion",
                        "created": 1700000000,
                        "model": "gpt-4o-mini",
                        "choices": [{
                            "index": 0,
                            "message": { "role": "assistant", "content": "hi" },
                            "finish_reason": "stop",
                            "logprobs": null
                        }],
                        "usage": { "prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2 }
                    })
                    .to_string();

                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });

        (format!("http://{addr}/v1"), connections)
    }

    async fn read_request(socket: &mut TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            let Ok(n) = socket.read(&mut chunk).await else { return };
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);

            let text = String::from_utf8_lossy(&buf);
            let Some(header_end) = text.find("\r\n\r\n") else { continue };

            let content_length = text[..header_end]
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok()).flatten()
                })
                .unwrap_or(0);

            if buf.len() >= header_end + 4 + content_length {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_stalled_attempt_is_retried_within_call_scope() {
        let (api_base, connections) = stall_first_then_answer().await;
        let config = Config {
            inner: Arc::new(ConfigInner {
                openai_api_key: "sk-test".to_string(),
                openai_api_base: api_base,
                openai_request_timeout: Duration::from_millis(300),
                call_timeout: Duration::from_secs(10),
                ..Default::default()
            }),
        };
        let client = LlmClient::openai(&config).unwrap();

        let reply = CallScope::with_timeout(config.call_timeout)
            .run(client.complete(&[ChatMessage::user("hello")], AiMode::Balanced))
            .await
            .unwrap();

        assert_eq!(reply, ChatMessage::assistant("hi"));
        assert_eq!(connections.load(Ordering::SeqCst), 2);
    }
}
