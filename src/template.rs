//! Chat templating
//!
//! Renders a conversation into the linear prompt a model family expects.
//! Rendering is a pure function of the conversation, the resolved template
//! body, and the thinking flag. A template body carries two things: format
//! signature markers (which built-in renderer to use) and optional directive
//! comments contributing stop sequences or a grammar constraint.

use serde::{Deserialize, Serialize};

use crate::error::ContextError;

/// Role of a message sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System prompt
    System,
    /// Message from the user
    User,
    /// Message from the model
    Assistant,
    /// Tool invocation result fed back to the model
    Tool,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single chat turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Name of the tool a `tool` message reports for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Structured arguments of the originating tool call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<serde_json::Value>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: Role::System, content: content.into(), tool_name: None, tool_arguments: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), tool_name: None, tool_arguments: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), tool_name: None, tool_arguments: None }
    }
}

/// Parse the JSON-encoded message array accepted at the public boundary.
/// Unknown keys are ignored; a malformed array is a template error.
pub fn parse_messages(json: &str) -> Result<Vec<ChatMessage>, ContextError> {
    serde_json::from_str(json)
        .map_err(|e| ContextError::Template(format!("invalid message array: {e}")))
}

/// Model families the renderer understands, detected from signature markers
/// in the template body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChatFormat {
    /// `<|im_start|>role ... <|im_end|>` (Qwen, many fine-tunes)
    ChatMl,
    /// `[INST] <<SYS>> ... [/INST]`
    Llama2,
    /// `<|start_header_id|>role<|end_header_id|> ... <|eot_id|>`
    Llama3,
    /// `<start_of_turn>role ... <end_of_turn>`
    Gemma,
    /// `### Instruction: / ### Response:`
    Alpaca,
}

impl ChatFormat {
    /// Identify the format from its signature markers. Order matters:
    /// Llama3 headers also contain no ChatML markers, but a combined
    /// template is resolved by the most specific marker first.
    fn detect(body: &str) -> Option<Self> {
        if body.contains("<|im_start|>") {
            Some(ChatFormat::ChatMl)
        } else if body.contains("<|start_header_id|>") {
            Some(ChatFormat::Llama3)
        } else if body.contains("<start_of_turn>") {
            Some(ChatFormat::Gemma)
        } else if body.contains("[INST]") {
            Some(ChatFormat::Llama2)
        } else if body.contains("### Instruction") {
            Some(ChatFormat::Alpaca)
        } else {
            None
        }
    }

    /// The token text that terminates one turn, merged into stop sequences.
    fn turn_stop(&self) -> Option<&'static str> {
        match self {
            ChatFormat::ChatMl => Some("<|im_end|>"),
            ChatFormat::Llama2 => Some("</s>"),
            ChatFormat::Llama3 => Some("<|eot_id|>"),
            ChatFormat::Gemma => Some("<end_of_turn>"),
            ChatFormat::Alpaca => None,
        }
    }

    fn supports_tools(&self) -> bool {
        matches!(self, ChatFormat::ChatMl | ChatFormat::Llama3)
    }
}

/// Immutable result of a full-form render.
#[derive(Debug, Clone)]
pub struct RenderedPrompt {
    pub prompt: String,
    /// Stop sequences contributed by the template (turn terminator plus
    /// `stop:` directives); empty when the template contributes none.
    pub additional_stops: Vec<String>,
    pub format: ChatFormat,
    /// GBNF constraint from a `grammar:` directive, if present.
    pub grammar: Option<String>,
}

/// Stateless chat renderer, parameterized per call.
pub struct TemplateEngine;

impl TemplateEngine {
    /// Simple form: prompt text only.
    pub fn format(
        messages: &[ChatMessage],
        template: Option<&str>,
        model_default: Option<&str>,
    ) -> Result<String, ContextError> {
        Self::format_full(messages, template, model_default, false).map(|r| r.prompt)
    }

    /// Full form: prompt plus generation controls derived from the template.
    ///
    /// Resolution order: explicit non-empty `template` overrides, otherwise
    /// the model's embedded default, otherwise this is a template error.
    /// The caller's `enable_thinking` flag is authoritative; templates that
    /// have no thinking concept ignore it silently.
    pub fn format_full(
        messages: &[ChatMessage],
        template: Option<&str>,
        model_default: Option<&str>,
        enable_thinking: bool,
    ) -> Result<RenderedPrompt, ContextError> {
        let body = match template.filter(|t| !t.trim().is_empty()) {
            Some(t) => t,
            None => model_default
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| ContextError::Template("no template given and the model embeds none".into()))?,
        };

        let format = ChatFormat::detect(body)
            .ok_or_else(|| ContextError::Template("unrecognized chat template".into()))?;

        let directives = Directives::parse(body)?;

        for msg in messages {
            if msg.role == Role::Tool && !format.supports_tools() {
                return Err(ContextError::Template(format!(
                    "{:?} templates cannot render tool messages",
                    format
                )));
            }
        }

        let prompt = match format {
            ChatFormat::ChatMl => render_chatml(messages, body.contains("<think>"), enable_thinking),
            ChatFormat::Llama2 => render_llama2(messages),
            ChatFormat::Llama3 => render_llama3(messages),
            ChatFormat::Gemma => render_gemma(messages),
            ChatFormat::Alpaca => render_alpaca(messages),
        };

        let mut stops = directives.stops;
        if let Some(stop) = format.turn_stop() {
            if !stops.iter().any(|s| s == stop) {
                stops.push(stop.to_string());
            }
        }

        Ok(RenderedPrompt { prompt, additional_stops: stops, format, grammar: directives.grammar })
    }
}

/// Structured controls parsed from `{#- key: value -#}` comments.
#[derive(Debug, Default)]
struct Directives {
    stops: Vec<String>,
    grammar: Option<String>,
}

impl Directives {
    fn parse(body: &str) -> Result<Self, ContextError> {
        let mut out = Directives::default();
        let mut rest = body;
        while let Some(start) = rest.find("{#-") {
            let after = &rest[start + 3..];
            let end = after.find("-#}").ok_or_else(|| {
                ContextError::Template("unterminated template directive".into())
            })?;
            let inner = after[..end].trim();
            if let Some(value) = inner.strip_prefix("stop:") {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    out.stops.push(value.to_string());
                }
            } else if let Some(value) = inner.strip_prefix("grammar:") {
                out.grammar = Some(value.trim().to_string());
            }
            // Unknown directives are ignored, same as unknown JSON keys
            rest = &after[end + 3..];
        }
        Ok(out)
    }
}

fn render_chatml(messages: &[ChatMessage], thinking_capable: bool, enable_thinking: bool) -> String {
    let mut prompt = String::new();
    for msg in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(msg.role.as_str());
        prompt.push('\n');
        if msg.role == Role::Tool {
            if let Some(name) = &msg.tool_name {
                prompt.push_str(&format!("[{name}]\n"));
            }
        }
        prompt.push_str(&msg.content);
        prompt.push_str("<|im_end|>\n");
    }
    if !matches!(messages.last().map(|m| m.role), Some(Role::Assistant)) {
        prompt.push_str("<|im_start|>assistant\n");
        // Thinking-capable templates: an empty think block suppresses the
        // reasoning segment when the caller disabled it
        if thinking_capable && !enable_thinking {
            prompt.push_str("<think>\n\n</think>\n\n");
        }
    }
    prompt
}

fn render_llama2(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    let system = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let mut first_user = true;
    for msg in messages {
        match msg.role {
            Role::System => {}
            Role::User => {
                if first_user && !system.is_empty() {
                    prompt.push_str("[INST] <<SYS>>\n");
                    prompt.push_str(&system);
                    prompt.push_str("\n<</SYS>>\n\n");
                    prompt.push_str(&msg.content);
                    prompt.push_str(" [/INST] ");
                } else {
                    prompt.push_str("[INST] ");
                    prompt.push_str(&msg.content);
                    prompt.push_str(" [/INST] ");
                }
                first_user = false;
            }
            Role::Assistant => {
                prompt.push_str(&msg.content);
                if !msg.content.is_empty() {
                    prompt.push_str("</s>");
                }
            }
            Role::Tool => unreachable!("rejected before rendering"),
        }
    }
    prompt
}

fn render_llama3(messages: &[ChatMessage]) -> String {
    let mut prompt = String::from("<|begin_of_text|>");
    for msg in messages {
        let role = match msg.role {
            Role::Tool => "ipython",
            other => other.as_str(),
        };
        prompt.push_str("<|start_header_id|>");
        prompt.push_str(role);
        prompt.push_str("<|end_header_id|>\n\n");
        prompt.push_str(&msg.content);
        prompt.push_str("<|eot_id|>");
    }
    if !matches!(messages.last().map(|m| m.role), Some(Role::Assistant)) {
        prompt.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    }
    prompt
}

fn render_gemma(messages: &[ChatMessage]) -> String {
    // Gemma has no system role; a system prompt is folded into the first
    // user turn
    let system = messages
        .iter()
        .find(|m| m.role == Role::System)
        .map(|m| m.content.clone())
        .unwrap_or_default();

    let mut prompt = String::new();
    let mut first_user = true;
    for msg in messages {
        match msg.role {
            Role::System => {}
            Role::User => {
                prompt.push_str("<start_of_turn>user\n");
                if first_user && !system.is_empty() {
                    prompt.push_str(&system);
                    prompt.push_str("\n\n");
                }
                prompt.push_str(&msg.content);
                prompt.push_str("<end_of_turn>\n");
                first_user = false;
            }
            Role::Assistant => {
                prompt.push_str("<start_of_turn>model\n");
                prompt.push_str(&msg.content);
                prompt.push_str("<end_of_turn>\n");
            }
            Role::Tool => unreachable!("rejected before rendering"),
        }
    }
    if !matches!(messages.last().map(|m| m.role), Some(Role::Assistant)) {
        prompt.push_str("<start_of_turn>model\n");
    }
    prompt
}

fn render_alpaca(messages: &[ChatMessage]) -> String {
    let mut instruction = String::new();
    for msg in messages {
        if msg.role == Role::System {
            instruction = msg.content.clone();
        }
    }
    for msg in messages.iter().rev() {
        if msg.role == Role::User {
            if !instruction.is_empty() {
                instruction.push_str("\n\n");
            }
            instruction.push_str(&msg.content);
            break;
        }
    }

    let mut prompt = String::new();
    if !instruction.is_empty() {
        prompt.push_str("### Instruction:\n");
        prompt.push_str(&instruction);
        prompt.push_str("\n\n### Response:\n");
    }
    prompt
}
