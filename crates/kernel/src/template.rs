//! Prompt template language.
//!
//! Text passes through untouched except for `{{ ... }}` blocks:
//!
//! | Block                                   | Meaning                          |
//! |-----------------------------------------|----------------------------------|
//! | `{{topic}}`, `{{$topic}}`               | value of the variable `topic`    |
//! | `{{'text'}}`, `{{"text"}}`              | the literal text                 |
//! | `{{Plugin.Function}}`                   | result of calling the function   |
//! | `{{Plugin.Function $x}}`                | ... with `input` bound to `x`    |
//! | `{{Plugin.Function a=1 b='x' c=$var}}`  | ... with named arguments         |
//!
//! A called function sees the caller's arguments, overridden by the ones
//! written in the block. An unterminated `{{` is plain text; an empty
//! block is a syntax error.

use rustedkernel_core::error::{Result, TemplateError};
use rustedkernel_core::function::{InputVariable, KernelArguments, value_to_text};
use rustedkernel_core::registry::FunctionInvoker;
use tokio_util::sync::CancellationToken;

/// Argument name a positional block value binds to.
pub const POSITIONAL_ARGUMENT: &str = "input";

#[derive(Debug, Clone, PartialEq)]
enum Block {
    Text(String),
    Variable(String),
    Literal(String),
    Call(CallBlock),
}

#[derive(Debug, Clone, PartialEq)]
struct CallBlock {
    function: String,
    positional: Option<ArgValue>,
    named: Vec<(String, ArgValue)>,
}

#[derive(Debug, Clone, PartialEq)]
enum ArgValue {
    Literal(String),
    Variable(String),
}

/// A parsed template, ready to render any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTemplate {
    blocks: Vec<Block>,
}

impl PromptTemplate {
    pub fn parse(source: &str) -> std::result::Result<Self, TemplateError> {
        let mut blocks = Vec::new();
        let mut text = String::new();
        let mut pos = 0;

        while let Some(rel) = source[pos..].find("{{") {
            let open = pos + rel;
            let Some(close) = find_close(source, open + 2) else {
                break;
            };
            text.push_str(&source[pos..open]);
            if !text.is_empty() {
                blocks.push(Block::Text(std::mem::take(&mut text)));
            }
            blocks.push(parse_block(&source[open + 2..close], open)?);
            pos = close + 2;
        }

        text.push_str(&source[pos..]);
        if !text.is_empty() {
            blocks.push(Block::Text(text));
        }
        Ok(Self { blocks })
    }

    /// Whether rendering calls any function.
    pub fn has_function_calls(&self) -> bool {
        self.blocks.iter().any(|b| matches!(b, Block::Call(_)))
    }

    /// Variable names referenced anywhere in the template, in first-use order.
    pub fn variables(&self) -> Vec<&str> {
        fn push_unique<'a>(names: &mut Vec<&'a str>, name: &'a str) {
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let mut names = Vec::new();
        for block in &self.blocks {
            match block {
                Block::Variable(name) => push_unique(&mut names, name),
                Block::Call(call) => {
                    let values = call.positional.iter().chain(call.named.iter().map(|(_, v)| v));
                    for value in values {
                        if let ArgValue::Variable(name) = value {
                            push_unique(&mut names, name);
                        }
                    }
                }
                Block::Text(_) | Block::Literal(_) => {}
            }
        }
        names
    }

    /// Render with `arguments`, falling back to `defaults` for missing
    /// variables. Inline calls go through `invoker`, in template order.
    pub async fn render(
        &self,
        arguments: &KernelArguments,
        defaults: &[InputVariable],
        invoker: &dyn FunctionInvoker,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut out = String::new();
        for block in &self.blocks {
            match block {
                Block::Text(text) | Block::Literal(text) => out.push_str(text),
                Block::Variable(name) => {
                    out.push_str(&value_to_text(&lookup(name, arguments, defaults)?));
                }
                Block::Call(call) => {
                    let mut call_arguments = arguments.clone();
                    if let Some(value) = &call.positional {
                        call_arguments.insert(POSITIONAL_ARGUMENT, resolve(value, arguments, defaults)?);
                    }
                    for (name, value) in &call.named {
                        call_arguments.insert(name.clone(), resolve(value, arguments, defaults)?);
                    }
                    let result = invoker
                        .invoke_function(&call.function, call_arguments, cancel)
                        .await?;
                    out.push_str(&result.as_text());
                }
            }
        }
        Ok(out)
    }
}

fn lookup(
    name: &str,
    arguments: &KernelArguments,
    defaults: &[InputVariable],
) -> std::result::Result<serde_json::Value, TemplateError> {
    if let Some(value) = arguments.get(name) {
        return Ok(value.clone());
    }
    defaults
        .iter()
        .find(|v| v.name == name)
        .and_then(|v| v.default.clone())
        .ok_or_else(|| TemplateError::UndefinedVariable(name.to_string()))
}

fn resolve(
    value: &ArgValue,
    arguments: &KernelArguments,
    defaults: &[InputVariable],
) -> std::result::Result<serde_json::Value, TemplateError> {
    match value {
        ArgValue::Literal(text) => Ok(serde_json::Value::String(text.clone())),
        ArgValue::Variable(name) => lookup(name, arguments, defaults),
    }
}

/// Byte offset of the `}}` closing a block whose body starts at `from`.
/// Quoted text may contain `}}`.
fn find_close(source: &str, from: usize) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in source[from..].char_indices() {
        let at = from + i;
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                } else if source[at..].starts_with("}}") {
                    return Some(at);
                }
            }
        }
    }
    None
}

fn syntax(offset: usize, reason: impl Into<String>) -> TemplateError {
    TemplateError::Syntax {
        offset,
        reason: reason.into(),
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split block content on whitespace, keeping quoted runs intact.
fn tokenize(inner: &str, offset: usize) -> std::result::Result<Vec<String>, TemplateError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in inner.chars() {
        match quote {
            Some(q) => {
                current.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == q {
                    quote = None;
                }
            }
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                }
                current.push(c);
            }
        }
    }
    if quote.is_some() {
        return Err(syntax(offset, "unterminated quoted value"));
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Strip matching quotes and resolve `\` escapes.
fn unquote(raw: &str, offset: usize) -> std::result::Result<String, TemplateError> {
    let mut chars = raw.chars();
    let (Some(open), Some(close)) = (chars.next(), chars.next_back()) else {
        return Err(syntax(offset, format!("malformed quoted value {raw}")));
    };
    if open != close || raw.len() < 2 {
        return Err(syntax(offset, format!("malformed quoted value {raw}")));
    }
    let mut out = String::new();
    let mut escaped = false;
    for c in chars {
        if escaped {
            out.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn is_quoted(raw: &str) -> bool {
    raw.starts_with('\'') || raw.starts_with('"')
}

fn parse_value(raw: &str, offset: usize) -> std::result::Result<ArgValue, TemplateError> {
    if let Some(name) = raw.strip_prefix('$') {
        if !is_identifier(name) {
            return Err(syntax(offset, format!("invalid variable name '{name}'")));
        }
        Ok(ArgValue::Variable(name.to_string()))
    } else if is_quoted(raw) {
        Ok(ArgValue::Literal(unquote(raw, offset)?))
    } else if raw.is_empty() {
        Err(syntax(offset, "missing argument value"))
    } else {
        Ok(ArgValue::Literal(raw.to_string()))
    }
}

fn parse_block(inner: &str, offset: usize) -> std::result::Result<Block, TemplateError> {
    let tokens = tokenize(inner, offset)?;
    let Some((first, rest)) = tokens.split_first() else {
        return Err(syntax(offset, "empty block"));
    };

    if let Some(name) = first.strip_prefix('$') {
        if !rest.is_empty() {
            return Err(syntax(offset, "a variable block takes no arguments"));
        }
        if !is_identifier(name) {
            return Err(syntax(offset, format!("invalid variable name '{name}'")));
        }
        return Ok(Block::Variable(name.to_string()));
    }

    if is_quoted(first) {
        if !rest.is_empty() {
            return Err(syntax(offset, "a literal block takes no arguments"));
        }
        return Ok(Block::Literal(unquote(first, offset)?));
    }

    if rest.is_empty() && !first.contains('.') {
        if !is_identifier(first) {
            return Err(syntax(offset, format!("invalid variable name '{first}'")));
        }
        return Ok(Block::Variable(first.clone()));
    }

    let valid_function = match first.split_once('.') {
        Some((plugin, function)) => is_identifier(plugin) && is_identifier(function),
        None => is_identifier(first),
    };
    if !valid_function {
        return Err(syntax(offset, format!("invalid function name '{first}'")));
    }

    let mut call = CallBlock {
        function: first.clone(),
        positional: None,
        named: Vec::new(),
    };
    for (i, token) in rest.iter().enumerate() {
        let named = if is_quoted(token) { None } else { token.split_once('=') };
        match named {
            Some((name, value)) => {
                if !is_identifier(name) {
                    return Err(syntax(offset, format!("invalid argument name '{name}'")));
                }
                call.named.push((name.to_string(), parse_value(value, offset)?));
            }
            None if i == 0 => call.positional = Some(parse_value(token, offset)?),
            None => {
                return Err(syntax(offset, "only the first argument may be positional"));
            }
        }
    }
    Ok(Block::Call(call))
}
