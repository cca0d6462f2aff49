//! Manifest template rendering.
//!
//! Manifests are byte templates. Before decoding, a renderer substitutes
//! named parameters into them. Callers may supply any [`Render`]
//! implementation (closures included); [`TemplateRenderer`] is the stock one
//! and understands a small subset of Go template actions.
//!
//! # Action Formats
//!
//! - `{{ .Name }}` - the value of parameter `Name`
//! - `{{ .Outer.Inner }}` - a nested value inside an object parameter
//! - `{{ . }}` - all parameters as a JSON object
//! - `{{ "text" }}` - a string literal (use `{{ "{{" }}` for a literal `{{`)
//! - `{{ Sha256sum .Name }}` - a function applied to one argument
//! - `{{ .Name | Base64 | Quote }}` - a pipeline of functions
//!
//! `{{-` and `-}}` trim whitespace around the action, as in Go.
//!
//! # Example
//!
//! ```
//! use kapply_lib::render::{Render, RenderParams, TemplateRenderer};
//!
//! let params = RenderParams::new().with("Image", "quay.io/router:4.1");
//! let out = TemplateRenderer.render(b"image: {{ .Image }}", &params).unwrap();
//! assert_eq!(out, b"image: quay.io/router:4.1");
//! ```

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Named values substituted into a manifest template.
///
/// Each apply call carries its own parameters; nothing is inherited between
/// calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderParams(BTreeMap<String, Value>);

impl RenderParams {
  pub fn new() -> Self {
    Self::default()
  }

  /// Builder-style insert.
  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.0.insert(key.into(), value.into());
    self
  }

  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
    self.0.insert(key.into(), value.into())
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.0.get(key)
  }

  /// Walk a dotted path (`["Outer", "Inner"]`) through nested objects.
  pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
    let (first, rest) = path.split_first()?;
    let mut current = self.0.get(*first)?;
    for key in rest {
      current = current.as_object()?.get(*key)?;
    }
    Some(current)
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.0.iter()
  }

  fn to_value(&self) -> Value {
    Value::Object(self.0.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
  }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for RenderParams {
  fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
    Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }
}

/// Errors that can occur while rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
  #[error("template is not valid UTF-8: {0}")]
  NotUtf8(String),

  #[error("unclosed action at position {0}")]
  Unclosed(usize),

  #[error("empty action at position {0}")]
  Empty(usize),

  #[error("malformed action at position {pos}: {message}")]
  Malformed { pos: usize, message: String },

  #[error("unknown function: {0}")]
  UnknownFunction(String),

  #[error("missing parameter: .{0}")]
  MissingParam(String),

  /// Raised by caller-supplied renderers.
  #[error("{0}")]
  Custom(String),
}

/// Turns raw manifest bytes into rendered manifest bytes.
///
/// Implementations must be referentially transparent: the same bytes and
/// parameters always yield the same output.
pub trait Render: Send + Sync {
  fn render(&self, raw: &[u8], params: &RenderParams) -> Result<Vec<u8>, RenderError>;
}

impl<F> Render for F
where
  F: Fn(&[u8], &RenderParams) -> Result<Vec<u8>, RenderError> + Send + Sync,
{
  fn render(&self, raw: &[u8], params: &RenderParams) -> Result<Vec<u8>, RenderError> {
    self(raw, params)
  }
}

/// Render `raw` with `render`, or pass it through untouched when no renderer
/// is given.
pub fn render_manifest(raw: &[u8], render: Option<&dyn Render>, params: &RenderParams) -> Result<Vec<u8>, RenderError> {
  match render {
    Some(r) => r.render(raw, params),
    None => Ok(raw.to_vec()),
  }
}

/// Default renderer for `{{ .Param }}` style templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl Render for TemplateRenderer {
  fn render(&self, raw: &[u8], params: &RenderParams) -> Result<Vec<u8>, RenderError> {
    let input = std::str::from_utf8(raw).map_err(|e| RenderError::NotUtf8(e.to_string()))?;
    let segments = parse(input)?;
    substitute(&segments, params).map(String::into_bytes)
  }
}

/// Built-in template functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
  Dir,
  Sha256sum,
  Base64,
  Quote,
}

impl Function {
  fn from_name(name: &str) -> Result<Self, RenderError> {
    match name {
      "Dir" => Ok(Function::Dir),
      "Sha256sum" => Ok(Function::Sha256sum),
      "Base64" => Ok(Function::Base64),
      "Quote" => Ok(Function::Quote),
      _ => Err(RenderError::UnknownFunction(name.to_string())),
    }
  }

  fn call(self, arg: &str) -> String {
    match self {
      Function::Dir => parent_dir(arg),
      Function::Sha256sum => hex::encode(Sha256::digest(arg.as_bytes())),
      Function::Base64 => base64::engine::general_purpose::STANDARD.encode(arg),
      Function::Quote => Value::String(arg.to_string()).to_string(),
    }
  }
}

/// The value a pipeline starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
  /// `.a.b.c`; an empty path is `.` itself.
  Path(Vec<String>),
  Literal(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
  pub operand: Operand,
  pub functions: Vec<Function>,
}

/// A segment of a parsed template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Action(Pipeline),
}

/// Parse a template into literal and action segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, RenderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut rest = input;
  let mut offset = 0;
  let mut trim_next = false;

  while let Some(open) = rest.find("{{") {
    let mut text = &rest[..open];
    if trim_next {
      text = text.trim_start();
    }
    let pos = offset + open;
    let body_start = open + 2;
    let close = find_close(&rest[body_start..]).ok_or(RenderError::Unclosed(pos))?;
    let mut body = &rest[body_start..body_start + close];

    let trim_left = body.starts_with("- ") || body == "-";
    if trim_left {
      body = &body[1..];
      text = text.trim_end();
    }
    trim_next = body.ends_with(" -");
    if trim_next {
      body = &body[..body.len() - 1];
    }

    literal.push_str(text);
    if !literal.is_empty() {
      segments.push(Segment::Literal(std::mem::take(&mut literal)));
    }
    segments.push(Segment::Action(parse_pipeline(body.trim(), pos)?));

    let consumed = body_start + close + 2;
    offset += consumed;
    rest = &rest[consumed..];
  }

  if trim_next {
    rest = rest.trim_start();
  }
  literal.push_str(rest);
  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

/// Find the `}}` closing an action, skipping over string literals.
fn find_close(body: &str) -> Option<usize> {
  let bytes = body.as_bytes();
  let mut in_string = false;
  let mut i = 0;
  while i < bytes.len() {
    match bytes[i] {
      b'\\' if in_string => i += 1,
      b'"' => in_string = !in_string,
      b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
      _ => {}
    }
    i += 1;
  }
  None
}

fn parse_pipeline(body: &str, pos: usize) -> Result<Pipeline, RenderError> {
  if body.is_empty() {
    return Err(RenderError::Empty(pos));
  }

  let mut stages = split_outside_quotes(body, '|').into_iter();
  let head = stages.next().unwrap_or_default();
  let words = split_outside_quotes(head.trim(), ' ')
    .into_iter()
    .filter(|w| !w.is_empty())
    .collect::<Vec<_>>();

  let (operand, mut functions) = match words.as_slice() {
    [operand] => (parse_operand(operand, pos)?, Vec::new()),
    [function, operand] => (parse_operand(operand, pos)?, vec![Function::from_name(function)?]),
    _ => {
      return Err(RenderError::Malformed {
        pos,
        message: format!("expected an operand or a function call, got '{head}'"),
      });
    }
  };

  for stage in stages {
    let name = stage.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
      return Err(RenderError::Malformed {
        pos,
        message: format!("pipeline stage must be a function name, got '{name}'"),
      });
    }
    functions.push(Function::from_name(name)?);
  }

  Ok(Pipeline { operand, functions })
}

fn parse_operand(word: &str, pos: usize) -> Result<Operand, RenderError> {
  if word == "." {
    return Ok(Operand::Path(Vec::new()));
  }
  if let Some(path) = word.strip_prefix('.') {
    let keys = path.split('.').map(str::to_string).collect::<Vec<_>>();
    if keys.iter().any(|k| k.is_empty()) {
      return Err(RenderError::Malformed {
        pos,
        message: format!("invalid parameter path '{word}'"),
      });
    }
    return Ok(Operand::Path(keys));
  }
  if word.starts_with('"') {
    return serde_json::from_str::<String>(word)
      .map(Operand::Literal)
      .map_err(|e| RenderError::Malformed {
        pos,
        message: format!("invalid string literal {word}: {e}"),
      });
  }
  Err(RenderError::Malformed {
    pos,
    message: format!("unexpected operand '{word}'"),
  })
}

fn split_outside_quotes(input: &str, sep: char) -> Vec<&str> {
  let mut parts = Vec::new();
  let mut in_string = false;
  let mut escaped = false;
  let mut start = 0;
  for (i, c) in input.char_indices() {
    if escaped {
      escaped = false;
      continue;
    }
    match c {
      '\\' if in_string => escaped = true,
      '"' => in_string = !in_string,
      c if c == sep && !in_string => {
        parts.push(&input[start..i]);
        start = i + c.len_utf8();
      }
      _ => {}
    }
  }
  parts.push(&input[start..]);
  parts
}

/// Evaluate pre-parsed segments against `params`.
pub fn substitute(segments: &[Segment], params: &RenderParams) -> Result<String, RenderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Action(pipeline) => {
        let mut value = match &pipeline.operand {
          Operand::Literal(s) => s.clone(),
          Operand::Path(path) if path.is_empty() => params.to_value().to_string(),
          Operand::Path(path) => {
            let keys = path.iter().map(String::as_str).collect::<Vec<_>>();
            let value = params
              .lookup(&keys)
              .ok_or_else(|| RenderError::MissingParam(path.join(".")))?;
            format_value(value)
          }
        };
        for function in &pipeline.functions {
          value = function.call(&value);
        }
        result.push_str(&value);
      }
    }
  }

  Ok(result)
}

fn format_value(value: &Value) -> String {
  match value {
    Value::Null => String::new(),
    Value::String(s) => s.clone(),
    Value::Bool(b) => b.to_string(),
    Value::Number(n) => n.to_string(),
    Value::Array(_) | Value::Object(_) => value.to_string(),
  }
}

/// Parent directory of a slash-separated path.
fn parent_dir(path: &str) -> String {
  let trimmed = path.trim_end_matches('/');
  if trimmed.is_empty() {
    return if path.is_empty() { ".".to_string() } else { "/".to_string() };
  }
  match trimmed.rfind('/') {
    None => ".".to_string(),
    Some(i) => {
      let parent = trimmed[..i].trim_end_matches('/');
      if parent.is_empty() { "/".to_string() } else { parent.to_string() }
    }
  }
}
