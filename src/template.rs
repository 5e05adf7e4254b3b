//! Request templates.
//!
//! Definitions build URLs, form inputs and derived fields from templates
//! such as `{{ .Keywords }}` or
//! `{{ if .Query.Season }}S{{ .Query.Season }}{{ else }}all{{ end }}`.
//! Supported actions: variable paths, `if`/`else`/`end`, `range`/`end`
//! (the element is `.` inside the body), and the functions `join` and
//! `re_replace`. A `-` next to the braces trims adjacent whitespace.

use regex::Regex;
use serde_json::Value;

use crate::{IndexerError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Expr(Expr),
    If {
        cond: Expr,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    Range {
        over: Expr,
        body: Vec<Node>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    /// `.A.B`; an empty path is the current element.
    Path(Vec<String>),
    Literal(String),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Action(String),
}

/// A parsed template.
#[derive(Debug, Clone)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    /// Parses a template source string.
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut pos = 0;
        let (nodes, terminator) = parse_nodes(&tokens, &mut pos)?;
        if let Some(word) = terminator {
            return Err(template_error(format!("unexpected {{{{ {} }}}}", word)));
        }
        Ok(Self { nodes })
    }

    /// Renders against a data context.
    pub fn render(&self, data: &Value) -> Result<String> {
        let mut out = String::new();
        render_nodes(&self.nodes, data, data, &mut out)?;
        Ok(out)
    }
}

/// Parses and renders in one step.
pub fn render(source: &str, data: &Value) -> Result<String> {
    if !source.contains("{{") {
        return Ok(source.to_string());
    }
    Template::parse(source)?.render(data)
}

fn template_error(message: impl Into<String>) -> IndexerError {
    IndexerError::validation("template", message)
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = source;
    let mut trim_next = false;

    while let Some(start) = rest.find("{{") {
        let mut text = &rest[..start];
        if trim_next {
            text = text.trim_start();
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| template_error("unclosed action"))?;
        let mut action = &after[..end];

        if let Some(stripped) = action.strip_prefix('-') {
            text = text.trim_end();
            action = stripped;
        }
        trim_next = false;
        if let Some(stripped) = action.strip_suffix('-') {
            trim_next = true;
            action = stripped;
        }

        if !text.is_empty() {
            tokens.push(Token::Text(text.to_string()));
        }
        tokens.push(Token::Action(action.trim().to_string()));
        rest = &after[end + 2..];
    }

    let tail = if trim_next { rest.trim_start() } else { rest };
    if !tail.is_empty() {
        tokens.push(Token::Text(tail.to_string()));
    }
    Ok(tokens)
}

/// Parses until a block keyword (`else`/`end`) or the end of input.
fn parse_nodes(tokens: &[Token], pos: &mut usize) -> Result<(Vec<Node>, Option<String>)> {
    let mut nodes = Vec::new();

    while *pos < tokens.len() {
        let token = &tokens[*pos];
        *pos += 1;

        match token {
            Token::Text(text) => nodes.push(Node::Text(text.clone())),
            Token::Action(action) => {
                let words = split_args(action)?;
                match words.first().map(String::as_str) {
                    Some("end") | Some("else") => return Ok((nodes, Some(words[0].clone()))),
                    Some("if") => {
                        let cond = parse_expr(&words[1..])?;
                        let (then, term) = parse_nodes(tokens, pos)?;
                        let otherwise = match term.as_deref() {
                            Some("else") => {
                                let (otherwise, term) = parse_nodes(tokens, pos)?;
                                if term.as_deref() != Some("end") {
                                    return Err(template_error("if without end"));
                                }
                                otherwise
                            }
                            Some("end") => Vec::new(),
                            _ => return Err(template_error("if without end")),
                        };
                        nodes.push(Node::If {
                            cond,
                            then,
                            otherwise,
                        });
                    }
                    Some("range") => {
                        let over = parse_expr(&words[1..])?;
                        let (body, term) = parse_nodes(tokens, pos)?;
                        if term.as_deref() != Some("end") {
                            return Err(template_error("range without end"));
                        }
                        nodes.push(Node::Range { over, body });
                    }
                    Some(_) => nodes.push(Node::Expr(parse_expr(&words)?)),
                    None => return Err(template_error("empty action")),
                }
            }
        }
    }

    Ok((nodes, None))
}

fn parse_expr(words: &[String]) -> Result<Expr> {
    let first = words
        .first()
        .ok_or_else(|| template_error("missing expression"))?;

    if words.len() == 1 {
        return parse_operand(first);
    }

    match first.as_str() {
        "join" | "re_replace" => {
            let args = words[1..]
                .iter()
                .map(|w| parse_operand(w))
                .collect::<Result<Vec<_>>>()?;
            Ok(Expr::Call(first.clone(), args))
        }
        other => Err(template_error(format!("unknown function '{}'", other))),
    }
}

fn parse_operand(word: &str) -> Result<Expr> {
    if let Some(literal) = word.strip_prefix('\u{0}') {
        return Ok(Expr::Literal(literal.to_string()));
    }
    if word == "." {
        return Ok(Expr::Path(Vec::new()));
    }
    if let Some(path) = word.strip_prefix('.') {
        return Ok(Expr::Path(path.split('.').map(str::to_string).collect()));
    }
    Err(template_error(format!("cannot evaluate '{}'", word)))
}

/// Splits an action into words; quoted strings become literals marked
/// with a leading NUL so they cannot be mistaken for paths.
fn split_args(action: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut chars = action.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut literal = String::from('\u{0}');
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            literal.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                    }
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => literal.push(other),
                }
            }
            if !closed {
                return Err(template_error("unterminated string"));
            }
            words.push(literal);
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
            words.push(word);
        }
    }
    Ok(words)
}

fn render_nodes(nodes: &[Node], root: &Value, dot: &Value, out: &mut String) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Expr(expr) => out.push_str(&to_text(&eval(expr, root, dot)?)),
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                let branch = if truthy(&eval(cond, root, dot)?) {
                    then
                } else {
                    otherwise
                };
                render_nodes(branch, root, dot, out)?;
            }
            Node::Range { over, body } => {
                if let Value::Array(items) = eval(over, root, dot)? {
                    for item in &items {
                        render_nodes(body, root, item, out)?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn eval(expr: &Expr, root: &Value, dot: &Value) -> Result<Value> {
    match expr {
        Expr::Literal(s) => Ok(Value::String(s.clone())),
        Expr::Path(path) if path.is_empty() => Ok(dot.clone()),
        Expr::Path(path) => {
            let mut current = root;
            for part in path {
                match current.get(part) {
                    Some(next) => current = next,
                    None => return Ok(Value::Null),
                }
            }
            Ok(current.clone())
        }
        Expr::Call(name, args) => {
            let values = args
                .iter()
                .map(|a| eval(a, root, dot))
                .collect::<Result<Vec<_>>>()?;
            call(name, &values)
        }
    }
}

fn call(name: &str, args: &[Value]) -> Result<Value> {
    match (name, args) {
        ("join", [Value::Array(items), sep]) => Ok(Value::String(
            items.iter().map(to_text).collect::<Vec<_>>().join(&to_text(sep)),
        )),
        ("join", [other, _]) => Ok(Value::String(to_text(other))),
        ("re_replace", [input, pattern, replacement]) => {
            let re = Regex::new(&to_text(pattern))
                .map_err(|e| template_error(format!("bad regex: {}", e)))?;
            Ok(Value::String(
                re.replace_all(&to_text(input), to_text(replacement).as_str())
                    .into_owned(),
            ))
        }
        _ => Err(template_error(format!(
            "wrong arguments for '{}' ({} given)",
            name,
            args.len()
        ))),
    }
}

/// Go-template truthiness: empty, zero, false and null are false.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Renders a value as template output.
pub fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(to_text).collect::<Vec<_>>().join(","),
        Value::Object(_) => String::new(),
    }
}
