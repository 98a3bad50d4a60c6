//! Condition expression parser and evaluator.
//!
//! Conditions select which gated outputs a contract applies to:
//!
//! ```text
//! content CONTAINS "password"
//! output.result.status == "error"
//! args.to ENDS_WITH "@competitor.com"
//! output.result.amount > 500
//! tool_name == "send_email" AND content MATCHES "\\b\\d{3}-\\d{2}-\\d{4}\\b"
//! NOT (user_message CONTAINS "refund")
//! ```
//!
//! Grammar (informal):
//! ```text
//! expr     = and ("OR" and)*
//! and      = unary ("AND" unary)*
//! unary    = "NOT" unary | "(" expr ")" | atom
//! atom     = field ["NOT"] OP value
//! field    = "output." PATH | "args." PATH | "content" | "tool_name"
//!          | "user_message" | "stage"
//! OP       = "CONTAINS" | "MATCHES" | "STARTS_WITH" | "ENDS_WITH"
//!          | "==" | "!=" | ">" | "<" | ">=" | "<="
//! value    = QUOTED_STRING | NUMBER
//! ```

use std::borrow::Cow;

use regex_lite::Regex;
use serde_json::Value;

/// A parsed condition tree.
#[derive(Debug, Clone)]
pub enum Condition {
    Atom(Atom),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    /// Empty condition
    Always,
}

#[derive(Debug, Clone)]
pub struct Atom {
    pub field: Field,
    pub op: Op,
    pub literal: Literal,
    /// Compiled once for MATCHES / NOT MATCHES
    regex: Option<Regex>,
}

/// A field reference in a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// `output.<path>`: a path into the candidate output
    Output(String),
    /// `args.<path>`: a path into the tool call arguments
    Arg(String),
    /// `content`: the output's text (response text, or the tool result)
    Content,
    ToolName,
    UserMessage,
    /// `stage`: "act" or "respond"
    Stage,
}

/// Comparison operators.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Contains,
    NotContains,
    Matches,
    NotMatches,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
}

/// A literal value in a condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(f64),
}

impl Literal {
    fn as_text(&self) -> Cow<'_, str> {
        match self {
            Literal::Str(s) => Cow::Borrowed(s),
            Literal::Num(n) => Cow::Owned(n.to_string()),
        }
    }
}

/// What a condition is evaluated against.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalContext<'a> {
    pub output: Option<&'a Value>,
    pub args: Option<&'a Value>,
    pub content: Option<&'a str>,
    pub tool_name: Option<&'a str>,
    pub user_message: Option<&'a str>,
    pub stage: Option<&'a str>,
}

impl Condition {
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        match self {
            Condition::Always => true,
            Condition::Atom(atom) => atom.evaluate(ctx),
            Condition::And(a, b) => a.evaluate(ctx) && b.evaluate(ctx),
            Condition::Or(a, b) => a.evaluate(ctx) || b.evaluate(ctx),
            Condition::Not(inner) => !inner.evaluate(ctx),
        }
    }
}

impl Atom {
    fn evaluate(&self, ctx: &EvalContext<'_>) -> bool {
        let field_value = self.resolve_field(ctx);
        let fv = field_value.as_deref();
        let needle = self.literal.as_text();
        match &self.op {
            Op::Contains => fv.is_some_and(|v| v.contains(needle.as_ref())),
            Op::NotContains => fv.is_none_or(|v| !v.contains(needle.as_ref())),
            Op::Matches => fv.is_some_and(|v| self.regex.as_ref().is_some_and(|re| re.is_match(v))),
            Op::NotMatches => {
                fv.is_none_or(|v| self.regex.as_ref().is_some_and(|re| !re.is_match(v)))
            }
            Op::StartsWith => fv.is_some_and(|v| v.starts_with(needle.as_ref())),
            Op::NotStartsWith => fv.is_none_or(|v| !v.starts_with(needle.as_ref())),
            Op::EndsWith => fv.is_some_and(|v| v.ends_with(needle.as_ref())),
            Op::NotEndsWith => fv.is_none_or(|v| !v.ends_with(needle.as_ref())),
            Op::Eq => match (fv, &self.literal) {
                (Some(v), Literal::Str(s)) => v == s,
                (Some(v), Literal::Num(n)) => {
                    v.parse::<f64>().is_ok_and(|x| (x - n).abs() < f64::EPSILON)
                }
                (None, _) => false,
            },
            Op::NotEq => match (fv, &self.literal) {
                (Some(v), Literal::Str(s)) => v != s,
                (Some(v), Literal::Num(n)) => {
                    v.parse::<f64>().is_ok_and(|x| (x - n).abs() >= f64::EPSILON)
                }
                (None, _) => true,
            },
            Op::Gt => self.compare_num(fv, |a, b| a > b),
            Op::Lt => self.compare_num(fv, |a, b| a < b),
            Op::Gte => self.compare_num(fv, |a, b| a >= b),
            Op::Lte => self.compare_num(fv, |a, b| a <= b),
        }
    }

    fn resolve_field<'a>(&self, ctx: &EvalContext<'a>) -> Option<Cow<'a, str>> {
        match &self.field {
            Field::Content => ctx.content.map(Cow::Borrowed),
            Field::ToolName => ctx.tool_name.map(Cow::Borrowed),
            Field::UserMessage => ctx.user_message.map(Cow::Borrowed),
            Field::Stage => ctx.stage.map(Cow::Borrowed),
            Field::Output(path) => lookup_path(ctx.output?, path),
            Field::Arg(path) => lookup_path(ctx.args?, path),
        }
    }

    fn compare_num(&self, field_value: Option<&str>, cmp: impl Fn(f64, f64) -> bool) -> bool {
        match (field_value, &self.literal) {
            (Some(v), Literal::Num(n)) => v.parse::<f64>().is_ok_and(|x| cmp(x, *n)),
            _ => false,
        }
    }
}

/// Follow a dotted path (`result.items.0.name`) into a JSON value.
fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<Cow<'a, str>> {
    let mut current = root;
    for part in path.split('.') {
        current = match current {
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            other => other.get(part)?,
        };
    }
    match current {
        Value::String(s) => Some(Cow::Borrowed(s)),
        Value::Null => None,
        other => Some(Cow::Owned(other.to_string())),
    }
}

// ─── Parser ──────────────────────────────────────────────────────────

/// Parse a condition expression string into a [`Condition`] tree.
///
/// Returns `Ok(Condition::Always)` for empty input.
pub fn parse_condition(input: &str) -> Result<Condition, String> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Condition::Always);
    }
    let tokens = tokenize(input)?;
    let (cond, rest) = parse_or(&tokens)?;
    if !rest.is_empty() {
        return Err(format!("unexpected tokens after expression: {rest:?}"));
    }
    Ok(cond)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    And,
    Or,
    Not,
    Contains,
    Matches,
    StartsWith,
    EndsWith,
    Eq,
    NotEq,
    Gt,
    Lt,
    Gte,
    Lte,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        // Keep the backslash unless it escapes the quote, so
                        // regex escapes like `\d` survive.
                        Some((_, '\\')) => match chars.next() {
                            Some((_, ch)) if ch == quote || ch == '\\' => s.push(ch),
                            Some((_, ch)) => {
                                s.push('\\');
                                s.push(ch);
                            }
                            None => return Err("unterminated string literal".into()),
                        },
                        Some((_, ch)) if ch == quote => break,
                        Some((_, ch)) => s.push(ch),
                        None => return Err(format!("unterminated string literal at {pos}")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '>' | '<' | '=' | '!' => {
                chars.next();
                let followed_by_eq = chars.peek().is_some_and(|&(_, n)| n == '=');
                if followed_by_eq {
                    chars.next();
                }
                tokens.push(match (c, followed_by_eq) {
                    ('>', true) => Token::Gte,
                    ('>', false) => Token::Gt,
                    ('<', true) => Token::Lte,
                    ('<', false) => Token::Lt,
                    ('=', _) => Token::Eq,
                    ('!', true) => Token::NotEq,
                    _ => Token::Not,
                });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num_str = String::new();
                num_str.push(c);
                chars.next();
                while let Some(&(_, nc)) = chars.peek() {
                    if nc.is_ascii_digit() || nc == '.' {
                        num_str.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let n = num_str
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number at {pos}: {num_str}"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphanumeric() || c == '_' || c == '.' => {
                let mut word = String::new();
                while let Some(&(_, wc)) = chars.peek() {
                    if wc.is_alphanumeric() || wc == '_' || wc == '.' {
                        word.push(wc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "CONTAINS" => Token::Contains,
                    "MATCHES" => Token::Matches,
                    "STARTS_WITH" => Token::StartsWith,
                    "ENDS_WITH" => Token::EndsWith,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            _ => return Err(format!("unexpected character at {pos}: {c}")),
        }
    }

    Ok(tokens)
}

fn parse_or(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (mut left, mut rest) = parse_and(tokens)?;
    while rest.first() == Some(&Token::Or) {
        let (right, remaining) = parse_and(&rest[1..])?;
        left = Condition::Or(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_and(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (mut left, mut rest) = parse_unary(tokens)?;
    while rest.first() == Some(&Token::And) {
        let (right, remaining) = parse_unary(&rest[1..])?;
        left = Condition::And(Box::new(left), Box::new(right));
        rest = remaining;
    }
    Ok((left, rest))
}

fn parse_unary(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    // A leading NOT is logical negation; `field NOT OP` is handled in parse_op.
    if tokens.first() == Some(&Token::Not) {
        let (inner, rest) = parse_unary(&tokens[1..])?;
        return Ok((Condition::Not(Box::new(inner)), rest));
    }
    parse_primary(tokens)
}

fn parse_primary(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    if tokens.first() == Some(&Token::LParen) {
        let (inner, rest) = parse_or(&tokens[1..])?;
        if rest.first() != Some(&Token::RParen) {
            return Err("expected closing parenthesis".into());
        }
        return Ok((inner, &rest[1..]));
    }
    parse_atom(tokens)
}

fn parse_atom(tokens: &[Token]) -> Result<(Condition, &[Token]), String> {
    let (field, rest) = parse_field(tokens)?;
    let (op, rest) = parse_op(rest)?;
    let (literal, rest) = parse_literal(rest)?;

    let regex = match op {
        Op::Matches | Op::NotMatches => Some(
            Regex::new(&literal.as_text()).map_err(|e| format!("invalid regex: {e}"))?,
        ),
        _ => None,
    };

    Ok((
        Condition::Atom(Atom {
            field,
            op,
            literal,
            regex,
        }),
        rest,
    ))
}

fn parse_field(tokens: &[Token]) -> Result<(Field, &[Token]), String> {
    let Some(Token::Ident(name)) = tokens.first() else {
        return Err(format!("expected field name, got {:?}", tokens.first()));
    };
    let field = if let Some(path) = name.strip_prefix("output.") {
        Field::Output(path.to_string())
    } else if let Some(path) = name.strip_prefix("args.") {
        Field::Arg(path.to_string())
    } else {
        match name.as_str() {
            "content" => Field::Content,
            "tool_name" => Field::ToolName,
            "user_message" => Field::UserMessage,
            "stage" => Field::Stage,
            // Bare names read from the output
            other => Field::Output(other.to_string()),
        }
    };
    Ok((field, &tokens[1..]))
}

fn parse_op(tokens: &[Token]) -> Result<(Op, &[Token]), String> {
    if tokens.first() == Some(&Token::Not) {
        let (base_op, rest) = parse_base_op(&tokens[1..])?;
        let negated = match base_op {
            Op::Contains => Op::NotContains,
            Op::Matches => Op::NotMatches,
            Op::StartsWith => Op::NotStartsWith,
            Op::EndsWith => Op::NotEndsWith,
            other => return Err(format!("cannot negate operator: {other:?}")),
        };
        return Ok((negated, rest));
    }
    parse_base_op(tokens)
}

fn parse_base_op(tokens: &[Token]) -> Result<(Op, &[Token]), String> {
    let op = match tokens.first() {
        Some(Token::Contains) => Op::Contains,
        Some(Token::Matches) => Op::Matches,
        Some(Token::StartsWith) => Op::StartsWith,
        Some(Token::EndsWith) => Op::EndsWith,
        Some(Token::Eq) => Op::Eq,
        Some(Token::NotEq) => Op::NotEq,
        Some(Token::Gt) => Op::Gt,
        Some(Token::Lt) => Op::Lt,
        Some(Token::Gte) => Op::Gte,
        Some(Token::Lte) => Op::Lte,
        other => return Err(format!("expected operator, got {other:?}")),
    };
    Ok((op, &tokens[1..]))
}

fn parse_literal(tokens: &[Token]) -> Result<(Literal, &[Token]), String> {
    match tokens.first() {
        Some(Token::Str(s)) => Ok((Literal::Str(s.clone()), &tokens[1..])),
        Some(Token::Num(n)) => Ok((Literal::Num(*n), &tokens[1..])),
        // Bare identifier as a string value
        Some(Token::Ident(s)) => Ok((Literal::Str(s.clone()), &tokens[1..])),
        other => Err(format!("expected value (string or number), got {other:?}")),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────
