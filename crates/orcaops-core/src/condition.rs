//! Restricted condition expressions for workflow gating.
//!
//! Supports exactly the grammar used inside `${{ ... }}` markers:
//! `jobs.<name>.status` and `env.<KEY>` references, string literals,
//! `==`/`!=`, `and`/`or`/`not` and parentheses. A dedicated lexer and
//! recursive-descent parser enforce the grammar; nothing is ever handed to a
//! general-purpose evaluator. References to unknown jobs or environment
//! keys evaluate to false.

use crate::types::JobStatus;
use crate::OrcaError;
use std::collections::HashMap;

/// Named values visible to a condition expression.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    pub job_statuses: HashMap<String, JobStatus>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    EqEq,
    NotEq,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    JobStatus(String),
    EnvVar(String),
    Literal(String),
    Eq(Box<Expr>, Box<Expr>),
    NotEq(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
    Missing,
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !s.is_empty(),
            Value::Missing => false,
        }
    }
}

/// Parses and evaluates restricted condition expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates a condition, accepting either a bare expression or one
    /// wrapped in `${{ ... }}`.
    pub fn evaluate(&self, condition: &str, ctx: &ConditionContext) -> Result<bool, OrcaError> {
        let source = strip_marker(condition);
        if source.trim().is_empty() {
            return Err(OrcaError::Condition("empty condition expression".to_string()));
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(OrcaError::Condition(format!(
                "unexpected trailing input in condition '{source}'"
            )));
        }
        Ok(eval(&expr, ctx).truthy())
    }
}

fn strip_marker(condition: &str) -> &str {
    let trimmed = condition.trim();
    trimmed
        .strip_prefix("${{")
        .and_then(|rest| rest.strip_suffix("}}"))
        .unwrap_or(trimmed)
}

fn tokenize(source: &str) -> Result<Vec<Token>, OrcaError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(OrcaError::Condition("single '=' is not an operator".to_string()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    return Err(OrcaError::Condition("'!' is not an operator, use 'not'".to_string()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(OrcaError::Condition("unterminated string literal".to_string()))
                        }
                    }
                }
                tokens.push(Token::Str(literal));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.get(i) {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        ident.push(ch);
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(ident),
                });
            }
            other => {
                return Err(OrcaError::Condition(format!(
                    "unexpected character '{other}' in condition"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Expr, OrcaError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, OrcaError> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, OrcaError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, OrcaError> {
        let left = self.parse_primary()?;
        match self.peek() {
            Some(Token::EqEq) => {
                self.advance();
                let right = self.parse_primary()?;
                Ok(Expr::Eq(Box::new(left), Box::new(right)))
            }
            Some(Token::NotEq) => {
                self.advance();
                let right = self.parse_primary()?;
                Ok(Expr::NotEq(Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, OrcaError> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(OrcaError::Condition("expected closing ')'".to_string())),
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(s)),
            Some(Token::Ident(ident)) => parse_reference(&ident),
            other => Err(OrcaError::Condition(format!(
                "expected identifier, string or '(', got {other:?}"
            ))),
        }
    }
}

/// Only `jobs.<name>.status` and `env.<KEY>` references are legal.
fn parse_reference(ident: &str) -> Result<Expr, OrcaError> {
    if let Some(rest) = ident.strip_prefix("jobs.") {
        if let Some(job) = rest.strip_suffix(".status") {
            if !job.is_empty() && !job.contains('.') {
                return Ok(Expr::JobStatus(job.to_string()));
            }
        }
        return Err(OrcaError::Condition(format!(
            "'{ident}' is not of the form jobs.<name>.status"
        )));
    }
    if let Some(key) = ident.strip_prefix("env.") {
        if !key.is_empty() && !key.contains('.') {
            return Ok(Expr::EnvVar(key.to_string()));
        }
        return Err(OrcaError::Condition(format!("'{ident}' is not of the form env.<KEY>")));
    }
    Err(OrcaError::Condition(format!(
        "unknown identifier '{ident}': only jobs.<name>.status and env.<KEY> are allowed"
    )))
}

fn eval(expr: &Expr, ctx: &ConditionContext) -> Value {
    match expr {
        Expr::Literal(s) => Value::Str(s.clone()),
        Expr::JobStatus(job) => ctx
            .job_statuses
            .get(job)
            .map(|s| Value::Str(s.as_condition_str().to_string()))
            .unwrap_or(Value::Missing),
        Expr::EnvVar(key) => ctx
            .env
            .get(key)
            .map(|v| Value::Str(v.clone()))
            .unwrap_or(Value::Missing),
        // A comparison touching a missing reference is false either way.
        Expr::Eq(a, b) => match (eval(a, ctx), eval(b, ctx)) {
            (Value::Missing, _) | (_, Value::Missing) => Value::Bool(false),
            (left, right) => Value::Bool(left == right),
        },
        Expr::NotEq(a, b) => match (eval(a, ctx), eval(b, ctx)) {
            (Value::Missing, _) | (_, Value::Missing) => Value::Bool(false),
            (left, right) => Value::Bool(left != right),
        },
        Expr::And(a, b) => Value::Bool(eval(a, ctx).truthy() && eval(b, ctx).truthy()),
        Expr::Or(a, b) => Value::Bool(eval(a, ctx).truthy() || eval(b, ctx).truthy()),
        Expr::Not(inner) => Value::Bool(!eval(inner, ctx).truthy()),
    }
}
