//! Context and label expressions
//!
//! A changeset declares a boolean expression over names
//! (`dev and !test`, `v1, v2`, `(a or b) and not c`). A run selects a set of
//! names; the changeset is eligible when its expression holds for that set.
//! Names are compared case-insensitively. `,` is a synonym for `or`.

use std::collections::BTreeSet;
use std::fmt;

use super::result::{Error, Result};

/// Names selected for a run (e.g. `--contexts dev,local`)
///
/// An empty selection matches every changeset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection(BTreeSet<String>);

impl Selection {
    /// Parse a comma-separated list of names
    pub fn parse(s: &str) -> Self {
        Self(
            s.split(',')
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(&name.to_lowercase())
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(String::as_str).collect();
        write!(f, "{}", names.join(","))
    }
}

/// Parsed boolean expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    /// No expression declared
    Always,
    Name(String),
    Not(Box<Expression>),
    And(Box<Expression>, Box<Expression>),
    Or(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Ok(Self::Always);
        }
        let mut parser = ExprParser { tokens, pos: 0 };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::validation(format!(
                "unexpected '{}' in expression '{}'",
                parser.tokens[parser.pos], input
            )));
        }
        Ok(expr)
    }

    /// Evaluate against a selection; an empty selection matches everything
    pub fn matches(&self, selection: &Selection) -> bool {
        if selection.is_empty() {
            return true;
        }
        self.eval(selection)
    }

    fn eval(&self, selection: &Selection) -> bool {
        match self {
            Self::Always => true,
            Self::Name(name) => selection.contains(name),
            Self::Not(inner) => !inner.eval(selection),
            Self::And(a, b) => a.eval(selection) && b.eval(selection),
            Self::Or(a, b) => a.eval(selection) || b.eval(selection),
        }
    }

    pub fn is_always(&self) -> bool {
        matches!(self, Self::Always)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => Ok(()),
            Self::Name(n) => write!(f, "{}", n),
            Self::Not(inner) => write!(f, "!{}", inner),
            Self::And(a, b) => write!(f, "({} and {})", a, b),
            Self::Or(a, b) => write!(f, "({} or {})", a, b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Name(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Name(n) => write!(f, "{}", n),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Not => write!(f, "!"),
            Token::Open => write!(f, "("),
            Token::Close => write!(f, ")"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Or);
            }
            c if is_name_char(c) => {
                let mut word = String::new();
                while let Some(&c) = chars.peek() {
                    if !is_name_char(c) {
                        break;
                    }
                    word.push(c);
                    chars.next();
                }
                tokens.push(match word.to_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Name(word.to_lowercase()),
                });
            }
            other => {
                return Err(Error::validation(format!(
                    "invalid character '{}' in expression '{}'",
                    other, input
                )))
            }
        }
    }

    Ok(tokens)
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | '/')
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or_expr(&mut self) -> Result<Expression> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expression::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expression> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expression::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expression> {
        match self.next() {
            Some(Token::Not) => Ok(Expression::Not(Box::new(self.unary()?))),
            Some(Token::Open) => {
                let inner = self.or_expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(Error::validation("unbalanced parentheses in expression")),
                }
            }
            Some(Token::Name(n)) => Ok(Expression::Name(n)),
            Some(other) => Err(Error::validation(format!("unexpected '{}' in expression", other))),
            None => Err(Error::validation("expression ends unexpectedly")),
        }
    }
}
