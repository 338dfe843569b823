//! Route criteria: a small boolean language over request attributes.
//!
//! ```text
//! expr      := conj ( "||" conj )*
//! conj      := term ( "&&" term )*
//! term      := "(" expr ")" | predicate
//! predicate := Name "(" string ( "," string )* ")"
//! string    := `...` | "..."
//! ```
//!
//! Evaluation yields a specificity score instead of a plain boolean so
//! the router can rank overlapping criteria. Conjunctions add up the
//! scores of their parts, disjunctions keep the best matching branch.

use std::fmt;

use regex::Regex;

use super::request::RequestView;

/// Errors from parsing a criterion string.
#[derive(Debug, thiserror::Error)]
pub enum CriterionError {
    #[error("syntax error at offset {pos}: {message}")]
    Syntax { pos: usize, message: String },

    #[error("unknown predicate: {0}")]
    UnknownPredicate(String),

    #[error("{name} takes {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: &'static str,
        found: usize,
    },

    #[error("invalid regexp in {name}: {source}")]
    Regex {
        name: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid header name in {name}: {value}")]
    HeaderName { name: String, value: String },
}

/// A parsed criterion.
#[derive(Debug)]
pub struct Criterion {
    source: String,
    expr: Expr,
}

impl Criterion {
    pub fn parse(source: &str) -> Result<Self, CriterionError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if let Some(tok) = parser.peek() {
            return Err(CriterionError::Syntax {
                pos: tok.pos,
                message: "unexpected trailing input".to_string(),
            });
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Specificity of the match, or `None` when the request does not match.
    pub fn score(&self, req: &RequestView<'_>) -> Option<u32> {
        self.expr.score(req)
    }

    pub fn matches(&self, req: &RequestView<'_>) -> bool {
        self.score(req).is_some()
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Pred(Predicate),
}

impl Expr {
    fn score(&self, req: &RequestView<'_>) -> Option<u32> {
        match self {
            Expr::Or(branches) => branches.iter().filter_map(|b| b.score(req)).max(),
            Expr::And(parts) => parts
                .iter()
                .try_fold(0u32, |acc, p| p.score(req).map(|s| acc.saturating_add(s))),
            Expr::Pred(pred) => pred.score(req),
        }
    }
}

#[derive(Debug)]
enum PathPattern {
    Exact(String),
    /// `<name>` segments match any single non-empty segment.
    Template(Vec<Option<String>>),
}

impl PathPattern {
    fn new(raw: &str) -> Self {
        if !raw.contains('<') {
            return PathPattern::Exact(raw.to_string());
        }
        let segments = raw
            .split('/')
            .map(|seg| {
                if seg.starts_with('<') && seg.ends_with('>') {
                    None
                } else {
                    Some(seg.to_string())
                }
            })
            .collect();
        PathPattern::Template(segments)
    }

    fn score(&self, path: &str) -> Option<u32> {
        match self {
            PathPattern::Exact(p) => (p == path).then(|| 10_000 + p.len() as u32),
            PathPattern::Template(segments) => {
                let parts: Vec<&str> = path.split('/').collect();
                if parts.len() != segments.len() {
                    return None;
                }
                let mut literal_len = 0;
                for (seg, part) in segments.iter().zip(parts) {
                    match seg {
                        Some(lit) if lit == part => literal_len += lit.len() as u32,
                        Some(_) => return None,
                        None if part.is_empty() => return None,
                        None => {}
                    }
                }
                Some(5_000 + literal_len)
            }
        }
    }
}

#[derive(Debug)]
enum Predicate {
    Host(Vec<String>),
    HostRegexp(Vec<Regex>),
    Path(Vec<PathPattern>),
    PathRegexp(Vec<Regex>),
    Method(Vec<String>),
    MethodRegexp(Vec<Regex>),
    Header(http::HeaderName, String),
    HeaderRegexp(http::HeaderName, Regex),
}

impl Predicate {
    fn build(name: &str, args: Vec<String>) -> Result<Self, CriterionError> {
        let at_least_one = |args: &Vec<String>| {
            if args.is_empty() {
                Err(CriterionError::Arity {
                    name: name.to_string(),
                    expected: "at least 1",
                    found: 0,
                })
            } else {
                Ok(())
            }
        };
        let regexes = |args: Vec<String>| -> Result<Vec<Regex>, CriterionError> {
            args.iter()
                .map(|a| {
                    Regex::new(a).map_err(|source| CriterionError::Regex {
                        name: name.to_string(),
                        source,
                    })
                })
                .collect()
        };

        match name {
            "Host" => {
                at_least_one(&args)?;
                Ok(Predicate::Host(
                    args.iter().map(|h| h.to_ascii_lowercase()).collect(),
                ))
            }
            "HostRegexp" => {
                at_least_one(&args)?;
                Ok(Predicate::HostRegexp(regexes(args)?))
            }
            "Path" => {
                at_least_one(&args)?;
                Ok(Predicate::Path(args.iter().map(|p| PathPattern::new(p)).collect()))
            }
            "PathRegexp" => {
                at_least_one(&args)?;
                Ok(Predicate::PathRegexp(regexes(args)?))
            }
            "Method" => {
                at_least_one(&args)?;
                Ok(Predicate::Method(
                    args.iter().map(|m| m.to_ascii_uppercase()).collect(),
                ))
            }
            "MethodRegexp" => {
                at_least_one(&args)?;
                Ok(Predicate::MethodRegexp(regexes(args)?))
            }
            "Header" | "HeaderRegexp" => {
                let [header, value]: [String; 2] =
                    args.try_into().map_err(|args: Vec<String>| CriterionError::Arity {
                        name: name.to_string(),
                        expected: "2",
                        found: args.len(),
                    })?;
                let header_name = http::HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                    CriterionError::HeaderName {
                        name: name.to_string(),
                        value: header.clone(),
                    }
                })?;
                if name == "Header" {
                    Ok(Predicate::Header(header_name, value))
                } else {
                    let re = Regex::new(&value).map_err(|source| CriterionError::Regex {
                        name: name.to_string(),
                        source,
                    })?;
                    Ok(Predicate::HeaderRegexp(header_name, re))
                }
            }
            other => Err(CriterionError::UnknownPredicate(other.to_string())),
        }
    }

    fn score(&self, req: &RequestView<'_>) -> Option<u32> {
        match self {
            Predicate::Host(hosts) => {
                let host = req.host();
                hosts
                    .iter()
                    .find(|h| **h == host)
                    .map(|h| 1_000 + h.len() as u32)
            }
            Predicate::HostRegexp(res) => res.iter().any(|re| re.is_match(&req.host())).then_some(100),
            Predicate::Path(patterns) => {
                let path = req.path();
                patterns.iter().filter_map(|p| p.score(&path)).max()
            }
            Predicate::PathRegexp(res) => {
                let path = req.path();
                res.iter().any(|re| re.is_match(&path)).then_some(500)
            }
            Predicate::Method(methods) => methods
                .iter()
                .any(|m| m == req.method.as_str())
                .then_some(10),
            Predicate::MethodRegexp(res) => res
                .iter()
                .any(|re| re.is_match(req.method.as_str()))
                .then_some(5),
            Predicate::Header(name, value) => req
                .headers
                .get_all(name)
                .iter()
                .any(|v| v.as_bytes() == value.as_bytes())
                .then_some(50),
            Predicate::HeaderRegexp(name, re) => req
                .headers
                .get_all(name)
                .iter()
                .any(|v| re.is_match(&String::from_utf8_lossy(v.as_bytes())))
                .then_some(20),
        }
    }
}

// ========== Lexer ==========

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Str(String),
    LParen,
    RParen,
    Comma,
    And,
    Or,
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

fn tokenize(source: &str) -> Result<Vec<Token>, CriterionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        let syntax = |message: &str| CriterionError::Syntax {
            pos,
            message: message.to_string(),
        };

        let kind = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '(' => {
                chars.next();
                TokenKind::LParen
            }
            ')' => {
                chars.next();
                TokenKind::RParen
            }
            ',' => {
                chars.next();
                TokenKind::Comma
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        if c == '&' {
                            TokenKind::And
                        } else {
                            TokenKind::Or
                        }
                    }
                    _ => return Err(syntax("expected && or ||")),
                }
            }
            '`' | '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == c {
                        closed = true;
                        break;
                    }
                    if ch == '\\' && c == '"' {
                        match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        }
                        continue;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(syntax("unterminated string"));
                }
                TokenKind::Str(value)
            }
            c if c.is_ascii_alphabetic() => {
                let mut ident = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(ident)
            }
            _ => return Err(syntax(&format!("unexpected character {:?}", c))),
        };

        tokens.push(Token { kind, pos });
    }

    Ok(tokens)
}

// ========== Parser ==========

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn end_pos(&self) -> usize {
        self.tokens.last().map(|t| t.pos + 1).unwrap_or(0)
    }

    fn error(&self, message: &str) -> CriterionError {
        CriterionError::Syntax {
            pos: self.peek().map(|t| t.pos).unwrap_or_else(|| self.end_pos()),
            message: message.to_string(),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek().map(|t| &t.kind) == Some(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), CriterionError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(&format!("expected {}", what)))
        }
    }

    fn expr(&mut self) -> Result<Expr, CriterionError> {
        let mut branches = vec![self.conj()?];
        while self.eat(&TokenKind::Or) {
            branches.push(self.conj()?);
        }
        Ok(if branches.len() == 1 {
            branches.remove(0)
        } else {
            Expr::Or(branches)
        })
    }

    fn conj(&mut self) -> Result<Expr, CriterionError> {
        let mut parts = vec![self.term()?];
        while self.eat(&TokenKind::And) {
            parts.push(self.term()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            Expr::And(parts)
        })
    }

    fn term(&mut self) -> Result<Expr, CriterionError> {
        if self.eat(&TokenKind::LParen) {
            let inner = self.expr()?;
            self.expect(&TokenKind::RParen, "')'")?;
            return Ok(inner);
        }

        let name = match self.peek().map(|t| &t.kind) {
            Some(TokenKind::Ident(name)) => name.clone(),
            _ => return Err(self.error("expected predicate")),
        };
        self.pos += 1;

        self.expect(&TokenKind::LParen, "'('")?;
        let mut args = Vec::new();
        if !self.eat(&TokenKind::RParen) {
            loop {
                match self.peek().map(|t| &t.kind) {
                    Some(TokenKind::Str(s)) => {
                        args.push(s.clone());
                        self.pos += 1;
                    }
                    _ => return Err(self.error("expected string argument")),
                }
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                self.expect(&TokenKind::RParen, "')'")?;
                break;
            }
        }

        Ok(Expr::Pred(Predicate::build(&name, args)?))
    }
}
