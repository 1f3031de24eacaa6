//! `.berth` file parser built on `nom`.
//!
//! Transforms raw `.berth` text into a validated AST through
//! lexing, parsing, and static analysis phases.

pub mod ast;
pub mod lexer;
pub mod validator;

use std::collections::BTreeMap;

use berth_common::error::{BerthError, Result};

use self::ast::{BuildDecl, ServiceDecl, ServiceFile};
use self::lexer::Token;

/// Cursor into a token stream for recursive-descent parsing.
struct TokenCursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    const fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect_identifier(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::Identifier(s)) => Ok(s.clone()),
            other => Err(parse_err(format!("expected identifier, got {other:?}"))),
        }
    }

    fn expect_token(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(tok) if tok == expected => Ok(()),
            other => Err(parse_err(format!("expected {expected:?}, got {other:?}"))),
        }
    }

    fn expect_string(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::StringLiteral(s)) => Ok(s.clone()),
            other => Err(parse_err(format!("expected string literal, got {other:?}"))),
        }
    }

    fn expect_integer(&mut self) -> Result<i64> {
        match self.advance() {
            Some(Token::Integer(n)) => Ok(*n),
            other => Err(parse_err(format!("expected integer, got {other:?}"))),
        }
    }

    /// Accepts either a quoted string or an integer, as text.
    fn expect_scalar(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::StringLiteral(s)) => Ok(s.clone()),
            Some(Token::Integer(n)) => Ok(n.to_string()),
            Some(Token::True) => Ok("true".into()),
            Some(Token::False) => Ok("false".into()),
            other => Err(parse_err(format!("expected value, got {other:?}"))),
        }
    }

    const fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }
}

const fn parse_err(message: String) -> BerthError {
    BerthError::Config { message }
}

fn skip_optional_comma(cursor: &mut TokenCursor<'_>) {
    if cursor.peek() == Some(&Token::Comma) {
        let _ = cursor.advance();
    }
}

/// Parses a `.berth` file from its source text.
///
/// # Errors
///
/// Returns an error if the input contains syntax errors or fails validation.
pub fn parse_berth(input: &str) -> Result<ServiceFile> {
    tracing::debug!("parsing .berth input");
    let tokens = lexer::tokenize(input)?;
    let mut cursor = TokenCursor::new(&tokens);
    let file = parse_file(&mut cursor)?;
    validator::validate(&file)?;
    Ok(file)
}

fn parse_file(cursor: &mut TokenCursor<'_>) -> Result<ServiceFile> {
    let mut file = ServiceFile::default();

    while let Some(tok) = cursor.peek() {
        match tok {
            Token::Service => file.services.push(parse_service(cursor)?),
            other => {
                return Err(parse_err(format!(
                    "expected SERVICE at top level, got {other:?}"
                )));
            }
        }
    }

    Ok(file)
}

fn parse_service(cursor: &mut TokenCursor<'_>) -> Result<ServiceDecl> {
    cursor.expect_token(&Token::Service)?;
    let name = cursor.expect_identifier()?;
    cursor.expect_token(&Token::BraceOpen)?;

    let mut svc = ServiceDecl {
        name,
        ..ServiceDecl::default()
    };

    while cursor.peek() != Some(&Token::BraceClose) {
        if cursor.at_end() {
            return Err(parse_err(format!(
                "unexpected end of input inside SERVICE {} block",
                svc.name
            )));
        }
        parse_property(cursor, &mut svc)?;
        skip_optional_comma(cursor);
    }

    cursor.expect_token(&Token::BraceClose)?;
    Ok(svc)
}

fn parse_property(cursor: &mut TokenCursor<'_>, svc: &mut ServiceDecl) -> Result<()> {
    let key = cursor.expect_identifier()?;
    cursor.expect_token(&Token::Equals)?;

    match key.as_str() {
        "image" => svc.image = Some(cursor.expect_string()?),
        "build" => svc.build = Some(parse_build(cursor)?),
        "command" => svc.command = parse_string_list(cursor)?,
        "port" => svc.port = Some(cursor.expect_integer()?),
        "publish" => svc.publish = parse_string_list(cursor)?,
        "network" => svc.networks = vec![cursor.expect_string()?],
        "networks" => svc.networks = parse_string_list(cursor)?,
        "restart" => svc.restart = Some(cursor.expect_string()?),
        "env_file" => svc.env_file = Some(cursor.expect_string()?),
        "env" => svc.env = parse_env_map(cursor)?,
        "workers" => svc.workers = Some(cursor.expect_integer()?),
        _ => {
            return Err(parse_err(format!("unknown service property: {key}")));
        }
    }

    Ok(())
}

fn parse_build(cursor: &mut TokenCursor<'_>) -> Result<BuildDecl> {
    cursor.expect_token(&Token::BraceOpen)?;
    let mut build = BuildDecl::default();

    while cursor.peek() != Some(&Token::BraceClose) {
        if cursor.at_end() {
            return Err(parse_err("unexpected end of input inside build block".into()));
        }
        let key = cursor.expect_identifier()?;
        cursor.expect_token(&Token::Equals)?;
        match key.as_str() {
            "base" => build.base = Some(cursor.expect_string()?),
            "manifest" => build.manifest = Some(cursor.expect_string()?),
            "source" => build.source = Some(cursor.expect_string()?),
            "entrypoint" => build.entrypoint = Some(cursor.expect_string()?),
            "script" => build.script = Some(cursor.expect_string()?),
            "factory" => build.factory = Some(cursor.expect_string()?),
            "interpreter" => build.interpreter = parse_string_list(cursor)?,
            "loader" => build.loader = parse_string_list(cursor)?,
            "workdir" => build.workdir = Some(cursor.expect_string()?),
            _ => {
                return Err(parse_err(format!("unknown build property: {key}")));
            }
        }
        skip_optional_comma(cursor);
    }

    cursor.expect_token(&Token::BraceClose)?;
    Ok(build)
}

fn parse_string_list(cursor: &mut TokenCursor<'_>) -> Result<Vec<String>> {
    cursor.expect_token(&Token::BracketOpen)?;
    let mut items = Vec::new();

    while cursor.peek() != Some(&Token::BracketClose) {
        if cursor.at_end() {
            return Err(parse_err("unexpected end of input inside list".into()));
        }
        items.push(cursor.expect_string()?);
        skip_optional_comma(cursor);
    }

    cursor.expect_token(&Token::BracketClose)?;
    Ok(items)
}

fn parse_env_map(cursor: &mut TokenCursor<'_>) -> Result<BTreeMap<String, String>> {
    cursor.expect_token(&Token::BraceOpen)?;
    let mut map = BTreeMap::new();

    while cursor.peek() != Some(&Token::BraceClose) {
        if cursor.at_end() {
            return Err(parse_err("unexpected end of input inside env block".into()));
        }
        let key = cursor.expect_identifier()?;
        cursor.expect_token(&Token::Equals)?;
        let value = cursor.expect_scalar()?;
        if map.insert(key.clone(), value).is_some() {
            return Err(parse_err(format!("duplicate env key: {key}")));
        }
        skip_optional_comma(cursor);
    }

    cursor.expect_token(&Token::BraceClose)?;
    Ok(map)
}
