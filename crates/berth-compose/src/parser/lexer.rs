//! Tokenization of `.berth` source text using `nom`.
//!
//! Produces a stream of [`Token`]s from raw input for the parser to consume.
//! Whitespace and `//` or `#` line comments are discarded between tokens.

use berth_common::error::{BerthError, Result};
use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1, multispace1, not_line_ending},
    combinator::value,
    multi::many0,
    sequence::preceded,
};

/// A token in the `.berth` language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `SERVICE` keyword.
    Service,
    /// Boolean literal `true`.
    True,
    /// Boolean literal `false`.
    False,
    /// An identifier (service name, property name, env key).
    Identifier(String),
    /// A double-quoted string literal.
    StringLiteral(String),
    /// An integer literal.
    Integer(i64),
    /// `{` opening brace.
    BraceOpen,
    /// `}` closing brace.
    BraceClose,
    /// `[` opening bracket.
    BracketOpen,
    /// `]` closing bracket.
    BracketClose,
    /// `=` assignment.
    Equals,
    /// `,` comma separator.
    Comma,
}

fn skip_trivia(input: &str) -> IResult<&str, ()> {
    let slash_comment = value((), preceded(tag("//"), not_line_ending));
    let hash_comment = value((), preceded(char('#'), not_line_ending));
    let ws = value((), multispace1);
    let (input, _) = many0(alt((ws, slash_comment, hash_comment))).parse(input)?;
    Ok((input, ()))
}

/// Parses a double-quoted string literal with basic escape support.
fn string_literal(input: &str) -> IResult<&str, Token> {
    let (input, _) = char('"')(input)?;
    let mut result = String::new();
    let mut chars = input.char_indices();
    loop {
        match chars.next() {
            Some((idx, '"')) => {
                let remaining = &input[idx + 1..];
                return Ok((remaining, Token::StringLiteral(result)));
            }
            Some((_, '\\')) => match chars.next() {
                Some((_, 'n')) => result.push('\n'),
                Some((_, 't')) => result.push('\t'),
                Some((_, '\\')) => result.push('\\'),
                Some((_, '"')) => result.push('"'),
                Some((_, c)) => {
                    result.push('\\');
                    result.push(c);
                }
                None => return Err(unterminated(input)),
            },
            Some((_, c)) => result.push(c),
            None => return Err(unterminated(input)),
        }
    }
}

fn unterminated(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Failure(nom::error::Error::new(input, nom::error::ErrorKind::Char))
}

fn integer_literal(input: &str) -> IResult<&str, Token> {
    let (input, digits) = digit1(input)?;
    let val: i64 = digits.parse().map_err(|_| {
        nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Digit))
    })?;
    Ok((input, Token::Integer(val)))
}

const fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

const fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'
}

fn identifier_or_keyword(input: &str) -> IResult<&str, Token> {
    let (input, first) = take_while1(is_ident_start)(input)?;
    let (input, rest) = take_while(is_ident_continue)(input)?;
    let word = format!("{first}{rest}");
    let token = match word.as_str() {
        "SERVICE" => Token::Service,
        "true" => Token::True,
        "false" => Token::False,
        _ => Token::Identifier(word),
    };
    Ok((input, token))
}

fn symbol(input: &str) -> IResult<&str, Token> {
    alt((
        value(Token::BraceOpen, char('{')),
        value(Token::BraceClose, char('}')),
        value(Token::BracketOpen, char('[')),
        value(Token::BracketClose, char(']')),
        value(Token::Equals, char('=')),
        value(Token::Comma, char(',')),
    ))
    .parse(input)
}

fn single_token(input: &str) -> IResult<&str, Token> {
    alt((
        string_literal,
        symbol,
        integer_literal,
        identifier_or_keyword,
    ))
    .parse(input)
}

/// Tokenizes a `.berth` source string into a vector of tokens.
///
/// # Errors
///
/// Returns an error if the input contains characters that cannot be tokenized.
pub fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut remaining = input;

    loop {
        let (rest, ()) = skip_trivia(remaining).map_err(|e| BerthError::Config {
            message: format!("lexer error skipping whitespace: {e}"),
        })?;
        remaining = rest;

        if remaining.is_empty() {
            break;
        }

        let (rest, token) = single_token(remaining).map_err(|e| BerthError::Config {
            message: format!(
                "unexpected character at: \"{}\" ({e})",
                remaining.chars().take(20).collect::<String>()
            ),
        })?;
        tokens.push(token);
        remaining = rest;
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_keywords_and_symbols() {
        let tokens = tokenize("SERVICE true false { } [ ] = ,").expect("tokenize");
        assert_eq!(
            tokens,
            vec![
                Token::Service,
                Token::True,
                Token::False,
                Token::BraceOpen,
                Token::BraceClose,
                Token::BracketOpen,
                Token::BracketClose,
                Token::Equals,
                Token::Comma,
            ]
        );
    }

    #[test]
    fn tokenize_string_with_escapes() {
        let tokens = tokenize(r#""line\nnew\"quote""#).expect("tokenize");
        assert_eq!(tokens, vec![Token::StringLiteral("line\nnew\"quote".into())]);
    }

    #[test]
    fn tokenize_unterminated_string_fails() {
        assert!(tokenize(r#""open"#).is_err());
    }

    #[test]
    fn tokenize_identifiers_with_dashes_and_dots() {
        let tokens = tokenize("image-api env_file DB.HOST").expect("tokenize");
        assert_eq!(
            tokens,
            vec![
                Token::Identifier("image-api".into()),
                Token::Identifier("env_file".into()),
                Token::Identifier("DB.HOST".into()),
            ]
        );
    }

    #[test]
    fn tokenize_skips_both_comment_styles() {
        let input = "# header\nSERVICE web // trailing\n{ port = 5000 }";
        let tokens = tokenize(input).expect("tokenize");
        assert_eq!(
            tokens,
            vec![
                Token::Service,
                Token::Identifier("web".into()),
                Token::BraceOpen,
                Token::Identifier("port".into()),
                Token::Equals,
                Token::Integer(5000),
                Token::BraceClose,
            ]
        );
    }

    #[test]
    fn tokenize_error_on_invalid_char() {
        assert!(tokenize("SERVICE @web").is_err());
    }

    #[test]
    fn tokenize_empty_and_comment_only_input() {
        assert!(tokenize("").expect("tokenize").is_empty());
        assert!(tokenize("// nothing\n# here").expect("tokenize").is_empty());
    }
}
