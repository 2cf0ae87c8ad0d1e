//! Parser for deferred annotation text.
//!
//! Accepts the subset of expression syntax that appears in forward
//! references: dotted names, `None`, string and integer literals,
//! subscripts (`X[a, b]`) and `|` unions.

use std::iter::Peekable;
use std::str::CharIndices;

use thiserror::Error;

/// Deepest bracket nesting accepted in annotation text
pub const MAX_NESTING: usize = 100;

/// Parsed form of a deferred annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Name(String),
    None,
    Str(String),
    Int(i64),
    Subscript(Box<Expr>, Vec<Expr>),
    Union(Box<Expr>, Box<Expr>),
}

/// Errors raised while parsing annotation text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unexpected character `{0}` at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unexpected end of input")]
    UnexpectedEnd,
    #[error("unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("integer literal `{0}` out of range")]
    IntOverflow(String),
    #[error("annotation nested deeper than {0} levels")]
    TooDeep(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LBracket,
    RBracket,
    Comma,
    Pipe,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(name) => name.clone(),
            Token::Str(text) => format!("{:?}", text),
            Token::Int(value) => value.to_string(),
            Token::LBracket => "[".to_string(),
            Token::RBracket => "]".to_string(),
            Token::Comma => ",".to_string(),
            Token::Pipe => "|".to_string(),
        }
    }
}

//-----------------------------------------------------------------------------
// Lexer
//-----------------------------------------------------------------------------

fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, ch)) = chars.peek() {
        match ch {
            c if c.is_whitespace() => {
                chars.next();
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '|' => {
                chars.next();
                tokens.push(Token::Pipe);
            }
            '\'' | '"' => {
                chars.next();
                tokens.push(Token::Str(lex_string(&mut chars, ch)?));
            }
            c if c.is_ascii_digit() || c == '-' => {
                tokens.push(lex_int(&mut chars)?);
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_alphanumeric() || c == '_' || c == '.' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(ParseError::UnexpectedChar(other, offset)),
        }
    }

    Ok(tokens)
}

fn lex_string(chars: &mut Peekable<CharIndices<'_>>, quote: char) -> Result<String, ParseError> {
    let mut text = String::new();
    while let Some((_, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped)) => text.push(escaped),
                None => return Err(ParseError::UnterminatedString),
            },
            c if c == quote => return Ok(text),
            c => text.push(c),
        }
    }
    Err(ParseError::UnterminatedString)
}

fn lex_int(chars: &mut Peekable<CharIndices<'_>>) -> Result<Token, ParseError> {
    let mut digits = String::new();
    if let Some(&(_, '-')) = chars.peek() {
        digits.push('-');
        chars.next();
    }
    while let Some(&(_, c)) = chars.peek() {
        if c.is_ascii_digit() || c == '_' {
            if c != '_' {
                digits.push(c);
            }
            chars.next();
        } else {
            break;
        }
    }
    digits
        .parse::<i64>()
        .map(Token::Int)
        .map_err(|_| ParseError::IntOverflow(digits))
}

//-----------------------------------------------------------------------------
// Parser
//-----------------------------------------------------------------------------

/// Parse deferred annotation text into an expression tree
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.union()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(ParseError::UnexpectedToken(token.describe())),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    // union := primary ('|' primary)*
    fn union(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.primary()?;
        while self.eat(&Token::Pipe) {
            let right = self.primary()?;
            left = Expr::Union(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // primary := atom ('[' args ']')*
    fn primary(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.atom()?;
        while self.eat(&Token::LBracket) {
            self.depth += 1;
            if self.depth > MAX_NESTING {
                return Err(ParseError::TooDeep(MAX_NESTING));
            }
            let args = self.args()?;
            self.depth -= 1;
            expr = Expr::Subscript(Box::new(expr), args);
        }
        Ok(expr)
    }

    // args := union (',' union)* ','? ']'
    fn args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = vec![self.union()?];
        loop {
            if self.eat(&Token::RBracket) {
                return Ok(args);
            }
            if !self.eat(&Token::Comma) {
                return match self.next() {
                    Some(token) => Err(ParseError::UnexpectedToken(token.describe())),
                    None => Err(ParseError::UnexpectedEnd),
                };
            }
            if self.eat(&Token::RBracket) {
                return Ok(args);
            }
            args.push(self.union()?);
        }
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        match self.next() {
            Some(Token::Ident(name)) if name == "None" => Ok(Expr::None),
            Some(Token::Ident(name)) => Ok(Expr::Name(name)),
            Some(Token::Str(text)) => Ok(Expr::Str(text)),
            Some(Token::Int(value)) => Ok(Expr::Int(value)),
            Some(token) => Err(ParseError::UnexpectedToken(token.describe())),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}
