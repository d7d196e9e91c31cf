//! Pipeline script tokenizer
//!
//! Token classes, longest match first:
//! - structural keywords (`pipeline agent docker stages stage steps none failFast parallel`)
//! - quoted strings, single or double quotes, captured without the quotes
//! - boolean literals (`true`, `false`)
//! - identifiers (`[A-Za-z_][A-Za-z0-9_]*`)
//! - punctuation (`{ } ( )`), colon and comma
//!
//! Whitespace and `//` line comments are discarded.

use std::fmt;

use crate::error::{ParseError, Result};

/// Structural keywords of the pipeline grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keyword {
    Pipeline,
    Agent,
    Docker,
    Stages,
    Stage,
    Steps,
    None,
    FailFast,
    Parallel,
}

impl Keyword {
    fn from_word(word: &str) -> Option<Self> {
        let keyword = match word {
            "pipeline" => Keyword::Pipeline,
            "agent" => Keyword::Agent,
            "docker" => Keyword::Docker,
            "stages" => Keyword::Stages,
            "stage" => Keyword::Stage,
            "steps" => Keyword::Steps,
            "none" => Keyword::None,
            "failFast" => Keyword::FailFast,
            "parallel" => Keyword::Parallel,
            _ => return None,
        };
        Some(keyword)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Pipeline => "pipeline",
            Keyword::Agent => "agent",
            Keyword::Docker => "docker",
            Keyword::Stages => "stages",
            Keyword::Stage => "stage",
            Keyword::Steps => "steps",
            Keyword::None => "none",
            Keyword::FailFast => "failFast",
            Keyword::Parallel => "parallel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Keyword(Keyword),
    String(String),
    Bool(bool),
    Ident(String),
    LBrace,
    RBrace,
    LParen,
    RParen,
    Colon,
    Comma,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Keyword(k) => write!(f, "keyword '{}'", k.as_str()),
            TokenKind::String(s) => write!(f, "string '{}'", s),
            TokenKind::Bool(b) => write!(f, "boolean '{}'", b),
            TokenKind::Ident(i) => write!(f, "identifier '{}'", i),
            TokenKind::LBrace => f.write_str("'{'"),
            TokenKind::RBrace => f.write_str("'}'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Colon => f.write_str("':'"),
            TokenKind::Comma => f.write_str("','"),
        }
    }
}

/// A token and the 1-based position it starts at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

/// Splits pipeline text into tokens
///
/// # Errors
/// Returns `UnexpectedChar` for input no rule matches and
/// `UnterminatedString` for a quote that is never closed.
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn run(mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();

        while let Some(&c) = self.chars.peek() {
            let (line, column) = (self.line, self.column);

            let kind = match c {
                c if c.is_whitespace() => {
                    self.bump();
                    continue;
                }
                '/' => {
                    self.skip_comment(line, column)?;
                    continue;
                }
                '\'' | '"' => self.string(c, line, column)?,
                c if c.is_ascii_alphabetic() || c == '_' => self.word(),
                '{' | '}' | '(' | ')' | ':' | ',' => {
                    self.bump();
                    match c {
                        '{' => TokenKind::LBrace,
                        '}' => TokenKind::RBrace,
                        '(' => TokenKind::LParen,
                        ')' => TokenKind::RParen,
                        ':' => TokenKind::Colon,
                        _ => TokenKind::Comma,
                    }
                }
                other => {
                    return Err(ParseError::UnexpectedChar {
                        found: other,
                        line,
                        column,
                    });
                }
            };

            tokens.push(Token { kind, line, column });
        }

        Ok(tokens)
    }

    fn skip_comment(&mut self, line: usize, column: usize) -> Result<()> {
        self.bump();
        if self.chars.peek() != Some(&'/') {
            return Err(ParseError::UnexpectedChar {
                found: '/',
                line,
                column,
            });
        }
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
        Ok(())
    }

    fn string(&mut self, quote: char, line: usize, column: usize) -> Result<TokenKind> {
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(TokenKind::String(value)),
                Some(c) => value.push(c),
                None => return Err(ParseError::UnterminatedString { line, column }),
            }
        }
    }

    fn word(&mut self) -> TokenKind {
        let mut word = String::new();
        while let Some(&c) = self.chars.peek() {
            if !(c.is_ascii_alphanumeric() || c == '_') {
                break;
            }
            word.push(c);
            self.bump();
        }

        if let Some(keyword) = Keyword::from_word(&word) {
            return TokenKind::Keyword(keyword);
        }

        match word.as_str() {
            "true" => TokenKind::Bool(true),
            "false" => TokenKind::Bool(false),
            _ => TokenKind::Ident(word),
        }
    }
}
