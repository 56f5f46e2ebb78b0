//! Tokenizer for Vigil source.
//!
//! Statements are newline-terminated; newlines are significant tokens and
//! the parser decides where they may be skipped (inside bracketed
//! expressions and around block braces). `#` starts a line comment.
//! Strings are single- or double-quoted with the usual escapes, or
//! triple-quoted (`"""`) for multi-line text such as state tables.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LexError {
    #[error("{file}:{line}: unterminated string literal")]
    UnterminatedString { file: String, line: u32 },
    #[error("{file}:{line}: invalid escape `\\{escape}`")]
    BadEscape {
        file: String,
        line: u32,
        escape: char,
    },
    #[error("{file}:{line}: malformed number `{text}`")]
    BadNumber {
        file: String,
        line: u32,
        text: String,
    },
    #[error("{file}:{line}: unexpected character `{ch}`")]
    UnexpectedChar { file: String, line: u32, ch: char },
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    // Keywords.
    Def,
    Class,
    Return,
    If,
    Elif,
    Else,
    For,
    In,
    While,
    Break,
    Continue,
    Import,
    Try,
    Except,
    Finally,
    Raise,
    Pass,
    And,
    Or,
    Not,
    Is,
    None,
    True,
    False,

    // Punctuation and operators.
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Arrow,
    Assign,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    Shl,
    Shr,
    Amp,
    Pipe,
    Caret,
    PlusEq,
    MinusEq,
    StarEq,
    StarStarEq,
    SlashEq,
    SlashSlashEq,
    PercentEq,
    ShlEq,
    ShrEq,
    AmpEq,
    PipeEq,
    CaretEq,

    Newline,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => write!(f, "identifier `{}`", name),
            TokenKind::Int(v) => write!(f, "integer `{}`", v),
            TokenKind::Float(v) => write!(f, "float `{}`", v),
            TokenKind::Str(_) => f.write_str("string literal"),
            TokenKind::Newline => f.write_str("end of line"),
            TokenKind::Eof => f.write_str("end of file"),
            other => write!(f, "`{:?}`", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
    pub col: u32,
}

fn keyword(name: &str) -> Option<TokenKind> {
    Some(match name {
        "def" => TokenKind::Def,
        "class" => TokenKind::Class,
        "return" => TokenKind::Return,
        "if" => TokenKind::If,
        "elif" => TokenKind::Elif,
        "else" => TokenKind::Else,
        "for" => TokenKind::For,
        "in" => TokenKind::In,
        "while" => TokenKind::While,
        "break" => TokenKind::Break,
        "continue" => TokenKind::Continue,
        "import" => TokenKind::Import,
        "try" => TokenKind::Try,
        "except" => TokenKind::Except,
        "finally" => TokenKind::Finally,
        "raise" => TokenKind::Raise,
        "pass" => TokenKind::Pass,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "is" => TokenKind::Is,
        "none" => TokenKind::None,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        _ => return Option::None,
    })
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
    file: &'a str,
    tokens: Vec<Token>,
}

/// Tokenizes `src`. `file` is used for error messages only.
pub fn lex(src: &str, file: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer {
        src: src.as_bytes(),
        pos: 0,
        line: 1,
        col: 0,
        file,
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.src.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 0;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn push(&mut self, kind: TokenKind, line: u32, col: u32) {
        self.tokens.push(Token { kind, line, col });
    }

    fn run(&mut self) -> Result<(), LexError> {
        while let Some(c) = self.peek() {
            let (line, col) = (self.line, self.col);
            match c {
                b' ' | b'\t' | b'\r' => {
                    self.bump();
                }
                b'\n' => {
                    self.bump();
                    // Collapse runs of blank lines into one separator.
                    if !matches!(
                        self.tokens.last().map(|t| &t.kind),
                        Some(TokenKind::Newline) | None
                    ) {
                        self.push(TokenKind::Newline, line, col);
                    }
                }
                b'#' => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                b'"' | b'\'' => self.string(c)?,
                b'0'..=b'9' => self.number()?,
                c if c == b'_' || c.is_ascii_alphabetic() => self.ident(),
                _ => self.punct()?,
            }
        }
        if !matches!(
            self.tokens.last().map(|t| &t.kind),
            Some(TokenKind::Newline) | None
        ) {
            let (line, col) = (self.line, self.col);
            self.push(TokenKind::Newline, line, col);
        }
        let (line, col) = (self.line, self.col);
        self.push(TokenKind::Eof, line, col);
        Ok(())
    }

    fn string(&mut self, quote: u8) -> Result<(), LexError> {
        let (line, col) = (self.line, self.col);
        self.bump();
        let triple = quote == b'"' && self.peek() == Some(b'"') && self.peek2() == Some(b'"');
        if triple {
            self.bump();
            self.bump();
        }
        let mut text = String::new();
        loop {
            let Some(c) = self.bump() else {
                return Err(LexError::UnterminatedString {
                    file: self.file.to_string(),
                    line,
                });
            };
            match c {
                b'"' if triple => {
                    if self.peek() == Some(b'"') && self.peek2() == Some(b'"') {
                        self.bump();
                        self.bump();
                        break;
                    }
                    text.push('"');
                }
                c if c == quote && !triple => break,
                b'\n' if !triple => {
                    return Err(LexError::UnterminatedString {
                        file: self.file.to_string(),
                        line,
                    });
                }
                b'\\' => {
                    let Some(esc) = self.bump() else {
                        return Err(LexError::UnterminatedString {
                            file: self.file.to_string(),
                            line,
                        });
                    };
                    match esc {
                        b'n' => text.push('\n'),
                        b't' => text.push('\t'),
                        b'r' => text.push('\r'),
                        b'\\' => text.push('\\'),
                        b'"' => text.push('"'),
                        b'\'' => text.push('\''),
                        b'0' => text.push('\0'),
                        other => {
                            return Err(LexError::BadEscape {
                                file: self.file.to_string(),
                                line,
                                escape: other as char,
                            });
                        }
                    }
                }
                c => text.push(c as char),
            }
        }
        self.push(TokenKind::Str(text), line, col);
        Ok(())
    }

    fn number(&mut self) -> Result<(), LexError> {
        let (line, col) = (self.line, self.col);
        let mut text = String::new();
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => {
                    text.push(c as char);
                    self.bump();
                }
                b'.' if !is_float && matches!(self.peek2(), Some(b'0'..=b'9')) => {
                    is_float = true;
                    text.push('.');
                    self.bump();
                }
                b'_' => {
                    self.bump();
                }
                _ => break,
            }
        }
        let kind = if is_float {
            TokenKind::Float(text.parse().map_err(|_| LexError::BadNumber {
                file: self.file.to_string(),
                line,
                text: text.clone(),
            })?)
        } else {
            TokenKind::Int(text.parse().map_err(|_| LexError::BadNumber {
                file: self.file.to_string(),
                line,
                text: text.clone(),
            })?)
        };
        self.push(kind, line, col);
        Ok(())
    }

    fn ident(&mut self) {
        let (line, col) = (self.line, self.col);
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if c == b'_' || c.is_ascii_alphanumeric() {
                name.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        let kind = keyword(&name).unwrap_or(TokenKind::Ident(name));
        self.push(kind, line, col);
    }

    fn punct(&mut self) -> Result<(), LexError> {
        let (line, col) = (self.line, self.col);
        let c = self.bump().expect("caller saw a character");
        let eq = self.peek() == Some(b'=');
        let kind = match c {
            b'(' => TokenKind::LParen,
            b')' => TokenKind::RParen,
            b'[' => TokenKind::LBracket,
            b']' => TokenKind::RBracket,
            b'{' => TokenKind::LBrace,
            b'}' => TokenKind::RBrace,
            b',' => TokenKind::Comma,
            b':' => TokenKind::Colon,
            b';' => TokenKind::Semicolon,
            b'.' => TokenKind::Dot,
            b'=' if eq => {
                self.bump();
                TokenKind::Eq
            }
            b'=' => TokenKind::Assign,
            b'!' if eq => {
                self.bump();
                TokenKind::NotEq
            }
            b'<' if eq => {
                self.bump();
                TokenKind::LtEq
            }
            b'<' if self.peek() == Some(b'<') => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::ShlEq
                } else {
                    TokenKind::Shl
                }
            }
            b'<' => TokenKind::Lt,
            b'>' if eq => {
                self.bump();
                TokenKind::GtEq
            }
            b'>' if self.peek() == Some(b'>') => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::ShrEq
                } else {
                    TokenKind::Shr
                }
            }
            b'>' => TokenKind::Gt,
            b'+' if eq => {
                self.bump();
                TokenKind::PlusEq
            }
            b'+' => TokenKind::Plus,
            b'-' if eq => {
                self.bump();
                TokenKind::MinusEq
            }
            b'-' if self.peek() == Some(b'>') => {
                self.bump();
                TokenKind::Arrow
            }
            b'-' => TokenKind::Minus,
            b'*' if self.peek() == Some(b'*') => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::StarStarEq
                } else {
                    TokenKind::StarStar
                }
            }
            b'*' if eq => {
                self.bump();
                TokenKind::StarEq
            }
            b'*' => TokenKind::Star,
            b'/' if self.peek() == Some(b'/') => {
                self.bump();
                if self.peek() == Some(b'=') {
                    self.bump();
                    TokenKind::SlashSlashEq
                } else {
                    TokenKind::SlashSlash
                }
            }
            b'/' if eq => {
                self.bump();
                TokenKind::SlashEq
            }
            b'/' => TokenKind::Slash,
            b'%' if eq => {
                self.bump();
                TokenKind::PercentEq
            }
            b'%' => TokenKind::Percent,
            b'&' if eq => {
                self.bump();
                TokenKind::AmpEq
            }
            b'&' => TokenKind::Amp,
            b'|' if eq => {
                self.bump();
                TokenKind::PipeEq
            }
            b'|' => TokenKind::Pipe,
            b'^' if eq => {
                self.bump();
                TokenKind::CaretEq
            }
            b'^' => TokenKind::Caret,
            other => {
                return Err(LexError::UnexpectedChar {
                    file: self.file.to_string(),
                    line,
                    ch: other as char,
                });
            }
        };
        self.push(kind, line, col);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        lex(src, "test.vg").unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn lexes_assignment() {
        assert_eq!(
            kinds("x = 1 + 2\n"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn lexes_augmented_operators() {
        assert_eq!(
            kinds("x //= 2"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::SlashSlashEq,
                TokenKind::Int(2),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
        assert_eq!(kinds("a **= b")[1], TokenKind::StarStarEq);
        assert_eq!(kinds("a <<= b")[1], TokenKind::ShlEq);
    }

    #[test]
    fn triple_quoted_strings_span_lines() {
        let toks = kinds("x = \"\"\"s0 [\n  open -> s1\n]\"\"\"\n");
        assert_eq!(
            toks[2],
            TokenKind::Str("s0 [\n  open -> s1\n]".into())
        );
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let toks = kinds("# header\n\n\nx = 1  # trailing\n");
        assert_eq!(toks[0], TokenKind::Ident("x".into()));
    }

    #[test]
    fn arrow_and_minus() {
        assert_eq!(kinds("-> - -=")[0], TokenKind::Arrow);
        assert_eq!(kinds("- x")[0], TokenKind::Minus);
        assert_eq!(kinds("x -= 1")[1], TokenKind::MinusEq);
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(lex("x = \"oops\n", "t.vg").is_err());
    }

    #[test]
    fn tracks_line_numbers() {
        let toks = lex("a = 1\nb = 2\n", "t.vg").unwrap();
        let b = toks
            .iter()
            .find(|t| t.kind == TokenKind::Ident("b".into()))
            .unwrap();
        assert_eq!(b.line, 2);
    }
}
