//! A cursor-based, single-pass lexer: `next_token` pulls one token at a
//! time off the source text. Unlike the teacher's `Lexer` (which eagerly
//! lexes a whole file into a `Vec<Token>` up front), this one is a pull
//! interface the parser drives directly, matching §4.1's "does not buffer
//! the full stream".

use std::rc::Rc;
use std::str::Chars;

use crate::common::source::Source;
use crate::common::span::Span;
use crate::compiler::token::{keyword, Token, TokenKind};

pub struct Lexer {
    source: Rc<Source>,
    /// Byte offset of the next unconsumed character.
    offset: usize,
    line: u32,
}

impl Lexer {
    pub fn new(source: Rc<Source>) -> Lexer {
        Lexer { source, offset: 0, line: 1 }
    }

    fn remaining(&self) -> Chars<'_> {
        self.source.contents[self.offset..].chars()
    }

    fn peek(&self) -> Option<char> {
        self.remaining().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.remaining();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    /// Skips whitespace and `//` line comments.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.advance();
                }
                Some('/') if self.peek_second() == Some('/') => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Produces the next token, or an end-of-input token once the source is
    /// exhausted. Always returns a token — lexical errors are carried as
    /// `TokenKind::Error` rather than an `Err`, so the caller (the parser)
    /// decides when to stop pulling tokens.
    pub fn next_token(&mut self) -> Token {
        self.skip_trivia();
        let line = self.line;

        let c = match self.advance() {
            Some(c) => c,
            None => return Token::new(TokenKind::Eof, Span::new(line)),
        };

        let kind = match c {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            '[' => TokenKind::LeftBracket,
            ']' => TokenKind::RightBracket,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '-' => TokenKind::Minus,
            '+' => {
                if self.matches('=') {
                    TokenKind::PlusEqual
                } else {
                    TokenKind::Plus
                }
            }
            '=' => {
                if self.matches('=') {
                    TokenKind::EqualEqual
                } else {
                    TokenKind::Equal
                }
            }
            '!' => {
                if self.matches('=') {
                    TokenKind::BangEqual
                } else {
                    TokenKind::Bang
                }
            }
            '>' => {
                if self.matches('=') {
                    TokenKind::GreaterEqual
                } else {
                    TokenKind::Greater
                }
            }
            '<' => {
                if self.matches('=') {
                    TokenKind::LessEqual
                } else {
                    TokenKind::Less
                }
            }
            '"' => return self.string(line),
            c if c.is_ascii_digit() => return self.number(c, line),
            c if c.is_alphabetic() || c == '_' => return self.identifier(c, line),
            other => TokenKind::Error(format!("Unexpected character '{}'.", other)),
        };

        Token::new(kind, Span::new(line))
    }

    /// Lexes a `"`-delimited string literal with no escape sequences, per
    /// §4.1. An end-of-line or end-of-input before the closing quote is a
    /// lex error.
    fn string(&mut self, start_line: u32) -> Token {
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Token::new(
                        TokenKind::Error("Unterminated string.".to_string()),
                        Span::new(start_line),
                    );
                }
                Some('"') => {
                    self.advance();
                    return Token::new(TokenKind::String(value), Span::new(start_line));
                }
                Some(c) => {
                    value.push(c);
                    self.advance();
                }
            }
        }
    }

    /// Lexes an integer or float literal. The fractional part is only
    /// consumed if a digit follows the `.`, so `1.` (no trailing digit)
    /// lexes as `NUMBER(1)` followed by a separate `.` token.
    fn number(&mut self, first: char, line: u32) -> Token {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        if self.peek() == Some('.') && self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let value: f64 = text.parse().expect("lexer only accumulates digits and one dot");
        Token::new(TokenKind::Number(value), Span::new(line))
    }

    fn identifier(&mut self, first: char, line: u32) -> Token {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        let kind = keyword(&text).unwrap_or(TokenKind::Identifier(text));
        Token::new(kind, Span::new(line))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(Source::source(source));
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token();
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn skips_whitespace_and_line_comments() {
        assert_eq!(kinds("  // a comment\n  "), vec![TokenKind::Eof]);
    }

    #[test]
    fn number_with_fraction() {
        assert_eq!(kinds("3.5"), vec![TokenKind::Number(3.5), TokenKind::Eof]);
    }

    /// `1.` has no digit after the dot, so the dot is its own token rather
    /// than being folded into the number.
    #[test]
    fn number_dot_without_trailing_digit() {
        assert_eq!(kinds("1."), vec![TokenKind::Number(1.0), TokenKind::Dot, TokenKind::Eof]);
    }

    #[test]
    fn unterminated_string_is_an_error_token() {
        let kinds = kinds("\"abc");
        assert!(matches!(kinds[0], TokenKind::Error(_)));
    }

    #[test]
    fn string_spanning_newline_is_unterminated() {
        let kinds = kinds("\"abc\ndef\"");
        assert!(matches!(kinds[0], TokenKind::Error(_)));
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("let x = constructor"),
            vec![
                TokenKind::Let,
                TokenKind::Identifier("x".to_string()),
                TokenKind::Equal,
                TokenKind::Constructor,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn plus_equal_vs_plus() {
        assert_eq!(kinds("x += 1"), vec![
            TokenKind::Identifier("x".to_string()),
            TokenKind::PlusEqual,
            TokenKind::Number(1.0),
            TokenKind::Eof,
        ]);
        assert_eq!(kinds("x + 1"), vec![
            TokenKind::Identifier("x".to_string()),
            TokenKind::Plus,
            TokenKind::Number(1.0),
            TokenKind::Eof,
        ]);
    }

    use proptest::prelude::*;

    proptest! {
        /// No input, however malformed, should panic the lexer — it always
        /// terminates with either a well-formed token stream or an `Error`
        /// token, never a crash.
        #[test]
        fn doesnt_crash(s in "\\PC*") {
            kinds(&s);
        }
    }
}
