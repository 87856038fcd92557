//! Tokenizer for match and action expressions.
//!
//! Token classes: bare identifiers, integer literals (decimal or `0x…`
//! hex, optional sign), quoted strings, `/…/` regex literals (scanned on
//! demand), the two-character comparators, and single-character
//! punctuation. Path-ish positions (plugin names, call-target files, CSV
//! basenames) are captured as raw text up to a stop character, so dots and
//! slashes need no quoting there.

use std::fmt;

use crate::{Error, Result};

/// One token of a rule expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Str(String),
    Regex(String),
    /// `!=`
    Neq,
    /// `<=`
    Leq,
    /// `>=`
    Geq,
    Punct(char),
    End,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::Int(i) => write!(f, "{}", i),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::Regex(r) => write!(f, "/{}/", r),
            Token::Neq => write!(f, "!="),
            Token::Leq => write!(f, "<="),
            Token::Geq => write!(f, ">="),
            Token::Punct(c) => write!(f, "{}", c),
            Token::End => write!(f, "<end-of-input>"),
        }
    }
}

/// Streaming tokenizer over one `--match` or `--action` string.
pub struct Lexer<'a> {
    src: &'a str,
    pos: usize,
    /// (token, start offset) buffered by `peek`.
    peeked: Option<(Token, usize)>,
    /// "matching" or "action", used in diagnostics.
    mode: &'static str,
}

const PUNCT: &str = "[](),.=!<>&@/-";

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str, mode: &'static str) -> Self {
        Lexer {
            src,
            pos: 0,
            peeked: None,
            mode,
        }
    }

    pub fn source(&self) -> &'a str {
        self.src
    }

    /// A diagnostic prefixed with the parse mode, matching the rest of the
    /// rule-parse errors.
    pub fn fail(&self, msg: impl fmt::Display) -> Error {
        Error::Parse(format!("{}; {}", self.mode, msg))
    }

    pub fn unexpected(&self, token: &Token) -> Error {
        self.fail(format!("unexpected token `{}'", token))
    }

    /// Next token, consuming it.
    pub fn next(&mut self) -> Result<Token> {
        if let Some((token, _)) = self.peeked.take() {
            return Ok(token);
        }
        self.scan()
    }

    /// Next token without consuming it.
    pub fn peek(&mut self) -> Result<Token> {
        if self.peeked.is_none() {
            let start = self.skip_ws();
            let token = self.scan_at(start)?;
            self.peeked = Some((token, start));
        }
        Ok(self.peeked.as_ref().unwrap().0.clone())
    }

    /// Consume the given punctuation token or fail.
    pub fn expect_punct(&mut self, c: char) -> Result<()> {
        let token = self.next()?;
        if token != Token::Punct(c) {
            return Err(self.fail(format!("expected token `{}', found `{}'", c, token)));
        }
        Ok(())
    }

    /// Consume the end-of-input token or fail.
    pub fn expect_end(&mut self) -> Result<()> {
        let token = self.next()?;
        if token != Token::End {
            return Err(self.fail(format!(
                "expected end of input, found `{}'",
                token
            )));
        }
        Ok(())
    }

    /// Consume an integer token or fail.
    pub fn expect_int(&mut self) -> Result<i64> {
        match self.next()? {
            Token::Int(i) => Ok(i),
            token => Err(self.fail(format!("expected an integer, found `{}'", token))),
        }
    }

    /// Scan a `/…/` regex literal if one follows; otherwise a normal
    /// token. Only called at value positions of string attributes.
    pub fn next_regex(&mut self) -> Result<Token> {
        if self.peeked.is_some() {
            return self.next();
        }
        let start = self.skip_ws();
        if self.src[start..].starts_with('/') {
            self.pos = start + 1;
            let bytes = self.src.as_bytes();
            let mut out = String::new();
            while self.pos < bytes.len() {
                let c = self.src[self.pos..].chars().next().unwrap();
                if c == '\\' && self.src[self.pos..].starts_with("\\/") {
                    out.push('/');
                    self.pos += 2;
                    continue;
                }
                if c == '/' {
                    self.pos += 1;
                    return Ok(Token::Regex(out));
                }
                out.push(c);
                self.pos += c.len_utf8();
            }
            return Err(self.fail("unterminated regular expression"));
        }
        self.scan_at(start)
    }

    /// Raw text from here up to (not including) `stop`, or to the end of
    /// input when `stop` is `None`. Used for path-ish positions.
    pub fn take_path(&mut self, stop: Option<char>) -> Result<String> {
        let start = match self.peeked.take() {
            Some((_, start)) => start,
            None => self.skip_ws(),
        };
        let end = match stop {
            Some(c) => self.src[start..]
                .find(c)
                .map(|i| start + i)
                .ok_or_else(|| self.fail(format!("expected token `{}'", c)))?,
            None => self.src.len(),
        };
        self.pos = end;
        let path = self.src[start..end].trim();
        if path.is_empty() {
            return Err(self.fail("expected a name"));
        }
        Ok(path.to_string())
    }

    fn skip_ws(&mut self) -> usize {
        while self.pos < self.src.len()
            && self.src[self.pos..].starts_with(|c: char| c.is_whitespace())
        {
            self.pos += 1;
        }
        self.pos
    }

    fn scan(&mut self) -> Result<Token> {
        let start = self.skip_ws();
        self.scan_at(start)
    }

    fn scan_at(&mut self, start: usize) -> Result<Token> {
        self.pos = start;
        let rest = &self.src[start..];
        let Some(c) = rest.chars().next() else {
            return Ok(Token::End);
        };

        if c == '"' {
            let inner = &rest[1..];
            let end = inner
                .find('"')
                .ok_or_else(|| self.fail("unterminated string"))?;
            self.pos = start + 1 + end + 1;
            return Ok(Token::Str(inner[..end].to_string()));
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let end = rest
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(rest.len());
            self.pos = start + end;
            return Ok(Token::Ident(rest[..end].to_string()));
        }

        if c.is_ascii_digit() || (c == '-' && rest[1..].starts_with(|d: char| d.is_ascii_digit()))
        {
            return self.scan_int(start);
        }

        // Two-character comparators first.
        if rest.starts_with("!=") {
            self.pos = start + 2;
            return Ok(Token::Neq);
        }
        if rest.starts_with("<=") {
            self.pos = start + 2;
            return Ok(Token::Leq);
        }
        if rest.starts_with(">=") {
            self.pos = start + 2;
            return Ok(Token::Geq);
        }
        if rest.starts_with("==") {
            self.pos = start + 2;
            return Ok(Token::Punct('='));
        }

        if PUNCT.contains(c) {
            self.pos = start + 1;
            return Ok(Token::Punct(c));
        }
        Err(self.fail(format!("unexpected character `{}'", c)))
    }

    fn scan_int(&mut self, start: usize) -> Result<Token> {
        let rest = &self.src[start..];
        let (neg, digits_at) = if rest.starts_with('-') { (true, 1) } else { (false, 0) };
        let body = &rest[digits_at..];
        let (radix, skip) = if body.starts_with("0x") || body.starts_with("0X") {
            (16, 2)
        } else {
            (10, 0)
        };
        let digits = &body[skip..];
        let end = digits
            .find(|c: char| !c.is_ascii_hexdigit())
            .unwrap_or(digits.len());
        let text = &digits[..end];
        if text.is_empty() || (radix == 10 && !text.chars().all(|c| c.is_ascii_digit())) {
            return Err(self.fail(format!("invalid integer \"{}\"", &rest[..digits_at + skip + end])));
        }
        let value = i64::from_str_radix(text, radix)
            .map_err(|_| self.fail(format!("integer \"{}\" is out of range", text)))?;
        self.pos = start + digits_at + skip + end;
        Ok(Token::Int(if neg { -value } else { value }))
    }
}
