use std::collections::VecDeque;
use std::str::FromStr;

use crate::core::{Error, Result};

/// Positional parameter cursor over one protocol line
///
/// Tokens are separated by spaces; a double-quoted token may contain
/// spaces and `\"` / `\\` escapes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    tokens: VecDeque<String>,
}

impl Params {
    /// Tokenizes a line
    pub fn parse(line: &str) -> Result<Self> {
        let mut tokens = VecDeque::new();
        let mut chars = line.chars().peekable();

        loop {
            while matches!(chars.peek(), Some(c) if c.is_ascii_whitespace()) {
                chars.next();
            }
            let Some(&first) = chars.peek() else {
                break;
            };

            let mut token = String::new();
            if first == '"' {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => match chars.next() {
                            Some(escaped) => token.push(escaped),
                            None => break,
                        },
                        '"' => {
                            closed = true;
                            break;
                        }
                        _ => token.push(c),
                    }
                }
                if !closed {
                    return Err(Error::parameter("Unterminated quoted parameter"));
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_whitespace() {
                        break;
                    }
                    token.push(c);
                    chars.next();
                }
            }
            tokens.push_back(token);
        }

        Ok(Params { tokens })
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Params {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Number of unread tokens
    pub fn remaining(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn peek(&self) -> Option<&str> {
        self.tokens.front().map(String::as_str)
    }

    /// Next token as a string
    pub fn next_str(&mut self) -> Result<String> {
        self.tokens
            .pop_front()
            .ok_or_else(|| Error::parameter("Missing parameter"))
    }

    /// Next token parsed as `T`
    pub fn next_parsed<T: FromStr>(&mut self, what: &str) -> Result<T> {
        let token = self.next_str()?;
        token
            .parse()
            .map_err(|_| Error::parameter(format!("Expected {}, got '{}'", what, token)))
    }

    pub fn next_i64(&mut self) -> Result<i64> {
        self.next_parsed("integer")
    }

    pub fn next_i32(&mut self) -> Result<i32> {
        self.next_parsed("integer")
    }

    pub fn next_u32(&mut self) -> Result<u32> {
        self.next_parsed("unsigned integer")
    }

    pub fn next_u16(&mut self) -> Result<u16> {
        self.next_parsed("port number")
    }

    pub fn next_usize(&mut self) -> Result<usize> {
        self.next_parsed("size")
    }

    pub fn next_f64(&mut self) -> Result<f64> {
        let value: f64 = self.next_parsed("number")?;
        if value.is_nan() {
            return Err(Error::parameter("Expected number, got NaN"));
        }
        Ok(value)
    }

    /// Accepts `1`/`0`, `true`/`false` and `on`/`off`
    pub fn next_bool(&mut self) -> Result<bool> {
        let token = self.next_str()?;
        match token.to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Ok(true),
            "0" | "false" | "off" => Ok(false),
            _ => Err(Error::parameter(format!("Expected boolean, got '{}'", token))),
        }
    }

    /// Drains every unread token
    pub fn rest(&mut self) -> Vec<String> {
        self.tokens.drain(..).collect()
    }

    /// Fails with a parameter error when unread tokens remain
    pub fn expect_end(&self) -> Result<()> {
        match self.tokens.front() {
            None => Ok(()),
            Some(extra) => Err(Error::parameter(format!(
                "Unexpected parameter '{}'",
                extra
            ))),
        }
    }
}

/// Quotes a string so that `Params::parse` returns it as one token
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        // line breaks would terminate the protocol line
        if c == '\n' || c == '\r' {
            out.push(' ');
            continue;
        }
        out.push(c);
    }
    out.push('"');
    out
}
