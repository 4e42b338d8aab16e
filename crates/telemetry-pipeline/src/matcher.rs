// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label matchers and the selector syntax `name{key="value",key=~"re",key!="v",key}`.
//!
//! Matchers combine with logical AND. A label that is absent behaves as an empty value for
//! `!=`, `=~` and `!~`, so `key!="x"` matches series without `key`.

use std::fmt;

use regex::Regex;
use ustr::Ustr;

use crate::constants::METRIC_NAME_LABEL;
use crate::errors::ParseError;
use crate::labels::LabelSet;

#[derive(Clone, Debug)]
pub enum Matcher {
    Equal(Ustr, Ustr),
    NotEqual(Ustr, Ustr),
    /// Label key is present, any value.
    Present(Ustr),
    Regex(Ustr, Regex),
    NotRegex(Ustr, Regex),
}

impl Matcher {
    pub fn equal(key: &str, value: &str) -> Self {
        Matcher::Equal(Ustr::from(key), Ustr::from(value))
    }

    pub fn not_equal(key: &str, value: &str) -> Self {
        Matcher::NotEqual(Ustr::from(key), Ustr::from(value))
    }

    pub fn present(key: &str) -> Self {
        Matcher::Present(Ustr::from(key))
    }

    /// Regex matchers are fully anchored.
    pub fn regex(key: &str, pattern: &str) -> Result<Self, ParseError> {
        Ok(Matcher::Regex(Ustr::from(key), anchored(pattern)?))
    }

    pub fn not_regex(key: &str, pattern: &str) -> Result<Self, ParseError> {
        Ok(Matcher::NotRegex(Ustr::from(key), anchored(pattern)?))
    }

    pub fn name(metric_name: &str) -> Self {
        Self::equal(METRIC_NAME_LABEL, metric_name)
    }

    pub fn key(&self) -> Ustr {
        match self {
            Matcher::Equal(k, _)
            | Matcher::NotEqual(k, _)
            | Matcher::Present(k)
            | Matcher::Regex(k, _)
            | Matcher::NotRegex(k, _) => *k,
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        let value = labels.get(self.key().as_str());
        match self {
            Matcher::Equal(_, v) => value == Some(v.as_str()),
            Matcher::NotEqual(_, v) => value.unwrap_or("") != v.as_str(),
            Matcher::Present(_) => value.is_some(),
            Matcher::Regex(_, re) => re.is_match(value.unwrap_or("")),
            Matcher::NotRegex(_, re) => !re.is_match(value.unwrap_or("")),
        }
    }

    /// True when every matching series must carry this matcher's key, which lets the index
    /// narrow candidates through its per-key postings.
    pub(crate) fn requires_key(&self) -> bool {
        match self {
            Matcher::Equal(_, v) => !v.is_empty(),
            Matcher::Present(_) => true,
            Matcher::Regex(_, re) => !re.is_match(""),
            Matcher::NotEqual(_, v) => v.is_empty(),
            Matcher::NotRegex(_, re) => re.is_match(""),
        }
    }
}

fn anchored(pattern: &str) -> Result<Regex, ParseError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| ParseError::Raw(format!("invalid regex {pattern:?}: {e}")))
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Matcher::Equal(a, b), Matcher::Equal(c, d))
            | (Matcher::NotEqual(a, b), Matcher::NotEqual(c, d)) => a == c && b == d,
            (Matcher::Present(a), Matcher::Present(b)) => a == b,
            (Matcher::Regex(a, r1), Matcher::Regex(b, r2))
            | (Matcher::NotRegex(a, r1), Matcher::NotRegex(b, r2)) => {
                a == b && r1.as_str() == r2.as_str()
            }
            _ => false,
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Equal(k, v) => write!(f, "{k}={v:?}"),
            Matcher::NotEqual(k, v) => write!(f, "{k}!={v:?}"),
            Matcher::Present(k) => write!(f, "{k}"),
            Matcher::Regex(k, re) => write!(f, "{k}=~{:?}", re.as_str()),
            Matcher::NotRegex(k, re) => write!(f, "{k}!~{:?}", re.as_str()),
        }
    }
}

/// Parses a selector into matchers. An empty selector yields no matchers (matches everything).
pub fn parse_selector(input: &str) -> Result<Vec<Matcher>, ParseError> {
    let input = input.trim();
    let (name, rest) = match input.find('{') {
        Some(i) => (input[..i].trim(), &input[i..]),
        None => (input, ""),
    };

    let mut matchers = Vec::new();
    if !name.is_empty() {
        if !is_identifier(name) {
            return Err(ParseError::InvalidMetricName(name.to_string()));
        }
        matchers.push(Matcher::name(name));
    }
    if rest.is_empty() {
        return Ok(matchers);
    }

    let body = rest
        .strip_prefix('{')
        .and_then(|r| r.strip_suffix('}'))
        .ok_or_else(|| ParseError::Raw(format!("unbalanced braces in selector {input:?}")))?;

    let mut parser = SelectorParser {
        chars: body.chars().collect(),
        pos: 0,
    };
    loop {
        parser.skip_whitespace();
        if parser.at_end() {
            break;
        }
        matchers.push(parser.matcher()?);
        parser.skip_whitespace();
        if parser.at_end() {
            break;
        }
        parser.expect(',')?;
    }
    Ok(matchers)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == ':')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

struct SelectorParser {
    chars: Vec<char>,
    pos: usize,
}

impl SelectorParser {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, c: char) -> Result<(), ParseError> {
        if self.peek() == Some(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError::Raw(format!(
                "expected {c:?} at position {} in selector",
                self.pos
            )))
        }
    }

    fn matcher(&mut self) -> Result<Matcher, ParseError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            self.pos += 1;
        }
        let key: String = self.chars[start..self.pos].iter().collect();
        if key.is_empty() {
            return Err(ParseError::EmptyLabelName);
        }
        self.skip_whitespace();

        let op: String = match (self.peek(), self.chars.get(self.pos + 1).copied()) {
            (Some('='), Some('~')) | (Some('!'), Some('=')) | (Some('!'), Some('~')) => {
                self.pos += 2;
                self.chars[self.pos - 2..self.pos].iter().collect()
            }
            (Some('='), _) => {
                self.pos += 1;
                "=".to_string()
            }
            _ => return Ok(Matcher::present(&key)),
        };
        self.skip_whitespace();
        let value = self.quoted()?;
        match op.as_str() {
            "=" => Ok(Matcher::equal(&key, &value)),
            "!=" => Ok(Matcher::not_equal(&key, &value)),
            "=~" => Matcher::regex(&key, &value),
            _ => Matcher::not_regex(&key, &value),
        }
    }

    fn quoted(&mut self) -> Result<String, ParseError> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.peek() {
                None => return Err(ParseError::Raw("unterminated string in selector".into())),
                Some('"') => {
                    self.pos += 1;
                    return Ok(value);
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.peek() {
                        Some('n') => value.push('\n'),
                        Some(c) => value.push(c),
                        None => {
                            return Err(ParseError::Raw("dangling escape in selector".into()))
                        }
                    }
                    self.pos += 1;
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
            }
        }
    }
}
