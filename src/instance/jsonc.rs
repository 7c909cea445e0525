//! Span-aware reader for the relaxed JSON dialect gateway configs are written in.
//!
//! Accepts everything JSON does plus `//` and `/* */` comments, trailing commas,
//! unquoted identifier keys, single-quoted strings, hex numbers, a leading `+`,
//! and `Infinity` / `NaN` (read as `null`). Every node remembers the byte range
//! it came from, which is what lets [`set_string`] rewrite a single value and
//! leave every other byte of the document alone.

use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at line {}, column {}", self.message, self.line, self.column)
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    Scalar(serde_json::Value),
    Array(Vec<Node>),
    Object(Vec<Member>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: Kind,
    pub span: Range<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub key: String,
    pub key_span: Range<usize>,
    pub value: Node,
}

impl Node {
    /// Member value by key. Later duplicates win, matching how the gateway
    /// itself resolves them.
    pub fn get(&self, key: &str) -> Option<&Node> {
        match &self.kind {
            Kind::Object(members) => members.iter().rev().find(|m| m.key == key).map(|m| &m.value),
            _ => None,
        }
    }

    pub fn get_path(&self, path: &[&str]) -> Option<&Node> {
        path.iter().try_fold(self, |node, key| node.get(key))
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            Kind::Scalar(serde_json::Value::String(s)) => Some(s),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn to_json(&self) -> serde_json::Value {
        match &self.kind {
            Kind::Scalar(v) => v.clone(),
            Kind::Array(items) => serde_json::Value::Array(items.iter().map(Node::to_json).collect()),
            Kind::Object(members) => {
                let mut map = serde_json::Map::new();
                for m in members {
                    map.insert(m.key.clone(), m.value.to_json());
                }
                serde_json::Value::Object(map)
            }
        }
    }
}

/// Parse a whole document. Anything but whitespace and comments after the
/// root value is an error.
pub fn parse(text: &str) -> Result<Node, ParseError> {
    let mut parser = Parser { src: text, pos: 0 };
    parser.skip_trivia()?;
    if parser.peek().is_none() {
        return Err(parser.error("empty document"));
    }
    let root = parser.value()?;
    parser.skip_trivia()?;
    if parser.peek().is_some() {
        return Err(parser.error("unexpected trailing content"));
    }
    Ok(root)
}

/// Set the string at `path` and return the edited document.
///
/// An existing value is replaced in place. Missing members (and missing
/// intermediate objects) are appended to the deepest existing object. The
/// rest of the text, comments and formatting included, is untouched.
pub fn set_string(text: &str, path: &[&str], value: &str) -> Result<String, ParseError> {
    let root = parse(text)?;
    if path.is_empty() {
        return Err(error_at(text, 0, "empty path"));
    }
    let literal = json_string(value);

    let mut node = &root;
    for (depth, key) in path.iter().enumerate() {
        let members = match &node.kind {
            Kind::Object(members) => members,
            _ => {
                return Err(error_at(
                    text,
                    node.span.start,
                    &format!("'{}' is not an object", path[..depth].join(".")),
                ))
            }
        };

        match members.iter().rev().find(|m| m.key == *key) {
            Some(member) => node = &member.value,
            None => {
                let mut nested = literal.clone();
                for inner in path[depth + 1..].iter().rev() {
                    nested = format!("{{ {}: {} }}", json_string(inner), nested);
                }
                let insertion = format!("{}: {}", json_string(key), nested);
                return Ok(insert_member(text, node, members, &insertion));
            }
        }
    }

    let mut out = String::with_capacity(text.len() + literal.len());
    out.push_str(&text[..node.span.start]);
    out.push_str(&literal);
    out.push_str(&text[node.span.end..]);
    Ok(out)
}

fn insert_member(text: &str, object: &Node, members: &[Member], member: &str) -> String {
    let mut out = String::with_capacity(text.len() + member.len() + 8);
    match members.last() {
        Some(last) => {
            let indent = line_indent(text, last.key_span.start);
            let at = last.value.span.end;
            out.push_str(&text[..at]);
            out.push_str(",\n");
            out.push_str(indent);
            out.push_str(member);
            out.push_str(&text[at..]);
        }
        None => {
            // Just past the opening brace.
            let at = object.span.start + 1;
            out.push_str(&text[..at]);
            out.push(' ');
            out.push_str(member);
            out.push(' ');
            out.push_str(&text[at..]);
        }
    }
    out
}

/// Leading whitespace of the line containing byte `pos`, or "" when other
/// content precedes `pos` on that line.
fn line_indent(text: &str, pos: usize) -> &str {
    let line_start = text[..pos].rfind('\n').map(|i| i + 1).unwrap_or(0);
    let prefix = &text[line_start..pos];
    if prefix.chars().all(|c| c == ' ' || c == '\t') {
        prefix
    } else {
        ""
    }
}

fn json_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

fn error_at(text: &str, pos: usize, message: &str) -> ParseError {
    let before = &text[..pos.min(text.len())];
    let line = before.matches('\n').count() + 1;
    let column = before
        .rfind('\n')
        .map(|i| before[i + 1..].chars().count())
        .unwrap_or_else(|| before.chars().count())
        + 1;
    ParseError {
        line,
        column,
        message: message.to_string(),
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.src[self.pos..].chars().nth(offset)
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: &str) -> ParseError {
        error_at(self.src, self.pos, message)
    }

    fn expect(&mut self, want: char) -> Result<(), ParseError> {
        match self.peek() {
            Some(c) if c == want => {
                self.bump();
                Ok(())
            }
            Some(c) => Err(self.error(&format!("expected '{}', found '{}'", want, c))),
            None => Err(self.error(&format!("expected '{}', found end of input", want))),
        }
    }

    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() || c == '\u{feff}' => {
                    self.bump();
                }
                Some('/') if self.peek_at(1) == Some('/') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.peek_at(1) == Some('*') => {
                    let start = self.pos;
                    self.pos += 2;
                    match self.src[self.pos..].find("*/") {
                        Some(end) => self.pos += end + 2,
                        None => {
                            self.pos = start;
                            return Err(self.error("unterminated block comment"));
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn value(&mut self) -> Result<Node, ParseError> {
        let start = self.pos;
        let kind = match self.peek() {
            Some('{') => self.object()?,
            Some('[') => self.array()?,
            Some(q @ ('"' | '\'')) => Kind::Scalar(serde_json::Value::String(self.string(q)?)),
            Some(c) if c == '-' || c == '+' || c == '.' || c.is_ascii_digit() => {
                Kind::Scalar(self.number()?)
            }
            Some(c) if is_ident_start(c) => {
                let word = self.identifier();
                match word {
                    "true" => Kind::Scalar(serde_json::Value::Bool(true)),
                    "false" => Kind::Scalar(serde_json::Value::Bool(false)),
                    "null" | "Infinity" | "NaN" => Kind::Scalar(serde_json::Value::Null),
                    other => {
                        self.pos = start;
                        return Err(self.error(&format!("unexpected identifier '{}'", other)));
                    }
                }
            }
            Some(c) => return Err(self.error(&format!("unexpected character '{}'", c))),
            None => return Err(self.error("unexpected end of input")),
        };
        Ok(Node {
            kind,
            span: start..self.pos,
        })
    }

    fn object(&mut self) -> Result<Kind, ParseError> {
        self.expect('{')?;
        let mut members = Vec::new();
        loop {
            self.skip_trivia()?;
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Kind::Object(members));
            }

            let key_start = self.pos;
            let key = match self.peek() {
                Some(q @ ('"' | '\'')) => self.string(q)?,
                Some(c) if is_ident_start(c) => self.identifier().to_string(),
                Some(c) => return Err(self.error(&format!("expected member name, found '{}'", c))),
                None => return Err(self.error("unterminated object")),
            };
            let key_span = key_start..self.pos;

            self.skip_trivia()?;
            self.expect(':')?;
            self.skip_trivia()?;
            let value = self.value()?;
            members.push(Member {
                key,
                key_span,
                value,
            });

            self.skip_trivia()?;
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some('}') => {
                    self.bump();
                    return Ok(Kind::Object(members));
                }
                Some(c) => return Err(self.error(&format!("expected ',' or '}}', found '{}'", c))),
                None => return Err(self.error("unterminated object")),
            }
        }
    }

    fn array(&mut self) -> Result<Kind, ParseError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_trivia()?;
            if self.peek() == Some(']') {
                self.bump();
                return Ok(Kind::Array(items));
            }
            items.push(self.value()?);
            self.skip_trivia()?;
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(']') => {
                    self.bump();
                    return Ok(Kind::Array(items));
                }
                Some(c) => return Err(self.error(&format!("expected ',' or ']', found '{}'", c))),
                None => return Err(self.error("unterminated array")),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<String, ParseError> {
        let start = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            let c = match self.bump() {
                Some(c) => c,
                None => {
                    self.pos = start;
                    return Err(self.error("unterminated string"));
                }
            };
            match c {
                c if c == quote => return Ok(out),
                '\n' | '\r' => {
                    self.pos -= 1;
                    return Err(self.error("unescaped line break in string"));
                }
                '\\' => self.escape(&mut out)?,
                c => out.push(c),
            }
        }
    }

    fn escape(&mut self, out: &mut String) -> Result<(), ParseError> {
        let c = match self.bump() {
            Some(c) => c,
            None => return Err(self.error("unterminated escape")),
        };
        match c {
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            'x' => {
                let code = self.hex_digits(2)?;
                out.push(char::from_u32(code).unwrap_or('\u{fffd}'));
            }
            'u' => {
                let high = self.hex_digits(4)?;
                if (0xD800..0xDC00).contains(&high)
                    && self.peek() == Some('\\')
                    && self.peek_at(1) == Some('u')
                {
                    self.pos += 2;
                    let low = self.hex_digits(4)?;
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (low.wrapping_sub(0xDC00) & 0x3FF);
                    out.push(char::from_u32(combined).unwrap_or('\u{fffd}'));
                } else {
                    out.push(char::from_u32(high).unwrap_or('\u{fffd}'));
                }
            }
            // Line continuation.
            '\n' => {}
            '\r' => {
                if self.peek() == Some('\n') {
                    self.bump();
                }
            }
            other => out.push(other),
        }
        Ok(())
    }

    fn hex_digits(&mut self, count: usize) -> Result<u32, ParseError> {
        let mut code = 0u32;
        for _ in 0..count {
            match self.peek().and_then(|c| c.to_digit(16)) {
                Some(d) => {
                    code = code * 16 + d;
                    self.bump();
                }
                None => return Err(self.error("invalid hex escape")),
            }
        }
        Ok(code)
    }

    fn number(&mut self) -> Result<serde_json::Value, ParseError> {
        let start = self.pos;
        let negative = match self.peek() {
            Some('-') => {
                self.bump();
                true
            }
            Some('+') => {
                self.bump();
                false
            }
            _ => false,
        };

        if self.peek().is_some_and(is_ident_start) {
            let word = self.identifier();
            if word == "Infinity" || word == "NaN" {
                return Ok(serde_json::Value::Null);
            }
            self.pos = start;
            return Err(self.error("invalid number"));
        }

        if self.peek() == Some('0') && matches!(self.peek_at(1), Some('x' | 'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while self.peek().is_some_and(|c| c.is_ascii_hexdigit()) {
                self.bump();
            }
            let parsed = i64::from_str_radix(&self.src[digits_start..self.pos], 16);
            let magnitude = match parsed {
                Ok(m) => m,
                Err(_) => {
                    self.pos = start;
                    return Err(self.error("invalid hex number"));
                }
            };
            let n = if negative { -magnitude } else { magnitude };
            return Ok(serde_json::Value::Number(n.into()));
        }

        let digits_start = self.pos;
        let mut is_float = false;
        while let Some(c) = self.peek() {
            match c {
                '0'..='9' => {}
                '.' => is_float = true,
                'e' | 'E' => {
                    is_float = true;
                    if matches!(self.peek_at(1), Some('+' | '-')) {
                        self.bump();
                    }
                }
                _ => break,
            }
            self.bump();
        }
        let digits = &self.src[digits_start..self.pos];
        if digits.is_empty() || digits == "." {
            self.pos = start;
            return Err(self.error("invalid number"));
        }

        if !is_float {
            if let Ok(n) = digits.parse::<i64>() {
                let n = if negative { -n } else { n };
                return Ok(serde_json::Value::Number(n.into()));
            }
        }
        match digits.parse::<f64>() {
            Ok(f) => {
                let f = if negative { -f } else { f };
                Ok(serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null))
            }
            Err(_) => {
                self.pos = start;
                Err(self.error("invalid number"))
            }
        }
    }

    fn identifier(&mut self) -> &'a str {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.bump();
        }
        &self.src[start..self.pos]
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c == '$' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    is_ident_start(c) || c.is_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_matches_serde() {
        let text = r#"{"a": [1, 2.5, "x"], "b": {"c": null, "d": true}}"#;
        let expected: serde_json::Value = serde_json::from_str(text).unwrap();
        assert_eq!(parse(text).unwrap().to_json(), expected);
    }

    #[test]
    fn relaxed_syntax_is_accepted() {
        let text = r#"
// gateway settings
{
  gateway: {
    mode: 'local', /* inline */
    port: 0x4965,
    weight: +1.5,
    limit: Infinity,
  },
  list: [1, 2,],
}
"#;
        let value = parse(text).unwrap().to_json();
        assert_eq!(
            value,
            json!({
                "gateway": {"mode": "local", "port": 18789, "weight": 1.5, "limit": null},
                "list": [1, 2]
            })
        );
    }

    #[test]
    fn string_escapes() {
        let node = parse(r#"{ "s": "a\"b\né😀", 't': 'it\'s' }"#).unwrap();
        assert_eq!(node.get("s").unwrap().as_str(), Some("a\"b\né😀"));
        assert_eq!(node.get("t").unwrap().as_str(), Some("it's"));
    }

    #[test]
    fn errors_report_position() {
        let err = parse("{\n  \"a\": 1\n  \"b\": 2\n}").unwrap_err();
        assert_eq!(err.line, 3);
        assert_eq!(err.column, 3);

        assert!(parse("").is_err());
        assert!(parse("{\"a\": 1} extra").is_err());
        assert!(parse("{ /* never closed ").is_err());
        assert!(parse("{\"a\": \"line\nbreak\"}").is_err());
    }

    #[test]
    fn get_path_walks_objects() {
        let node = parse(r#"{"gateway": {"auth": {"token": "abc"}}}"#).unwrap();
        assert_eq!(
            node.get_path(&["gateway", "auth", "token"]).and_then(Node::as_str),
            Some("abc")
        );
        assert!(node.get_path(&["gateway", "missing"]).is_none());
    }

    #[test]
    fn duplicate_keys_resolve_to_last() {
        let node = parse(r#"{"k": "first", "k": "second"}"#).unwrap();
        assert_eq!(node.get("k").unwrap().as_str(), Some("second"));
    }

    #[test]
    fn set_string_replaces_only_the_value() {
        let text = r#"{
  // keep me
  gateway: {
    auth: { mode: 'token', token: 'old', },
  },
  other: [1, 2, 3,], /* and me */
}
"#;
        let edited = set_string(text, &["gateway", "auth", "token"], "new").unwrap();
        assert_eq!(edited, text.replace("'old'", "\"new\""));
    }

    #[test]
    fn set_string_appends_missing_member() {
        let text = "{\n  \"gateway\": {\n    \"mode\": \"local\"\n  }\n}\n";
        let edited = set_string(text, &["gateway", "auth", "token"], "t0k").unwrap();
        assert_eq!(
            edited,
            "{\n  \"gateway\": {\n    \"mode\": \"local\",\n    \"auth\": { \"token\": \"t0k\" }\n  }\n}\n"
        );
        let node = parse(&edited).unwrap();
        assert_eq!(
            node.get_path(&["gateway", "auth", "token"]).and_then(Node::as_str),
            Some("t0k")
        );
    }

    #[test]
    fn set_string_fills_empty_object() {
        let edited = set_string("{}", &["gateway", "auth", "token"], "x").unwrap();
        assert_eq!(edited, "{ \"gateway\": { \"auth\": { \"token\": \"x\" } } }");
    }

    #[test]
    fn set_string_rejects_non_object_parent() {
        let err = set_string(r#"{"gateway": "flat"}"#, &["gateway", "auth"], "x").unwrap_err();
        assert!(err.message.contains("gateway"));
    }

    #[test]
    fn set_string_escapes_value() {
        let edited = set_string(r#"{"t": ""}"#, &["t"], "a\"b").unwrap();
        assert_eq!(edited, r#"{"t": "a\"b"}"#);
    }
}
