//! JSX lowering: rewrites JSX elements to `React.createElement` calls
//! (classic runtime) and leaves every other token as written.
//!
//! The scanner tracks just enough JavaScript lexical structure (strings,
//! templates, comments, regex literals, expression position) to tell a
//! JSX `<` from a less-than operator.
use std::fmt;

const FACTORY: &str = "React.createElement";
const FRAGMENT: &str = "React.Fragment";

/// Keywords after which an expression starts.
const EXPRESSION_KEYWORDS: &[&str] = &[
    "return", "default", "yield", "await", "case", "typeof", "void", "delete", "in", "of",
    "else", "do", "new", "throw", "instanceof",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsxError {
    pub line: usize,
    pub message: String,
}

impl fmt::Display for JsxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSX syntax error at line {}: {}", self.line, self.message)
    }
}

impl std::error::Error for JsxError {}

pub fn transform(source: &str) -> Result<String, JsxError> {
    if !source.contains('<') {
        return Ok(source.to_string());
    }
    let mut scanner = Scanner {
        src: source.as_bytes(),
        pos: 0,
        out: Vec::with_capacity(source.len() + source.len() / 4),
    };
    scanner.js(false)?;
    String::from_utf8(scanner.out).map_err(|e| JsxError {
        line: 0,
        message: e.to_string(),
    })
}

struct Scanner<'a> {
    src: &'a [u8],
    pos: usize,
    out: Vec<u8>,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b'$' || b >= 0x80
}

fn is_ident_char(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

impl Scanner<'_> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn error(&self, message: impl Into<String>) -> JsxError {
        let end = self.pos.min(self.src.len());
        JsxError {
            line: self.src[..end].iter().filter(|&&b| b == b'\n').count() + 1,
            message: message.into(),
        }
    }

    fn push(&mut self) {
        if let Some(b) = self.peek() {
            self.out.push(b);
            self.pos += 1;
        }
    }

    fn emit(&mut self, text: &str) {
        self.out.extend_from_slice(text.as_bytes());
    }

    /// Runs `f` and returns what it wrote instead of keeping it in the output.
    fn capture<F>(&mut self, f: F) -> Result<String, JsxError>
    where
        F: FnOnce(&mut Self) -> Result<(), JsxError>,
    {
        let start = self.out.len();
        f(self)?;
        let captured = self.out.split_off(start);
        String::from_utf8(captured).map_err(|e| self.error(e.to_string()))
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), JsxError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", byte as char)))
        }
    }

    /// Copies JavaScript through, lowering any JSX it contains. With
    /// `until_brace`, stops after the first unbalanced `}` (not emitted).
    fn js(&mut self, until_brace: bool) -> Result<(), JsxError> {
        let mut depth = 0usize;
        let mut expression_start = true;

        while let Some(b) = self.peek() {
            match b {
                b'\'' | b'"' => {
                    self.copy_string(b)?;
                    expression_start = false;
                }
                b'`' => {
                    self.copy_template()?;
                    expression_start = false;
                }
                b'/' if self.peek_at(1) == Some(b'/') => {
                    while !matches!(self.peek(), None | Some(b'\n')) {
                        self.push();
                    }
                }
                b'/' if self.peek_at(1) == Some(b'*') => self.copy_block_comment()?,
                b'/' if expression_start => {
                    self.copy_regex()?;
                    expression_start = false;
                }
                b'<' if expression_start && self.at_element() => {
                    self.element()?;
                    expression_start = false;
                }
                b'{' => {
                    depth += 1;
                    self.push();
                    expression_start = true;
                }
                b'}' => {
                    if depth == 0 && until_brace {
                        self.pos += 1;
                        return Ok(());
                    }
                    depth = depth.saturating_sub(1);
                    self.push();
                    expression_start = true;
                }
                b if b.is_ascii_whitespace() => self.push(),
                b if is_ident_start(b) => {
                    let start = self.pos;
                    while matches!(self.peek(), Some(c) if is_ident_char(c)) {
                        self.push();
                    }
                    let word = std::str::from_utf8(&self.src[start..self.pos]).unwrap_or("");
                    expression_start = EXPRESSION_KEYWORDS.contains(&word);
                }
                b if b.is_ascii_digit() => {
                    while matches!(self.peek(), Some(c) if is_ident_char(c) || c == b'.') {
                        self.push();
                    }
                    expression_start = false;
                }
                b')' | b']' | b'.' => {
                    self.push();
                    expression_start = false;
                }
                _ => {
                    self.push();
                    expression_start = true;
                }
            }
        }

        if until_brace {
            Err(self.error("unterminated '{' expression"))
        } else {
            Ok(())
        }
    }

    fn copy_string(&mut self, quote: u8) -> Result<(), JsxError> {
        self.push();
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.error("unterminated string literal")),
                Some(b'\\') => {
                    self.push();
                    self.push();
                }
                Some(b) if b == quote => {
                    self.push();
                    return Ok(());
                }
                Some(_) => self.push(),
            }
        }
    }

    fn copy_template(&mut self) -> Result<(), JsxError> {
        self.push();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated template literal")),
                Some(b'\\') => {
                    self.push();
                    self.push();
                }
                Some(b'`') => {
                    self.push();
                    return Ok(());
                }
                Some(b'$') if self.peek_at(1) == Some(b'{') => {
                    self.push();
                    self.push();
                    self.js(true)?;
                    self.emit("}");
                }
                Some(_) => self.push(),
            }
        }
    }

    fn copy_block_comment(&mut self) -> Result<(), JsxError> {
        self.push();
        self.push();
        loop {
            match self.peek() {
                None => return Err(self.error("unterminated comment")),
                Some(b'*') if self.peek_at(1) == Some(b'/') => {
                    self.push();
                    self.push();
                    return Ok(());
                }
                Some(_) => self.push(),
            }
        }
    }

    fn copy_regex(&mut self) -> Result<(), JsxError> {
        self.push();
        let mut in_class = false;
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.error("unterminated regular expression")),
                Some(b'\\') => {
                    self.push();
                    self.push();
                }
                Some(b'[') => {
                    in_class = true;
                    self.push();
                }
                Some(b']') => {
                    in_class = false;
                    self.push();
                }
                Some(b'/') if !in_class => {
                    self.push();
                    while matches!(self.peek(), Some(c) if is_ident_char(c)) {
                        self.push();
                    }
                    return Ok(());
                }
                Some(_) => self.push(),
            }
        }
    }

    fn at_element(&self) -> bool {
        matches!(self.peek_at(1), Some(b) if b == b'>' || is_ident_start(b))
    }

    fn read_name(&mut self, extra: &[u8]) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c) || extra.contains(&c)) {
            self.pos += 1;
        }
        String::from_utf8_lossy(&self.src[start..self.pos]).into_owned()
    }

    /// Lowers one element or fragment starting at `<`.
    fn element(&mut self) -> Result<(), JsxError> {
        self.pos += 1;
        self.skip_whitespace();

        if self.peek() == Some(b'>') {
            self.pos += 1;
            let children = self.children("")?;
            self.emit(&format!("{FACTORY}({FRAGMENT}, null"));
            for child in children {
                self.emit(", ");
                self.emit(&child);
            }
            self.emit(")");
            return Ok(());
        }

        let name = self.read_name(b".-:");
        if name.is_empty() {
            return Err(self.error("expected an element name"));
        }
        let (props, self_closing) = self.attributes(&name)?;
        let children = if self_closing {
            Vec::new()
        } else {
            self.children(&name)?
        };

        self.emit(&format!("{FACTORY}({}, {props}", tag_expression(&name)));
        for child in children {
            self.emit(", ");
            self.emit(&child);
        }
        self.emit(")");
        Ok(())
    }

    /// Parses attributes up to `>` or `/>`; returns the props expression
    /// and whether the element closed itself.
    fn attributes(&mut self, element: &str) -> Result<(String, bool), JsxError> {
        let mut parts: Vec<String> = Vec::new();
        let self_closing = loop {
            self.skip_whitespace();
            match self.peek() {
                None => return Err(self.error(format!("unterminated element <{element}>"))),
                Some(b'/') => {
                    self.pos += 1;
                    self.expect(b'>')?;
                    break true;
                }
                Some(b'>') => {
                    self.pos += 1;
                    break false;
                }
                Some(b'{') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    if !self.src[self.pos..].starts_with(b"...") {
                        return Err(self.error("expected '...' in attribute spread"));
                    }
                    self.pos += 3;
                    let expression = self.capture(|s| s.js(true))?;
                    parts.push(format!("...({})", expression.trim()));
                }
                Some(_) => {
                    let name = self.read_name(b"-:");
                    if name.is_empty() {
                        return Err(self.error(format!("unexpected character in <{element}>")));
                    }
                    self.skip_whitespace();
                    let value = if self.peek() == Some(b'=') {
                        self.pos += 1;
                        self.skip_whitespace();
                        self.attribute_value()?
                    } else {
                        "true".to_string()
                    };
                    parts.push(format!("{}: {value}", js_string(&name)));
                }
            }
        };

        let props = if parts.is_empty() {
            "null".to_string()
        } else {
            format!("{{{}}}", parts.join(", "))
        };
        Ok((props, self_closing))
    }

    fn attribute_value(&mut self) -> Result<String, JsxError> {
        match self.peek() {
            Some(quote @ (b'"' | b'\'')) => {
                self.pos += 1;
                let start = self.pos;
                while matches!(self.peek(), Some(b) if b != quote) {
                    self.pos += 1;
                }
                if self.peek().is_none() {
                    return Err(self.error("unterminated attribute string"));
                }
                let raw = String::from_utf8_lossy(&self.src[start..self.pos]).into_owned();
                self.pos += 1;
                Ok(js_string(&decode_entities(&raw)))
            }
            Some(b'{') => {
                self.pos += 1;
                let expression = self.capture(|s| s.js(true))?;
                if expression.trim().is_empty() {
                    return Err(self.error("attribute expression must not be empty"));
                }
                Ok(format!("({})", expression.trim()))
            }
            Some(b'<') => self.capture(|s| s.element()),
            _ => Err(self.error("expected an attribute value")),
        }
    }

    /// Parses children up to the closing tag for `element` ("" for a fragment).
    fn children(&mut self, element: &str) -> Result<Vec<String>, JsxError> {
        let mut children = Vec::new();
        loop {
            match self.peek() {
                None => {
                    let shown = if element.is_empty() { "<>" } else { element };
                    return Err(self.error(format!("missing closing tag for {shown}")));
                }
                Some(b'<') => {
                    let mut lookahead = self.pos + 1;
                    while matches!(self.src.get(lookahead), Some(b) if b.is_ascii_whitespace()) {
                        lookahead += 1;
                    }
                    if self.src.get(lookahead) == Some(&b'/') {
                        self.pos = lookahead + 1;
                        self.skip_whitespace();
                        let closing = self.read_name(b".-:");
                        self.skip_whitespace();
                        self.expect(b'>')?;
                        if closing != element {
                            return Err(self.error(format!(
                                "expected closing tag for <{element}>, found </{closing}>"
                            )));
                        }
                        return Ok(children);
                    }
                    children.push(self.capture(|s| s.element())?);
                }
                Some(b'{') => {
                    self.pos += 1;
                    let expression = self.capture(|s| s.js(true))?;
                    if !is_blank_expression(&expression) {
                        children.push(format!("({})", expression.trim()));
                    }
                }
                Some(_) => {
                    let start = self.pos;
                    while !matches!(self.peek(), None | Some(b'<') | Some(b'{')) {
                        self.pos += 1;
                    }
                    let raw = String::from_utf8_lossy(&self.src[start..self.pos]);
                    if let Some(text) = clean_text(&raw) {
                        children.push(js_string(&decode_entities(&text)));
                    }
                }
            }
        }
    }
}

/// Intrinsic elements (lowercase or dashed names) become strings;
/// everything else is a reference to a component in scope.
fn tag_expression(name: &str) -> String {
    let intrinsic = !name.contains('.')
        && (name.contains('-') || name.starts_with(|c: char| c.is_ascii_lowercase()));
    if intrinsic {
        js_string(name)
    } else {
        name.to_string()
    }
}

/// `{}` and `{/* comment */}` children produce nothing.
fn is_blank_expression(expression: &str) -> bool {
    let mut rest = expression.trim();
    loop {
        if let Some(after) = rest.strip_prefix("/*") {
            match after.find("*/") {
                Some(end) => rest = after[end + 2..].trim_start(),
                None => return false,
            }
        } else if let Some(after) = rest.strip_prefix("//") {
            rest = after.find('\n').map_or("", |end| &after[end..]).trim_start();
        } else {
            return rest.is_empty();
        }
    }
}

/// JSX text whitespace rules: lines are trimmed where they meet a line
/// break, blank lines are dropped and the rest are joined with a space.
fn clean_text(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw.lines().collect();
    let last_non_empty = lines.iter().rposition(|line| !line.trim().is_empty())?;
    let ends_with_newline = raw.ends_with('\n');
    let mut text = String::new();

    for (i, line) in lines.iter().enumerate() {
        let is_first = i == 0;
        let is_last = i == lines.len() - 1 && !ends_with_newline;
        let mut part: &str = line;
        if !is_first {
            part = part.trim_start();
        }
        if !is_last {
            part = part.trim_end();
        }
        if !part.is_empty() {
            text.push_str(part);
            if i != last_non_empty {
                text.push(' ');
            }
        }
    }

    (!text.is_empty()).then_some(text)
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = candidate.find(';').filter(|&end| end <= 10).and_then(|end| {
            let entity = &candidate[1..end];
            let ch = match entity {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => entity
                    .strip_prefix("#x")
                    .or_else(|| entity.strip_prefix("#X"))
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                    .and_then(char::from_u32),
            };
            ch.map(|c| (c, end))
        });
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
