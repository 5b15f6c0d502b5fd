//! ST-010: Lookup expression parsing.
//!
//! A field is literal text interleaved with `${type query::key=value, ...}`
//! expressions. The type is separated from the query by the first unescaped
//! whitespace, the query from its arguments by the first unescaped `::`, and
//! arguments by unescaped commas. Delimiters inside a nested `${...}` belong to
//! the nested expression. At field level only `\${` is an escape; inside an
//! expression body a backslash escapes any character.
//!
//! Parsing is bounded: each nesting level increments a depth counter and the
//! parser fails with [`LookupError::DepthExceeded`] past the configured limit.

use crate::error::LookupError;

/// One piece of a field.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Literal(String),
    Lookup(LookupExpr),
}

/// A parsed field: literal text and lookups, in order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Field {
    segments: Vec<Segment>,
}

/// An immutable parsed lookup: type name, query, ordered arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupExpr {
    pub kind: String,
    pub query: Field,
    pub args: Vec<(String, Field)>,
    /// Source text including `${` and `}`
    pub raw: String,
}

/// Quick check for an embedded lookup.
pub fn contains_lookup(text: &str) -> bool {
    text.contains("${")
}

impl Field {
    /// Parse a top-level field.
    pub fn parse(input: &str, max_depth: usize) -> Result<Self, LookupError> {
        Self::parse_at(input, 0, max_depth)
    }

    /// Parse a field that sits `depth` levels below the top.
    pub fn parse_at(input: &str, depth: usize, max_depth: usize) -> Result<Self, LookupError> {
        let chars: Vec<char> = input.chars().collect();
        parse_field(&chars, depth, max_depth, false)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The lookup when the field is exactly one expression and nothing else.
    pub fn single_lookup(&self) -> Option<&LookupExpr> {
        match self.segments.as_slice() {
            [Segment::Lookup(expr)] => Some(expr),
            _ => None,
        }
    }

    pub fn has_lookups(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Lookup(_)))
    }

    /// Literal text of a lookup-free field.
    pub fn as_literal(&self) -> Option<String> {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Literal(text) => out.push_str(text),
                Segment::Lookup(_) => return None,
            }
        }
        Some(out)
    }
}

impl LookupExpr {
    pub fn arg(&self, key: &str) -> Option<&Field> {
        self.args.iter().find(|(k, _)| k == key).map(|(_, f)| f)
    }
}

fn malformed(expr: &[char], reason: &str) -> LookupError {
    LookupError::Malformed {
        expr: expr.iter().collect(),
        reason: reason.to_string(),
    }
}

fn parse_field(
    chars: &[char],
    depth: usize,
    max_depth: usize,
    escape_all: bool,
) -> Result<Field, LookupError> {
    if depth > max_depth {
        return Err(LookupError::DepthExceeded(max_depth));
    }

    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\\' {
            if escape_all {
                if let Some(&next) = chars.get(i + 1) {
                    literal.push(next);
                    i += 2;
                    continue;
                }
            } else if chars.get(i + 1) == Some(&'$') && chars.get(i + 2) == Some(&'{') {
                literal.push_str("${");
                i += 3;
                continue;
            }
            literal.push(c);
            i += 1;
            continue;
        }

        if c == '$' && chars.get(i + 1) == Some(&'{') {
            let close = find_closing(chars, i + 2)
                .ok_or_else(|| malformed(&chars[i..], "unclosed '${'"))?;
            if !literal.is_empty() {
                segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }
            let expr = parse_expr(&chars[i..=close], depth, max_depth)?;
            segments.push(Segment::Lookup(expr));
            i = close + 1;
            continue;
        }

        literal.push(c);
        i += 1;
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(Field { segments })
}

/// Index of the `}` closing an expression whose body starts at `start`.
fn find_closing(chars: &[char], start: usize) -> Option<usize> {
    let mut level = 1usize;
    let mut j = start;
    while j < chars.len() {
        match chars[j] {
            '\\' => {
                j += 2;
                continue;
            }
            '$' if chars.get(j + 1) == Some(&'{') => {
                level += 1;
                j += 2;
                continue;
            }
            '}' => {
                level -= 1;
                if level == 0 {
                    return Some(j);
                }
            }
            _ => {}
        }
        j += 1;
    }
    None
}

/// First index at nesting level zero where `matches` holds, skipping escapes.
fn find_top_level(chars: &[char], matches: impl Fn(&[char], usize) -> bool) -> Option<usize> {
    let mut level = 0usize;
    let mut j = 0;
    while j < chars.len() {
        match chars[j] {
            '\\' => {
                j += 2;
                continue;
            }
            '$' if chars.get(j + 1) == Some(&'{') => {
                level += 1;
                j += 2;
                continue;
            }
            '}' if level > 0 => level -= 1,
            _ if level == 0 && matches(chars, j) => return Some(j),
            _ => {}
        }
        j += 1;
    }
    None
}

/// Split on every top-level occurrence of `sep`.
fn split_top_level(chars: &[char], sep: char) -> Vec<&[char]> {
    let mut pieces = Vec::new();
    let mut rest = chars;
    while let Some(pos) = find_top_level(rest, |c, j| c[j] == sep) {
        pieces.push(&rest[..pos]);
        rest = &rest[pos + 1..];
    }
    pieces.push(rest);
    pieces
}

fn trim(chars: &[char]) -> &[char] {
    let start = chars
        .iter()
        .position(|c| !c.is_whitespace())
        .unwrap_or(chars.len());
    let end = chars
        .iter()
        .rposition(|c| !c.is_whitespace())
        .map_or(start, |p| p + 1);
    &chars[start..end.max(start)]
}

fn valid_kind(kind: &str) -> bool {
    !kind.is_empty()
        && kind
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Parse `${...}` (delimiters included) into a [`LookupExpr`].
fn parse_expr(raw: &[char], depth: usize, max_depth: usize) -> Result<LookupExpr, LookupError> {
    let body = trim(&raw[2..raw.len() - 1]);

    let split = find_top_level(body, |c, j| c[j].is_whitespace())
        .ok_or_else(|| malformed(raw, "missing query after lookup type"))?;
    let kind: String = body[..split].iter().collect();
    if !valid_kind(&kind) {
        return Err(malformed(raw, "invalid lookup type name"));
    }
    let rest = trim(&body[split + 1..]);

    let (query_chars, args_chars) =
        match find_top_level(rest, |c, j| c[j] == ':' && c.get(j + 1) == Some(&':')) {
            Some(pos) => (trim(&rest[..pos]), Some(&rest[pos + 2..])),
            None => (rest, None),
        };
    if query_chars.is_empty() {
        return Err(malformed(raw, "empty query"));
    }
    let query = parse_field(query_chars, depth + 1, max_depth, true)?;

    let mut args: Vec<(String, Field)> = Vec::new();
    if let Some(args_chars) = args_chars {
        for piece in split_top_level(args_chars, ',') {
            let piece = trim(piece);
            if piece.is_empty() {
                return Err(malformed(raw, "empty argument"));
            }
            let eq = find_top_level(piece, |c, j| c[j] == '=')
                .ok_or_else(|| malformed(raw, "argument is missing '='"))?;
            let key: String = trim(&piece[..eq]).iter().collect();
            if key.is_empty() || contains_lookup(&key) {
                return Err(malformed(raw, "invalid argument name"));
            }
            if args.iter().any(|(k, _)| *k == key) {
                return Err(malformed(raw, &format!("duplicate argument '{}'", key)));
            }
            let value = parse_field(trim(&piece[eq + 1..]), depth + 1, max_depth, true)?;
            args.push((key, value));
        }
    }

    Ok(LookupExpr {
        kind,
        query,
        args,
        raw: raw.iter().collect(),
    })
}
