//! Reference extraction from function source.
//!
//! Scans a function body for the host calls that read other cells or
//! collections and turns their literal arguments into dependencies:
//!
//! ```text
//! cell("B3")            single location
//! range("R[-2]C:R[-1]C") rectangular range
//! collection("Orders")  named collection
//! own_collection()      collection named by the calling cell's text
//! ```
//!
//! Reference text is `[Sheet!]address[:address]`, where an address is A1
//! notation (always absolute, `$` accepted) or R1C1 notation (`R3C2`
//! absolute and 1-based, `R[-1]C[2]` relative to the calling cell, a bare
//! `R` or `C` meaning offset 0). When a string fits both notations
//! (`RC1`), R1C1 wins.
//!
//! # Known Limitations
//!
//! - Dynamic references (`cell(name)`, `cell("A" .. n)`) cannot be
//!   statically analyzed. They produce a diagnostic, not a dependency.
//! - Comments and strings are recognised with Lua rules (`--`, `--[[ ]]`,
//!   `"..."`, `'...'`, `[[...]]`).
//!
//! Extraction never fails: malformed input yields a partial dependency list
//! plus diagnostics.

use crate::cell_id::{letters_to_col, Location};

/// One axis (row or column) of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// 0-based index
    Absolute(usize),
    /// Offset from the calling cell
    Relative(isize),
}

impl Axis {
    /// Resolve against the caller's coordinate on this axis.
    ///
    /// Returns None for a relative axis without a caller or one that lands
    /// before the first row/column.
    pub fn resolve(self, base: Option<usize>) -> Option<usize> {
        match self {
            Axis::Absolute(n) => Some(n),
            Axis::Relative(delta) => base?.checked_add_signed(delta),
        }
    }

    pub fn is_relative(self) -> bool {
        matches!(self, Axis::Relative(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address {
    pub row: Axis,
    pub col: Axis,
}

/// A reference to a single location or a rectangular range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocationRef {
    /// None = the calling cell's sheet
    pub sheet: Option<String>,
    pub start: Address,
    /// Some for ranges
    pub end: Option<Address>,
}

impl LocationRef {
    pub fn is_range(&self) -> bool {
        self.end.is_some()
    }

    pub fn is_relative(&self) -> bool {
        let rel = |a: &Address| a.row.is_relative() || a.col.is_relative();
        rel(&self.start) || self.end.as_ref().is_some_and(rel)
    }

    /// Resolve to concrete locations, row-major.
    ///
    /// `caller` supplies the base for relative axes and the default sheet.
    /// Ranges larger than `max_cells` are truncated (logged).
    pub fn resolve(&self, caller: Option<&Location>, max_cells: usize) -> Vec<Location> {
        self.resolve_in(caller, None, max_cells)
    }

    /// Like `resolve`, with `fallback_sheet` used when neither the reference
    /// nor a caller names a sheet. Relative axes still need a caller.
    pub fn resolve_in(&self, caller: Option<&Location>, fallback_sheet: Option<&str>, max_cells: usize) -> Vec<Location> {
        let Some(sheet) = self
            .sheet
            .as_deref()
            .or(caller.map(|c| c.sheet.as_str()))
            .or(fallback_sheet)
        else {
            return Vec::new();
        };
        let base_row = caller.map(|c| c.row);
        let base_col = caller.map(|c| c.col);

        let corner = |a: &Address| Some((a.row.resolve(base_row)?, a.col.resolve(base_col)?));
        let Some((r0, c0)) = corner(&self.start) else {
            return Vec::new();
        };
        let Some(end) = &self.end else {
            return vec![Location::new(sheet, r0, c0)];
        };
        let Some((r1, c1)) = corner(end) else {
            return Vec::new();
        };

        let (top, bottom) = (r0.min(r1), r0.max(r1));
        let (left, right) = (c0.min(c1), c0.max(c1));
        let total = (bottom - top + 1).saturating_mul(right - left + 1);
        if total > max_cells {
            log::warn!(
                "range {} covers {} cells, tracking only the first {}",
                self,
                total,
                max_cells
            );
        }

        (top..=bottom)
            .flat_map(|row| (left..=right).map(move |col| (row, col)))
            .take(max_cells)
            .map(|(row, col)| Location::new(sheet, row, col))
            .collect()
    }
}

impl std::fmt::Display for LocationRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fn axis(f: &mut std::fmt::Formatter<'_>, prefix: char, a: Axis) -> std::fmt::Result {
            match a {
                Axis::Absolute(n) => write!(f, "{}{}", prefix, n + 1),
                Axis::Relative(0) => write!(f, "{}", prefix),
                Axis::Relative(d) => write!(f, "{}[{}]", prefix, d),
            }
        }
        fn address(f: &mut std::fmt::Formatter<'_>, a: &Address) -> std::fmt::Result {
            axis(f, 'R', a.row)?;
            axis(f, 'C', a.col)
        }

        if let Some(sheet) = &self.sheet {
            write!(f, "{}!", sheet)?;
        }
        address(f, &self.start)?;
        if let Some(end) = &self.end {
            write!(f, ":")?;
            address(f, end)?;
        }
        Ok(())
    }
}

/// A reference to a named collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectionRef {
    Named(String),
    /// The collection named by the calling cell's text
    OwnText,
}

impl CollectionRef {
    /// Resolve to a collection name. `caller_text` is the calling cell's text.
    pub fn resolve(&self, caller_text: Option<&str>) -> Option<String> {
        match self {
            CollectionRef::Named(name) => Some(name.clone()),
            CollectionRef::OwnText => caller_text
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, CollectionRef::OwnText)
    }
}

/// Everything a function reads, in first-seen order, without duplicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dependencies {
    pub locations: Vec<LocationRef>,
    pub collections: Vec<CollectionRef>,
}

impl Dependencies {
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty() && self.collections.is_empty()
    }

    pub fn has_dynamic_collections(&self) -> bool {
        self.collections.iter().any(CollectionRef::is_dynamic)
    }

    fn add_location(&mut self, r: LocationRef) {
        if !self.locations.contains(&r) {
            self.locations.push(r);
        }
    }

    fn add_collection(&mut self, r: CollectionRef) {
        if !self.collections.contains(&r) {
            self.collections.push(r);
        }
    }
}

/// Result of scanning one source text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub dependencies: Dependencies,
    /// Human-readable problems, prefixed with the line number
    pub diagnostics: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    Empty,
    BadSheet(String),
    BadAddress(String),
}

impl std::fmt::Display for ReferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty reference"),
            Self::BadSheet(s) => write!(f, "invalid sheet name in '{s}'"),
            Self::BadAddress(s) => write!(f, "invalid address '{s}'"),
        }
    }
}

impl std::error::Error for ReferenceError {}

// =============================================================================
// Reference text parsing
// =============================================================================

/// Parse reference text such as `B3`, `Data!A1:B2` or `R[-1]C`.
pub fn parse_reference(text: &str) -> Result<LocationRef, ReferenceError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ReferenceError::Empty);
    }

    let (sheet, rest) = split_sheet(text)?;
    let (start, end) = match rest.split_once(':') {
        Some((a, b)) => (parse_address(a)?, Some(parse_address(b)?)),
        None => (parse_address(rest)?, None),
    };

    Ok(LocationRef { sheet, start, end })
}

fn split_sheet(text: &str) -> Result<(Option<String>, &str), ReferenceError> {
    if let Some(quoted) = text.strip_prefix('\'') {
        let Some((name, rest)) = quoted.split_once("'!") else {
            return Err(ReferenceError::BadSheet(text.to_string()));
        };
        if name.is_empty() {
            return Err(ReferenceError::BadSheet(text.to_string()));
        }
        return Ok((Some(name.to_string()), rest));
    }

    match text.split_once('!') {
        Some((name, rest)) => {
            let name = name.trim();
            if name.is_empty() {
                return Err(ReferenceError::BadSheet(text.to_string()));
            }
            Ok((Some(name.to_string()), rest))
        }
        None => Ok((None, text)),
    }
}

fn parse_address(text: &str) -> Result<Address, ReferenceError> {
    let text = text.trim();
    parse_r1c1(text)
        .or_else(|| parse_a1(text))
        .ok_or_else(|| ReferenceError::BadAddress(text.to_string()))
}

/// `$?letters$?digits`, always absolute.
fn parse_a1(text: &str) -> Option<Address> {
    let s = text.replace('$', "");
    let split = s.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = s.split_at(split);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let col = letters_to_col(letters)?;
    let row: usize = digits.parse().ok()?;
    if row == 0 {
        return None;
    }
    Some(Address {
        row: Axis::Absolute(row - 1),
        col: Axis::Absolute(col),
    })
}

/// `R<part>C<part>` where part is empty, `n` (1-based) or `[±n]`.
fn parse_r1c1(text: &str) -> Option<Address> {
    let rest = text.strip_prefix(['R', 'r'])?;
    let c_pos = rest.find(['C', 'c'])?;
    let row = parse_r1c1_part(&rest[..c_pos])?;
    let col = parse_r1c1_part(&rest[c_pos + 1..])?;
    Some(Address { row, col })
}

fn parse_r1c1_part(part: &str) -> Option<Axis> {
    if part.is_empty() {
        return Some(Axis::Relative(0));
    }
    if let Some(inner) = part.strip_prefix('[').and_then(|p| p.strip_suffix(']')) {
        return inner.trim().parse::<isize>().ok().map(Axis::Relative);
    }
    if !part.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    match part.parse::<usize>().ok()? {
        0 => None,
        n => Some(Axis::Absolute(n - 1)),
    }
}

// =============================================================================
// Source scanning
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Ident(&'a str),
    Str(String),
    Punct(u8),
    Other,
}

#[derive(Debug)]
struct Spanned<'a> {
    token: Token<'a>,
    offset: usize,
}

/// Host calls whose arguments are tracked.
const TRACKED_CALLS: &[&str] = &["cell", "range", "collection", "own_collection"];

/// Extract all location and collection references from `source`.
pub fn extract(source: &str) -> Extraction {
    let mut extraction = Extraction::default();
    let (tokens, lex_error) = tokenize(source);

    for (i, spanned) in tokens.iter().enumerate() {
        let Token::Ident(name) = spanned.token else {
            continue;
        };
        if !TRACKED_CALLS.contains(&name) || is_member_or_definition(&tokens, i) {
            continue;
        }
        let line = line_of(source, spanned.offset);

        match call_argument(&tokens, i) {
            CallArg::NotACall => {}
            CallArg::Literal(arg) => match name {
                "collection" => {
                    if arg.trim().is_empty() {
                        extraction.diagnostics.push(format!("line {line}: empty collection name"));
                    } else {
                        extraction
                            .dependencies
                            .add_collection(CollectionRef::Named(arg.trim().to_string()));
                    }
                }
                "own_collection" => {
                    extraction
                        .diagnostics
                        .push(format!("line {line}: own_collection() takes no arguments"));
                }
                _ => match parse_reference(&arg) {
                    Ok(r) => extraction.dependencies.add_location(r),
                    Err(e) => extraction.diagnostics.push(format!("line {line}: {name}(): {e}")),
                },
            },
            CallArg::NoArgs => {
                if name == "own_collection" {
                    extraction.dependencies.add_collection(CollectionRef::OwnText);
                } else {
                    extraction
                        .diagnostics
                        .push(format!("line {line}: {name}() needs a reference argument"));
                }
            }
            CallArg::Dynamic => {
                extraction.diagnostics.push(format!(
                    "line {line}: {name}() with a computed argument cannot be tracked"
                ));
            }
        }
    }

    if let Some(error) = lex_error {
        extraction.diagnostics.push(error);
    }
    extraction
}

enum CallArg {
    NotACall,
    NoArgs,
    Literal(String),
    Dynamic,
}

fn call_argument(tokens: &[Spanned<'_>], i: usize) -> CallArg {
    let at = |n: usize| tokens.get(i + n).map(|s| &s.token);
    match at(1) {
        // Lua call sugar: cell "A1"
        Some(Token::Str(s)) => CallArg::Literal(s.clone()),
        Some(Token::Punct(b'(')) => match (at(2), at(3)) {
            (Some(Token::Punct(b')')), _) => CallArg::NoArgs,
            (Some(Token::Str(s)), Some(Token::Punct(b')'))) => CallArg::Literal(s.clone()),
            _ => CallArg::Dynamic,
        },
        _ => CallArg::NotACall,
    }
}

/// `x.cell(...)`, `x:cell(...)` and `function cell(...)` are not host calls.
fn is_member_or_definition(tokens: &[Spanned<'_>], i: usize) -> bool {
    if i == 0 {
        return false;
    }
    match tokens[i - 1].token {
        // `..` is concatenation, not member access
        Token::Punct(b'.') => !(i >= 2 && tokens[i - 2].token == Token::Punct(b'.')),
        Token::Punct(b':') | Token::Ident("function") => true,
        _ => false,
    }
}

fn line_of(source: &str, offset: usize) -> usize {
    source.as_bytes()[..offset.min(source.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}

/// Tokenize with Lua comment/string rules.
///
/// Returns the tokens seen so far and, for unterminated strings or
/// comments, a diagnostic.
fn tokenize(source: &str) -> (Vec<Spanned<'_>>, Option<String>) {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];

        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // Comments: -- line, --[[ block ]]
        if b == b'-' && bytes.get(i + 1) == Some(&b'-') {
            let body = i + 2;
            if let Some(level) = long_bracket_level(bytes, body) {
                match find_long_close(bytes, body + level + 2, level) {
                    Some(end) => i = end,
                    None => {
                        let line = line_of(source, i);
                        return (tokens, Some(format!("line {line}: unterminated block comment")));
                    }
                }
            } else {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            continue;
        }

        // Quoted strings
        if b == b'"' || b == b'\'' {
            match scan_quoted(source, i) {
                Some((value, end)) => {
                    tokens.push(Spanned { token: Token::Str(value), offset: i });
                    i = end;
                }
                None => {
                    let line = line_of(source, i);
                    return (tokens, Some(format!("line {line}: unterminated string")));
                }
            }
            continue;
        }

        // Long strings: [[...]], [==[...]==]
        if b == b'[' {
            if let Some(level) = long_bracket_level(bytes, i) {
                let content = i + level + 2;
                match find_long_close(bytes, content, level) {
                    Some(end) => {
                        let value = source[content..end - level - 2].to_string();
                        tokens.push(Spanned { token: Token::Str(value), offset: i });
                        i = end;
                    }
                    None => {
                        let line = line_of(source, i);
                        return (tokens, Some(format!("line {line}: unterminated long string")));
                    }
                }
                continue;
            }
        }

        if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(Spanned { token: Token::Ident(&source[start..i]), offset: start });
            continue;
        }

        if b.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                i += 1;
            }
            tokens.push(Spanned { token: Token::Other, offset: start });
            continue;
        }

        if b.is_ascii() {
            tokens.push(Spanned { token: Token::Punct(b), offset: i });
        } else {
            tokens.push(Spanned { token: Token::Other, offset: i });
        }
        i += 1;
    }

    (tokens, None)
}

/// If `bytes[at..]` opens a long bracket `[=*[`, return its level.
fn long_bracket_level(bytes: &[u8], at: usize) -> Option<usize> {
    if bytes.get(at) != Some(&b'[') {
        return None;
    }
    let mut level = 0;
    while bytes.get(at + 1 + level) == Some(&b'=') {
        level += 1;
    }
    (bytes.get(at + 1 + level) == Some(&b'[')).then_some(level)
}

/// Find the end (exclusive) of the closing `]=*]` with `level` equals.
fn find_long_close(bytes: &[u8], from: usize, level: usize) -> Option<usize> {
    let mut i = from;
    while i < bytes.len() {
        if bytes[i] == b']' {
            let mut j = i + 1;
            let mut eq = 0;
            while bytes.get(j) == Some(&b'=') {
                eq += 1;
                j += 1;
            }
            if eq == level && bytes.get(j) == Some(&b']') {
                return Some(j + 1);
            }
        }
        i += 1;
    }
    None
}

/// Scan a quoted string starting at `start`. Returns (unescaped value, end).
fn scan_quoted(source: &str, start: usize) -> Option<(String, usize)> {
    let quote = source.as_bytes()[start] as char;
    let mut value = String::new();
    let mut chars = source[start + 1..].char_indices();

    while let Some((j, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, other)) => value.push(other),
                None => return None,
            },
            '\n' => return None,
            c if c == quote => return Some((value, start + 1 + j + 1)),
            c => value.push(c),
        }
    }
    None
}
