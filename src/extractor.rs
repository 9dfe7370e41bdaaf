//! Call-site extraction from stored function bodies
//!
//! A single forward pass over the body text. The scanner keeps a stack of
//! open delimiters so that commas inside nested calls, grouping parentheses,
//! index brackets, and string literals never count toward an enclosing call's
//! arguments. No regex backtracking is involved; every byte is visited once.
//!
//! ```text
//! Foo(a, b, Bar(c, d), e)
//! ^^^^      ^^^^
//! │         └─ ordinal 1, arity 2 (depth 2)
//! └─ ordinal 0, arity 3 (commas at depth 1 only)
//! ```
//!
//! Recognized call syntax is an identifier immediately followed by `(`,
//! optionally module-qualified as `MODULE->Name(`. `// ...` and `/* ... */`
//! comments are skipped. Text between `'` or `"` quotes is opaque.
//!
//! Argument counting follows the interpreter: an empty list is zero
//! arguments and a blank segment after the last top-level comma is not an
//! argument, so `Foo(a, b,)` has two.
//!
//! Sites are yielded in ordinal (textual) order. The iterator buffers only
//! the sites of the current top-level statement, so it stays lazy on long
//! bodies.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

/// Control-flow words that take a parenthesized condition, not calls
const KEYWORDS: &[&str] = &[
    "if", "elif", "elseif", "else", "while", "for", "foreach", "until", "repeat", "case",
    "switch", "when", "return", "and", "or", "not", "xor", "in", "then", "do", "begin", "end",
];

/// Parsed argument count of a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arity {
    Resolved(usize),
    /// Delimiters never balanced before end of text
    Unresolved,
}

impl Arity {
    pub fn count(self) -> Option<usize> {
        match self {
            Arity::Resolved(n) => Some(n),
            Arity::Unresolved => None,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Resolved(n) => write!(f, "{}", n),
            Arity::Unresolved => write!(f, "unresolved"),
        }
    }
}

/// One textual call occurrence inside a body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    /// Position among the body's call sites, 0-based, in textual order
    pub ordinal: usize,
    pub callee: String,
    /// Module written before `->`, if any
    pub qualifier: Option<String>,
    /// Raw text between the delimiters (to end of body when unresolved)
    pub args_text: String,
    pub arity: Arity,
    /// 1-based line of the callee name
    pub line: usize,
    /// Byte offset of the callee name (or its qualifier)
    pub offset: usize,
}

impl CallSite {
    pub fn is_resolved(&self) -> bool {
        matches!(self.arity, Arity::Resolved(_))
    }

    /// Callee as written, qualifier included
    pub fn target(&self) -> String {
        match &self.qualifier {
            Some(module) => format!("{}->{}", module, self.callee),
            None => self.callee.clone(),
        }
    }
}

/// Extract call sites from a body
///
/// # Example
///
/// ```
/// use fansy_tracer::extractor::{extract, Arity};
///
/// let sites: Vec<_> = extract("x := Foo(a, b, Bar(c, d), e);").collect();
/// assert_eq!(sites[0].callee, "Foo");
/// assert_eq!(sites[0].arity, Arity::Resolved(3));
/// assert_eq!(sites[1].callee, "Bar");
/// assert_eq!(sites[1].arity, Arity::Resolved(2));
/// ```
pub fn extract(body: &str) -> CallSites<'_> {
    CallSites {
        text: body,
        pos: 0,
        line: 1,
        stack: Vec::new(),
        pending: Vec::new(),
        ready: VecDeque::new(),
        next_ordinal: 0,
        finished: false,
    }
}

#[derive(Debug, Clone)]
enum Frame {
    Call {
        /// Index into `pending`
        slot: usize,
        args_start: usize,
        commas: usize,
        /// Byte offset just past the last top-level comma
        last_comma: usize,
    },
    Group {
        closer: u8,
    },
}

/// Lazy iterator over a body's call sites; clone it to restart from the
/// same position
#[derive(Debug, Clone)]
pub struct CallSites<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
    stack: Vec<Frame>,
    /// Sites opened in the current top-level statement
    pending: Vec<CallSite>,
    ready: VecDeque<CallSite>,
    next_ordinal: usize,
    finished: bool,
}

impl<'a> CallSites<'a> {
    /// Start over from the beginning of the body
    pub fn rewind(&mut self) {
        *self = extract(self.text);
    }

    fn flush_if_top_level(&mut self) {
        if self.stack.is_empty() && !self.pending.is_empty() {
            self.ready.extend(self.pending.drain(..));
        }
    }

    /// Close every open call frame as unresolved
    fn finish(&mut self) {
        self.finished = true;
        let end = self.text.len();
        for frame in self.stack.drain(..) {
            if let Frame::Call {
                slot, args_start, ..
            } = frame
            {
                let site = &mut self.pending[slot];
                site.args_text = self.text[args_start..end].to_string();
                site.arity = Arity::Unresolved;
            }
        }
        self.ready.extend(self.pending.drain(..));
    }

    fn close(&mut self, closer: u8) {
        let matches = match self.stack.last() {
            Some(Frame::Call { .. }) => closer == b')',
            Some(Frame::Group { closer: expected }) => *expected == closer,
            None => false,
        };
        if !matches {
            // Stray or mismatched closer
            return;
        }
        if let Some(Frame::Call {
            slot,
            args_start,
            commas,
            last_comma,
        }) = self.stack.pop()
        {
            let args = &self.text[args_start..self.pos];
            let trailing_empty = commas > 0 && self.text[last_comma..self.pos].trim().is_empty();
            let site = &mut self.pending[slot];
            site.args_text = args.to_string();
            site.arity = if args.trim().is_empty() {
                Arity::Resolved(0)
            } else if trailing_empty {
                Arity::Resolved(commas)
            } else {
                Arity::Resolved(commas + 1)
            };
        }
        self.flush_if_top_level();
    }

    fn skip_line_comment(&mut self) {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self) {
        let bytes = self.text.as_bytes();
        self.pos += 2;
        while self.pos < bytes.len() {
            if bytes[self.pos] == b'*' && bytes.get(self.pos + 1) == Some(&b'/') {
                self.pos += 2;
                return;
            }
            if bytes[self.pos] == b'\n' {
                self.line += 1;
            }
            self.pos += 1;
        }
    }

    fn skip_string(&mut self, quote: u8) {
        let bytes = self.text.as_bytes();
        self.pos += 1;
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            self.pos += 1;
            if b == quote {
                return;
            }
            if b == b'\n' {
                self.line += 1;
            }
        }
    }

    /// Scan an identifier (with optional `->` qualifiers) starting at `pos`
    fn scan_name(&mut self) {
        let start = self.pos;
        let line = self.line;
        let mut qualifier: Option<&'a str> = None;
        let mut name = self.take_ident();

        while self.text[self.pos..].starts_with("->") && ident_start(self.text, self.pos + 2) {
            self.pos += 2;
            qualifier = Some(name);
            name = self.take_ident();
        }

        if self.text.as_bytes().get(self.pos) != Some(&b'(') {
            return;
        }
        self.pos += 1;

        if qualifier.is_none() && is_keyword(name) {
            self.stack.push(Frame::Group { closer: b')' });
            return;
        }

        let slot = self.pending.len();
        self.pending.push(CallSite {
            ordinal: self.next_ordinal,
            callee: name.to_string(),
            qualifier: qualifier.map(str::to_string),
            args_text: String::new(),
            arity: Arity::Unresolved,
            line,
            offset: start,
        });
        self.next_ordinal += 1;
        self.stack.push(Frame::Call {
            slot,
            args_start: self.pos,
            commas: 0,
            last_comma: self.pos,
        });
    }

    fn take_ident(&mut self) -> &'a str {
        let text: &'a str = self.text;
        let start = self.pos;
        let end = text[start..]
            .char_indices()
            .find(|(_, c)| !is_ident_char(*c))
            .map_or(text.len(), |(i, _)| start + i);
        self.pos = end;
        &text[start..end]
    }

    /// Advance until at least one site is ready or the text is exhausted
    fn scan(&mut self) {
        let text: &'a str = self.text;
        let bytes = text.as_bytes();
        while self.ready.is_empty() {
            if self.pos >= bytes.len() {
                self.finish();
                return;
            }
            match bytes[self.pos] {
                b'\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                b'/' if bytes.get(self.pos + 1) == Some(&b'/') => self.skip_line_comment(),
                b'/' if bytes.get(self.pos + 1) == Some(&b'*') => self.skip_block_comment(),
                q @ (b'\'' | b'"') => self.skip_string(q),
                b'(' => {
                    self.stack.push(Frame::Group { closer: b')' });
                    self.pos += 1;
                }
                b'[' => {
                    self.stack.push(Frame::Group { closer: b']' });
                    self.pos += 1;
                }
                c @ (b')' | b']') => {
                    self.close(c);
                    self.pos += 1;
                }
                b',' => {
                    let after = self.pos + 1;
                    if let Some(Frame::Call {
                        commas, last_comma, ..
                    }) = self.stack.last_mut()
                    {
                        *commas += 1;
                        *last_comma = after;
                    }
                    self.pos += 1;
                }
                _ if ident_start(text, self.pos) => self.scan_name(),
                _ => {
                    let rest = &text[self.pos..];
                    let step = match rest.chars().next() {
                        // Number: consume the run so `1e(` is not a call
                        Some(c) if is_ident_char(c) => rest
                            .char_indices()
                            .find(|(_, c)| !is_ident_char(*c))
                            .map_or(rest.len(), |(i, _)| i),
                        Some(c) => c.len_utf8(),
                        None => 1,
                    };
                    self.pos += step;
                }
            }
        }
    }
}

impl Iterator for CallSites<'_> {
    type Item = CallSite;

    fn next(&mut self) -> Option<CallSite> {
        if self.ready.is_empty() && !self.finished {
            self.scan();
        }
        self.ready.pop_front()
    }
}

/// Split a parenthesized list into its top-level segments
///
/// `text` starts just past the opening `(`. Returns the raw segments and the
/// byte offset of the matching `)`, or `None` when the list never closes.
/// Nested `()`/`[]` and quoted text are kept whole.
pub fn split_top_level(text: &str) -> Option<(Vec<&str>, usize)> {
    let bytes = text.as_bytes();
    let mut closers: Vec<u8> = Vec::new();
    let mut segments = Vec::new();
    let mut segment_start = 0;
    let mut pos = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            q @ (b'\'' | b'"') => {
                pos += 1;
                while pos < bytes.len() && bytes[pos] != q {
                    pos += 1;
                }
            }
            b'(' => closers.push(b')'),
            b'[' => closers.push(b']'),
            c @ (b')' | b']') => match closers.last() {
                Some(expected) if *expected == c => {
                    closers.pop();
                }
                None if c == b')' => {
                    segments.push(&text[segment_start..pos]);
                    return Some((segments, pos));
                }
                _ => {}
            },
            b',' if closers.is_empty() => {
                segments.push(&text[segment_start..pos]);
                segment_start = pos + 1;
            }
            _ => {}
        }
        pos += 1;
    }
    None
}

fn is_ident_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn ident_start(text: &str, pos: usize) -> bool {
    text.get(pos..)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c == '_' || c.is_alphabetic())
}

fn is_keyword(name: &str) -> bool {
    KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(name))
}
