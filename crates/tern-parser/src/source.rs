//! Source text and source locations.
//!
//! A [`ModuleSource`] owns the text of one script module and a line index
//! computed once at construction. [`SourceLocation`]s are small copyable
//! descriptors that point back into the owning source by byte offset.

use serde::{Deserialize, Serialize};

/// Owned source text for a single module, with a derived index of line slices.
///
/// Line endings may be LF, CR, or CRLF; the index stores the byte offset of
/// the first character of each line.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    path: String,
    text: String,
    line_offsets: Vec<u32>,
}

impl ModuleSource {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let line_offsets = build_line_index(&text);
        Self {
            path: path.into(),
            text,
            line_offsets,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn line_count(&self) -> u32 {
        self.line_offsets.len() as u32
    }

    /// The text of a zero-based line, without its terminator.
    pub fn line(&self, idx: u32) -> Option<&str> {
        let begin = *self.line_offsets.get(idx as usize)? as usize;
        let end = self
            .line_offsets
            .get(idx as usize + 1)
            .map(|o| *o as usize)
            .unwrap_or(self.text.len());
        Some(self.text[begin..end].trim_end_matches(['\r', '\n']))
    }

    /// Map a byte offset to a zero-based `(line, column)` pair.
    ///
    /// Columns count bytes from the start of the line, which matches how the
    /// lexer produces locations for ASCII-heavy source.
    pub fn line_col(&self, offset: u32) -> (u32, u32) {
        let line = match self.line_offsets.binary_search(&offset) {
            Ok(l) => l,
            Err(next) => next.saturating_sub(1),
        };
        (line as u32, offset - self.line_offsets[line])
    }

    /// Build a [`SourceLocation`] covering `[begin, end)`.
    pub fn location(&self, begin: u32, end: u32) -> SourceLocation {
        debug_assert!(begin <= end && end as usize <= self.text.len());
        let (line, column) = self.line_col(begin);
        let (end_line, end_column) = self.line_col(end);
        SourceLocation {
            offset: begin,
            length: end - begin,
            line,
            column,
            end_line,
            end_column,
        }
    }

    /// The source text a location covers.
    pub fn slice(&self, loc: &SourceLocation) -> &str {
        &self.text[loc.offset as usize..loc.end_offset() as usize]
    }
}

fn build_line_index(text: &str) -> Vec<u32> {
    let mut offsets = vec![0u32];
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\n' => offsets.push(i as u32 + 1),
            b'\r' => {
                // CRLF counts as one terminator
                if bytes.get(i + 1) == Some(&b'\n') {
                    i += 1;
                }
                offsets.push(i as u32 + 1);
            }
            _ => {}
        }
        i += 1;
    }
    offsets
}

/// A span of source text. Immutable once produced.
///
/// Lines and columns are zero-based. `end_line`/`end_column` locate the first
/// position past the span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceLocation {
    pub offset: u32,
    pub length: u32,
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SourceLocation {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn end_offset(&self) -> u32 {
        self.offset + self.length
    }

    /// A zero-length location at the end of this one.
    pub fn end_location(&self) -> SourceLocation {
        SourceLocation {
            offset: self.end_offset(),
            length: 0,
            line: self.end_line,
            column: self.end_column,
            end_line: self.end_line,
            end_column: self.end_column,
        }
    }

    /// The smallest location covering both `self` and `other`.
    pub fn merge(&self, other: &SourceLocation) -> SourceLocation {
        let (first, last) = if self.offset <= other.offset {
            (self, other)
        } else {
            (other, self)
        };
        SourceLocation {
            offset: first.offset,
            length: last.end_offset().saturating_sub(first.offset),
            line: first.line,
            column: first.column,
            end_line: last.end_line,
            end_column: last.end_column,
        }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line + 1, self.column + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_index_handles_all_terminators() {
        let src = ModuleSource::new("test.tn", "a\nb\r\nc\rd");
        assert_eq!(src.line_count(), 4);
        assert_eq!(src.line(0), Some("a"));
        assert_eq!(src.line(1), Some("b"));
        assert_eq!(src.line(2), Some("c"));
        assert_eq!(src.line(3), Some("d"));
    }

    #[test]
    fn line_col_maps_offsets() {
        let src = ModuleSource::new("test.tn", "let x;\nlet y;\n");
        assert_eq!(src.line_col(0), (0, 0));
        assert_eq!(src.line_col(4), (0, 4));
        assert_eq!(src.line_col(7), (1, 0));
        assert_eq!(src.line_col(11), (1, 4));
    }

    #[test]
    fn location_merge_covers_both() {
        let src = ModuleSource::new("test.tn", "aa bb cc");
        let a = src.location(0, 2);
        let b = src.location(6, 8);
        let m = a.merge(&b);
        assert_eq!(m.offset, 0);
        assert_eq!(m.end_offset(), 8);
        assert_eq!(src.slice(&m), "aa bb cc");
    }

    #[test]
    fn end_location_is_zero_length() {
        let src = ModuleSource::new("test.tn", "abc\ndef");
        let loc = src.location(0, 5);
        let end = loc.end_location();
        assert_eq!(end.offset, 5);
        assert_eq!(end.length, 0);
        assert!(loc.offset() <= end.offset());
    }
}
