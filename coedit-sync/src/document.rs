//! Document metadata and the in-memory text buffer a session edits.
//!
//! The buffer is a rope, so span application is `O(log n)` per span and
//! snapshotting for an atomic multi-span apply is a cheap clone.

use ropey::Rope;
use serde::{Deserialize, Serialize};

use crate::protocol::{deserialize_id, EditSpan};

/// A document as served by the storage service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub content: String,
}

fn default_language() -> String {
    "javascript".to_string()
}

impl Document {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            language: default_language(),
            content: content.into(),
        }
    }
}

/// Mutable document text.
#[derive(Debug, Clone, Default)]
pub struct DocumentBuffer {
    rope: Rope,
}

impl DocumentBuffer {
    pub fn new(text: &str) -> Self {
        Self {
            rope: Rope::from_str(text),
        }
    }

    /// Replace the whole content.
    pub fn replace(&mut self, text: &str) {
        self.rope = Rope::from_str(text);
    }

    /// Apply spans in order, each against the text the previous spans produced.
    ///
    /// All-or-nothing: if any span is out of range the buffer is unchanged.
    pub fn apply(&mut self, spans: &[EditSpan]) -> Result<(), EditError> {
        let mut scratch = self.rope.clone();
        for (index, span) in spans.iter().enumerate() {
            if span.from > span.to {
                return Err(EditError::Inverted {
                    index,
                    from: span.from,
                    to: span.to,
                });
            }
            let len = scratch.len_chars();
            if span.to > len {
                return Err(EditError::OutOfRange {
                    index,
                    from: span.from,
                    to: span.to,
                    len,
                });
            }
            if span.from < span.to {
                scratch.remove(span.from..span.to);
            }
            if !span.insert.is_empty() {
                scratch.insert(span.from, &span.insert);
            }
        }
        self.rope = scratch;
        Ok(())
    }

    /// Length in chars.
    pub fn len_chars(&self) -> usize {
        self.rope.len_chars()
    }

    pub fn is_empty(&self) -> bool {
        self.rope.len_chars() == 0
    }

    pub fn text(&self) -> String {
        self.rope.to_string()
    }
}

/// Span application errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EditError {
    #[error("span #{index} ({from}..{to}) is inverted")]
    Inverted { index: usize, from: usize, to: usize },
    #[error("span #{index} ({from}..{to}) exceeds document length {len}")]
    OutOfRange {
        index: usize,
        from: usize,
        to: usize,
        len: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_at_start() {
        let mut buffer = DocumentBuffer::new("abc");
        buffer.apply(&[EditSpan::insert(0, "x")]).unwrap();
        assert_eq!(buffer.text(), "xabc");
    }

    #[test]
    fn test_replace_range() {
        let mut buffer = DocumentBuffer::new("hello world");
        buffer.apply(&[EditSpan::new(6, 11, "there")]).unwrap();
        assert_eq!(buffer.text(), "hello there");
    }

    #[test]
    fn test_spans_apply_progressively() {
        let mut buffer = DocumentBuffer::new("abc");
        // The second span sees the text produced by the first.
        buffer
            .apply(&[EditSpan::insert(0, "12"), EditSpan::delete(2, 3)])
            .unwrap();
        assert_eq!(buffer.text(), "12bc");
    }

    #[test]
    fn test_out_of_range_leaves_buffer_unchanged() {
        let mut buffer = DocumentBuffer::new("abc");
        let result = buffer.apply(&[EditSpan::insert(0, "x"), EditSpan::delete(3, 9)]);
        assert_eq!(
            result,
            Err(EditError::OutOfRange {
                index: 1,
                from: 3,
                to: 9,
                len: 4
            })
        );
        assert_eq!(buffer.text(), "abc");
    }

    #[test]
    fn test_inverted_span_rejected() {
        let mut buffer = DocumentBuffer::new("abc");
        assert!(matches!(
            buffer.apply(&[EditSpan::new(2, 1, "")]),
            Err(EditError::Inverted { .. })
        ));
    }

    #[test]
    fn test_char_offsets() {
        let mut buffer = DocumentBuffer::new("héllo");
        buffer.apply(&[EditSpan::new(1, 2, "e")]).unwrap();
        assert_eq!(buffer.text(), "hello");
        assert_eq!(buffer.len_chars(), 5);
    }

    #[test]
    fn test_replace_whole() {
        let mut buffer = DocumentBuffer::new("old");
        buffer.replace("new content");
        assert_eq!(buffer.text(), "new content");
        assert!(!buffer.is_empty());
    }

    #[test]
    fn test_document_decode_numeric_id() {
        let doc: Document = serde_json::from_value(serde_json::json!({
            "id": 4,
            "title": "notes",
            "language": "python",
            "content": "print(1)",
            "owner_id": 1
        }))
        .unwrap();
        assert_eq!(doc.id, "4");
        assert_eq!(doc.language, "python");
        assert_eq!(doc.content, "print(1)");
    }
}
