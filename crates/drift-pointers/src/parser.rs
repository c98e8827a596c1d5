use drift_core::{FileId, TextSize};

use crate::tree::{ElementKind, ElementTree, TreeBuilder};

/// Turns document text into an element tree.
pub trait Parser: Send + Sync {
    fn parse(&self, file: FileId, text: &str, stamp: u64) -> ElementTree;
}

/// A language-agnostic parser: identifiers, numbers, string literals, whitespace and single
/// character punctuation, with `()`, `[]` and `{}` nested into groups.
///
/// Unbalanced closers are kept as plain punctuation; groups still open at the end of input are
/// closed there.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenParser;

impl Parser for TokenParser {
    fn parse(&self, file: FileId, text: &str, stamp: u64) -> ElementTree {
        let mut builder = TreeBuilder::new(file).stamp(stamp);
        let mut open: Vec<u8> = Vec::new();
        let mut lexer = Lexer::new(text);

        while let Some((kind, len)) = lexer.next_token() {
            let first = text.as_bytes()[lexer.pos - len];
            match (kind, first) {
                (ElementKind::Punct, b'(' | b'[' | b'{') => {
                    builder.start_node(group_kind(first));
                    builder.token(kind, size(len));
                    open.push(closer(first));
                }
                (ElementKind::Punct, b')' | b']' | b'}') if open.last() == Some(&first) => {
                    builder.token(kind, size(len));
                    builder.finish_node();
                    open.pop();
                }
                _ => builder.token(kind, size(len)),
            }
        }
        builder.finish()
    }
}

fn group_kind(opener: u8) -> ElementKind {
    match opener {
        b'(' => ElementKind::ParenGroup,
        b'[' => ElementKind::BracketGroup,
        _ => ElementKind::BraceGroup,
    }
}

fn closer(opener: u8) -> u8 {
    match opener {
        b'(' => b')',
        b'[' => b']',
        _ => b'}',
    }
}

fn size(len: usize) -> TextSize {
    TextSize::try_from(len).unwrap_or(TextSize::from(u32::MAX))
}

struct Lexer<'a> {
    src: &'a str,
    input: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            input: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn peek_char(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump_while(&mut self, mut pred: impl FnMut(char) -> bool) {
        while let Some(ch) = self.peek_char() {
            if !pred(ch) {
                break;
            }
            self.pos += ch.len_utf8();
        }
    }

    /// Returns the next token kind and its byte length.
    fn next_token(&mut self) -> Option<(ElementKind, usize)> {
        let start = self.pos;
        let ch = self.peek_char()?;
        let kind = if ch.is_whitespace() {
            self.bump_while(char::is_whitespace);
            ElementKind::Whitespace
        } else if ch == '_' || ch.is_alphabetic() {
            self.bump_while(|c| c == '_' || c.is_alphanumeric());
            ElementKind::Ident
        } else if ch.is_ascii_digit() {
            self.bump_while(|c| c == '_' || c == '.' || c.is_ascii_alphanumeric());
            ElementKind::Number
        } else if ch == '"' {
            self.string();
            ElementKind::Str
        } else {
            self.pos += ch.len_utf8();
            ElementKind::Punct
        };
        Some((kind, self.pos - start))
    }

    /// Consumes a string literal. Unterminated literals stop at the end of the line.
    fn string(&mut self) {
        self.pos += 1;
        while let Some(b) = self.peek() {
            match b {
                b'\\' => {
                    self.pos += 1;
                    if let Some(ch) = self.peek_char() {
                        if ch == '\n' {
                            return;
                        }
                        self.pos += ch.len_utf8();
                    }
                }
                b'"' => {
                    self.pos += 1;
                    return;
                }
                b'\n' => return,
                _ => self.bump_one(),
            }
        }
    }

    fn bump_one(&mut self) {
        if let Some(ch) = self.peek_char() {
            self.pos += ch.len_utf8();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use drift_core::TextRange;

    use super::*;

    fn range(start: u32, end: u32) -> TextRange {
        TextRange::new(TextSize::from(start), TextSize::from(end))
    }

    fn parse(text: &str) -> Arc<ElementTree> {
        Arc::new(TokenParser.parse(FileId::from_raw(1), text, 0))
    }

    fn kinds(text: &str) -> Vec<(ElementKind, &str)> {
        let tree = parse(text);
        let tokens = tree
            .elements()
            .skip(1)
            .map(|element| (element.kind(), element.text(text).unwrap_or("")))
            .collect();
        tokens
    }

    #[test]
    fn lexes_basic_tokens() {
        assert_eq!(
            kinds("let x1 = 42;"),
            vec![
                (ElementKind::Ident, "let"),
                (ElementKind::Whitespace, " "),
                (ElementKind::Ident, "x1"),
                (ElementKind::Whitespace, " "),
                (ElementKind::Punct, "="),
                (ElementKind::Whitespace, " "),
                (ElementKind::Number, "42"),
                (ElementKind::Punct, ";"),
            ]
        );
    }

    #[test]
    fn nests_groups() {
        let text = "f(a[1]) { }";
        let tree = parse(text);
        let group = tree
            .find_element(range(1, 7), ElementKind::ParenGroup)
            .unwrap();
        assert_eq!(group.text(text), Some("(a[1])"));
        let inner: Vec<_> = group.children().map(|c| c.kind()).collect();
        assert_eq!(
            inner,
            vec![
                ElementKind::Punct,
                ElementKind::Ident,
                ElementKind::BracketGroup,
                ElementKind::Punct,
            ]
        );
        assert!(tree
            .find_element(range(8, 11), ElementKind::BraceGroup)
            .is_some());
    }

    #[test]
    fn unbalanced_input_is_tolerated() {
        let text = "a) (b";
        let tree = parse(text);
        assert_eq!(tree.root().range(), range(0, 5));
        let group = tree
            .find_element(range(3, 5), ElementKind::ParenGroup)
            .unwrap();
        assert_eq!(group.text(text), Some("(b"));
    }

    #[test]
    fn strings_and_unicode() {
        assert_eq!(
            kinds("\"a\\\"b\" é"),
            vec![
                (ElementKind::Str, "\"a\\\"b\""),
                (ElementKind::Whitespace, " "),
                (ElementKind::Ident, "é"),
            ]
        );
        assert_eq!(
            kinds("\"open\nx"),
            vec![
                (ElementKind::Str, "\"open"),
                (ElementKind::Whitespace, "\n"),
                (ElementKind::Ident, "x"),
            ]
        );
    }
}
