//! Incremental segmentation of backend stdout.
//!
//! The backend's stdout is one long text stream, delivered in chunks that do
//! not line up with messages. Messages start at a delimiter:
//!
//! - `Ultra:` / `User:` open a chat segment that runs until the next delimiter
//! - a bracketed tag `[...]` (closed on the same line)
//! - one of the named status phrases, at the start of a line
//!
//! A status phrase in the middle of a line stays part of the surrounding text.
//!
//! A delimiter is only committed once no further input could change it, so
//! the events produced for a stream never depend on how it was chunked.

use std::collections::VecDeque;

use ultra_protocol::{ClassifiedEvent, Speaker};

use crate::rules::{classify, NAMED_STATUSES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    /// Chat prefix; its message extends to the next delimiter
    Chat,
    /// Tag or status phrase; classified on its own text
    Marker,
}

enum Scan {
    Found { delimiter: Delimiter, len: usize },
    NoMatch,
    /// The text at the cursor could still become a delimiter.
    NeedMore,
}

fn literal_delimiters(line_start: bool) -> impl Iterator<Item = (&'static str, Delimiter)> {
    [Speaker::Ultra, Speaker::User]
        .into_iter()
        .map(|speaker| (speaker.prefix(), Delimiter::Chat))
        .chain(
            NAMED_STATUSES
                .iter()
                .filter(move |status| line_start && !status.phrase.starts_with('['))
                .map(|status| (status.phrase, Delimiter::Marker)),
        )
}

fn is_delimiter_start(c: char) -> bool {
    c == '[' || literal_delimiters(true).any(|(literal, _)| literal.starts_with(c))
}

fn is_line_break(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

fn scan_at(rest: &str, line_start: bool, eof: bool) -> Scan {
    if rest.is_empty() {
        return Scan::NeedMore;
    }

    let mut need_more = false;
    for (literal, delimiter) in literal_delimiters(line_start) {
        if rest.starts_with(literal) {
            return Scan::Found {
                delimiter,
                len: literal.len(),
            };
        }
        if !eof && literal.starts_with(rest) {
            need_more = true;
        }
    }

    if let Some(inner) = rest.strip_prefix('[') {
        match inner.find(&[']', '\n', '\r'][..]) {
            Some(i) if inner.as_bytes()[i] == b']' => {
                return Scan::Found {
                    delimiter: Delimiter::Marker,
                    len: i + 2,
                };
            }
            Some(_) => {}
            None => need_more |= !eof,
        }
    }

    if need_more {
        Scan::NeedMore
    } else {
        Scan::NoMatch
    }
}

/// Streaming classifier for backend stdout.
///
/// Keeps only the unresolved tail of the stream; everything before the last
/// resolved message is discarded.
#[derive(Debug, Default)]
pub struct Classifier {
    buf: String,
    /// Next byte offset in `buf` to examine. Always on a char boundary.
    cursor: usize,
    /// Start of the chat segment still waiting for its end.
    open_chat: Option<usize>,
    /// The byte before `buf[0]` was not a line break.
    mid_line: bool,
    ready: VecDeque<ClassifiedEvent>,
}

impl Classifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return the events it resolves, lazily.
    pub fn feed(&mut self, chunk: &str) -> Events<'_> {
        self.buf.push_str(chunk);
        Events {
            classifier: self,
            eof: false,
        }
    }

    /// End of stream: resolve everything still buffered and reset.
    pub fn finish(&mut self) -> Vec<ClassifiedEvent> {
        let mut events: Vec<ClassifiedEvent> = Events {
            classifier: self,
            eof: true,
        }
        .collect();
        if let Some(start) = self.open_chat.take() {
            events.extend(classify(self.buf[start..].trim()));
        }
        self.buf.clear();
        self.cursor = 0;
        self.mid_line = false;
        events
    }

    /// Bytes held back waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    fn next_event(&mut self, eof: bool) -> Option<ClassifiedEvent> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }

            match self.buf[self.cursor..].find(is_delimiter_start) {
                Some(offset) => self.cursor += offset,
                None => {
                    self.cursor = self.buf.len();
                    self.compact();
                    return None;
                }
            }

            let line_start = self.at_line_start(self.cursor);
            match scan_at(&self.buf[self.cursor..], line_start, eof) {
                Scan::Found { delimiter, len } => self.commit(delimiter, len),
                // Delimiter starts are ASCII, so one byte is one char here.
                Scan::NoMatch => self.cursor += 1,
                Scan::NeedMore => {
                    self.compact();
                    return None;
                }
            }
        }
    }

    fn at_line_start(&self, at: usize) -> bool {
        match at {
            0 => !self.mid_line,
            _ => is_line_break(self.buf.as_bytes()[at - 1]),
        }
    }

    fn commit(&mut self, delimiter: Delimiter, len: usize) {
        let at = self.cursor;
        if let Some(start) = self.open_chat.take() {
            self.ready.extend(classify(self.buf[start..at].trim()));
        }
        match delimiter {
            Delimiter::Chat => self.open_chat = Some(at),
            Delimiter::Marker => self.ready.extend(classify(&self.buf[at..at + len])),
        }
        self.cursor = at + len;
    }

    fn compact(&mut self) {
        let keep_from = self.open_chat.unwrap_or(self.cursor);
        if keep_from == 0 {
            return;
        }
        self.mid_line = !is_line_break(self.buf.as_bytes()[keep_from - 1]);
        self.buf.drain(..keep_from);
        self.cursor -= keep_from;
        if let Some(start) = self.open_chat.as_mut() {
            *start -= keep_from;
        }
    }
}

/// Events resolved by the most recent `feed`, produced on demand.
pub struct Events<'a> {
    classifier: &'a mut Classifier,
    eof: bool,
}

impl Iterator for Events<'_> {
    type Item = ClassifiedEvent;

    fn next(&mut self) -> Option<ClassifiedEvent> {
        self.classifier.next_event(self.eof)
    }
}
