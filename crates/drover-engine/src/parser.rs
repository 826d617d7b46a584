//! Agent output parser: raw streamed text in, semantic events out.
//!
//! Parsing is pure: no logging, no state mutation. The supervisor feeds
//! whatever chunks the pipe produces; a token split across two reads is
//! held in the buffer until it either completes or turns out not to be a
//! token at all. Consumers (the engine) decide what events mean.

/// A semantic event extracted from the agent's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedEvent {
    /// `<criterion-complete>N</criterion-complete>`. N is 1-indexed
    /// against the criteria list at loop creation time.
    CriterionComplete(usize),
    /// `<criterion-incomplete>N</criterion-incomplete>`
    CriterionIncomplete(usize),
    /// `<promise>TASK COMPLETE</promise>`, the agent's authoritative
    /// completion declaration.
    TaskComplete,
    /// Plain output with recognized tokens stripped.
    Text(String),
}

const CRITERION_COMPLETE_OPEN: &str = "<criterion-complete>";
const CRITERION_COMPLETE_CLOSE: &str = "</criterion-complete>";
const CRITERION_INCOMPLETE_OPEN: &str = "<criterion-incomplete>";
const CRITERION_INCOMPLETE_CLOSE: &str = "</criterion-incomplete>";
const PROMISE_TOKEN: &str = "<promise>TASK COMPLETE</promise>";

enum TokenMatch {
    /// A full token starting at the scan position, with its byte length.
    Complete(ParsedEvent, usize),
    /// The remaining input is a proper prefix of some token; wait for more.
    Partial,
    /// Not a token.
    None,
}

enum LiteralMatch {
    Complete,
    Partial,
    None,
}

fn match_literal(s: &str, lit: &str) -> LiteralMatch {
    if s.len() >= lit.len() {
        if s.starts_with(lit) {
            LiteralMatch::Complete
        } else {
            LiteralMatch::None
        }
    } else if lit.starts_with(s) {
        LiteralMatch::Partial
    } else {
        LiteralMatch::None
    }
}

/// Try to match `<open>DIGITS<close>` at the start of `s`.
fn match_criterion(
    s: &str,
    open: &str,
    close: &str,
    event: fn(usize) -> ParsedEvent,
) -> TokenMatch {
    match match_literal(s, open) {
        LiteralMatch::None => return TokenMatch::None,
        LiteralMatch::Partial => return TokenMatch::Partial,
        LiteralMatch::Complete => {}
    }

    let rest = &s[open.len()..];
    let digits = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits == rest.len() {
        // Still collecting digits (or the close tag hasn't arrived).
        return TokenMatch::Partial;
    }
    if digits == 0 {
        return TokenMatch::None;
    }

    let after_digits = &rest[digits..];
    match match_literal(after_digits, close) {
        LiteralMatch::Complete => match rest[..digits].parse::<usize>() {
            Ok(n) => TokenMatch::Complete(event(n), open.len() + digits + close.len()),
            Err(_) => TokenMatch::None,
        },
        LiteralMatch::Partial => TokenMatch::Partial,
        LiteralMatch::None => TokenMatch::None,
    }
}

/// Try every known token at the start of `s` (which begins with `<`).
fn match_token(s: &str) -> TokenMatch {
    let candidates = [
        match_criterion(
            s,
            CRITERION_COMPLETE_OPEN,
            CRITERION_COMPLETE_CLOSE,
            ParsedEvent::CriterionComplete,
        ),
        match_criterion(
            s,
            CRITERION_INCOMPLETE_OPEN,
            CRITERION_INCOMPLETE_CLOSE,
            ParsedEvent::CriterionIncomplete,
        ),
        match match_literal(s, PROMISE_TOKEN) {
            LiteralMatch::Complete => {
                TokenMatch::Complete(ParsedEvent::TaskComplete, PROMISE_TOKEN.len())
            }
            LiteralMatch::Partial => TokenMatch::Partial,
            LiteralMatch::None => TokenMatch::None,
        },
    ];

    let mut saw_partial = false;
    for candidate in candidates {
        match candidate {
            TokenMatch::Complete(..) => return candidate,
            TokenMatch::Partial => saw_partial = true,
            TokenMatch::None => {}
        }
    }
    if saw_partial {
        TokenMatch::Partial
    } else {
        TokenMatch::None
    }
}

/// Incremental scanner over an agent's output stream.
#[derive(Debug, Default)]
pub struct OutputParser {
    buf: String,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return the events it completes, in stream order.
    pub fn feed(&mut self, chunk: &str) -> Vec<ParsedEvent> {
        self.buf.push_str(chunk);
        self.drain(false)
    }

    /// Flush at end of stream. Anything held back as a possible token
    /// prefix is emitted as plain text.
    pub fn finish(&mut self) -> Vec<ParsedEvent> {
        self.drain(true)
    }

    fn drain(&mut self, eof: bool) -> Vec<ParsedEvent> {
        let mut events = Vec::new();
        let mut text = String::new();
        let mut held_from: Option<usize> = None;
        let mut i = 0;

        while i < self.buf.len() {
            let Some(off) = self.buf[i..].find('<') else {
                text.push_str(&self.buf[i..]);
                i = self.buf.len();
                break;
            };
            let start = i + off;
            text.push_str(&self.buf[i..start]);

            match match_token(&self.buf[start..]) {
                TokenMatch::Complete(event, len) => {
                    if !text.is_empty() {
                        events.push(ParsedEvent::Text(std::mem::take(&mut text)));
                    }
                    events.push(event);
                    i = start + len;
                }
                TokenMatch::Partial => {
                    if eof {
                        text.push_str(&self.buf[start..]);
                        i = self.buf.len();
                    } else {
                        held_from = Some(start);
                    }
                    break;
                }
                TokenMatch::None => {
                    // A '<' that opens nothing we know: plain text.
                    text.push('<');
                    i = start + 1;
                }
            }
        }

        if !text.is_empty() {
            events.push(ParsedEvent::Text(text));
        }
        match held_from {
            Some(start) => {
                self.buf.drain(..start);
            }
            None => self.buf.clear(),
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(chunks: &[&str]) -> Vec<ParsedEvent> {
        let mut parser = OutputParser::new();
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(parser.feed(chunk));
        }
        events.extend(parser.finish());
        events
    }

    #[test]
    fn plain_text_passes_through() {
        let events = feed_all(&["hello world"]);
        assert_eq!(events, vec![ParsedEvent::Text("hello world".into())]);
    }

    #[test]
    fn recognizes_all_tokens_in_order() {
        let events = feed_all(&[
            "start <criterion-complete>1</criterion-complete> mid \
             <criterion-incomplete>2</criterion-incomplete> then \
             <promise>TASK COMPLETE</promise> end",
        ]);
        assert_eq!(
            events,
            vec![
                ParsedEvent::Text("start ".into()),
                ParsedEvent::CriterionComplete(1),
                ParsedEvent::Text(" mid ".into()),
                ParsedEvent::CriterionIncomplete(2),
                ParsedEvent::Text(" then ".into()),
                ParsedEvent::TaskComplete,
                ParsedEvent::Text(" end".into()),
            ]
        );
    }

    #[test]
    fn token_split_across_chunks_is_recognized() {
        let events = feed_all(&["before <criterion-com", "plete>4</criterion-co", "mplete> after"]);
        assert_eq!(
            events,
            vec![
                ParsedEvent::Text("before ".into()),
                ParsedEvent::CriterionComplete(4),
                ParsedEvent::Text(" after".into()),
            ]
        );
    }

    #[test]
    fn promise_split_at_every_boundary() {
        let token = "<promise>TASK COMPLETE</promise>";
        for split in 1..token.len() {
            let (a, b) = token.split_at(split);
            let events = feed_all(&[a, b]);
            assert_eq!(events, vec![ParsedEvent::TaskComplete], "split at {split}");
        }
    }

    #[test]
    fn digits_split_across_chunks() {
        let events = feed_all(&["<criterion-complete>1", "2</criterion-complete>"]);
        assert_eq!(events, vec![ParsedEvent::CriterionComplete(12)]);
    }

    #[test]
    fn unknown_tags_are_text() {
        let events = feed_all(&["<something>else</something>"]);
        assert_eq!(
            events,
            vec![ParsedEvent::Text("<something>else</something>".into())]
        );
    }

    #[test]
    fn near_miss_token_is_text() {
        // Opens like a criterion token but has no digits.
        let events = feed_all(&["<criterion-complete></criterion-complete>"]);
        assert_eq!(
            events,
            vec![ParsedEvent::Text(
                "<criterion-complete></criterion-complete>".into()
            )]
        );
    }

    #[test]
    fn wrong_promise_body_is_text() {
        let events = feed_all(&["<promise>TASK DONE</promise>"]);
        assert_eq!(
            events,
            vec![ParsedEvent::Text("<promise>TASK DONE</promise>".into())]
        );
    }

    #[test]
    fn finish_flushes_dangling_prefix_as_text() {
        let mut parser = OutputParser::new();
        assert!(parser.feed("tail <criterion-com").len() == 1); // "tail " only
        let events = parser.finish();
        assert_eq!(events, vec![ParsedEvent::Text("<criterion-com".into())]);
    }

    #[test]
    fn lone_angle_bracket_is_text() {
        let events = feed_all(&["a < b and a > b"]);
        assert_eq!(events, vec![ParsedEvent::Text("a < b and a > b".into())]);
    }

    #[test]
    fn adjacent_tokens_without_text() {
        let events = feed_all(&[
            "<criterion-complete>1</criterion-complete><criterion-complete>2</criterion-complete>",
        ]);
        assert_eq!(
            events,
            vec![
                ParsedEvent::CriterionComplete(1),
                ParsedEvent::CriterionComplete(2),
            ]
        );
    }

    #[test]
    fn held_prefix_resolving_to_text_is_not_lost() {
        // "<criterion-x" first looks like a possible token prefix, then
        // the next chunk disproves it.
        let events = feed_all(&["<criterion-", "x>1"]);
        assert_eq!(events, vec![ParsedEvent::Text("<criterion-x>1".into())]);
    }
}
