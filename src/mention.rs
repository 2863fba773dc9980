//! Lexical `@name` extraction.
//!
//! A mention is `@` followed by one or more word characters, where the `@`
//! is not preceded by a word character and the whole word run is not
//! immediately followed by a `.`. The trailing-dot rule keeps the domain of
//! `user@example.com` (and `@example.com` on its own) from being read as a
//! mention of `example`.

use std::collections::HashSet;

use crate::types::AgentName;

/// One `@name` token found in a piece of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    pub name: AgentName,
    /// Byte offset of the `@`.
    pub offset: usize,
    /// Byte length of the token including the `@`.
    pub len: usize,
}

impl Mention {
    fn end(&self) -> usize {
        self.offset + self.len
    }
}

fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// Extracts every mention in left-to-right order. Duplicates are kept.
pub fn extract(text: &str) -> Vec<Mention> {
    let mut mentions = Vec::new();
    let mut prev: Option<char> = None;
    let mut iter = text.char_indices().peekable();

    while let Some((offset, ch)) = iter.next() {
        if ch != '@' || prev.is_some_and(is_word_char) {
            prev = Some(ch);
            continue;
        }

        let start = offset + ch.len_utf8();
        let mut end = start;
        let mut last = ch;
        while let Some(&(idx, next)) = iter.peek() {
            if !is_word_char(next) {
                break;
            }
            end = idx + next.len_utf8();
            last = next;
            iter.next();
        }
        prev = Some(last);

        if end == start {
            continue;
        }
        if text[end..].starts_with('.') {
            continue;
        }

        mentions.push(Mention {
            name: AgentName::new(&text[start..end]),
            offset,
            len: end - offset,
        });
    }

    mentions
}

/// Names from `mentions` in first-occurrence order, without duplicates.
pub fn unique_names(mentions: &[Mention]) -> Vec<AgentName> {
    let mut seen = HashSet::new();
    mentions
        .iter()
        .filter(|m| seen.insert(m.name.clone()))
        .map(|m| m.name.clone())
        .collect()
}

/// Removes the given spans (each with the whitespace that follows it) and
/// trims the result.
fn remove_spans<'a>(text: &str, spans: impl Iterator<Item = &'a Mention>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for mention in spans {
        if mention.offset < cursor {
            continue;
        }
        out.push_str(&text[cursor..mention.offset]);
        let rest = &text[mention.end()..];
        cursor = mention.end() + (rest.len() - rest.trim_start().len());
    }
    out.push_str(&text[cursor..]);
    out.trim().to_string()
}

/// Removes every mention of one of `names` from `text`.
pub fn strip_mentions(text: &str, names: &[AgentName]) -> String {
    let mentions = extract(text);
    remove_spans(text, mentions.iter().filter(|m| names.contains(&m.name)))
}

/// Removes only the first mention of `name`, leaving any later mentions in
/// place.
pub fn strip_first(text: &str, name: &AgentName) -> String {
    let mentions = extract(text);
    remove_spans(text, mentions.iter().find(|m| &m.name == name).into_iter())
}

/// Splits a multi-line message between `targets`.
///
/// A line that mentions one or more targets goes to each of them with those
/// mentions removed. A line that mentions no target goes to every target.
/// Blank lines are dropped. A target whose share comes out empty receives
/// the whole message with all target mentions removed.
pub fn split_by_target(text: &str, targets: &[AgentName]) -> Vec<(AgentName, String)> {
    let mut shares: Vec<Vec<String>> = vec![Vec::new(); targets.len()];

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let line_mentions = extract(line);
        let addressed: Vec<usize> = targets
            .iter()
            .enumerate()
            .filter(|(_, t)| line_mentions.iter().any(|m| &m.name == *t))
            .map(|(i, _)| i)
            .collect();

        if addressed.is_empty() {
            for share in &mut shares {
                share.push(line.to_string());
            }
            continue;
        }

        let cleaned = strip_mentions(line, targets);
        for i in addressed {
            if !cleaned.is_empty() {
                shares[i].push(cleaned.clone());
            }
        }
    }

    targets
        .iter()
        .zip(shares)
        .map(|(target, lines)| {
            let content = if lines.is_empty() {
                strip_mentions(text, targets)
            } else {
                lines.join("\n")
            };
            (target.clone(), content)
        })
        .collect()
}
