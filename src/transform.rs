//! Pure text transformations.
//!
//! Every strategy maps the current file content to either new content or a
//! "no match" signal. Nothing here touches the filesystem and nothing here
//! knows about markers: whether a unit already ran is decided upstream by
//! [`crate::guard`].
//!
//! Line-oriented strategies understand just enough Python layout (top-level
//! imports, indentation, `try:` guards) to place text sensibly. There is no
//! parsing beyond that.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Similarity a line must reach before it is offered as a drift hint.
const HINT_THRESHOLD: f64 = 0.6;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("invalid regex pattern {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Where [`TransformStrategy::BlockAppend`] puts its block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    /// After the last top-level import of the leading import section.
    #[default]
    AfterImports,
    /// At the very end of the file.
    EndOfFile,
    /// At the top of the file, below any shebang or encoding line.
    StartOfFile,
}

/// How a unit rewrites its target.
#[derive(Debug, Clone)]
pub enum TransformStrategy {
    /// Replace every occurrence of an exact substring.
    LiteralReplace { find: String, replace: String },
    /// Multi-line regex substitution; `replacement` may use `$1` / `${name}`.
    RegexReplace { pattern: Regex, replacement: String },
    /// Insert a self-contained block.
    BlockAppend { content: String, placement: Placement },
    /// Replace the first unguarded `anchor_line` with a re-indented template.
    /// `{anchor}` in the template expands to the original statement.
    ConditionalWrap {
        anchor_line: String,
        wrapper_template: String,
    },
}

impl TransformStrategy {
    /// Build a [`TransformStrategy::RegexReplace`], compiling `pattern` in
    /// multi-line CRLF-aware mode so `^`/`$` anchor at line boundaries of
    /// both LF and CRLF files.
    pub fn regex(pattern: &str, replacement: impl Into<String>) -> Result<Self, TransformError> {
        let compiled = RegexBuilder::new(pattern)
            .multi_line(true)
            .crlf(true)
            .build()
            .map_err(|source| TransformError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;
        Ok(TransformStrategy::RegexReplace {
            pattern: compiled,
            replacement: replacement.into(),
        })
    }

    /// Short name used in logs and listings.
    pub fn kind(&self) -> &'static str {
        match self {
            TransformStrategy::LiteralReplace { .. } => "literal-replace",
            TransformStrategy::RegexReplace { .. } => "regex-replace",
            TransformStrategy::BlockAppend { .. } => "block-append",
            TransformStrategy::ConditionalWrap { .. } => "conditional-wrap",
        }
    }

    /// The text this strategy writes into the file. A unit's marker has to
    /// appear here, otherwise the next run could not detect the patch.
    pub fn inserted_text(&self) -> &str {
        match self {
            TransformStrategy::LiteralReplace { replace, .. } => replace,
            TransformStrategy::RegexReplace { replacement, .. } => replacement,
            TransformStrategy::BlockAppend { content, .. } => content,
            TransformStrategy::ConditionalWrap {
                wrapper_template, ..
            } => wrapper_template,
        }
    }
}

impl fmt::Display for TransformStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformStrategy::LiteralReplace { find, .. } => {
                write!(f, "literal-replace of {:?}", first_line(find))
            }
            TransformStrategy::RegexReplace { pattern, .. } => {
                write!(f, "regex-replace of /{}/", pattern.as_str())
            }
            TransformStrategy::BlockAppend { placement, .. } => {
                write!(f, "block-append ({placement:?})")
            }
            TransformStrategy::ConditionalWrap { anchor_line, .. } => {
                write!(f, "conditional-wrap of {:?}", anchor_line.trim())
            }
        }
    }
}

/// Result of [`apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "TransformOutcome carries the new content"]
pub enum TransformOutcome {
    /// The strategy matched; `matches` counts the sites it found (for
    /// `ConditionalWrap` only the first one is rewritten).
    Changed { new_content: String, matches: usize },
    /// The expected source text is absent. `hint` may point at the line that
    /// most resembles what was expected.
    NoMatch { hint: Option<String> },
}

/// Apply `strategy` to `content`.
pub fn apply(content: &str, strategy: &TransformStrategy) -> TransformOutcome {
    match strategy {
        TransformStrategy::LiteralReplace { find, replace } => {
            literal_replace(content, find, replace)
        }
        TransformStrategy::RegexReplace {
            pattern,
            replacement,
        } => regex_replace(content, pattern, replacement),
        TransformStrategy::BlockAppend {
            content: block,
            placement,
        } => TransformOutcome::Changed {
            new_content: insert_block(content, block, *placement),
            matches: 1,
        },
        TransformStrategy::ConditionalWrap {
            anchor_line,
            wrapper_template,
        } => conditional_wrap(content, anchor_line, wrapper_template),
    }
}

fn literal_replace(content: &str, find: &str, replace: &str) -> TransformOutcome {
    if find.is_empty() {
        return TransformOutcome::NoMatch { hint: None };
    }
    let matches = content.matches(find).count();
    if matches == 0 {
        return TransformOutcome::NoMatch {
            hint: closest_line(content, find),
        };
    }
    TransformOutcome::Changed {
        new_content: content.replace(find, replace),
        matches,
    }
}

fn regex_replace(content: &str, pattern: &Regex, replacement: &str) -> TransformOutcome {
    let matches = pattern.find_iter(content).count();
    if matches == 0 {
        return TransformOutcome::NoMatch { hint: None };
    }
    TransformOutcome::Changed {
        new_content: pattern.replace_all(content, replacement).into_owned(),
        matches,
    }
}

/// `"\r\n"` if the content already uses CRLF, otherwise `"\n"`.
fn newline_of(content: &str) -> &'static str {
    if content.contains("\r\n") {
        "\r\n"
    } else {
        "\n"
    }
}

/// Re-terminate `text` with `nl`, guaranteeing a trailing newline.
fn normalize_block(text: &str, nl: &str) -> String {
    let mut out = text
        .trim_end_matches(['\r', '\n'])
        .lines()
        .collect::<Vec<_>>()
        .join(nl);
    out.push_str(nl);
    out
}

fn insert_block(content: &str, block: &str, placement: Placement) -> String {
    let nl = newline_of(content);
    let block = normalize_block(block, nl);

    let offset = match placement {
        Placement::EndOfFile => content.len(),
        Placement::StartOfFile => header_end(content),
        Placement::AfterImports => {
            import_section_end(content).unwrap_or_else(|| header_end(content))
        }
    };

    splice_block(content, offset, &block, nl)
}

/// Insert `block` at line boundary `offset`, keeping one blank line between
/// the block and any neighbouring code.
fn splice_block(content: &str, offset: usize, block: &str, nl: &str) -> String {
    let (head, tail) = content.split_at(offset);
    let mut out = String::with_capacity(content.len() + block.len() + 3 * nl.len());

    out.push_str(head);
    if !head.is_empty() {
        if !head.ends_with('\n') {
            out.push_str(nl);
        }
        out.push_str(nl);
    }
    out.push_str(block);
    if !tail.is_empty() {
        if !tail.starts_with(nl) {
            out.push_str(nl);
        }
        out.push_str(tail);
    }
    out
}

/// Iterate `(start_offset, line_including_terminator)`.
fn lines_with_offsets(content: &str) -> impl Iterator<Item = (usize, &str)> {
    content.split_inclusive('\n').scan(0, |offset, line| {
        let start = *offset;
        *offset += line.len();
        Some((start, line))
    })
}

/// Byte offset just past a leading shebang and/or encoding declaration.
fn header_end(content: &str) -> usize {
    let mut end = 0;
    for (idx, (start, line)) in lines_with_offsets(content).enumerate() {
        let trimmed = line.trim_start();
        let is_header = (idx == 0 && trimmed.starts_with("#!"))
            || (idx < 2 && trimmed.starts_with('#') && trimmed.contains("coding"));
        if !is_header {
            break;
        }
        end = start + line.len();
    }
    end
}

fn is_top_level_import(line: &str) -> bool {
    line.starts_with("import ") || (line.starts_with("from ") && line.contains(" import"))
}

fn opens_definition(line: &str) -> bool {
    line.starts_with("def ")
        || line.starts_with("async def ")
        || line.starts_with("class ")
        || line.starts_with('@')
}

/// Byte offset just past the last top-level import that appears before the
/// first top-level definition. Parenthesised and backslash-continued imports
/// are consumed whole.
fn import_section_end(content: &str) -> Option<usize> {
    let mut end = None;
    let mut open_parens: i64 = 0;
    let mut continued = false;

    for (start, line) in lines_with_offsets(content) {
        let line_end = start + line.len();
        let code = line.split('#').next().unwrap_or("");

        if open_parens > 0 || continued {
            open_parens += paren_delta(code);
            continued = code.trim_end().ends_with('\\');
            end = Some(line_end);
            continue;
        }

        if opens_definition(line) {
            break;
        }
        if is_top_level_import(line) {
            open_parens = paren_delta(code).max(0);
            continued = code.trim_end().ends_with('\\');
            end = Some(line_end);
        }
    }
    end
}

fn paren_delta(code: &str) -> i64 {
    code.chars().fold(0, |acc, c| match c {
        '(' => acc + 1,
        ')' => acc - 1,
        _ => acc,
    })
}

fn leading_indent(line: &str) -> &str {
    let trimmed = line.trim_start_matches([' ', '\t']);
    &line[..line.len() - trimmed.len()]
}

fn indent_width(line: &str) -> usize {
    leading_indent(line).chars().map(|c| if c == '\t' { 8 } else { 1 }).sum()
}

/// Whether `statement` (a trimmed line) is the anchor, allowing a trailing
/// comment such as `# noqa`.
fn is_anchor(statement: &str, anchor: &str) -> bool {
    match statement.strip_prefix(anchor) {
        Some("") => true,
        Some(rest) => rest.trim_start().starts_with('#'),
        None => false,
    }
}

fn conditional_wrap(content: &str, anchor_line: &str, template: &str) -> TransformOutcome {
    let anchor = anchor_line.trim();
    if anchor.is_empty() {
        return TransformOutcome::NoMatch { hint: None };
    }

    let lines: Vec<(usize, &str)> = lines_with_offsets(content).collect();
    let candidates: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(idx, (_, line))| {
            is_anchor(line.trim(), anchor) && !is_guarded(&lines, *idx)
        })
        .map(|(idx, _)| idx)
        .collect();

    let Some(&first) = candidates.first() else {
        return TransformOutcome::NoMatch {
            hint: closest_line(content, anchor),
        };
    };

    let (start, line) = lines[first];
    let nl = newline_of(content);
    let indent = leading_indent(line);
    let statement = line.trim();

    let body = line.trim_end_matches(['\r', '\n']);
    let terminator = &line[body.len()..];

    let wrapped = template
        .trim_end_matches(['\r', '\n'])
        .lines()
        .map(|t| {
            if t.trim().is_empty() {
                String::new()
            } else {
                format!("{indent}{}", t.replace("{anchor}", statement))
            }
        })
        .collect::<Vec<_>>()
        .join(nl);

    let mut new_content = String::with_capacity(content.len() + wrapped.len());
    new_content.push_str(&content[..start]);
    new_content.push_str(&wrapped);
    new_content.push_str(terminator);
    new_content.push_str(&content[start + line.len()..]);

    TransformOutcome::Changed {
        new_content,
        matches: candidates.len(),
    }
}

/// An anchor is guarded when the header of its enclosing block is a `try:`.
///
/// The header is the closest line above with a shallower indentation,
/// ignoring blank lines and comments.
fn is_guarded(lines: &[(usize, &str)], idx: usize) -> bool {
    let width = indent_width(lines[idx].1);
    if width == 0 {
        return false;
    }
    lines[..idx]
        .iter()
        .rev()
        .map(|(_, l)| *l)
        .filter(|l| {
            let trimmed = l.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .find(|l| indent_width(l) < width)
        .is_some_and(|header| header.trim() == "try:")
}

fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

/// Describe the line of `content` most similar to the first line of `expected`.
fn closest_line(content: &str, expected: &str) -> Option<String> {
    let needle = first_line(expected);
    if needle.is_empty() {
        return None;
    }

    content
        .lines()
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(idx, l)| (idx, l.trim(), strsim::normalized_levenshtein(needle, l.trim())))
        .filter(|(_, _, score)| *score >= HINT_THRESHOLD)
        .max_by(|a, b| a.2.total_cmp(&b.2))
        .map(|(idx, line, score)| {
            format!(
                "closest line {} ({:.0}% similar): {}",
                idx + 1,
                score * 100.0,
                line
            )
        })
}
