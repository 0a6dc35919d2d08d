//! Verification of transformed content before it is committed.
//!
//! Two layers:
//! - **Textual** (always): the content must actually differ from the
//!   original and must carry the unit's marker, otherwise the next run could
//!   not recognise the patch and idempotence would be lost.
//! - **Syntax** (per file type): the new content is parsed with the target
//!   language's tree-sitter grammar. Only errors that were not already
//!   present in the original count, since upstream files may use syntax the
//!   grammar does not know.

use crate::pool;
use crate::ts::{language_for_path, ErrorNode, SupportLang, TreeSitterError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

/// How a syntax problem in the patched content is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyntaxCheck {
    /// Do not commit content that fails to parse.
    #[default]
    Enforce,
    /// Log the problem and commit anyway.
    Advisory,
    /// Skip parsing entirely.
    Off,
}

/// Result of [`Verifier::check`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "VerifyOutcome decides whether the content may be committed"]
pub enum VerifyOutcome {
    Ok,
    /// The transform produced byte-identical content.
    Unchanged,
    /// The new content does not contain the unit's marker.
    MarkerMissing,
    /// The new content introduced a parse error.
    SyntaxInvalid {
        line: usize,
        column: usize,
        message: String,
    },
}

impl VerifyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerifyOutcome::Ok)
    }
}

/// Checks transformed content against the original.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verifier {
    syntax: SyntaxCheck,
}

impl Verifier {
    pub fn new(syntax: SyntaxCheck) -> Self {
        Self { syntax }
    }

    pub fn syntax_check(&self) -> SyntaxCheck {
        self.syntax
    }

    /// Verify `new_content` as a replacement for `original` at `path`.
    pub fn check(
        &self,
        path: &Path,
        original: &str,
        new_content: &str,
        marker: &str,
    ) -> VerifyOutcome {
        if new_content == original {
            return VerifyOutcome::Unchanged;
        }
        if !crate::guard::is_applied(new_content, marker) {
            return VerifyOutcome::MarkerMissing;
        }
        if self.syntax == SyntaxCheck::Off {
            return VerifyOutcome::Ok;
        }

        let Some(language) = language_for_path(path) else {
            debug!(path = %path.display(), "no grammar for file type, skipping syntax check");
            return VerifyOutcome::Ok;
        };

        match introduced_error(language, original, new_content) {
            Ok(None) => VerifyOutcome::Ok,
            Ok(Some(error)) => VerifyOutcome::SyntaxInvalid {
                line: error.line,
                column: error.column,
                message: describe(&error),
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "syntax check unavailable");
                VerifyOutcome::Ok
            }
        }
    }

    /// Whether `outcome` must stop the commit under this verifier's policy.
    pub fn blocks_commit(&self, outcome: &VerifyOutcome) -> bool {
        match outcome {
            VerifyOutcome::Ok => false,
            VerifyOutcome::Unchanged | VerifyOutcome::MarkerMissing => true,
            VerifyOutcome::SyntaxInvalid { .. } => self.syntax == SyntaxCheck::Enforce,
        }
    }
}

fn describe(error: &ErrorNode) -> String {
    if error.missing {
        "missing token".to_string()
    } else if error.context.is_empty() {
        "unexpected end of input".to_string()
    } else {
        format!("unexpected `{}`", error.context)
    }
}

/// The first parse error in `edited` that `original` did not already have.
///
/// Errors are matched by their offending text rather than by offset, since
/// the edit shifts everything below it.
pub fn introduced_error(
    language: SupportLang,
    original: &str,
    edited: &str,
) -> Result<Option<ErrorNode>, TreeSitterError> {
    let edited_errors = syntax_errors(language, edited)?;
    if edited_errors.is_empty() {
        return Ok(None);
    }

    let mut original_errors = syntax_errors(language, original)?;
    let introduced = edited_errors.into_iter().find(|e| {
        match original_errors
            .iter()
            .position(|o| o.context == e.context && o.missing == e.missing)
        {
            Some(idx) => {
                original_errors.swap_remove(idx);
                false
            }
            None => true,
        }
    });
    Ok(introduced)
}

/// Every ERROR and MISSING node of `source`, in document order.
fn syntax_errors(
    language: SupportLang,
    source: &str,
) -> Result<Vec<ErrorNode>, TreeSitterError> {
    pool::with_parser(language, |parser| {
        parser
            .parse_with_source(source)
            .map(|parsed| parsed.error_nodes())
    })?
}
