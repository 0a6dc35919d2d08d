//! Language detection for syntax validation.

use std::path::Path;

pub use ast_grep_language::SupportLang;

/// Pick the grammar for a target file from its extension.
///
/// Returns `None` for files we have no parser for; such files are only
/// checked textually.
pub fn language_for_path(path: &Path) -> Option<SupportLang> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "py" | "pyi" => Some(SupportLang::Python),
        "rs" => Some(SupportLang::Rust),
        "js" | "mjs" | "cjs" => Some(SupportLang::JavaScript),
        "ts" => Some(SupportLang::TypeScript),
        "json" => Some(SupportLang::Json),
        "yaml" | "yml" => Some(SupportLang::Yaml),
        "sh" | "bash" => Some(SupportLang::Bash),
        _ => None,
    }
}
