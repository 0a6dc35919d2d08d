//! Tree-sitter integration for post-patch syntax checks.
//!
//! Grammars come from ast-grep's bundled language table, so any language it
//! ships (Python for site-packages, but also Rust, JavaScript, ...) can be
//! validated without extra grammar crates.

pub mod errors;
pub mod lang;
pub mod parser;

pub use errors::TreeSitterError;
pub use lang::{language_for_path, SupportLang};
pub use parser::{ErrorNode, ParsedSource, SourceParser};
