//! Thread-local parser pooling.
//!
//! A run validates many files of the same language; keep one parser per
//! language per thread instead of rebuilding it for every unit.

use crate::ts::{SourceParser, SupportLang, TreeSitterError};
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

thread_local! {
    static PARSERS: RefCell<HashMap<SupportLang, SourceParser>> = RefCell::new(HashMap::new());
}

/// Execute `f` with the pooled parser for `language`, creating it on first use.
pub fn with_parser<F, R>(language: SupportLang, f: F) -> Result<R, TreeSitterError>
where
    F: FnOnce(&mut SourceParser) -> R,
{
    PARSERS.with(|cell| {
        let mut parsers = cell.borrow_mut();
        let parser = match parsers.entry(language) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(SourceParser::new(language)?),
        };
        Ok(f(parser))
    })
}
