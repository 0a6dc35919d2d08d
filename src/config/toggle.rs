//! Category switches.
//!
//! A category is on unless its environment variable is set to something
//! other than `true` (case-insensitive). Units of a disabled category are
//! never registered, which is the same as the patch file not listing them.

use crate::config::schema::Toggle;
use std::collections::BTreeSet;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryFilter {
    disabled: BTreeSet<String>,
}

impl CategoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate `toggles` against the process environment.
    pub fn from_env(toggles: &[Toggle]) -> Self {
        Self::from_lookup(toggles, |name| std::env::var(name).ok())
    }

    /// Evaluate `toggles` with a custom variable lookup.
    pub fn from_lookup<L>(toggles: &[Toggle], lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut filter = Self::new();
        for toggle in toggles {
            let value = lookup(&toggle.env);
            if !toggle_enabled(value.as_deref()) {
                info!(
                    env = %toggle.env,
                    category = %toggle.category,
                    "category disabled by environment"
                );
                filter.disable(toggle.category.clone());
            }
        }
        filter
    }

    pub fn disable(&mut self, category: impl Into<String>) {
        self.disabled.insert(category.into());
    }

    /// Whether units of `category` run. Uncategorised units always do.
    pub fn allows(&self, category: Option<&str>) -> bool {
        category.map_or(true, |c| !self.disabled.contains(c))
    }

    pub fn disabled(&self) -> impl Iterator<Item = &str> {
        self.disabled.iter().map(String::as_str)
    }
}

/// Unset means enabled. Set means enabled only for `true`.
pub fn toggle_enabled(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().eq_ignore_ascii_case("true"))
}
