//! Declarative patch files.
//!
//! Each `*.toml` file lists patch units plus the installation roots they
//! search. Loading validates the whole file and reports every problem at once.

pub mod loader;
pub mod schema;
pub mod toggle;

pub use loader::{
    discover_patch_files, load_all, load_each, load_from_path, load_from_str, ConfigError,
    LoadedPatches,
};
pub use schema::{
    Metadata, PatchConfig, PatchDefinition, Strategy, Toggle, ValidationError, ValidationIssue,
};
pub use toggle::{toggle_enabled, CategoryFilter};

use crate::orchestrator::PatchUnit;
use crate::transform::TransformError;

/// Build the units of `configs` in file order, then declaration order.
///
/// Toggles from every file are evaluated against the process environment and
/// combined with `filter`, which carries categories skipped on the command
/// line.
pub fn build_units<'a, I>(
    configs: I,
    filter: &CategoryFilter,
) -> Result<Vec<PatchUnit>, TransformError>
where
    I: IntoIterator<Item = &'a PatchConfig>,
{
    build_units_with(configs, filter, |name| std::env::var(name).ok())
}

/// [`build_units`] with a custom environment lookup.
pub fn build_units_with<'a, I, L>(
    configs: I,
    filter: &CategoryFilter,
    lookup: L,
) -> Result<Vec<PatchUnit>, TransformError>
where
    I: IntoIterator<Item = &'a PatchConfig>,
    L: Fn(&str) -> Option<String>,
{
    let configs: Vec<&PatchConfig> = configs.into_iter().collect();
    let mut filter = filter.clone();
    for config in &configs {
        for category in CategoryFilter::from_lookup(config.toggles(), &lookup).disabled() {
            filter.disable(category);
        }
    }

    let mut units = Vec::new();
    for config in configs {
        units.extend(config.units(|category| filter.allows(category))?);
    }
    Ok(units)
}
