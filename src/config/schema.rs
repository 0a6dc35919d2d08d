use crate::resolve::{check_relative_path, expand_home, TargetDescriptor};
use crate::orchestrator::PatchUnit;
use crate::transform::{Placement, TransformError, TransformStrategy};
use crate::validate::SyntaxCheck;
use regex::RegexBuilder;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Default, Clone)]
pub struct PatchConfig {
    #[serde(default)]
    pub meta: Metadata,
    #[serde(default)]
    pub patches: Vec<PatchDefinition>,
}

impl PatchConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut issues = Vec::new();

        if self.patches.is_empty() {
            issues.push(ValidationIssue::EmptyPatchList);
        }

        for toggle in &self.meta.toggles {
            if toggle.env.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    patch_id: None,
                    field: "meta.toggles.env",
                });
            }
            if toggle.category.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    patch_id: None,
                    field: "meta.toggles.category",
                });
            }
        }

        let mut ids: HashMap<&str, usize> = HashMap::new();
        let mut markers: HashMap<&str, &str> = HashMap::new();

        for patch in &self.patches {
            let id = Some(patch.id.clone());

            if patch.id.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    patch_id: None,
                    field: "id",
                });
            } else {
                let seen = ids.entry(patch.id.as_str()).or_insert(0);
                *seen += 1;
                if *seen == 2 {
                    issues.push(ValidationIssue::DuplicateId {
                        patch_id: patch.id.clone(),
                    });
                }
            }

            if patch.file.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    patch_id: id.clone(),
                    field: "file",
                });
            } else if let Err(err) = check_relative_path(Path::new(&patch.file)) {
                issues.push(ValidationIssue::InvalidCombo {
                    patch_id: id.clone(),
                    message: err.to_string(),
                });
            }

            if patch.marker.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    patch_id: id.clone(),
                    field: "marker",
                });
            } else {
                if let Some(first) = markers.insert(patch.marker.as_str(), patch.id.as_str()) {
                    issues.push(ValidationIssue::DuplicateMarker {
                        marker: patch.marker.clone(),
                        first: first.to_string(),
                        second: patch.id.clone(),
                    });
                }
                if !patch.strategy.inserted_text().contains(&patch.marker) {
                    issues.push(ValidationIssue::InvalidCombo {
                        patch_id: id.clone(),
                        message: format!(
                            "marker '{}' does not appear in the text the strategy inserts",
                            patch.marker
                        ),
                    });
                }
                if patch.strategy.searched_text().contains(&patch.marker) {
                    issues.push(ValidationIssue::InvalidCombo {
                        patch_id: id.clone(),
                        message: format!(
                            "marker '{}' appears in the text the strategy searches for",
                            patch.marker
                        ),
                    });
                }
            }

            if patch.roots.as_ref().unwrap_or(&self.meta.roots).is_empty() {
                issues.push(ValidationIssue::MissingField {
                    patch_id: id.clone(),
                    field: "roots",
                });
            }

            patch.strategy.collect_issues(&patch.id, &mut issues);
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { issues })
        }
    }

    /// Categories whose environment toggle is present in this file.
    pub fn toggles(&self) -> &[Toggle] {
        &self.meta.toggles
    }

    /// Build the runtime units of every patch whose category `enabled`
    /// accepts, in declaration order.
    pub fn units<P>(&self, enabled: P) -> Result<Vec<PatchUnit>, TransformError>
    where
        P: Fn(Option<&str>) -> bool,
    {
        self.patches
            .iter()
            .filter(|patch| enabled(patch.category.as_deref()))
            .map(|patch| patch.to_unit(&self.meta.roots))
            .collect()
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Candidate installation roots shared by every patch in the file.
    #[serde(default)]
    pub roots: Vec<String>,
    #[serde(default)]
    pub toggles: Vec<Toggle>,
}

/// An environment variable that switches a whole category of patches.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Toggle {
    pub env: String,
    pub category: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PatchDefinition {
    pub id: String,
    /// Package-relative path of the target file.
    pub file: String,
    pub marker: String,
    pub strategy: Strategy,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Overrides `meta.roots` for this patch.
    #[serde(default)]
    pub roots: Option<Vec<String>>,
    #[serde(default)]
    pub backup: bool,
    #[serde(default)]
    pub syntax_check: SyntaxCheck,
}

fn default_required() -> bool {
    true
}

impl PatchDefinition {
    pub fn to_unit(&self, default_roots: &[String]) -> Result<PatchUnit, TransformError> {
        let roots: Vec<PathBuf> = self
            .roots
            .as_deref()
            .unwrap_or(default_roots)
            .iter()
            .map(|root| expand_home(root))
            .collect();

        let mut unit = PatchUnit::new(
            self.id.clone(),
            TargetDescriptor::new(&self.file, roots),
            self.strategy.to_transform()?,
            self.marker.clone(),
        )
        .with_required(self.required)
        .with_backup(self.backup)
        .with_syntax_check(self.syntax_check);
        if let Some(category) = &self.category {
            unit = unit.with_category(category.clone());
        }
        Ok(unit)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Strategy {
    LiteralReplace {
        find: String,
        replace: String,
    },
    RegexReplace {
        pattern: String,
        replacement: String,
    },
    BlockAppend {
        content: String,
        #[serde(default)]
        placement: Placement,
    },
    ConditionalWrap {
        anchor: String,
        template: String,
    },
}

impl Strategy {
    pub fn to_transform(&self) -> Result<TransformStrategy, TransformError> {
        Ok(match self {
            Strategy::LiteralReplace { find, replace } => TransformStrategy::LiteralReplace {
                find: find.clone(),
                replace: replace.clone(),
            },
            Strategy::RegexReplace {
                pattern,
                replacement,
            } => TransformStrategy::regex(pattern, replacement.clone())?,
            Strategy::BlockAppend { content, placement } => TransformStrategy::BlockAppend {
                content: content.clone(),
                placement: *placement,
            },
            Strategy::ConditionalWrap { anchor, template } => TransformStrategy::ConditionalWrap {
                anchor_line: anchor.clone(),
                wrapper_template: template.clone(),
            },
        })
    }

    /// Text written into the target; it must carry the marker.
    pub fn inserted_text(&self) -> &str {
        match self {
            Strategy::LiteralReplace { replace, .. } => replace,
            Strategy::RegexReplace { replacement, .. } => replacement,
            Strategy::BlockAppend { content, .. } => content,
            Strategy::ConditionalWrap { template, .. } => template,
        }
    }

    /// Text looked for in an unpatched target; it must not carry the marker.
    pub fn searched_text(&self) -> &str {
        match self {
            Strategy::LiteralReplace { find, .. } => find,
            Strategy::RegexReplace { pattern, .. } => pattern,
            Strategy::BlockAppend { .. } => "",
            Strategy::ConditionalWrap { anchor, .. } => anchor,
        }
    }

    fn collect_issues(&self, patch_id: &str, issues: &mut Vec<ValidationIssue>) {
        let require = |issues: &mut Vec<ValidationIssue>, value: &str, field: &'static str| {
            if value.trim().is_empty() {
                issues.push(ValidationIssue::MissingField {
                    patch_id: Some(patch_id.to_string()),
                    field,
                });
            }
        };

        match self {
            Strategy::LiteralReplace { find, .. } => require(issues, find, "strategy.find"),
            Strategy::RegexReplace { pattern, .. } => {
                require(issues, pattern, "strategy.pattern");
                if let Err(err) = RegexBuilder::new(pattern)
                    .multi_line(true)
                    .crlf(true)
                    .build() {
                    issues.push(ValidationIssue::InvalidRegex {
                        patch_id: patch_id.to_string(),
                        message: err.to_string(),
                    });
                }
            }
            Strategy::BlockAppend { content, .. } => require(issues, content, "strategy.content"),
            Strategy::ConditionalWrap { anchor, template } => {
                require(issues, anchor, "strategy.anchor");
                require(issues, template, "strategy.template");
                if anchor.trim().contains('\n') {
                    issues.push(ValidationIssue::InvalidCombo {
                        patch_id: Some(patch_id.to_string()),
                        message: "conditional-wrap anchor must be a single line".to_string(),
                    });
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub issues: Vec<ValidationIssue>,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, issue) in self.issues.iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
    EmptyPatchList,
    MissingField {
        patch_id: Option<String>,
        field: &'static str,
    },
    DuplicateId {
        patch_id: String,
    },
    DuplicateMarker {
        marker: String,
        first: String,
        second: String,
    },
    InvalidRegex {
        patch_id: String,
        message: String,
    },
    InvalidCombo {
        patch_id: Option<String>,
        message: String,
    },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationIssue::EmptyPatchList => write!(f, "patch config contains no patches"),
            ValidationIssue::MissingField { patch_id, field } => match patch_id {
                Some(id) => write!(f, "patch '{id}' missing required field '{field}'"),
                None => write!(f, "patch missing required field '{field}'"),
            },
            ValidationIssue::DuplicateId { patch_id } => {
                write!(f, "patch id '{patch_id}' is used more than once")
            }
            ValidationIssue::DuplicateMarker {
                marker,
                first,
                second,
            } => write!(
                f,
                "patches '{first}' and '{second}' share marker '{marker}'"
            ),
            ValidationIssue::InvalidRegex { patch_id, message } => {
                write!(f, "patch '{patch_id}' has an invalid regex: {message}")
            }
            ValidationIssue::InvalidCombo { patch_id, message } => match patch_id {
                Some(id) => write!(f, "patch '{id}' has invalid configuration: {message}"),
                None => write!(f, "invalid patch configuration: {message}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> PatchConfig {
        toml_edit::de::from_str(input).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(
            r##"
[meta]
roots = ["/site"]

[[patches]]
id = "a"
file = "pkg/a.py"
marker = "A_MARK"

[patches.strategy]
type = "block-append"
content = "# A_MARK\n"
"##,
        );
        let patch = &config.patches[0];
        assert!(patch.required);
        assert!(!patch.backup);
        assert_eq!(patch.syntax_check, SyntaxCheck::Enforce);
        assert!(matches!(
            patch.strategy,
            Strategy::BlockAppend {
                placement: Placement::AfterImports,
                ..
            }
        ));
        config.validate().unwrap();
    }

    #[test]
    fn test_patch_roots_override_meta() {
        let config = parse(
            r#"
[meta]
roots = ["/meta"]

[[patches]]
id = "a"
file = "pkg/a.py"
marker = "A_MARK"
roots = ["/own", "/other"]
category = "pycolmap"

[patches.strategy]
type = "literal-replace"
find = "x"
replace = "y  # A_MARK"
"#,
        );
        let units = config.units(|_| true).unwrap();
        assert_eq!(
            units[0].target.candidate_roots,
            vec![PathBuf::from("/own"), PathBuf::from("/other")]
        );
        assert_eq!(units[0].category.as_deref(), Some("pycolmap"));

        assert!(config.units(|c| c != Some("pycolmap")).unwrap().is_empty());
    }

    #[test]
    fn test_marker_must_be_inserted() {
        let config = parse(
            r#"
[meta]
roots = ["/site"]

[[patches]]
id = "a"
file = "pkg/a.py"
marker = "A_MARK"

[patches.strategy]
type = "literal-replace"
find = "old()"
replace = "new()"
"#,
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("does not appear"));
    }

    #[test]
    fn test_collects_every_issue() {
        let config = parse(
            r#"
[[patches]]
id = "a"
file = "/abs/a.py"
marker = "M"

[patches.strategy]
type = "regex-replace"
pattern = "("
replacement = "M"

[[patches]]
id = "a"
file = "../b.py"
marker = "M"

[patches.strategy]
type = "conditional-wrap"
anchor = "import x"
template = "try:\n    {anchor}\nexcept ImportError:\n    x = None  # M"
"#,
        );
        let issues = config.validate().unwrap_err().issues;

        assert!(issues.contains(&ValidationIssue::DuplicateId {
            patch_id: "a".to_string()
        }));
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::DuplicateMarker { .. })));
        assert!(issues
            .iter()
            .any(|i| matches!(i, ValidationIssue::InvalidRegex { .. })));
        assert!(issues.iter().any(|i| matches!(
            i,
            ValidationIssue::MissingField { field: "roots", .. }
        )));
        let combos = issues
            .iter()
            .filter(|i| matches!(i, ValidationIssue::InvalidCombo { .. }))
            .count();
        assert_eq!(combos, 2, "{issues:?}");
    }

    #[test]
    fn test_marker_in_search_text_is_rejected() {
        let config = parse(
            r#"
[meta]
roots = ["/site"]

[[patches]]
id = "a"
file = "pkg/a.py"
marker = "import"

[patches.strategy]
type = "conditional-wrap"
anchor = "import pycolmap"
template = "try:\n    {anchor}\nexcept ImportError:\n    pycolmap = None"
"#,
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("searches for"));
    }
}
