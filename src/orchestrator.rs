//! Sequential, failure-isolated execution of patch units.
//!
//! Each unit runs the five-stage pipeline
//!
//! ```text
//! Resolve -> Detect -> Transform -> Verify -> Commit
//! ```
//!
//! against the *current* file content: the file is re-read for every unit, so
//! a unit that targets a file rewritten earlier in the same run sees the new
//! bytes and re-evaluates its marker.
//!
//! Anything that goes wrong inside a unit (unreadable file, failed write,
//! content the verifier rejects) becomes a [`PatchStatus::Failed`] result and
//! the next unit runs. Nothing propagates past the unit boundary.

use crate::commit::{CommitError, Committer};
use crate::fs::FileSystem;
use crate::guard;
use crate::resolve::{self, Resolution, ResolveError, TargetDescriptor};
use crate::transform::{self, TransformOutcome, TransformStrategy};
use crate::validate::{SyntaxCheck, Verifier, VerifyOutcome};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

/// A single named, idempotent modification of one file.
#[derive(Debug, Clone)]
pub struct PatchUnit {
    pub id: String,
    pub target: TargetDescriptor,
    pub strategy: TransformStrategy,
    /// Sentinel token whose presence means the unit already ran.
    pub marker: String,
    /// Whether a failure of this unit counts under [`FailurePolicy::Strict`].
    pub required: bool,
    pub category: Option<String>,
    /// Copy the untouched file to `<file>.backup` before the first write.
    pub backup: bool,
    pub syntax_check: SyntaxCheck,
}

impl PatchUnit {
    pub fn new(
        id: impl Into<String>,
        target: TargetDescriptor,
        strategy: TransformStrategy,
        marker: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            target,
            strategy,
            marker: marker.into(),
            required: true,
            category: None,
            backup: false,
            syntax_check: SyntaxCheck::default(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn with_syntax_check(mut self, syntax_check: SyntaxCheck) -> Self {
        self.syntax_check = syntax_check;
        self
    }
}

/// Terminal state of one unit in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PatchStatus {
    Applied,
    AlreadyApplied,
    SkippedNotFound,
    SkippedPatternNotMatched,
    Failed,
}

impl PatchStatus {
    pub const ALL: [PatchStatus; 5] = [
        PatchStatus::Applied,
        PatchStatus::AlreadyApplied,
        PatchStatus::SkippedNotFound,
        PatchStatus::SkippedPatternNotMatched,
        PatchStatus::Failed,
    ];

    /// Expected, non-fatal skips.
    pub fn is_skip(self) -> bool {
        matches!(
            self,
            PatchStatus::SkippedNotFound | PatchStatus::SkippedPatternNotMatched
        )
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PatchStatus::Applied => "applied",
            PatchStatus::AlreadyApplied => "already applied",
            PatchStatus::SkippedNotFound => "skipped (not found)",
            PatchStatus::SkippedPatternNotMatched => "skipped (pattern not matched)",
            PatchStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Content before and after a unit's change, kept only when requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    pub before: String,
    pub after: String,
}

/// Outcome of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[must_use = "PatchResult should be checked for success/failure"]
pub struct PatchResult {
    pub unit_id: String,
    pub status: PatchStatus,
    pub detail: String,
    /// The resolved target, when resolution succeeded.
    pub path: Option<PathBuf>,
    pub required: bool,
    #[serde(skip)]
    pub change: Option<ContentChange>,
}

impl PatchResult {
    fn new(unit: &PatchUnit, status: PatchStatus, detail: impl Into<String>) -> Self {
        Self {
            unit_id: unit.id.clone(),
            status,
            detail: detail.into(),
            path: None,
            required: unit.required,
            change: None,
        }
    }

    /// A patch file that could not be loaded, reported in place of its units.
    ///
    /// The file's units are unknown, so the entry is required: it counts
    /// under [`FailurePolicy::Strict`].
    pub fn unloadable(source: &Path, detail: impl Into<String>) -> Self {
        Self {
            unit_id: source.display().to_string(),
            status: PatchStatus::Failed,
            detail: detail.into(),
            path: Some(source.to_path_buf()),
            required: true,
            change: None,
        }
    }

    fn at(mut self, path: PathBuf) -> Self {
        self.path = Some(path);
        self
    }
}

impl fmt::Display for PatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.unit_id, self.status)?;
        if !self.detail.is_empty() {
            write!(f, " ({})", self.detail)?;
        }
        Ok(())
    }
}

/// Aggregate over one run, in registration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestrationReport {
    pub results: Vec<PatchResult>,
    pub applied_count: usize,
    pub total_count: usize,
}

impl OrchestrationReport {
    pub fn push(&mut self, result: PatchResult) {
        if result.status == PatchStatus::Applied {
            self.applied_count += 1;
        }
        self.total_count += 1;
        self.results.push(result);
    }

    /// Append the results of `other`, keeping its order.
    pub fn merge(&mut self, other: OrchestrationReport) {
        for result in other.results {
            self.push(result);
        }
    }

    pub fn count(&self, status: PatchStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Failed units that were marked required.
    pub fn required_failures(&self) -> impl Iterator<Item = &PatchResult> {
        self.results
            .iter()
            .filter(|r| r.required && r.status == PatchStatus::Failed)
    }

    /// Whether the run counts as successful under `policy`.
    pub fn is_success(&self, policy: FailurePolicy) -> bool {
        match policy {
            FailurePolicy::BestEffort => true,
            FailurePolicy::Strict => self.required_failures().next().is_none(),
        }
    }

    /// `applied/total`.
    pub fn summary(&self) -> String {
        format!("{}/{}", self.applied_count, self.total_count)
    }
}

/// How unit failures translate into the overall result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Always succeed. Failed units only lose their own fix.
    #[default]
    BestEffort,
    /// Fail when any required unit failed. Skips never fail.
    Strict,
}

/// Errors caught at the unit boundary and reported as `Failed`.
#[derive(Error, Debug)]
pub enum UnitError {
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] ResolveError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("transform left the content unchanged")]
    Unchanged,

    #[error("patched content does not contain marker {0:?}")]
    MarkerMissing(String),

    #[error("syntax invalid at line {line}, column {column}: {message}")]
    SyntaxInvalid {
        line: usize,
        column: usize,
        message: String,
    },

    #[error(transparent)]
    Commit(#[from] CommitError),
}

/// Whether a run writes its changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Apply,
    Check,
}

/// Runs patch units in order against a [`FileSystem`].
pub struct Orchestrator<F: FileSystem> {
    fs: F,
    record_changes: bool,
}

impl<F: FileSystem> Orchestrator<F> {
    pub fn new(fs: F) -> Self {
        Self {
            fs,
            record_changes: false,
        }
    }

    /// Keep before/after content on results that changed a file.
    pub fn record_changes(mut self, record: bool) -> Self {
        self.record_changes = record;
        self
    }

    pub fn file_system(&self) -> &F {
        &self.fs
    }

    /// Apply every unit in order.
    pub fn run(&self, units: &[PatchUnit]) -> OrchestrationReport {
        self.execute(units, Mode::Apply)
    }

    /// Run every stage except the commit. `Applied` means "would apply".
    pub fn check(&self, units: &[PatchUnit]) -> OrchestrationReport {
        self.execute(units, Mode::Check)
    }

    fn execute(&self, units: &[PatchUnit], mode: Mode) -> OrchestrationReport {
        let mut report = OrchestrationReport::default();

        for unit in units {
            let span = info_span!("unit", id = %unit.id);
            let _enter = span.enter();

            let result = self.run_unit(unit, mode);
            match result.status {
                PatchStatus::Failed => {
                    warn!(status = ?result.status, detail = %result.detail, "unit failed")
                }
                status => info!(status = ?status, detail = %result.detail, "unit finished"),
            }
            report.push(result);
        }

        info!(
            applied = report.applied_count,
            total = report.total_count,
            "patched {}",
            report.summary()
        );
        report
    }

    /// The failure boundary: every error inside the pipeline ends here.
    fn run_unit(&self, unit: &PatchUnit, mode: Mode) -> PatchResult {
        if let Err(err) = unit.target.check_relative_path() {
            return PatchResult::new(unit, PatchStatus::Failed, UnitError::from(err).to_string());
        }

        debug!(candidates = unit.target.candidate_roots.len(), "resolving");
        let path = match resolve::resolve(&self.fs, &unit.target) {
            Resolution::Found(path) => path,
            Resolution::NotFound => {
                return PatchResult::new(
                    unit,
                    PatchStatus::SkippedNotFound,
                    format!(
                        "{} not found under {} root(s)",
                        unit.target.relative_path.display(),
                        unit.target.candidate_roots.len()
                    ),
                );
            }
        };

        match self.patch_file(unit, &path, mode) {
            Ok(result) => result.at(path),
            Err(err) => PatchResult::new(unit, PatchStatus::Failed, err.to_string()).at(path),
        }
    }

    fn patch_file(
        &self,
        unit: &PatchUnit,
        path: &Path,
        mode: Mode,
    ) -> Result<PatchResult, UnitError> {
        debug!(path = %path.display(), "detecting marker");
        let original = self
            .fs
            .read_to_string(path)
            .map_err(|source| UnitError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        if guard::is_applied(&original, &unit.marker) {
            return Ok(PatchResult::new(
                unit,
                PatchStatus::AlreadyApplied,
                format!("marker {} present", unit.marker),
            ));
        }

        debug!(strategy = unit.strategy.kind(), "transforming");
        let (new_content, matches) = match transform::apply(&original, &unit.strategy) {
            TransformOutcome::Changed {
                new_content,
                matches,
            } => (new_content, matches),
            TransformOutcome::NoMatch { hint } => {
                let mut detail = format!("no match for {}", unit.strategy);
                if let Some(hint) = hint {
                    detail.push_str("; ");
                    detail.push_str(&hint);
                }
                return Ok(PatchResult::new(
                    unit,
                    PatchStatus::SkippedPatternNotMatched,
                    detail,
                ));
            }
        };

        if matches > 1 && matches!(unit.strategy, TransformStrategy::ConditionalWrap { .. }) {
            warn!(candidates = matches, "several anchor lines match, wrapping only the first");
        }

        debug!("verifying");
        let verifier = Verifier::new(unit.syntax_check);
        let outcome = verifier.check(path, &original, &new_content, &unit.marker);
        let blocks = verifier.blocks_commit(&outcome);
        let mut detail = String::new();
        match outcome {
            VerifyOutcome::Ok => {}
            VerifyOutcome::SyntaxInvalid {
                line,
                column,
                message,
            } => {
                if blocks {
                    return Err(UnitError::SyntaxInvalid {
                        line,
                        column,
                        message,
                    });
                }
                warn!(line, message = %message, "committing content with a syntax problem");
                detail = format!("syntax warning at line {line}: {message}");
            }
            VerifyOutcome::Unchanged => return Err(UnitError::Unchanged),
            VerifyOutcome::MarkerMissing => {
                return Err(UnitError::MarkerMissing(unit.marker.clone()))
            }
        }

        let mut result = match mode {
            Mode::Check => PatchResult::new(
                unit,
                PatchStatus::Applied,
                join_detail("would apply", &detail),
            ),
            Mode::Apply => {
                debug!(path = %path.display(), "committing");
                let receipt = Committer::new(&self.fs).write(path, &new_content, unit.backup)?;
                if let Some(backup) = receipt.backup {
                    detail = join_detail(&detail, &format!("backup at {}", backup.display()));
                }
                PatchResult::new(unit, PatchStatus::Applied, detail)
            }
        };

        if self.record_changes {
            result.change = Some(ContentChange {
                before: original,
                after: new_content,
            });
        }
        Ok(result)
    }
}

fn join_detail(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a}; {b}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use crate::transform::Placement;

    const ROOT: &str = "/usr/lib/python3/site-packages";

    fn target(rel: &str) -> TargetDescriptor {
        TargetDescriptor::new(rel, vec![PathBuf::from("/opt/missing"), PathBuf::from(ROOT)])
    }

    fn append_unit(id: &str, rel: &str, marker: &str) -> PatchUnit {
        PatchUnit::new(
            id,
            target(rel),
            TransformStrategy::BlockAppend {
                content: format!("# {marker}\nPATCHED = True\n"),
                placement: Placement::EndOfFile,
            },
            marker,
        )
    }

    #[test]
    fn test_applies_then_detects() {
        let fs = MemoryFileSystem::new().with_file(format!("{ROOT}/pkg/a.py"), "x = 1\n");
        let orchestrator = Orchestrator::new(&fs);
        let units = vec![append_unit("a", "pkg/a.py", "A_MARK")];

        let first = orchestrator.run(&units);
        assert_eq!(first.results[0].status, PatchStatus::Applied);
        assert_eq!(
            first.results[0].path.as_deref(),
            Some(Path::new("/usr/lib/python3/site-packages/pkg/a.py"))
        );
        let patched = fs.get(format!("{ROOT}/pkg/a.py")).unwrap();

        let second = orchestrator.run(&units);
        assert_eq!(second.results[0].status, PatchStatus::AlreadyApplied);
        assert_eq!(fs.get(format!("{ROOT}/pkg/a.py")).unwrap(), patched);
        assert_eq!(fs.write_count(format!("{ROOT}/pkg/a.py")), 1);
    }

    #[test]
    fn test_check_mode_does_not_write() {
        let fs = MemoryFileSystem::new().with_file(format!("{ROOT}/pkg/a.py"), "x = 1\n");
        let report = Orchestrator::new(&fs)
            .record_changes(true)
            .check(&[append_unit("a", "pkg/a.py", "A_MARK")]);

        let result = &report.results[0];
        assert_eq!(result.status, PatchStatus::Applied);
        assert!(result.detail.contains("would apply"));
        assert!(result.change.as_ref().unwrap().after.contains("A_MARK"));
        assert_eq!(fs.write_count(format!("{ROOT}/pkg/a.py")), 0);
    }

    #[test]
    fn test_invalid_target_fails_without_probing() {
        let fs = MemoryFileSystem::new();
        let report = Orchestrator::new(&fs).run(&[append_unit("bad", "../etc/passwd", "M")]);
        assert_eq!(report.results[0].status, PatchStatus::Failed);
        assert!(report.results[0].detail.contains("escapes"));
    }

    #[test]
    fn test_marker_missing_from_output_fails() {
        let fs = MemoryFileSystem::new().with_file(format!("{ROOT}/pkg/a.py"), "old()\n");
        let unit = PatchUnit::new(
            "no-marker",
            target("pkg/a.py"),
            TransformStrategy::LiteralReplace {
                find: "old()".into(),
                replace: "new()".into(),
            },
            "NEVER_INSERTED",
        );

        let report = Orchestrator::new(&fs).run(&[unit]);
        assert_eq!(report.results[0].status, PatchStatus::Failed);
        assert_eq!(fs.get(format!("{ROOT}/pkg/a.py")).as_deref(), Some("old()\n"));
    }

    #[test]
    fn test_syntax_enforce_blocks_and_advisory_commits() {
        let broken = TransformStrategy::LiteralReplace {
            find: "x = 1".into(),
            replace: "x = (1  # BROKEN_MARK".into(),
        };
        let path = format!("{ROOT}/pkg/a.py");

        let fs = MemoryFileSystem::new().with_file(&path, "x = 1\n");
        let unit = PatchUnit::new("enforce", target("pkg/a.py"), broken.clone(), "BROKEN_MARK");
        let report = Orchestrator::new(&fs).run(&[unit]);
        assert_eq!(report.results[0].status, PatchStatus::Failed);
        assert!(report.results[0].detail.contains("syntax invalid"));
        assert_eq!(fs.get(&path).as_deref(), Some("x = 1\n"));

        let unit = PatchUnit::new("advisory", target("pkg/a.py"), broken, "BROKEN_MARK")
            .with_syntax_check(SyntaxCheck::Advisory);
        let report = Orchestrator::new(&fs).run(&[unit]);
        assert_eq!(report.results[0].status, PatchStatus::Applied);
        assert!(report.results[0].detail.contains("syntax warning"));
        assert!(fs.get(&path).unwrap().contains("BROKEN_MARK"));
    }

    #[test]
    fn test_policy() {
        let fs = MemoryFileSystem::new().with_file(format!("{ROOT}/pkg/a.py"), "x = 1\n");
        fs.set_read_only(format!("{ROOT}/pkg/a.py"));
        let units = vec![
            append_unit("required", "pkg/a.py", "R_MARK"),
            append_unit("missing", "pkg/none.py", "N_MARK"),
        ];

        let report = Orchestrator::new(&fs).run(&units);
        assert_eq!(report.results[0].status, PatchStatus::Failed);
        assert_eq!(report.results[1].status, PatchStatus::SkippedNotFound);
        assert!(report.is_success(FailurePolicy::BestEffort));
        assert!(!report.is_success(FailurePolicy::Strict));

        let optional = vec![append_unit("optional", "pkg/a.py", "O_MARK").with_required(false)];
        let report = Orchestrator::new(&fs).run(&optional);
        assert_eq!(report.results[0].status, PatchStatus::Failed);
        assert!(report.is_success(FailurePolicy::Strict));
    }

    #[test]
    fn test_report_counts() {
        let fs = MemoryFileSystem::new()
            .with_file(format!("{ROOT}/pkg/a.py"), "x = 1\n")
            .with_file(format!("{ROOT}/pkg/b.py"), "# B_MARK\n");
        let report = Orchestrator::new(&fs).run(&[
            append_unit("a", "pkg/a.py", "A_MARK"),
            append_unit("b", "pkg/b.py", "B_MARK"),
            append_unit("c", "pkg/c.py", "C_MARK"),
        ]);

        assert_eq!(report.total_count, 3);
        assert_eq!(report.applied_count, 1);
        assert_eq!(report.count(PatchStatus::AlreadyApplied), 1);
        assert_eq!(report.count(PatchStatus::SkippedNotFound), 1);
        assert_eq!(report.summary(), "1/3");
    }

    #[test]
    fn test_backup_detail() {
        let path = format!("{ROOT}/pkg/a.py");
        let fs = MemoryFileSystem::new().with_file(&path, "x = 1\n");
        let report =
            Orchestrator::new(&fs).run(&[append_unit("a", "pkg/a.py", "A_MARK").with_backup(true)]);

        assert!(report.results[0].detail.contains("backup at"));
        assert_eq!(fs.get(format!("{path}.backup")).as_deref(), Some("x = 1\n"));
    }

    #[test]
    fn test_unloadable_patch_file_counts_as_required_failure() {
        let fs = MemoryFileSystem::new().with_file(format!("{ROOT}/pkg/a.py"), "x = 1\n");
        let mut report = OrchestrationReport::default();
        report.push(PatchResult::unloadable(
            Path::new("patches/20-bad.toml"),
            "invalid regex",
        ));
        report.merge(Orchestrator::new(&fs).run(&[append_unit("a", "pkg/a.py", "A_MARK")]));

        assert_eq!(report.summary(), "1/2");
        assert_eq!(report.results[0].unit_id, "patches/20-bad.toml");
        assert_eq!(report.results[1].status, PatchStatus::Applied);
        assert!(report.is_success(FailurePolicy::BestEffort));
        assert!(!report.is_success(FailurePolicy::Strict));
    }
}
