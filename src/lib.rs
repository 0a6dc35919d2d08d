//! Site Patcher: idempotent, best-effort patches for installed packages.
//!
//! Third-party packages installed into a Python environment sometimes call
//! an older API of one of their dependencies. This crate rewrites the
//! offending source files in place, once, and never breaks the surrounding
//! build when a rewrite cannot be made.
//!
//! # Architecture
//!
//! A [`PatchUnit`] is a declarative description of one change to one file.
//! The [`Orchestrator`] runs units in order, each through the same pipeline:
//!
//! 1. [`resolve`]: find the file under the first candidate root that has it
//! 2. [`guard`]: stop if the unit's marker is already in the file
//! 3. [`transform`]: compute the new content, or report "no match"
//! 4. [`validate`]: reject no-ops, missing markers and new syntax errors
//! 5. [`commit`]: atomic write (tempfile + fsync + rename)
//!
//! All I/O goes through the [`FileSystem`] trait, so the same pipeline runs
//! against an in-memory tree in tests.
//!
//! # Safety
//!
//! - A file is written at most once per unit per run, and only after
//!   verification succeeded
//! - Markers make every unit idempotent; a second run changes nothing
//! - Every unit runs inside its own failure boundary
//!
//! # Example
//!
//! ```no_run
//! use site_patcher::{
//!     Orchestrator, OsFileSystem, PatchUnit, TargetDescriptor, TransformStrategy,
//! };
//! use std::path::PathBuf;
//!
//! let unit = PatchUnit::new(
//!     "hloc-safe-import",
//!     TargetDescriptor::new(
//!         "hloc/utils/parsers.py",
//!         vec![PathBuf::from("/usr/local/lib/python3.10/dist-packages")],
//!     ),
//!     TransformStrategy::ConditionalWrap {
//!         anchor_line: "import pycolmap".into(),
//!         wrapper_template: "# PYCOLMAP_SAFE_IMPORT\ntry:\n    {anchor}\nexcept ImportError:\n    pycolmap = None\n".into(),
//!     },
//!     "PYCOLMAP_SAFE_IMPORT",
//! );
//!
//! let report = Orchestrator::new(OsFileSystem).run(&[unit]);
//! println!("applied {}", report.summary());
//! ```

pub mod commit;
pub mod config;
pub mod fs;
pub mod guard;
pub mod orchestrator;
pub mod pool;
pub mod resolve;
pub mod telemetry;
pub mod transform;
pub mod ts;
pub mod validate;

pub use commit::{CommitError, CommitReceipt, Committer};
pub use config::{load_from_path, load_from_str, CategoryFilter, ConfigError, PatchConfig};
pub use fs::{FileSystem, MemoryFileSystem, OsFileSystem};
pub use guard::is_applied;
pub use orchestrator::{
    ContentChange, FailurePolicy, OrchestrationReport, Orchestrator, PatchResult, PatchStatus,
    PatchUnit, UnitError,
};
pub use resolve::{Resolution, ResolveError, TargetDescriptor};
pub use transform::{Placement, TransformError, TransformOutcome, TransformStrategy};
pub use validate::{SyntaxCheck, Verifier, VerifyOutcome};
