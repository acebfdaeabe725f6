//! Local disk analysis engine: walk a tree, classify and deduplicate files,
//! report reclaimable space, then apply gate-approved cleanups.
//!
//! ```no_run
//! # async fn demo() -> Result<(), reclaim_engine_lib::EngineError> {
//! use reclaim_engine_lib::{EngineConfig, PolicyConfig, ReclaimEngine};
//! use tokio_util::sync::CancellationToken;
//!
//! let policy = PolicyConfig { dry_run: true, ..PolicyConfig::default() };
//! let engine = ReclaimEngine::with_default_rules(policy, EngineConfig::default())?;
//! let token = CancellationToken::new();
//! let scan = engine.scan("/home/me/Downloads".as_ref(), &token).await?;
//! let review = engine.review(&scan);
//! let report = engine.apply(review, &token).await;
//! println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod ops;
pub mod reclaim;

pub use config::{EngineConfig, PolicyConfig, RetentionPolicy, QUICK_MODE_MAX_DEPTH};
pub use error::{ApplyError, EngineError, SkipEvent, SkipKind};
pub use ops::{OperationMetrics, OperationReport, RunStatus, ScanDeadline};
pub use reclaim::{
    Action, ActionKind, ApplyEntry, ApplyReport, ApplyState, ApprovedAction, Category,
    CategoryReport, CategoryRules, CategorySet, ContentDigest, ContentHasher, DuplicateGroup,
    FileDescriptor, GateReview, OwnershipCheck, PhotoEstimate, PhotoFormat, PhotoOptimizer,
    ReclaimEngine, RejectedAction, RejectionReason, SavingsBasis, ScanResult, Sha256Hasher,
    SignatureCheck,
};
