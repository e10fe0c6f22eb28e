//! Quaxis Mining Pipeline
//!
//! The path from an observed chain tip to work on an ASIC and back:
//! - Template cache with speculative pre-computation (spy mining)
//! - Per-connection extranonce allocation (disjoint search spaces)
//! - Job minting and staleness tracking
//! - Share validation with midstate rehashing and duplicate detection
//! - Merged-mining commitments and aux-PoW proof assembly

pub mod extranonce;
pub mod job;
pub mod merged;
pub mod template_cache;
pub mod validator;

pub use extranonce::ExtranonceAllocator;
pub use job::{Job, JobError, JobManager, JobSnapshot, Share};
pub use merged::{AuxChainWork, AuxSubmission, MergedError, MergedMiner};
pub use template_cache::{TemplateCache, TemplateError, TemplateId, TipOutcome};
pub use validator::{
    FoundBlock, FoundBlockCallback, ShareOutcome, ShareValidator, ValidationResult,
    ValidatorStatsSnapshot, VERSION_ROLLING_MASK,
};
