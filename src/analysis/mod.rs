// Correction analysis
// Token-level diffing and feature extraction for before/after field values

pub mod diff;
pub mod features;

pub use diff::{ChangeFlags, ChangeType, DiffOp, DiffResult, compute_diff};
pub use features::{
    CertaintyIndicators, ContentPattern, FeatureBag, TransformationType, extract_features,
};
