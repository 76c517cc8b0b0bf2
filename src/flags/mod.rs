//! Feature flags: local evaluation against a polled definition snapshot,
//! with remote fallback for anything that needs server-side state.

pub mod cache;
pub mod evaluator;
pub(crate) mod matcher;
pub mod poller;
pub mod types;

pub use cache::DecisionCache;
pub use evaluator::{hash_key, LocalEvaluationSummary, LocalEvaluator, LocalFlagResult};
pub use poller::{FetchOutcome, FlagDefinitionSource, FlagPoller, FlagSourceConfig, SnapshotStore};
pub use types::{
    CohortNode, CohortPropertyGroup, FeatureFlag, FeatureFlagFilters, FilterType, FlagCondition,
    FlagDecisions, FlagDetail, FlagMetadata, FlagReason, FlagSnapshot, FlagValue, GroupLogic,
    LocalEvaluationResponse, MultivariateFilter, MultivariateVariant, Operator, PropertyFilter,
};
