// Loan Tape Pipeline - Core Library
// Rule engines, row migration and version bookkeeping for the CLI and tests

pub mod error;
pub mod config;
pub mod catalog;      // Column datatypes + cell parsing
pub mod dataset;      // In-memory CSV table + masks
pub mod condition;    // Single condition evaluation
pub mod rules;        // Rule groups + cumulative engine
pub mod pipeline;     // Step tracker
pub mod store;        // SQLite metadata store
pub mod preprocess;   // Upload cleaning + datatype conversion
pub mod conversion;   // Temp-copy datatype fix phase
pub mod migration;    // Tag-partition ejection/inclusion
pub mod calculated;   // Calculated column builder
pub mod rbi;          // Fixed RBI filter
pub mod chain;        // Rule version chains
pub mod debt_sheet;   // Debt sheet workflow
pub mod transaction;  // Transaction workflow

// Re-export commonly used types
pub use error::{ChainViolation, PipelineError, Result};
pub use config::Config;
pub use catalog::{ColumnCatalog, Datatype, SystemColumn};
pub use dataset::{Dataset, Mask};
pub use condition::{Condition, Connector, Operator, Outcome};
pub use rules::{
    build_mask, load_rule_groups, parse_rule_groups,
    DatasetStats, RuleApplication, RuleEngine, RuleGroup, RulesResults,
};
pub use pipeline::{Step, StepTracker};
pub use store::{
    ChainLink, Event, MetadataStore, ProjectRecord, SqliteStore,
    TransactionRecord, VersionEntry, VersionRecord,
};
pub use preprocess::{
    prepare_dataset, ColumnFix, ConversionReport, NumericFix, PrepareOptions, PrepareSummary, Rounding,
};
pub use conversion::{ColumnFixRequest, ConversionPhase, PromotedConversion};
pub use migration::{ApplyRule, RulePayload, RuleRunResult, TagKey, TagRules};
pub use calculated::{build_column, parse_fragments, BuiltColumn, CalcOp, Fragment, Operand};
pub use rbi::{apply_rbi_rules, RbiReport, RbiSelection};
pub use chain::{ChainDeletion, RuleVersionSummary, VersionChain, VersionChainManager};
pub use debt_sheet::{DebtSheetWorkflow, FinalizeResult, ProjectImport};
pub use transaction::{ColumnAddition, RbiApplication, TransactionImport, TransactionWorkflow};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
