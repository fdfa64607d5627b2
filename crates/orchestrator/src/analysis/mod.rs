//! Audit mode: agents consult each other over a shared, single-writer context
//! instead of running the build/QA loop. Approved recommendations are applied
//! one at a time afterwards.

pub mod analyzer;
pub mod context_store;
pub mod coordinator;
pub mod fix_flow;
pub mod todo_store;

pub use analyzer::{AnalysisResult, AnalyzerOrchestrator, ReviewOutcome};
pub use context_store::{ContextWrite, SharedContext, SharedContextStore, Writer};
pub use coordinator::{MessageCoordinator, MessageHandler};
pub use fix_flow::{FixApproval, FixSummary, IncrementalFixer, TaskFixResult};
pub use todo_store::TodoStore;
