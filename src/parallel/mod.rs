// Parallel execution engine: claims, conflicts, pools, budgets and the coordinator

pub mod conflicts;
pub mod coordinator;
pub mod ledger;
pub mod pool;
pub mod resolver;
pub mod resources;
pub mod structure;
pub mod tokens;

// Re-export for convenience
pub use conflicts::{ConflictDetector, ConflictPredictor, CycleProfile, DetectedConflict, JaccardPredictor};
pub use coordinator::{CoordinatorBuilder, MaintenanceReport, ParallelCoordinator, PlanEntry};
pub use ledger::{ClaimKind, ClaimOutcome, FileClaim, FileConflictLedger};
pub use pool::{AgentPoolManager, PoolStats, ScalingDecision};
pub use resolver::{ConflictResolver, Resolution, ResolutionStrategy};
pub use resources::{Feasibility, RebalanceReport, ResourceAllocation, ResourceAllocator};
pub use tokens::{HeadroomDecision, TokenAllocation, TokenBudgetManager, TokenRebalanceReport};
