//! flame-services — the transfer engine, the fragment directory, and the
//! placement/migration logic that drives them.

pub mod directory;
pub mod engine;
pub mod migration;
pub mod placement;
pub mod queue;

pub use directory::{FragmentDirectory, LeaseConflict};
pub use engine::{CompletionHandle, EngineStats, LatencyModel, TransferEngine, TransferEvent};
pub use migration::{MigrationController, MigrationError, MigrationOutcome, Move};
pub use placement::{Placement, PlacementPlan, PlanError, Planner};
