// State machines for batched migrations and their jobs.
//
// Transitions are resolved from (state, event) pairs, checked against
// guards, then persisted through a MigrationStore.

pub mod errors;
pub mod events;
pub mod guards;
pub mod job_state_machine;
pub mod migration_state_machine;
pub mod states;

// Re-export main types for convenient access
pub use errors::{GuardError, StateMachineError};
pub use events::{JobEvent, MigrationEvent};
pub use guards::StateGuard;
pub use job_state_machine::JobStateMachine;
pub use migration_state_machine::MigrationStateMachine;
pub use states::{JobState, MigrationState};
