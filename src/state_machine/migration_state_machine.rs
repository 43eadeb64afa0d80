use super::{
    errors::{StateMachineError, StateMachineResult},
    events::MigrationEvent,
    guards::{AllJobsSucceededGuard, StateGuard},
    states::MigrationState,
};
use crate::database::MigrationStore;
use crate::models::BatchedMigration;
use chrono::Utc;
use tracing::{debug, warn};

/// Lifecycle state machine for a batched migration.
///
/// Borrows the migration for the duration of one transition. A transition
/// is resolved, guarded, then persisted; if the write fails the in-memory
/// record is rolled back to its last persisted values.
pub struct MigrationStateMachine<'a> {
    migration: &'a mut BatchedMigration,
    store: &'a dyn MigrationStore,
}

impl<'a> MigrationStateMachine<'a> {
    pub fn new(migration: &'a mut BatchedMigration, store: &'a dyn MigrationStore) -> Self {
        Self { migration, store }
    }

    pub fn current_state(&self) -> MigrationState {
        self.migration.status()
    }

    /// Attempt to transition the migration state
    pub async fn transition(&mut self, event: MigrationEvent) -> StateMachineResult<MigrationState> {
        let current_state = self.current_state();
        let target_state = Self::determine_target_state(current_state, &event)?;

        self.check_guards(current_state, target_state, &event)
            .await?;

        self.migration.set_status(target_state);
        if event == MigrationEvent::Execute {
            self.migration.set_started_at(Some(Utc::now()));
        }

        if let Err(e) = self.migration.save(self.store).await {
            warn!(
                migration_id = self.migration.id,
                from = %current_state,
                to = %target_state,
                error = %e,
                "Failed to persist migration transition, reverting"
            );
            self.migration.revert_changes();
            return Err(StateMachineError::Store(e));
        }

        debug!(
            migration_id = self.migration.id,
            event = event.event_type(),
            from = %current_state,
            to = %target_state,
            "Batched migration transitioned"
        );

        Ok(target_state)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: MigrationState,
        event: &MigrationEvent,
    ) -> StateMachineResult<MigrationState> {
        use MigrationState::*;

        let target = match (current_state, event) {
            (Paused | Active, MigrationEvent::Pause) => Paused,
            (Paused | Active | Failed, MigrationEvent::Execute) => Active,
            (Active | Finalizing, MigrationEvent::Finish) => Finished,
            (Active | Finalizing, MigrationEvent::Failure) => Failed,
            (Paused | Active | Failed, MigrationEvent::Finalize) => Finalizing,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    pub fn can_transition(current_state: MigrationState, event: &MigrationEvent) -> bool {
        Self::determine_target_state(current_state, event).is_ok()
    }

    async fn check_guards(
        &self,
        _current_state: MigrationState,
        target_state: MigrationState,
        event: &MigrationEvent,
    ) -> StateMachineResult<()> {
        if let (MigrationState::Finished, MigrationEvent::Finish) = (target_state, event) {
            let guard = AllJobsSucceededGuard;
            guard.check(&*self.migration, self.store).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTS: [MigrationEvent; 5] = [
        MigrationEvent::Pause,
        MigrationEvent::Execute,
        MigrationEvent::Finish,
        MigrationEvent::Failure,
        MigrationEvent::Finalize,
    ];

    #[test]
    fn test_transition_table() {
        use MigrationState::*;

        let allowed = [
            (Paused, MigrationEvent::Pause, Paused),
            (Active, MigrationEvent::Pause, Paused),
            (Paused, MigrationEvent::Execute, Active),
            (Active, MigrationEvent::Execute, Active),
            (Failed, MigrationEvent::Execute, Active),
            (Active, MigrationEvent::Finish, Finished),
            (Finalizing, MigrationEvent::Finish, Finished),
            (Active, MigrationEvent::Failure, Failed),
            (Finalizing, MigrationEvent::Failure, Failed),
            (Paused, MigrationEvent::Finalize, Finalizing),
            (Active, MigrationEvent::Finalize, Finalizing),
            (Failed, MigrationEvent::Finalize, Finalizing),
        ];

        for state in MigrationState::ALL {
            for event in &EVENTS {
                let expected = allowed
                    .iter()
                    .find(|(from, e, _)| *from == state && e == event)
                    .map(|(_, _, to)| *to);

                let actual = MigrationStateMachine::determine_target_state(state, event).ok();
                assert_eq!(actual, expected, "{state} on {}", event.event_type());
            }
        }
    }

    #[test]
    fn test_finished_accepts_no_event() {
        for event in &EVENTS {
            assert!(!MigrationStateMachine::can_transition(
                MigrationState::Finished,
                event
            ));
        }
    }

    #[test]
    fn test_invalid_transition_names_state_and_event() {
        let err = MigrationStateMachine::determine_target_state(
            MigrationState::Paused,
            &MigrationEvent::Finish,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid state transition from paused on event finish"
        );
    }
}
