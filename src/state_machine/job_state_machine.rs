use super::{
    errors::{StateMachineError, StateMachineResult},
    events::JobEvent,
    guards::{MigrationNotFinishedGuard, StateGuard},
    states::JobState,
};
use crate::database::MigrationStore;
use crate::models::BatchedJob;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

/// Lifecycle state machine for a single batched job.
///
/// Each transition applies its side effects to the job (attempt counter,
/// timestamps, error message) before the row is written. The write only
/// lands while the stored status still matches the status this transition
/// started from, so two workers cannot both run the same pending job. A
/// failed write restores the job as it was before the transition.
pub struct JobStateMachine<'a> {
    job: &'a mut BatchedJob,
    store: &'a dyn MigrationStore,
}

impl<'a> JobStateMachine<'a> {
    pub fn new(job: &'a mut BatchedJob, store: &'a dyn MigrationStore) -> Self {
        Self { job, store }
    }

    pub fn current_state(&self) -> JobState {
        self.job.status
    }

    /// Attempt to transition the job state
    pub async fn transition(&mut self, event: JobEvent) -> StateMachineResult<JobState> {
        let current_state = self.current_state();
        let target_state = Self::determine_target_state(current_state, &event)?;

        self.check_guards(current_state, target_state, &event)
            .await?;

        let snapshot = self.job.clone();
        self.apply_effects(target_state, &event);

        if let Err(e) = self.store.save_job(self.job, current_state).await {
            warn!(
                job_id = self.job.id,
                from = %current_state,
                to = %target_state,
                error = %e,
                "Failed to persist job transition, reverting"
            );
            *self.job = snapshot;
            return Err(StateMachineError::Store(e));
        }

        debug!(
            job_id = self.job.id,
            migration_id = self.job.batched_migration_id,
            event = event.event_type(),
            from = %current_state,
            to = %target_state,
            attempts = self.job.attempts,
            "Batched job transitioned"
        );

        Ok(target_state)
    }

    /// Determine the target state based on current state and event
    pub fn determine_target_state(
        current_state: JobState,
        event: &JobEvent,
    ) -> StateMachineResult<JobState> {
        let target = match (current_state, event) {
            (JobState::Pending, JobEvent::Run) => JobState::Running,
            (JobState::Running, JobEvent::Succeed) => JobState::Succeeded,
            (JobState::Pending | JobState::Running, JobEvent::Fail(_)) => JobState::Failed,
            (JobState::Failed, JobEvent::Retry) => JobState::Pending,

            (from_state, _) => {
                return Err(StateMachineError::InvalidTransition {
                    from: from_state.to_string(),
                    event: event.event_type().to_string(),
                })
            }
        };

        Ok(target)
    }

    async fn check_guards(
        &self,
        _current_state: JobState,
        target_state: JobState,
        event: &JobEvent,
    ) -> StateMachineResult<()> {
        if let (JobState::Running, JobEvent::Run) = (target_state, event) {
            let guard = MigrationNotFinishedGuard;
            guard.check(&*self.job, self.store).await?;
        }

        Ok(())
    }

    fn apply_effects(&mut self, target_state: JobState, event: &JobEvent) {
        let now = Utc::now();
        let job = &mut *self.job;

        match event {
            JobEvent::Run => {
                job.attempts += 1;
                job.started_at = Some(now);
                job.finished_at = None;
                job.metrics = json!({});
            }
            JobEvent::Succeed => {
                job.finished_at = Some(now);
            }
            JobEvent::Fail(message) => {
                job.finished_at = Some(now);
                job.last_error = Some(message.clone());
            }
            JobEvent::Retry => {
                job.attempts = 0;
                job.finished_at = None;
                job.last_error = None;
            }
        }

        job.status = target_state;
        job.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table() {
        let fail = JobEvent::fail_with_error("boom");

        assert_eq!(
            JobStateMachine::determine_target_state(JobState::Pending, &JobEvent::Run).unwrap(),
            JobState::Running
        );
        assert_eq!(
            JobStateMachine::determine_target_state(JobState::Running, &JobEvent::Succeed).unwrap(),
            JobState::Succeeded
        );
        assert_eq!(
            JobStateMachine::determine_target_state(JobState::Pending, &fail).unwrap(),
            JobState::Failed
        );
        assert_eq!(
            JobStateMachine::determine_target_state(JobState::Running, &fail).unwrap(),
            JobState::Failed
        );
        assert_eq!(
            JobStateMachine::determine_target_state(JobState::Failed, &JobEvent::Retry).unwrap(),
            JobState::Pending
        );
    }

    #[test]
    fn test_succeeded_jobs_are_final() {
        for event in [
            JobEvent::Run,
            JobEvent::Succeed,
            JobEvent::fail_with_error("late"),
            JobEvent::Retry,
        ] {
            assert!(JobStateMachine::determine_target_state(JobState::Succeeded, &event).is_err());
        }
    }

    #[test]
    fn test_pending_job_cannot_succeed_without_running() {
        let err = JobStateMachine::determine_target_state(JobState::Pending, &JobEvent::Succeed)
            .unwrap_err();
        assert!(matches!(err, StateMachineError::InvalidTransition { .. }));
    }
}
