//! Experiment lifecycle state machine.
//!
//! One [`ExperimentMachine`] per experiment id. A transition is first
//! planned (validated, no side effects) and only committed once the
//! message is durably appended, so a failed append never moves the state.

use chrono::{DateTime, Utc};
use mlens_proto::{Event, ExperimentId, ExperimentMessage, LifecycleAction, MessageId};
use serde::Serialize;

use crate::error::IngestError;
use crate::types::{ExperimentState, Offset};

/// A committed state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub action: LifecycleAction,
    /// `None` for the `create` that brought the experiment into existence.
    pub from: Option<ExperimentState>,
    pub to: ExperimentState,
    pub at: DateTime<Utc>,
    pub message_id: MessageId,
    pub offset: Offset,
}

/// Current view of one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Experiment {
    pub id: ExperimentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub state: ExperimentState,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub events_applied: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_at: Option<DateTime<Utc>>,
    pub history: Vec<Transition>,
}

/// A validated transition waiting for its log append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTransition {
    pub action: LifecycleAction,
    pub from: Option<ExperimentState>,
    pub to: ExperimentState,
}

impl PlannedTransition {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.to.is_terminal()
    }
}

/// Lifecycle state of a single experiment id.
#[derive(Debug, Clone)]
pub struct ExperimentMachine {
    id: ExperimentId,
    experiment: Option<Experiment>,
}

impl ExperimentMachine {
    /// A machine for an id that has not been created yet.
    #[must_use]
    pub const fn new(id: ExperimentId) -> Self {
        Self {
            id,
            experiment: None,
        }
    }

    #[must_use]
    pub const fn id(&self) -> &ExperimentId {
        &self.id
    }

    #[must_use]
    pub const fn experiment(&self) -> Option<&Experiment> {
        self.experiment.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> Option<ExperimentState> {
        self.experiment.as_ref().map(|e| e.state)
    }

    #[must_use]
    pub const fn exists(&self) -> bool {
        self.experiment.is_some()
    }

    /// Validate `action` against the current state.
    ///
    /// # Errors
    ///
    /// - [`IngestError::InvalidTransition`] for `create` on an existing id
    ///   or any pair not in the transition table.
    /// - [`IngestError::UnknownExperiment`] for a non-`create` action on an
    ///   id that was never created.
    pub fn plan(&self, action: LifecycleAction) -> Result<PlannedTransition, IngestError> {
        let current = self.state();
        let to = match (current, action) {
            (None, LifecycleAction::Create) => ExperimentState::Created,
            (None, _) => return Err(IngestError::unknown_experiment(&self.id)),
            (Some(state), action) => state
                .apply(action)
                .ok_or_else(|| IngestError::invalid_transition(&self.id, state, action.as_str()))?,
        };
        Ok(PlannedTransition {
            action,
            from: current,
            to,
        })
    }

    /// Apply a planned transition after its message was appended at
    /// `offset`.
    pub fn commit(
        &mut self,
        plan: PlannedTransition,
        message: &ExperimentMessage,
        at: DateTime<Utc>,
        message_id: MessageId,
        offset: Offset,
    ) {
        let transition = Transition {
            action: plan.action,
            from: plan.from,
            to: plan.to,
            at,
            message_id,
            offset,
        };

        match &mut self.experiment {
            Some(experiment) => {
                experiment.state = plan.to;
                experiment.last_transition_at = at;
                if experiment.owner.is_none() {
                    experiment.owner.clone_from(&message.owner);
                }
                experiment.history.push(transition);
            }
            None => {
                self.experiment = Some(Experiment {
                    id: self.id.clone(),
                    owner: message.owner.clone(),
                    state: plan.to,
                    created_at: at,
                    last_transition_at: at,
                    events_applied: 0,
                    last_event_at: None,
                    history: vec![transition],
                });
            }
        }
    }

    /// Check that an event may be recorded against this experiment now.
    ///
    /// # Errors
    ///
    /// [`IngestError::UnknownExperiment`] if the id was never created and
    /// [`IngestError::InvalidTransition`] if the experiment is terminal.
    pub fn accepts_event(&self, event: &Event) -> Result<(), IngestError> {
        match self.state() {
            None => Err(IngestError::unknown_experiment(&self.id)),
            Some(state) if state.is_terminal() => Err(IngestError::invalid_transition(
                &self.id,
                state,
                format!("record {} event", event.kind),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Count an appended event.
    pub fn record_event(&mut self, event: &Event) {
        if let Some(experiment) = &mut self.experiment {
            experiment.events_applied = experiment.events_applied.saturating_add(1);
            experiment.last_event_at = Some(
                experiment
                    .last_event_at
                    .map_or(event.observed_at, |last| last.max(event.observed_at)),
            );
        }
    }
}
