use flowforge_core::Stage;

use crate::error::{OrchestratorError, Result};

pub struct StageMachine;

impl StageMachine {
    pub fn validate_transition(from: &Stage, to: &Stage) -> Result<()> {
        if from == to && !from.is_terminal() {
            return Ok(());
        }

        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: *from,
                to: *to,
            })
        }
    }

    fn allowed_transitions(from: &Stage) -> Vec<Stage> {
        let mut next = match from {
            Stage::Clarification => vec![Stage::Research, Stage::Decision, Stage::Complete],
            Stage::Research => vec![Stage::Decision],
            Stage::Decision => vec![Stage::Credentials],
            Stage::Credentials => vec![Stage::Implementation],
            Stage::Implementation => vec![Stage::Build],
            Stage::Build => vec![Stage::Validate],
            Stage::Validate => vec![Stage::Test, Stage::Build, Stage::Complete],
            Stage::Test => vec![Stage::Complete, Stage::Build, Stage::Validate],
            Stage::Complete | Stage::Blocked => return vec![],
        };
        next.push(Stage::Blocked);
        next
    }

    pub fn can_transition(from: &Stage, to: &Stage) -> bool {
        Self::validate_transition(from, to).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        assert!(StageMachine::can_transition(
            &Stage::Clarification,
            &Stage::Research
        ));
        assert!(StageMachine::can_transition(
            &Stage::Clarification,
            &Stage::Decision
        ));
        assert!(StageMachine::can_transition(&Stage::Build, &Stage::Validate));
        assert!(StageMachine::can_transition(&Stage::Validate, &Stage::Test));
        assert!(StageMachine::can_transition(&Stage::Test, &Stage::Complete));
    }

    #[test]
    fn test_conversational_short_circuit() {
        assert!(StageMachine::can_transition(
            &Stage::Clarification,
            &Stage::Complete
        ));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!StageMachine::can_transition(
            &Stage::Clarification,
            &Stage::Build
        ));
        assert!(!StageMachine::can_transition(&Stage::Build, &Stage::Complete));
        assert!(!StageMachine::can_transition(
            &Stage::Decision,
            &Stage::Research
        ));
    }

    #[test]
    fn test_blocked_reachable_from_any_active_stage() {
        for stage in [
            Stage::Clarification,
            Stage::Research,
            Stage::Decision,
            Stage::Credentials,
            Stage::Implementation,
            Stage::Build,
            Stage::Validate,
            Stage::Test,
        ] {
            assert!(StageMachine::can_transition(&stage, &Stage::Blocked));
        }
    }

    #[test]
    fn test_terminal_stages_are_absorbing() {
        assert!(!StageMachine::can_transition(&Stage::Complete, &Stage::Build));
        assert!(!StageMachine::can_transition(&Stage::Blocked, &Stage::Clarification));
        assert!(!StageMachine::can_transition(&Stage::Complete, &Stage::Blocked));
        assert!(!StageMachine::can_transition(&Stage::Blocked, &Stage::Blocked));
    }

    #[test]
    fn test_same_stage_is_noop() {
        assert!(StageMachine::can_transition(&Stage::Validate, &Stage::Validate));
    }
}
