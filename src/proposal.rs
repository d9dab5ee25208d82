//! Proposal lifecycle as recorded by the bridge contract
//!
//! The writer never tracks proposal state itself. It reads the current status
//! before every attempt and asks [`required_action`] whether submitting is
//! still useful.

use std::fmt;

use crate::error::ChainError;

/// On-chain proposal status (`enum ProposalStatus` in the bridge contract)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProposalStatus {
    Inactive = 0,
    Active = 1,
    Passed = 2,
    Executed = 3,
    Cancelled = 4,
}

impl ProposalStatus {
    pub fn is_active(&self) -> bool {
        *self == ProposalStatus::Active
    }

    /// Enough votes have been collected; the proposal awaits execution
    pub fn is_finalized(&self) -> bool {
        *self == ProposalStatus::Passed
    }

    pub fn is_executed(&self) -> bool {
        *self == ProposalStatus::Executed
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Inactive => "inactive",
            ProposalStatus::Active => "active",
            ProposalStatus::Passed => "passed",
            ProposalStatus::Executed => "executed",
            ProposalStatus::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<u8> for ProposalStatus {
    type Error = ChainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ProposalStatus::Inactive),
            1 => Ok(ProposalStatus::Active),
            2 => Ok(ProposalStatus::Passed),
            3 => Ok(ProposalStatus::Executed),
            4 => Ok(ProposalStatus::Cancelled),
            other => Err(ChainError::Decode(format!(
                "unknown proposal status {}",
                other
            ))),
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an inbound message wants to achieve on this chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalGoal {
    Vote,
    Execute,
}

impl ProposalGoal {
    /// Metric and log label for the transaction this goal submits
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalGoal::Vote => "vote",
            ProposalGoal::Execute => "execute",
        }
    }
}

/// Outcome of consulting the proposal state for a goal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalAction {
    Vote,
    Execute,
    Skip(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyVoted,
    /// The proposal is past the stage the goal targets
    AlreadyFinalized(ProposalStatus),
    /// Execution requested but the proposal has not passed
    NotPassed(ProposalStatus),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyVoted => write!(f, "relayer already voted"),
            SkipReason::AlreadyFinalized(status) => write!(f, "proposal already {}", status),
            SkipReason::NotPassed(status) => write!(f, "proposal is {}, not passed", status),
        }
    }
}

/// Decide the on-chain action for `goal` given the latest observed proposal state.
///
/// | Status    | Vote                   | Execute |
/// |-----------|------------------------|---------|
/// | Inactive  | yes                    | no      |
/// | Active    | yes, unless voted      | no      |
/// | Passed    | no                     | yes     |
/// | Executed  | no                     | no      |
/// | Cancelled | no                     | no      |
pub fn required_action(
    goal: ProposalGoal,
    status: ProposalStatus,
    already_voted: bool,
) -> ProposalAction {
    use self::ProposalStatus::*;

    match (goal, status) {
        (ProposalGoal::Vote, Inactive) => ProposalAction::Vote,
        (ProposalGoal::Vote, Active) if already_voted => {
            ProposalAction::Skip(SkipReason::AlreadyVoted)
        }
        (ProposalGoal::Vote, Active) => ProposalAction::Vote,
        (ProposalGoal::Vote, s) => ProposalAction::Skip(SkipReason::AlreadyFinalized(s)),

        (ProposalGoal::Execute, Passed) => ProposalAction::Execute,
        (ProposalGoal::Execute, s @ (Executed | Cancelled)) => {
            ProposalAction::Skip(SkipReason::AlreadyFinalized(s))
        }
        (ProposalGoal::Execute, s) => ProposalAction::Skip(SkipReason::NotPassed(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ProposalStatus::*;

    const ALL: [ProposalStatus; 5] = [Inactive, Active, Passed, Executed, Cancelled];

    #[test]
    fn test_status_from_u8() {
        for status in ALL {
            assert_eq!(ProposalStatus::try_from(status as u8).unwrap(), status);
        }
        assert!(ProposalStatus::try_from(5).is_err());
        assert!(ProposalStatus::try_from(255).is_err());
    }

    #[test]
    fn test_status_queries() {
        assert!(Active.is_active());
        assert!(!Inactive.is_active());
        assert!(Passed.is_finalized());
        assert!(!Executed.is_finalized());
        assert!(Executed.is_executed());
        assert!(!Cancelled.is_executed());
    }

    #[test]
    fn test_vote_decisions() {
        assert_eq!(required_action(ProposalGoal::Vote, Inactive, false), ProposalAction::Vote);
        assert_eq!(required_action(ProposalGoal::Vote, Active, false), ProposalAction::Vote);
        assert_eq!(
            required_action(ProposalGoal::Vote, Active, true),
            ProposalAction::Skip(SkipReason::AlreadyVoted)
        );
        for status in [Passed, Executed, Cancelled] {
            assert_eq!(
                required_action(ProposalGoal::Vote, status, false),
                ProposalAction::Skip(SkipReason::AlreadyFinalized(status))
            );
        }
    }

    #[test]
    fn test_execute_decisions() {
        assert_eq!(
            required_action(ProposalGoal::Execute, Passed, true),
            ProposalAction::Execute
        );
        for status in [Inactive, Active] {
            assert_eq!(
                required_action(ProposalGoal::Execute, status, false),
                ProposalAction::Skip(SkipReason::NotPassed(status))
            );
        }
        for status in [Executed, Cancelled] {
            assert!(matches!(
                required_action(ProposalGoal::Execute, status, false),
                ProposalAction::Skip(_)
            ));
        }
    }

    #[test]
    fn test_terminal_states_never_act() {
        for goal in [ProposalGoal::Vote, ProposalGoal::Execute] {
            for voted in [false, true] {
                assert!(matches!(
                    required_action(goal, Executed, voted),
                    ProposalAction::Skip(_)
                ));
                assert!(matches!(
                    required_action(goal, Cancelled, voted),
                    ProposalAction::Skip(_)
                ));
            }
        }
    }
}
