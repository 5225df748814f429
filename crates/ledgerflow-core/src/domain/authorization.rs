//! Authorization hook consulted before flows act on business objects.
//!
//! The platform does not own the authorization policy; the host application
//! supplies it as a predicate over [`FlowAction`]s. Flow logic asks the
//! hook before each guarded action, and a veto surfaces as a policy
//! violation, which is definitive: the scheduler never retries it.

use serde::{Deserialize, Serialize};

use crate::domain::identity::PartyName;
use crate::domain::transaction::TransactionId;
use crate::error::CoreError;

/// Actions a flow may need clearance for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowAction {
    /// A party asks to join the business network.
    RequestMembership {
        /// The joining party.
        party: PartyName,
    },
    /// Activate a pending membership.
    ActivateMembership {
        /// The member being activated.
        party: PartyName,
    },
    /// Suspend an active membership.
    SuspendMembership {
        /// The member being suspended.
        party: PartyName,
    },
    /// Revoke a membership outright.
    RevokeMembership {
        /// The member being revoked.
        party: PartyName,
    },
    /// Propose a ledger transaction to counterparties.
    ProposeTransaction {
        /// Party proposing.
        initiator: PartyName,
        /// The proposed transaction.
        transaction_id: TransactionId,
    },
    /// Send a fully signed transaction to the notary.
    FinaliseTransaction {
        /// Party finalising.
        initiator: PartyName,
        /// The transaction being finalised.
        transaction_id: TransactionId,
    },
}

impl FlowAction {
    /// Stable action name for logs and policy rules.
    pub fn name(&self) -> &'static str {
        match self {
            FlowAction::RequestMembership { .. } => "membership.request",
            FlowAction::ActivateMembership { .. } => "membership.activate",
            FlowAction::SuspendMembership { .. } => "membership.suspend",
            FlowAction::RevokeMembership { .. } => "membership.revoke",
            FlowAction::ProposeTransaction { .. } => "transaction.propose",
            FlowAction::FinaliseTransaction { .. } => "transaction.finalise",
        }
    }
}

/// Host-supplied authorization predicate.
pub trait AuthorizationHook: Send + Sync {
    /// Returns `Ok` to allow the action or a
    /// [`CoreError::PolicyViolation`] to veto it.
    fn authorize(&self, action: &FlowAction) -> Result<(), CoreError>;
}

/// Hook that allows everything. The default when the host supplies no
/// policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthorizationHook for AllowAll {
    fn authorize(&self, _action: &FlowAction) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyMembershipChanges;

    impl AuthorizationHook for DenyMembershipChanges {
        fn authorize(&self, action: &FlowAction) -> Result<(), CoreError> {
            match action {
                FlowAction::RevokeMembership { party }
                | FlowAction::SuspendMembership { party } => Err(CoreError::PolicyViolation(
                    format!("{} may not be altered by this node", party),
                )),
                _ => Ok(()),
            }
        }
    }

    #[test]
    fn allow_all_permits_everything() {
        let hook = AllowAll;
        let action = FlowAction::RequestMembership {
            party: PartyName::new("Dave"),
        };
        assert!(hook.authorize(&action).is_ok());
    }

    #[test]
    fn veto_surfaces_as_policy_violation() {
        let hook = DenyMembershipChanges;
        let action = FlowAction::RevokeMembership {
            party: PartyName::new("Dave"),
        };
        let err = hook.authorize(&action).unwrap_err();
        assert!(matches!(err, CoreError::PolicyViolation(_)));
        assert!(!err.is_retriable());
    }

    #[test]
    fn action_names_are_stable() {
        let action = FlowAction::ProposeTransaction {
            initiator: PartyName::new("Alice"),
            transaction_id: TransactionId::zero(),
        };
        assert_eq!(action.name(), "transaction.propose");
    }
}
