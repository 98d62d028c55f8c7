//! The `manual_approval` gate.
//!
//! Test-mode runs auto-approve unless the node sets `autoApprove: false`.
//! Otherwise the context's approval flag decides: approved succeeds, rejected
//! fails, and a missing flag raises the approval-pause signal so the state
//! machine parks the run in `WAITING_APPROVAL`.

use flowpilot_types::workflow::ApprovalParams;

use super::context::ExecutionContext;
use super::dispatcher::{DispatchEnv, HandlerError, HandlerResult};

pub fn gate(
    node_id: &str,
    params: &ApprovalParams,
    ctx: &mut ExecutionContext,
    env: &DispatchEnv,
) -> HandlerResult {
    if env.test_mode && params.auto_approve != Some(false) {
        ctx.set_approval(node_id, true);
        return Ok(None);
    }

    match ctx.approval(node_id) {
        Some(true) => Ok(None),
        Some(false) => Err(HandlerError::ApprovalRejected {
            node_id: node_id.to_string(),
        }),
        None => Err(HandlerError::ApprovalRequired {
            node_id: node_id.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn env(test_mode: bool) -> DispatchEnv {
        DispatchEnv::new(Uuid::now_v7(), "wf", test_mode)
    }

    #[test]
    fn test_mode_auto_approves() {
        let mut ctx = ExecutionContext::new();
        assert_eq!(gate("a", &ApprovalParams::default(), &mut ctx, &env(true)), Ok(None));
        assert_eq!(ctx.approval("a"), Some(true));
    }

    #[test]
    fn auto_approve_can_be_disabled() {
        let mut ctx = ExecutionContext::new();
        let params = ApprovalParams { auto_approve: Some(false) };
        let err = gate("a", &params, &mut ctx, &env(true)).unwrap_err();
        assert!(err.is_approval_required());
    }

    #[test]
    fn flag_decides_outside_test_mode() {
        let mut ctx = ExecutionContext::new();
        let params = ApprovalParams::default();
        assert!(gate("a", &params, &mut ctx, &env(false)).unwrap_err().is_approval_required());

        ctx.set_approval("a", true);
        assert_eq!(gate("a", &params, &mut ctx, &env(false)), Ok(None));

        ctx.set_approval("a", false);
        assert_eq!(
            gate("a", &params, &mut ctx, &env(false)),
            Err(HandlerError::ApprovalRejected { node_id: "a".into() })
        );
    }
}
