use crate::internal::manager::config::PolicyConfig;
use crate::internal::manager::drain::DrainEpoch;
use crate::internal::slot::state::SlotState;

/// Assembles the requirement (availability) expression a slot advertises.
///
/// The expression is a function of the slot's state, the configured start
/// policy and the active drain epoch; the drain epoch is passed in
/// explicitly rather than read from any shared mutable state.
pub fn requirements_expr(
    policy: &PolicyConfig,
    drain: Option<&DrainEpoch>,
    state: SlotState,
) -> String {
    if matches!(state, SlotState::Drained | SlotState::Delete) {
        return "false".to_string();
    }
    let start = match drain {
        // Once every pre-drain claim has ended no new work may start.
        Some(epoch) if epoch.final_phase => "false",
        // While draining, the drain request's start expression (if any)
        // replaces the normal one; with none supplied nothing may start.
        Some(epoch) => epoch.start_expr.as_deref().unwrap_or("false"),
        None => policy.start_expr.as_str(),
    };
    match &policy.slot_limit_expr {
        Some(limit) => format!("({start}) && ({limit})"),
        None => start.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PolicyConfig {
        PolicyConfig {
            start_expr: "start".to_string(),
            ..Default::default()
        }
    }

    fn epoch(start_expr: Option<&str>) -> DrainEpoch {
        DrainEpoch::for_tests(start_expr.map(|s| s.to_string()))
    }

    #[test]
    fn test_normal_state_uses_start_policy() {
        assert_eq!(requirements_expr(&policy(), None, SlotState::Unclaimed), "start");
    }

    #[test]
    fn test_drained_slot_never_available() {
        assert_eq!(requirements_expr(&policy(), None, SlotState::Drained), "false");
        let e = epoch(Some("true"));
        assert_eq!(requirements_expr(&policy(), Some(&e), SlotState::Drained), "false");
    }

    #[test]
    fn test_drain_start_expr_substitutes() {
        let e = epoch(Some("AcceptBackfill"));
        assert_eq!(
            requirements_expr(&policy(), Some(&e), SlotState::Unclaimed),
            "AcceptBackfill"
        );
        let none = epoch(None);
        assert_eq!(
            requirements_expr(&policy(), Some(&none), SlotState::Unclaimed),
            "false"
        );
    }

    #[test]
    fn test_machine_limit_is_anded() {
        let mut p = policy();
        p.slot_limit_expr = Some("TotalLoad < 10".to_string());
        assert_eq!(
            requirements_expr(&p, None, SlotState::Owner),
            "(start) && (TotalLoad < 10)"
        );
    }
}
