//! Per-slot health state machine. Pure: no I/O, no shared state.
//!
//! The telemetry loop turns each probe outcome into a [`Trigger`], asks
//! [`decide`] for the next state, and applies the returned [`Decision`].

use crate::chassis::{SlotState, SlotType};

/// Probe outcomes that can move a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    PowerOn,
    PowerOff,
    /// Power-enable probe failed; never a transition trigger.
    PowerUnknown,
    ReinitSucceeded,
    ReinitFailed,
    ThermalOk,
    ThermalFailed,
    LivenessOk,
    LivenessFailed,
}

impl Trigger {
    pub const ALL: [Trigger; 9] = [
        Trigger::PowerOn,
        Trigger::PowerOff,
        Trigger::PowerUnknown,
        Trigger::ReinitSucceeded,
        Trigger::ReinitFailed,
        Trigger::ThermalOk,
        Trigger::ThermalFailed,
        Trigger::LivenessOk,
        Trigger::LivenessFailed,
    ];
}

/// Slot facts the decision depends on besides its state.
#[derive(Debug, Clone, Copy)]
pub struct SlotContext {
    pub slot_type: SlotType,
    pub fail_count: u32,
    pub max_fail_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub state: SlotState,
    pub fail_count: u32,
}

impl Decision {
    fn to(state: SlotState, fail_count: u32) -> Self {
        Self { state, fail_count }
    }
}

/// A Fail-state slot whose counter is already past the limit goes straight
/// to Initialization without another liveness probe.
pub fn retry_budget_exhausted(ctx: &SlotContext) -> bool {
    ctx.fail_count > ctx.max_fail_count
}

pub fn decide(state: SlotState, trigger: Trigger, ctx: &SlotContext) -> Decision {
    use SlotState::*;
    use Trigger::*;

    let keep = Decision::to(state, ctx.fail_count);
    let jbod = ctx.slot_type == SlotType::Jbod;

    match (state, trigger) {
        (HardPowerOff, PowerOn) => Decision::to(Initialization, ctx.fail_count),
        (HardPowerOff, _) => keep,

        (_, PowerOff) => Decision::to(HardPowerOff, ctx.fail_count),

        (Initialization, ReinitSucceeded) => Decision::to(Probation, 0),
        (Initialization, ReinitFailed) => Decision::to(Fail, ctx.fail_count),

        (Probation | Healthy, ThermalOk) if !jbod => Decision::to(Healthy, 0),
        (Probation | Healthy, ThermalFailed) if !jbod => Decision::to(Fail, ctx.fail_count),
        (Probation | Healthy, LivenessOk) if jbod => Decision::to(Healthy, 0),
        (Probation | Healthy, LivenessFailed) if jbod => Decision::to(Fail, ctx.fail_count),

        (Fail, LivenessOk) => {
            if retry_budget_exhausted(ctx) {
                Decision::to(Initialization, ctx.fail_count)
            } else {
                Decision::to(Probation, ctx.fail_count)
            }
        }
        (Fail, LivenessFailed) => {
            let fail_count = ctx.fail_count.saturating_add(1);
            if fail_count > ctx.max_fail_count {
                Decision::to(Initialization, fail_count)
            } else {
                Decision::to(Fail, fail_count)
            }
        }

        _ => keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SlotState::*;
    use Trigger::*;

    fn ctx(slot_type: SlotType, fail_count: u32) -> SlotContext {
        SlotContext {
            slot_type,
            fail_count,
            max_fail_count: 2,
        }
    }

    fn next(state: SlotState, trigger: Trigger) -> SlotState {
        decide(state, trigger, &ctx(SlotType::Compute, 0)).state
    }

    /// Every (state, trigger) pair for a compute sled with a fresh counter.
    #[test]
    fn test_transition_table_is_total_for_compute() {
        let expected = |state: SlotState, trigger: Trigger| -> SlotState {
            match (state, trigger) {
                (HardPowerOff, PowerOn) => Initialization,
                (HardPowerOff, _) => HardPowerOff,
                (_, PowerOff) => HardPowerOff,
                (Initialization, ReinitSucceeded) => Probation,
                (Initialization, ReinitFailed) => Fail,
                (Probation | Healthy, ThermalOk) => Healthy,
                (Probation | Healthy, ThermalFailed) => Fail,
                (Fail, LivenessOk) => Probation,
                (s, _) => s,
            }
        };

        for state in [HardPowerOff, Initialization, Probation, Healthy, Fail] {
            for trigger in Trigger::ALL {
                assert_eq!(
                    next(state, trigger),
                    expected(state, trigger),
                    "{:?} + {:?}",
                    state,
                    trigger
                );
            }
        }
    }

    #[test]
    fn test_power_unknown_never_moves_a_slot() {
        for state in [HardPowerOff, Initialization, Probation, Healthy, Fail] {
            assert_eq!(next(state, PowerUnknown), state);
        }
    }

    #[test]
    fn test_jbod_uses_liveness_not_thermal() {
        let jbod = ctx(SlotType::Jbod, 0);
        assert_eq!(decide(Probation, LivenessOk, &jbod).state, Healthy);
        assert_eq!(decide(Healthy, LivenessFailed, &jbod).state, Fail);
        // Thermal outcomes are not triggers for a JBOD.
        assert_eq!(decide(Healthy, ThermalFailed, &jbod).state, Healthy);
        assert_eq!(decide(Probation, ThermalOk, &jbod).state, Probation);
        // Liveness outcomes are not triggers for a compute sled outside Fail.
        assert_eq!(next(Healthy, LivenessFailed), Healthy);
    }

    #[test]
    fn test_success_resets_fail_count() {
        let c = ctx(SlotType::Compute, 2);
        assert_eq!(
            decide(Initialization, ReinitSucceeded, &c),
            Decision {
                state: Probation,
                fail_count: 0
            }
        );
        assert_eq!(
            decide(Probation, ThermalOk, &c),
            Decision {
                state: Healthy,
                fail_count: 0
            }
        );
    }

    #[test]
    fn test_fail_counts_up_then_forces_reinit() {
        let mut state = Fail;
        let mut fail_count = 0;
        let mut seen = Vec::new();
        for _ in 0..3 {
            let d = decide(state, LivenessFailed, &ctx(SlotType::Compute, fail_count));
            state = d.state;
            fail_count = d.fail_count;
            seen.push((state, fail_count));
        }
        assert_eq!(seen, vec![(Fail, 1), (Fail, 2), (Initialization, 3)]);
    }

    #[test]
    fn test_fail_liveness_ok_over_budget_reinitializes() {
        assert_eq!(
            decide(Fail, LivenessOk, &ctx(SlotType::Compute, 3)).state,
            Initialization
        );
        assert_eq!(decide(Fail, LivenessOk, &ctx(SlotType::Compute, 2)).state, Probation);
        assert!(retry_budget_exhausted(&ctx(SlotType::Compute, 3)));
        assert!(!retry_budget_exhausted(&ctx(SlotType::Compute, 2)));
    }
}
