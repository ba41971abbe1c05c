use crate::internal::attrs::names;
use crate::internal::capacity::amount::ResourceAmount;
use crate::internal::comm::ExitStatus;
use crate::internal::eval::Value;
use crate::internal::messages::{ActivateResponse, ClaimResponse, OpResponse, RefusalReason};
use crate::internal::slot::claim::ClaimState;
use crate::internal::slot::state::{Activity, SlotState};
use crate::internal::tests::utils::{
    StubEvaluator, TestEnv, activate_request, claim_request, job, static_config,
};
use std::time::Duration;

#[test]
fn test_claim_activate_complete_release() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let old_advertised = env.advertised_id(slot);

    let (claim_id, handle) = env.run_job(slot, job(2, 1024, 100));
    {
        let slot = env.mgr.slot(slot).unwrap();
        assert_eq!(slot.state, SlotState::Claimed);
        assert_eq!(slot.activity, Activity::Busy);
        assert_eq!(slot.current_claim().state, ClaimState::Running);
        assert!(slot.current_claim().is_populated());
    }
    assert_ne!(claim_id, old_advertised);

    env.finish_job(handle);
    {
        let slot = env.mgr.slot(slot).unwrap();
        assert_eq!(slot.state, SlotState::Claimed);
        assert_eq!(slot.activity, Activity::Idle);
        assert_eq!(slot.current_claim().state, ClaimState::Idle);
        assert!(slot.current_claim().is_populated());
    }

    assert_eq!(env.mgr.release_claim(slot, &claim_id, env.now), OpResponse::Ok);
    let released = env.mgr.slot(slot).unwrap();
    assert_eq!(released.state, SlotState::Unclaimed);
    assert!(!released.current_claim().is_populated());
    // The old token is a dead capability now.
    assert_ne!(released.advertised_claim_id(), claim_id);
}

#[test]
fn test_unknown_claim_token_refused() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let req = claim_request("bogus-token", job(1, 1, 1));
    match env.mgr.request_claim(slot, &req, env.now) {
        ClaimResponse::Refused(RefusalReason::UnknownClaimId) => {}
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(env.mgr.slot(slot).unwrap().state, SlotState::Owner);
}

#[test]
fn test_requirements_rechecked_at_claim_time() {
    let mut config = static_config(1, 4, 4096, 10000);
    config.policy.start_expr = "false".to_string();
    let mut env = TestEnv::new(config);
    let slot = env.first_slot();
    let req = claim_request(&env.advertised_id(slot), job(1, 1, 1));
    match env.mgr.request_claim(slot, &req, env.now) {
        ClaimResponse::Refused(RefusalReason::RequirementsNotMet) => {}
        other => panic!("unexpected response: {other:?}"),
    }
}

#[test]
fn test_match_notify_and_timeout() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let token = env.advertised_id(slot);
    assert_eq!(env.mgr.match_notify(slot, &token, env.now), OpResponse::Ok);
    assert_eq!(env.mgr.slot(slot).unwrap().state, SlotState::Matched);
    assert!(env.mgr.next_deadline().is_some());

    // The negotiation never arrives; the reservation lapses.
    env.tick(Duration::from_secs(121));
    assert_eq!(env.mgr.slot(slot).unwrap().state, SlotState::Unclaimed);
    assert!(env.mgr.slot(slot).unwrap().match_deadline.is_none());
}

#[test]
fn test_claim_from_matched_state() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let token = env.advertised_id(slot);
    env.mgr.match_notify(slot, &token, env.now);
    env.claim(slot, job(1, 1, 1));
    assert_eq!(env.mgr.slot(slot).unwrap().state, SlotState::Claimed);
}

#[test]
fn test_activate_requires_idle_claim() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let token = env.advertised_id(slot);
    let resp = env
        .mgr
        .activate_claim(slot, &activate_request(&token, job(1, 1, 1)), env.now);
    assert_eq!(resp, ActivateResponse::InvalidState);
}

#[test]
fn test_activate_spawn_failure() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let claim_id = env.claim(slot, job(1, 1, 1));
    env.exec.borrow_mut().fail_spawn = true;
    let resp = env
        .mgr
        .activate_claim(slot, &activate_request(&claim_id, job(1, 1, 1)), env.now);
    assert_eq!(resp, ActivateResponse::NoExecutorAvailable);
    // The claim survives a failed activation.
    let slot = env.mgr.slot(slot).unwrap();
    assert_eq!(slot.state, SlotState::Claimed);
    assert_eq!(slot.activity, Activity::Idle);
}

#[test]
fn test_deactivate_keeps_claim() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let (claim_id, handle) = env.run_job(slot, job(1, 1, 1));

    assert_eq!(
        env.mgr.deactivate_claim(slot, &claim_id, true, env.now),
        OpResponse::Ok
    );
    assert_eq!(env.last_stop(), Some((handle, true)));
    assert_eq!(env.mgr.slot(slot).unwrap().activity, Activity::Vacating);

    env.finish_job(handle);
    let slot = env.mgr.slot(slot).unwrap();
    assert_eq!(slot.state, SlotState::Claimed);
    assert_eq!(slot.activity, Activity::Idle);
    assert!(slot.current_claim().is_populated());
}

#[test]
fn test_release_of_running_job_vacates_first() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let (claim_id, handle) = env.run_job(slot, job(1, 1, 1));

    assert_eq!(env.mgr.release_claim(slot, &claim_id, env.now), OpResponse::Ok);
    assert_eq!(env.last_stop(), Some((handle, true)));
    assert_eq!(env.mgr.slot(slot).unwrap().activity, Activity::Vacating);

    env.finish_job(handle);
    let slot = env.mgr.slot(slot).unwrap();
    assert_eq!(slot.state, SlotState::Unclaimed);
    assert!(!slot.current_claim().is_populated());
}

#[test]
fn test_vacate_deadline_escalates_to_kill() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let (claim_id, handle) = env.run_job(slot, job(1, 1, 1));
    env.mgr.release_claim(slot, &claim_id, env.now);
    assert_eq!(env.mgr.slot(slot).unwrap().activity, Activity::Vacating);

    // Default vacate budget is ten minutes.
    env.tick(Duration::from_secs(601));
    assert_eq!(env.mgr.slot(slot).unwrap().activity, Activity::Killing);
    assert_eq!(env.last_stop(), Some((handle, false)));

    env.mgr.executor_exited(handle, ExitStatus::Killed, env.now);
    assert_eq!(env.mgr.slot(slot).unwrap().state, SlotState::Unclaimed);
}

#[test]
fn test_suspend_and_continue() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let (claim_id, handle) = env.run_job(slot, job(1, 1, 1));

    assert_eq!(env.mgr.suspend_claim(slot, &claim_id), OpResponse::Ok);
    assert_eq!(env.mgr.slot(slot).unwrap().activity, Activity::Suspended);
    assert_eq!(env.exec.borrow().suspended, vec![handle]);

    assert_eq!(env.mgr.continue_claim(slot, &claim_id), OpResponse::Ok);
    assert_eq!(env.mgr.slot(slot).unwrap().activity, Activity::Busy);
    assert_eq!(env.exec.borrow().resumed, vec![handle]);
}

#[test]
fn test_consumption_restored_when_claim_ends() {
    let mut eval = StubEvaluator::new();
    eval.set("CpusTake", Value::Real(2.0));
    let mut config = static_config(1, 4, 4096, 10000);
    config
        .policy
        .consumption_exprs
        .insert(names::CPUS.to_string(), "CpusTake".to_string());
    let mut env = TestEnv::with_eval(config, eval);
    let slot = env.first_slot();

    for _ in 0..3 {
        let claim_id = env.claim(slot, job(2, 1024, 100));
        {
            let slot = env.mgr.slot(slot).unwrap();
            assert_eq!(slot.free.get(names::CPUS), ResourceAmount::units(2));
            assert_eq!(slot.free.get(names::MEMORY), ResourceAmount::units(3072));
        }
        assert_eq!(env.mgr.release_claim(slot, &claim_id, env.now), OpResponse::Ok);
        // The grant's deduction comes back with the claim; claim
        // cycles must not bleed the pool dry.
        let slot = env.mgr.slot(slot).unwrap();
        assert_eq!(slot.free.get(names::CPUS), ResourceAmount::units(4));
        assert_eq!(slot.free.get(names::MEMORY), ResourceAmount::units(4096));
    }
}

#[test]
fn test_policy_suspension_blocks_requester_continue() {
    let mut eval = StubEvaluator::new();
    eval.set("HighLoad", Value::Boolean(false));
    let mut config = static_config(1, 4, 4096, 10000);
    config.policy.suspend_expr = Some("HighLoad".to_string());
    let mut env = TestEnv::with_eval(config, eval);
    let slot = env.first_slot();
    let (claim_id, handle) = env.run_job(slot, job(1, 1, 1));

    env.eval.set("HighLoad", Value::Boolean(true));
    env.evaluate();
    assert_eq!(env.mgr.slot(slot).unwrap().activity, Activity::Suspended);
    assert_eq!(env.exec.borrow().suspended, vec![handle]);

    // A policy suspension is not the requester's to undo.
    assert_eq!(env.mgr.continue_claim(slot, &claim_id), OpResponse::InvalidState);

    env.eval.set("HighLoad", Value::Boolean(false));
    env.evaluate();
    let slot_ref = env.mgr.slot(slot).unwrap();
    assert_eq!(slot_ref.activity, Activity::Busy);
    assert_eq!(slot_ref.current_claim().state, ClaimState::Running);
    assert_eq!(env.exec.borrow().resumed, vec![handle]);
}

#[test]
fn test_suspend_requires_running_job() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let claim_id = env.claim(slot, job(1, 1, 1));
    assert_eq!(env.mgr.suspend_claim(slot, &claim_id), OpResponse::InvalidState);
}

#[test]
fn test_lease_expiry_releases_claim() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    let mut req = claim_request(&env.advertised_id(slot), job(1, 1, 1));
    req.lease_interval = Some(Duration::from_secs(30));
    let claim_id = match env.mgr.request_claim(slot, &req, env.now) {
        ClaimResponse::Accepted { claim_id } => claim_id,
        other => panic!("claim refused: {other:?}"),
    };

    env.tick(Duration::from_secs(20));
    assert_eq!(env.mgr.alive(slot, &claim_id, env.now), OpResponse::Ok);

    // The keep-alive pushed the lease out; not expired yet.
    env.tick(Duration::from_secs(20));
    assert!(env.mgr.slot(slot).unwrap().current_claim().is_populated());

    env.tick(Duration::from_secs(31));
    let slot = env.mgr.slot(slot).unwrap();
    assert!(!slot.current_claim().is_populated());
    assert_eq!(slot.state, SlotState::Unclaimed);
}

#[test]
fn test_shutdown_refuses_negotiation() {
    let mut env = TestEnv::new(static_config(1, 4, 4096, 10000));
    let slot = env.first_slot();
    env.mgr.shutdown();
    assert!(env.exec.borrow().killed_all);
    let req = claim_request(&env.advertised_id(slot), job(1, 1, 1));
    match env.mgr.request_claim(slot, &req, env.now) {
        ClaimResponse::Refused(RefusalReason::ShuttingDown) => {}
        other => panic!("unexpected response: {other:?}"),
    }
}

#[test]
fn test_advertise_publishes_every_slot() {
    let mut env = TestEnv::new(static_config(3, 6, 6000, 9000));
    env.evaluate();
    let log = env.sink.borrow();
    assert_eq!(log.published.len(), 3);
    for record in &log.published {
        assert!(record.get_str("Name").unwrap().starts_with("m1_slot"));
        assert_eq!(record.get_i64("Cpus"), Some(2));
    }
}
