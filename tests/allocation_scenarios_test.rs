//! End-to-end allocation scenarios against a real state directory.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use lab_allocator::core::{
    Allocation, AllocationRequest, AllocationState, AssignHook, LocalUser, ReleaseHook, Target,
};
use lab_allocator::runtime::{list_targets, submit_request_json};

use common::{admin, alice, bob, lab, lab_with, sibling};

fn owner_of(lab: &common::Lab, target: &str) -> Option<String> {
    lab.allocator
        .registry()
        .get(target)
        .unwrap()
        .owner_id()
        .unwrap()
}

fn state_of(lab: &common::Lab, alloc_id: &str) -> AllocationState {
    lab.allocator.get(alloc_id, &admin()).unwrap().state
}

#[test]
fn test_end_to_end_preemption_scenario() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;

    let first = a
        .request(&AllocationRequest::new().group("g1", ["t0"]).priority(50), &alice())
        .unwrap();
    assert_eq!(first.state, AllocationState::Active);
    assert_eq!(first.group_allocated, Some(vec!["t0".to_string()]));
    let first_id = first.alloc_id.unwrap();

    let second = a
        .request(
            &AllocationRequest::new().group("g1", ["t0"]).priority(50).queue(true),
            &bob(),
        )
        .unwrap();
    assert_eq!(second.state, AllocationState::Queued);
    let second_id = second.alloc_id.unwrap();

    let third = a
        .request(
            &AllocationRequest::new()
                .group("g1", ["t0"])
                .priority(10)
                .preempt(true)
                .queue(true),
            &admin(),
        )
        .unwrap();
    assert_eq!(third.state, AllocationState::Active);
    let third_id = third.alloc_id.unwrap();

    assert_eq!(owner_of(&lab, "t0"), Some(third_id));
    assert_eq!(state_of(&lab, &first_id), AllocationState::RestartNeeded);
    assert_eq!(state_of(&lab, &second_id), AllocationState::Queued);

    // the evicted client learns about it once, then the record is gone
    let seen = a.keepalive(&first_id, Some(AllocationState::Active), 0, &alice()).unwrap();
    assert_eq!(seen.state, AllocationState::RestartNeeded);
    assert_eq!(state_of(&lab, &first_id), AllocationState::Invalid);
}

#[test]
fn test_higher_priority_granted_first() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let holder = a
        .request(&AllocationRequest::new().group("g", ["t0"]), &alice())
        .unwrap()
        .alloc_id
        .unwrap();
    let low = a
        .request(&AllocationRequest::new().group("g", ["t0"]).priority(20).queue(true), &bob())
        .unwrap()
        .alloc_id
        .unwrap();
    let high = a
        .request(&AllocationRequest::new().group("g", ["t0"]).priority(10).queue(true), &bob())
        .unwrap()
        .alloc_id
        .unwrap();

    a.delete(&holder, &alice()).unwrap();

    assert_eq!(state_of(&lab, &high), AllocationState::Active);
    assert_eq!(state_of(&lab, &low), AllocationState::Queued);
    assert_eq!(owner_of(&lab, "t0"), Some(high));
}

#[test]
fn test_equal_priority_granted_in_arrival_order() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let holder = a
        .request(&AllocationRequest::new().group("g", ["t0"]), &alice())
        .unwrap()
        .alloc_id
        .unwrap();
    let early = a
        .request(&AllocationRequest::new().group("g", ["t0"]).queue(true), &bob())
        .unwrap()
        .alloc_id
        .unwrap();
    // arrival is recorded with one second resolution
    thread::sleep(Duration::from_millis(1100));
    let late = a
        .request(&AllocationRequest::new().group("g", ["t0"]).queue(true), &bob())
        .unwrap()
        .alloc_id
        .unwrap();

    a.delete(&holder, &alice()).unwrap();
    assert_eq!(state_of(&lab, &early), AllocationState::Active);
    assert_eq!(state_of(&lab, &late), AllocationState::Queued);

    a.delete(&early, &bob()).unwrap();
    assert_eq!(state_of(&lab, &late), AllocationState::Active);
}

#[test]
fn test_no_preemption_without_flag() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let holder = a
        .request(&AllocationRequest::new().group("g", ["t0"]).priority(50), &alice())
        .unwrap()
        .alloc_id
        .unwrap();
    let waiter = a
        .request(
            &AllocationRequest::new().group("g", ["t0"]).priority(10).queue(true),
            &admin(),
        )
        .unwrap();

    assert_eq!(waiter.state, AllocationState::Queued);
    assert_eq!(owner_of(&lab, "t0"), Some(holder.clone()));
    assert_eq!(state_of(&lab, &holder), AllocationState::Active);
}

#[test]
fn test_preemption_needs_admin() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    a.request(&AllocationRequest::new().group("g", ["t0"]), &alice())
        .unwrap();
    let reply = a
        .request(
            &AllocationRequest::new()
                .group("g", ["t0"])
                .priority(10)
                .preempt(true)
                .queue(true),
            &bob(),
        )
        .unwrap();
    assert_eq!(reply.state, AllocationState::Rejected);
    assert!(reply.alloc_id.is_none());
    assert_eq!(a.store().ids().unwrap().len(), 1);
}

#[test]
fn test_busy_without_queue_leaves_nothing_behind() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let holder = a
        .request(&AllocationRequest::new().group("g", ["t0"]), &alice())
        .unwrap()
        .alloc_id
        .unwrap();
    let reply = a
        .request(&AllocationRequest::new().group("g", ["t0"]), &bob())
        .unwrap();
    assert_eq!(reply.state, AllocationState::Busy);
    assert!(reply.alloc_id.is_none());
    assert_eq!(a.store().ids().unwrap(), vec![holder]);
    let targets = list_targets(a).unwrap();
    assert_eq!(targets[0].queue_len, 0);
}

#[test]
fn test_losing_group_targets_are_released() {
    let lab = lab(&["t0", "t1", "t2"]);
    let a = &lab.allocator;
    let blocker = a
        .request(&AllocationRequest::new().group("g", ["t1"]), &bob())
        .unwrap()
        .alloc_id
        .unwrap();

    let reply = a
        .request(
            &AllocationRequest::new()
                .group("g1", ["t0", "t1"])
                .group("g2", ["t2"])
                .queue(true),
            &alice(),
        )
        .unwrap();
    assert_eq!(reply.state, AllocationState::Active);
    assert_eq!(reply.group_allocated, Some(vec!["t2".to_string()]));
    let alloc_id = reply.alloc_id.unwrap();

    assert_eq!(owner_of(&lab, "t0"), None);
    assert_eq!(owner_of(&lab, "t1"), Some(blocker));
    assert_eq!(owner_of(&lab, "t2"), Some(alloc_id));
    for target in list_targets(a).unwrap() {
        assert_eq!(target.queue_len, 0, "{} still has waiters", target.name);
    }
}

#[test]
fn test_group_completes_when_last_target_frees() {
    let lab = lab(&["t0", "t1"]);
    let a = &lab.allocator;
    let blocker = a
        .request(&AllocationRequest::new().group("g", ["t1"]), &bob())
        .unwrap()
        .alloc_id
        .unwrap();
    let waiting = a
        .request(&AllocationRequest::new().group("g", ["t0", "t1"]).queue(true), &alice())
        .unwrap();
    assert_eq!(waiting.state, AllocationState::Queued);
    let waiting = waiting.alloc_id.unwrap();

    a.delete(&blocker, &bob()).unwrap();

    let reply = a.get(&waiting, &alice()).unwrap();
    assert_eq!(reply.state, AllocationState::Active);
    assert_eq!(
        reply.group_allocated,
        Some(vec!["t0".to_string(), "t1".to_string()])
    );
}

#[test]
fn test_delete_is_idempotent() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let id = a
        .request(&AllocationRequest::new().group("g", ["t0"]), &alice())
        .unwrap()
        .alloc_id
        .unwrap();
    assert_eq!(a.delete(&id, &alice()).unwrap().state, AllocationState::Removed);
    assert_eq!(a.delete(&id, &alice()).unwrap().state, AllocationState::Invalid);
    assert_eq!(owner_of(&lab, "t0"), None);
}

#[test]
fn test_guest_rights() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let id = a
        .request(&AllocationRequest::new().group("g", ["t0"]).guest("bob"), &alice())
        .unwrap()
        .alloc_id
        .unwrap();

    let seen = a.get(&id, &bob()).unwrap();
    assert_eq!(seen.state, AllocationState::Active);
    assert_eq!(seen.details.unwrap().guests, vec!["bob".to_string()]);
    assert_eq!(
        a.keepalive(&id, None, 0, &bob()).unwrap().state,
        AllocationState::Rejected
    );
    assert_eq!(a.delete(&id, &bob()).unwrap().state, AllocationState::Rejected);
    assert_eq!(
        a.guest_add(&id, &bob(), "carol").unwrap().state,
        AllocationState::Rejected
    );

    assert_eq!(
        a.guest_remove(&id, &bob(), "bob").unwrap().state,
        AllocationState::Active
    );
    assert_eq!(a.get(&id, &bob()).unwrap().state, AllocationState::Rejected);

    a.guest_add(&id, &alice(), "bob").unwrap();
    assert_eq!(a.get(&id, &bob()).unwrap().state, AllocationState::Active);
    assert_eq!(a.delete(&id, &alice()).unwrap().state, AllocationState::Removed);
}

#[test]
fn test_query_only_shows_readable_allocations() {
    let lab = lab(&["t0", "t1"]);
    let a = &lab.allocator;
    let mine = a
        .request(&AllocationRequest::new().group("g", ["t0"]), &alice())
        .unwrap()
        .alloc_id
        .unwrap();
    let theirs = a
        .request(&AllocationRequest::new().group("g", ["t1"]), &bob())
        .unwrap()
        .alloc_id
        .unwrap();

    let visible = a.query(&alice()).unwrap();
    assert!(visible.contains_key(&mine));
    assert!(!visible.contains_key(&theirs));
    assert_eq!(a.query(&admin()).unwrap().len(), 2);
    assert_eq!(a.get(&theirs, &alice()).unwrap().state, AllocationState::Rejected);
}

#[test]
fn test_on_behalf_of_user_owns_the_allocation() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let id = a
        .request(
            &AllocationRequest::new().group("g", ["t0"]).on_behalf_of("bob"),
            &alice(),
        )
        .unwrap()
        .alloc_id
        .unwrap();
    let details = a.get(&id, &bob()).unwrap().details.unwrap();
    assert_eq!(details.user.as_deref(), Some("bob"));
    assert_eq!(details.creator.as_deref(), Some("alice"));
    assert_eq!(
        lab.allocator.registry().get("t0").unwrap().owner_user().unwrap().as_deref(),
        Some("bob")
    );
}

#[test]
fn test_invalid_requests_are_rejected_without_side_effects() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    for request in [
        AllocationRequest::new().group("g", ["nope"]),
        AllocationRequest::new().group("g", ["t0"]).priority(10_000),
        AllocationRequest::new().group("g", ["t0"]).endtime("yesterday"),
        AllocationRequest::new().group("g", ["t0"]).guest(""),
        AllocationRequest::new(),
    ] {
        let reply = a.request(&request, &alice()).unwrap();
        assert_eq!(reply.state, AllocationState::Rejected, "{request:?}");
    }
    assert!(a.store().ids().unwrap().is_empty());
    assert_eq!(owner_of(&lab, "t0"), None);
}

#[test]
fn test_uuid_cannot_be_replayed() {
    let lab = lab(&["t0", "t1"]);
    let a = &lab.allocator;
    let uuid = "a5e000a8-25ed-42a2-96c2-d9e361465367";
    let first = a
        .request(&AllocationRequest::new().group("g", ["t0"]).extra("uuid", uuid), &alice())
        .unwrap();
    assert_eq!(first.state, AllocationState::Active);
    let replay = a
        .request(&AllocationRequest::new().group("g", ["t1"]).extra("uuid", uuid), &alice())
        .unwrap();
    assert_eq!(replay.state, AllocationState::Rejected);
    let bogus = a
        .request(&AllocationRequest::new().group("g", ["t1"]).extra("uuid", "1234"), &alice())
        .unwrap();
    assert_eq!(bogus.state, AllocationState::Rejected);
}

#[test]
fn test_json_entry_point() {
    let lab = lab(&["t0"]);
    let reply = submit_request_json(
        &lab.allocator,
        r#"{"groups": {"g1": ["t0"]}, "priority": 30, "reason": "flashing"}"#,
        &alice(),
    )
    .unwrap();
    let json = serde_json::to_value(&reply).unwrap();
    assert_eq!(json["state"], "active");
    assert_eq!(json["group_allocated"][0], "t0");
    assert!(submit_request_json(&lab.allocator, "{not json", &alice()).is_err());
}

#[test]
fn test_vanished_owner_is_cleaned_up() {
    let lab = lab(&["t0"]);
    let t0 = lab.allocator.registry().get("t0").unwrap();
    // as left behind by a process that died mid-delete
    t0.fsdb().put("_alloc.id", "zzzzzzzz").unwrap();
    t0.fsdb().put("_alloc.priority", 0_i64).unwrap();
    t0.fsdb().put("_alloc.queue.garbage", "x").unwrap();

    let reply = lab
        .allocator
        .request(&AllocationRequest::new().group("g", ["t0"]), &alice())
        .unwrap();
    assert_eq!(reply.state, AllocationState::Active);
    assert!(t0.fsdb().keys("_alloc.queue.*").unwrap().is_empty());
}

#[derive(Default)]
struct CountingHooks {
    assigned: AtomicUsize,
    forced_releases: AtomicUsize,
    soft_releases: AtomicUsize,
}

struct Hooks(Arc<CountingHooks>);

impl AssignHook for Hooks {
    fn on_assigned(&self, _target: &Target, _allocation: &Allocation) {
        self.0.assigned.fetch_add(1, Ordering::SeqCst);
    }
}

impl ReleaseHook for Hooks {
    fn on_release(&self, _target: &Target, force: bool) {
        if force {
            self.0.forced_releases.fetch_add(1, Ordering::SeqCst);
        } else {
            self.0.soft_releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn test_hooks_run_on_assign_release_and_preempt() {
    let counts = Arc::new(CountingHooks::default());
    let lab = lab_with(
        &["t0"],
        |_| {},
        |_, _, target| {
            Ok(target
                .with_assign_hook("power", Arc::new(Hooks(Arc::clone(&counts))))
                .with_release_hook(Arc::new(Hooks(Arc::clone(&counts)))))
        },
    );
    let a = &lab.allocator;
    a.request(&AllocationRequest::new().group("g", ["t0"]).priority(50), &alice())
        .unwrap();
    let winner = a
        .request(
            &AllocationRequest::new().group("g", ["t0"]).priority(10).preempt(true),
            &admin(),
        )
        .unwrap()
        .alloc_id
        .unwrap();
    a.delete(&winner, &admin()).unwrap();

    assert_eq!(counts.assigned.load(Ordering::SeqCst), 2);
    assert_eq!(counts.soft_releases.load(Ordering::SeqCst), 1);
    assert_eq!(counts.forced_releases.load(Ordering::SeqCst), 1);
}

#[test]
fn test_two_daemons_never_hand_out_a_target_twice() {
    let lab = lab(&["t0"]);
    let other = sibling(&lab, &["t0"]);
    let held = Arc::new(AtomicBool::new(false));
    let granted = AtomicUsize::new(0);

    thread::scope(|scope| {
        for allocator in [&lab.allocator, &other] {
            for n in 0..3 {
                let held = Arc::clone(&held);
                let granted = &granted;
                scope.spawn(move || {
                    let user = LocalUser::new(format!("user{n}"));
                    for _ in 0..5 {
                        let reply = allocator
                            .request(&AllocationRequest::new().group("g", ["t0"]), &user)
                            .unwrap();
                        if reply.state != AllocationState::Active {
                            continue;
                        }
                        assert!(!held.swap(true, Ordering::SeqCst), "t0 handed out twice");
                        granted.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        held.store(false, Ordering::SeqCst);
                        let id = reply.alloc_id.unwrap();
                        assert_eq!(
                            allocator.delete(&id, &user).unwrap().state,
                            AllocationState::Removed
                        );
                    }
                });
            }
        }
    });

    assert!(granted.load(Ordering::SeqCst) > 0);
    assert!(lab.allocator.registry().get("t0").unwrap().owner_id().unwrap().is_none());
    assert!(lab.allocator.store().ids().unwrap().is_empty());
}

#[test]
fn test_concurrent_requests_cannot_share_a_uuid() {
    let names = ["t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7"];
    let lab = lab(&names);
    let other = sibling(&lab, &names);
    let uuid = "0f8fad5b-d9cb-469f-a165-70867728950e";
    let barrier = Barrier::new(names.len());
    let accepted = AtomicUsize::new(0);

    thread::scope(|scope| {
        for (n, name) in names.iter().enumerate() {
            let allocator = if n % 2 == 0 { &lab.allocator } else { &other };
            let barrier = &barrier;
            let accepted = &accepted;
            scope.spawn(move || {
                let user = LocalUser::new(format!("user{n}"));
                let request = AllocationRequest::new().group("g", [*name]).extra("uuid", uuid);
                barrier.wait();
                let reply = allocator.request(&request, &user).unwrap();
                match reply.state {
                    AllocationState::Active => {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    }
                    state => assert_eq!(state, AllocationState::Rejected),
                }
            });
        }
    });

    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(lab.allocator.store().ids().unwrap().len(), 1);
}

#[test]
fn test_priorities_above_999_keep_their_order() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let waiting = |priority| {
        a.request(
            &AllocationRequest::new().group("g", ["t0"]).priority(priority).queue(true),
            &bob(),
        )
        .unwrap()
        .alloc_id
        .unwrap()
    };
    let holder = a
        .request(&AllocationRequest::new().group("g", ["t0"]), &alice())
        .unwrap()
        .alloc_id
        .unwrap();
    let p9000 = waiting(9000);
    let p1000 = waiting(1000);
    let p999 = waiting(999);

    a.delete(&holder, &alice()).unwrap();
    assert_eq!(state_of(&lab, &p999), AllocationState::Active);

    a.delete(&p999, &bob()).unwrap();
    assert_eq!(state_of(&lab, &p1000), AllocationState::Active);
    assert_eq!(state_of(&lab, &p9000), AllocationState::Queued);
    assert_eq!(
        a.registry().get("t0").unwrap().owner_priority().unwrap(),
        Some(1_000_000)
    );
}

#[test]
fn test_preemption_with_priorities_above_999() {
    let lab = lab(&["t0"]);
    let a = &lab.allocator;
    let holder = a
        .request(&AllocationRequest::new().group("g", ["t0"]).priority(5000), &alice())
        .unwrap()
        .alloc_id
        .unwrap();

    let lower = a
        .request(
            &AllocationRequest::new()
                .group("g", ["t0"])
                .priority(9000)
                .preempt(true)
                .queue(true),
            &admin(),
        )
        .unwrap();
    assert_eq!(lower.state, AllocationState::Queued);
    assert_eq!(owner_of(&lab, "t0"), Some(holder.clone()));

    let higher = a
        .request(
            &AllocationRequest::new()
                .group("g", ["t0"])
                .priority(1000)
                .preempt(true)
                .queue(true),
            &admin(),
        )
        .unwrap();
    assert_eq!(higher.state, AllocationState::Active);
    assert_eq!(owner_of(&lab, "t0"), higher.alloc_id);
    assert_eq!(state_of(&lab, &holder), AllocationState::RestartNeeded);
    assert_eq!(
        state_of(&lab, &lower.alloc_id.unwrap()),
        AllocationState::Queued
    );
}

#[test]
fn test_failed_enqueue_leaves_nothing_behind() {
    let lab = lab(&["t0", "t1"]);
    let a = &lab.allocator;
    let uuid = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
    let t1_dir = a.registry().get("t1").unwrap().fsdb().location().to_path_buf();
    std::fs::remove_dir_all(&t1_dir).unwrap();
    std::fs::write(&t1_dir, b"not a directory").unwrap();

    let request = AllocationRequest::new()
        .group("g", ["t0", "t1"])
        .queue(true)
        .extra("uuid", uuid);
    assert!(a.request(&request, &alice()).is_err());
    assert!(a.store().ids().unwrap().is_empty());
    let t0 = a.registry().get("t0").unwrap();
    assert!(t0.fsdb().keys("_alloc.queue.*").unwrap().is_empty());
    assert_eq!(owner_of(&lab, "t0"), None);

    // the uuid was never used, so it is still available
    std::fs::remove_file(&t1_dir).unwrap();
    std::fs::create_dir_all(&t1_dir).unwrap();
    let retried = a.request(&request, &alice()).unwrap();
    assert_eq!(retried.state, AllocationState::Active);
}
