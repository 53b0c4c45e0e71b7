//! Scheduling behavior of the profile queue: reader piggy-backing and the
//! bounded modification window.

mod common;

use meshvault_core::config::TimeToLive;
use meshvault_core::error::CoreError;
use meshvault_core::network::memory::MemoryDataManager;
use meshvault_core::profile_manager::UserProfileManager;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn concurrent_readers_piggy_back_on_one_round_trip() {
    // A slow overlay makes the piggy-backing window observable.
    let overlay = MemoryDataManager::with_latency(Duration::from_millis(100));
    let credentials = common::credentials("alice");
    common::store_profile(&overlay, &credentials);

    let manager = Arc::new(
        UserProfileManager::new(
            Arc::new(overlay.clone()),
            credentials,
            &common::test_config(),
            &TimeToLive::default(),
        )
        .unwrap(),
    );

    let baseline = overlay.get_count();
    let mut handles = Vec::new();
    for _ in 0..5 {
        let manager = manager.clone();
        handles.push(std::thread::spawn(move || {
            let pid = manager.new_process_id();
            manager.get_user_profile(pid, false).unwrap()
        }));
    }
    let profiles: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Exactly one overlay get served all five readers.
    assert_eq!(overlay.get_count() - baseline, 1);
    let version = profiles[0].version_key();
    assert!(version.is_some());
    for profile in &profiles {
        assert_eq!(profile.version_key(), version);
    }

    manager.stop();
}

#[test]
fn lapsed_modifier_fails_and_the_next_one_succeeds() {
    let overlay = MemoryDataManager::new();
    let credentials = common::credentials("alice");
    let initial_version = common::store_profile(&overlay, &credentials);

    let manager = UserProfileManager::new(
        Arc::new(overlay.clone()),
        credentials.clone(),
        &common::test_config(),
        &TimeToLive::default(),
    )
    .unwrap();

    // Modifier A oversleeps its window.
    let pid_a = manager.new_process_id();
    let profile_a = manager.get_user_profile(pid_a, true).unwrap();
    std::thread::sleep(Duration::from_millis(1500));
    let error = manager.ready_to_put(profile_a, pid_a).unwrap_err();
    match error {
        CoreError::PutFailed(message) => {
            assert_eq!(message, "Too long modification. Only 1000ms are allowed.")
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // No put happened on A's behalf.
    assert_eq!(
        common::stored_profile_version(&overlay, &credentials),
        Some(initial_version)
    );

    // Modifier B gets a fresh window and commits.
    let pid_b = manager.new_process_id();
    let profile_b = manager.get_user_profile(pid_b, true).unwrap();
    manager.ready_to_put(profile_b, pid_b).unwrap();

    let committed = common::stored_profile_version(&overlay, &credentials);
    assert!(committed.is_some());
    assert_ne!(committed, Some(initial_version));

    manager.stop();
}

#[test]
fn modifier_takes_precedence_and_readers_share_its_round_trip() {
    let overlay = MemoryDataManager::with_latency(Duration::from_millis(50));
    let credentials = common::credentials("alice");
    common::store_profile(&overlay, &credentials);

    let manager = Arc::new(
        UserProfileManager::new(
            Arc::new(overlay.clone()),
            credentials,
            &common::test_config(),
            &TimeToLive::default(),
        )
        .unwrap(),
    );

    let baseline = overlay.get_count();
    let modifier = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            let pid = manager.new_process_id();
            let profile = manager.get_user_profile(pid, true).unwrap();
            manager.ready_to_put(profile, pid).unwrap();
        })
    };
    let reader = {
        let manager = manager.clone();
        std::thread::spawn(move || {
            let pid = manager.new_process_id();
            manager.get_user_profile(pid, false).unwrap()
        })
    };
    modifier.join().unwrap();
    reader.join().unwrap();

    // Both were served by a single get (the reader piggy-backed on the
    // modifier's cycle) unless scheduling put them in separate cycles.
    assert!(overlay.get_count() - baseline <= 2);

    manager.stop();
}
