//! Notification fan-out and unfriendly-logout cleanup.

mod common;

use meshvault_core::network::content::content_keys;
use meshvault_core::network::data_manager::DataManager;
use meshvault_core::network::memory::MemoryDataManager;
use meshvault_core::network::messages::{NotificationPayload, PeerAddress};
use meshvault_core::network::parameters::Parameters;
use meshvault_core::notify::{notify_process, SimpleMessageFactory};
use meshvault_crypto::location_key;
use meshvault_process::execute_blocking;
use std::collections::BTreeSet;
use std::sync::Arc;

#[test]
fn unfriendly_logout_is_detected_and_pruned() {
    let overlay = MemoryDataManager::new();
    let config = common::test_config();
    let credentials = common::credentials("alice");

    // Three peers of the same user.
    let p0 = common::client(&overlay, "p0", &config);
    let p1 = common::client(&overlay, "p1", &config);
    let p2 = common::client(&overlay, "p2", &config);
    let roots = [
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
        tempfile::tempdir().unwrap(),
    ];

    p0.register(&credentials).unwrap().into_result().unwrap();
    p0.login(&credentials, roots[0].path())
        .unwrap()
        .into_result()
        .unwrap();
    p1.login(&credentials, roots[1].path())
        .unwrap()
        .into_result()
        .unwrap();
    p2.login(&credentials, roots[2].path())
        .unwrap()
        .into_result()
        .unwrap();

    // p1 dies without logging out: its receiver vanishes, its locations
    // entry stays.
    overlay.unregister_receiver(&PeerAddress::new("p1"));

    let session = p0.session().unwrap();
    let factory = SimpleMessageFactory::new(
        "alice",
        NotificationPayload::FileAdded {
            path: "x.txt".to_string(),
        },
        None,
    );
    let mut process = notify_process(
        session,
        Arc::new(factory),
        BTreeSet::from(["alice".to_string()]),
    );
    execute_blocking(&mut process).into_result().unwrap();
    let stats = process.take_result().unwrap();

    // Three peers addressed, two deliveries (p0 locally, p2 directly).
    assert_eq!(stats.sent, 3);
    assert_eq!(stats.arrived, 2);

    // The cleanup pruned p1 from the locations.
    let record = overlay
        .get(&Parameters::new(
            location_key(b"alice"),
            content_keys::LOCATIONS,
        ))
        .unwrap()
        .unwrap();
    let locations = record.content.into_locations().unwrap();
    assert_eq!(locations.entries().len(), 2);
    assert!(!locations.contains(&PeerAddress::new("p1")));
    assert!(locations.contains(&PeerAddress::new("p0")));
    assert!(locations.contains(&PeerAddress::new("p2")));

    p0.logout().unwrap().into_result().unwrap();
    p2.logout().unwrap().into_result().unwrap();
}

#[test]
fn clean_logout_transfers_the_initial_role() {
    let overlay = MemoryDataManager::new();
    let config = common::test_config();
    let credentials = common::credentials("alice");

    let p0 = common::client(&overlay, "p0", &config);
    let p1 = common::client(&overlay, "p1", &config);
    let roots = [tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap()];

    p0.register(&credentials).unwrap().into_result().unwrap();
    p0.login(&credentials, roots[0].path())
        .unwrap()
        .into_result()
        .unwrap();
    p1.login(&credentials, roots[1].path())
        .unwrap()
        .into_result()
        .unwrap();

    // The first logged-in peer is initial; its clean logout promotes the
    // remaining one.
    p0.logout().unwrap().into_result().unwrap();

    let record = overlay
        .get(&Parameters::new(
            location_key(b"alice"),
            content_keys::LOCATIONS,
        ))
        .unwrap()
        .unwrap();
    let locations = record.content.into_locations().unwrap();
    assert_eq!(locations.entries().len(), 1);
    let initial = locations.initial_peer().unwrap();
    assert_eq!(initial.peer, PeerAddress::new("p1"));

    p1.logout().unwrap().into_result().unwrap();
}
