//! Registration and credential checks.

mod common;

use meshvault_core::model::credentials::UserCredentials;
use meshvault_core::network::content::content_keys;
use meshvault_core::network::memory::MemoryDataManager;

#[test]
fn duplicate_registration_is_rejected() {
    let overlay = MemoryDataManager::new();
    let config = common::test_config();
    let credentials = common::credentials("alice");
    let client = common::client(&overlay, "alice-1", &config);

    client
        .register(&credentials)
        .unwrap()
        .into_result()
        .unwrap();
    let second = client.register(&credentials).unwrap();
    assert!(!second.is_succeeded());

    // The records of the first registration are untouched.
    assert_eq!(overlay.count_records(content_keys::USER_PROFILE), 1);
    assert_eq!(overlay.count_records(content_keys::USER_PUBLIC_KEY), 1);
    assert_eq!(overlay.count_records(content_keys::LOCATIONS), 1);
}

#[test]
fn login_with_wrong_credentials_fails() {
    let overlay = MemoryDataManager::new();
    let config = common::test_config();
    let credentials = common::credentials("alice");
    let client = common::client(&overlay, "alice-1", &config);
    let root = tempfile::tempdir().unwrap();

    client
        .register(&credentials)
        .unwrap()
        .into_result()
        .unwrap();

    // A wrong password derives a different profile location; the profile is
    // simply not found there.
    let wrong = UserCredentials::new("alice", "wrong-password", "1234");
    let outcome = client.login(&wrong, root.path()).unwrap();
    assert!(!outcome.is_succeeded());
    assert!(client.session().is_err());
}

#[test]
fn registration_creates_an_empty_locations_record() {
    let overlay = MemoryDataManager::new();
    let config = common::test_config();
    let credentials = common::credentials("alice");
    let client = common::client(&overlay, "alice-1", &config);

    client
        .register(&credentials)
        .unwrap()
        .into_result()
        .unwrap();

    use meshvault_core::network::data_manager::DataManager;
    use meshvault_core::network::parameters::Parameters;
    let record = overlay
        .get(&Parameters::new(
            meshvault_crypto::location_key(b"alice"),
            content_keys::LOCATIONS,
        ))
        .unwrap()
        .unwrap();
    let locations = record.content.into_locations().unwrap();
    assert!(locations.is_empty());
}
