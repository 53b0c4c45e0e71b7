//! Version retention: updating past the version cap evicts the oldest
//! versions and deletes their chunks from the overlay.

mod common;

use meshvault_core::config::FileConfiguration;
use meshvault_core::model::meta_file::FileVersion;
use meshvault_core::network::content::content_keys;
use meshvault_core::network::memory::MemoryDataManager;
use meshvault_core::processes::recover::VersionSelector;
use parking_lot::Mutex;
use std::sync::Arc;

/// Records the presented versions and aborts the recovery.
struct CaptureVersions {
    seen: Arc<Mutex<Option<Vec<usize>>>>,
}

impl VersionSelector for CaptureVersions {
    fn select(&self, versions: &[FileVersion]) -> Option<usize> {
        *self.seen.lock() = Some(versions.iter().map(|v| v.index).collect());
        None
    }
}

#[test]
fn retention_evicts_oldest_versions_and_their_chunks() {
    let overlay = MemoryDataManager::new();
    let config = FileConfiguration {
        max_num_of_versions: 3,
        max_size_all_versions: u64::MAX,
        ..common::test_config()
    };
    let client = common::client(&overlay, "alice-1", &config);
    let credentials = common::credentials("alice");
    let root = tempfile::tempdir().unwrap();

    client
        .register(&credentials)
        .unwrap()
        .into_result()
        .unwrap();
    client
        .login(&credentials, root.path())
        .unwrap()
        .into_result()
        .unwrap();

    // Version 0, then four updates: versions 1..=4.
    common::write_file(root.path(), "data.bin", &[0u8; 1024]);
    client.add_file("data.bin").unwrap().into_result().unwrap();
    for round in 1..=4u8 {
        common::write_file(root.path(), "data.bin", &[round; 1024]);
        client
            .update_file("data.bin")
            .unwrap()
            .into_result()
            .unwrap();
    }

    // The meta file must hold exactly versions {2, 3, 4}.
    let seen = Arc::new(Mutex::new(None));
    let (outcome, recovered) = client
        .recover_file(
            "data.bin",
            Arc::new(CaptureVersions { seen: seen.clone() }),
        )
        .unwrap();
    assert!(!outcome.is_succeeded(), "selection was aborted on purpose");
    assert_eq!(recovered, None);
    assert_eq!(seen.lock().clone().unwrap(), vec![2, 3, 4]);

    // One chunk per version: the chunks of versions 0 and 1 are gone.
    assert_eq!(overlay.count_records(content_keys::FILE_CHUNK), 3);

    client.logout().unwrap().into_result().unwrap();
}

#[test]
fn retention_by_total_size_keeps_at_least_one_version() {
    let overlay = MemoryDataManager::new();
    let config = FileConfiguration {
        max_num_of_versions: 100,
        // Any two 1 KiB versions exceed this, one alone also does.
        max_size_all_versions: 512,
        ..common::test_config()
    };
    let client = common::client(&overlay, "alice-1", &config);
    let credentials = common::credentials("alice");
    let root = tempfile::tempdir().unwrap();

    client
        .register(&credentials)
        .unwrap()
        .into_result()
        .unwrap();
    client
        .login(&credentials, root.path())
        .unwrap()
        .into_result()
        .unwrap();

    common::write_file(root.path(), "data.bin", &[1u8; 1024]);
    client.add_file("data.bin").unwrap().into_result().unwrap();
    common::write_file(root.path(), "data.bin", &[2u8; 1024]);
    client
        .update_file("data.bin")
        .unwrap()
        .into_result()
        .unwrap();

    // Even though one version already violates the size cap, the newest one
    // survives.
    let seen = Arc::new(Mutex::new(None));
    let (_, _) = client
        .recover_file(
            "data.bin",
            Arc::new(CaptureVersions { seen: seen.clone() }),
        )
        .unwrap();
    assert_eq!(seen.lock().clone().unwrap(), vec![1]);
    assert_eq!(overlay.count_records(content_keys::FILE_CHUNK), 1);

    client.logout().unwrap().into_result().unwrap();
}
