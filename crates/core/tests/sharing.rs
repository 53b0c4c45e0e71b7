//! Sharing a folder and converging on a friend's update.

mod common;

use meshvault_core::model::tree::PermissionType;
use meshvault_core::network::memory::MemoryDataManager;
use meshvault_crypto::ContentDigest;
use std::path::Path;

#[test]
fn share_then_update_by_friend_converges() {
    let overlay = MemoryDataManager::new();
    let config = common::test_config();
    let alice = common::credentials("alice");
    let bob = common::credentials("bob");

    let client_a = common::client(&overlay, "alice-1", &config);
    let client_b = common::client(&overlay, "bob-1", &config);
    let root_a = tempfile::tempdir().unwrap();
    let root_b = tempfile::tempdir().unwrap();

    client_a.register(&alice).unwrap().into_result().unwrap();
    client_b.register(&bob).unwrap().into_result().unwrap();
    client_a
        .login(&alice, root_a.path())
        .unwrap()
        .into_result()
        .unwrap();
    client_b
        .login(&bob, root_b.path())
        .unwrap()
        .into_result()
        .unwrap();

    // Alice publishes a folder with one file and shares it with Bob.
    common::write_file(root_a.path(), "shared/doc.txt", b"first draft");
    client_a.add_file("shared").unwrap().into_result().unwrap();
    client_a
        .add_file("shared/doc.txt")
        .unwrap()
        .into_result()
        .unwrap();
    client_a
        .share_folder("shared", "bob", PermissionType::Write)
        .unwrap()
        .into_result()
        .unwrap();

    // The share task reached Bob's profile through his message queue.
    {
        let session = client_b.session().unwrap();
        let manager = session.profile_manager();
        let pid = manager.new_process_id();
        let profile = manager.get_user_profile(pid, false).unwrap();
        assert!(
            profile
                .tree()
                .find_by_path(Path::new("shared/doc.txt"))
                .is_some(),
            "shared subtree missing from bob's profile"
        );
    }

    // Bob can open the shared content.
    client_b
        .download_file("shared/doc.txt")
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(
        std::fs::read(root_b.path().join("shared/doc.txt")).unwrap(),
        b"first draft"
    );

    // Bob writes a new version; the share keys authorize his puts.
    common::write_file(root_b.path(), "shared/doc.txt", b"second draft by bob");
    client_b
        .update_file("shared/doc.txt")
        .unwrap()
        .into_result()
        .unwrap();
    let bob_digest = ContentDigest::from_file(&root_b.path().join("shared/doc.txt")).unwrap();

    // Alice's next profile read reflects Bob's version.
    {
        let session = client_a.session().unwrap();
        let manager = session.profile_manager();
        let pid = manager.new_process_id();
        let profile = manager.get_user_profile(pid, false).unwrap();
        let node = profile
            .tree()
            .find_by_path(Path::new("shared/doc.txt"))
            .unwrap();
        let digest = profile.tree().node(node).unwrap().file_digest().unwrap();
        assert_eq!(digest, bob_digest);
    }

    // And the bytes round-trip back to Alice's disk.
    client_a
        .download_file("shared/doc.txt")
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(
        std::fs::read(root_a.path().join("shared/doc.txt")).unwrap(),
        b"second draft by bob"
    );

    client_a.logout().unwrap().into_result().unwrap();
    client_b.logout().unwrap().into_result().unwrap();
}
