//! Scenario tests for the push convergence pass, driven through the
//! in-memory KMS fake.

mod common;

use common::FakeKms;
use kms_operator::crd::KMSPushSecretDestination;
use kms_operator::kms::KmsSecret;
use kms_operator::reconciler::push::{delete_managed_secrets, sync_push_secrets};
use std::collections::BTreeMap;

fn destination() -> KMSPushSecretDestination {
    KMSPushSecretDestination {
        project_id: "project-1".into(),
        environment_slug: "prod".into(),
        secrets_path: "/".into(),
    }
}

fn processed(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

fn managed(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
    entries
        .iter()
        .map(|(id, key)| (id.to_string(), key.to_string()))
        .collect()
}

#[tokio::test]
async fn first_sync_with_replace_updates_existing_and_creates_missing() {
    let kms = FakeKms::new();
    kms.seed("id-a", "A", "1");

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("A", "2"), ("B", "3")]),
        kms.snapshot(),
        None,
        true,
    )
    .await;

    assert_eq!(kms.calls(), vec!["update:A", "create:B"]);
    assert!(!outcome.has_failures());

    assert_eq!(outcome.managed.get("id-a").map(String::as_str), Some("A"));
    assert_eq!(outcome.managed.len(), 2);
    assert!(outcome.managed.values().any(|key| key == "B"));

    let remote = kms.snapshot();
    assert_eq!(remote.iter().find(|s| s.key == "A").unwrap().value, "2");
    assert_eq!(remote.iter().find(|s| s.key == "B").unwrap().value, "3");
}

#[tokio::test]
async fn first_sync_default_policy_leaves_existing_untouched() {
    let kms = FakeKms::new();
    kms.seed("id-a", "A", "1");

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("A", "2"), ("B", "3")]),
        kms.snapshot(),
        None,
        false,
    )
    .await;

    assert_eq!(kms.calls(), vec!["create:B"]);
    // The untouched pre-existing secret is not adopted.
    assert_eq!(outcome.managed.len(), 1);
    assert!(outcome.managed.values().all(|key| key == "B"));
    assert_eq!(
        kms.snapshot().iter().find(|s| s.key == "A").unwrap().value,
        "1"
    );
}

#[tokio::test]
async fn remote_rename_is_reverted_preserving_value() {
    // Remote id-1 was pushed as OLD but someone renamed it to NEW. The local
    // key wins: the drifted secret is deleted and re-created under OLD.
    let kms = FakeKms::new();
    kms.seed("id-1", "NEW", "v");

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("NEW", "v")]),
        kms.snapshot(),
        Some(managed(&[("id-1", "OLD")])),
        false,
    )
    .await;

    assert_eq!(kms.calls(), vec!["delete:NEW", "create:OLD"]);
    assert!(!outcome.has_failures());

    // Ownership moved to the fresh id, still under the local key.
    assert_eq!(outcome.managed.len(), 1);
    let (new_id, local_key) = outcome.managed.iter().next().unwrap();
    assert_ne!(new_id, "id-1");
    assert_eq!(local_key, "OLD");

    let remote = kms.snapshot();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].key, "OLD");
    assert_eq!(remote[0].value, "v");
}

#[tokio::test]
async fn removed_key_is_deleted_remotely() {
    let kms = FakeKms::new();
    kms.seed("id-x", "X", "v");

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[]),
        kms.snapshot(),
        Some(managed(&[("id-x", "X")])),
        false,
    )
    .await;

    assert_eq!(kms.calls(), vec!["delete:X"]);
    assert!(outcome.managed.is_empty());
    assert!(kms.snapshot().is_empty());
}

#[tokio::test]
async fn converged_state_issues_no_writes() {
    let kms = FakeKms::new();
    kms.seed("id-a", "A", "1");
    kms.seed("id-b", "B", "2");

    let owned = managed(&[("id-a", "A"), ("id-b", "B")]);
    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("A", "1"), ("B", "2")]),
        kms.snapshot(),
        Some(owned.clone()),
        false,
    )
    .await;

    assert!(kms.calls().is_empty());
    assert_eq!(outcome.managed, owned);
    assert!(!outcome.has_failures());
}

#[tokio::test]
async fn value_drift_on_owned_secret_is_updated() {
    let kms = FakeKms::new();
    kms.seed("id-a", "A", "old");

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("A", "new")]),
        kms.snapshot(),
        Some(managed(&[("id-a", "A")])),
        false,
    )
    .await;

    assert_eq!(kms.calls(), vec!["update:A"]);
    assert_eq!(
        kms.snapshot().iter().find(|s| s.key == "A").unwrap().value,
        "new"
    );
    assert_eq!(outcome.managed, managed(&[("id-a", "A")]));
}

#[tokio::test]
async fn unowned_match_is_untouched_without_replace() {
    let kms = FakeKms::new();
    kms.seed("id-z", "K", "theirs");

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("K", "ours")]),
        kms.snapshot(),
        Some(managed(&[])),
        false,
    )
    .await;

    assert!(kms.calls().is_empty());
    assert!(outcome.managed.is_empty());
    assert_eq!(
        kms.snapshot().iter().find(|s| s.key == "K").unwrap().value,
        "theirs"
    );
}

#[tokio::test]
async fn replace_policy_overwrites_unowned_match_and_adopts_it() {
    let kms = FakeKms::new();
    kms.seed("id-z", "K", "theirs");

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("K", "ours")]),
        kms.snapshot(),
        Some(managed(&[])),
        true,
    )
    .await;

    assert_eq!(kms.calls(), vec!["update:K"]);
    assert_eq!(outcome.managed.get("id-z").map(String::as_str), Some("K"));
    assert_eq!(
        kms.snapshot().iter().find(|s| s.key == "K").unwrap().value,
        "ours"
    );
}

#[tokio::test]
async fn per_key_failures_are_collected_without_aborting() {
    let kms = FakeKms::new();
    kms.fail_on("create:B");

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("A", "1"), ("B", "2"), ("C", "3")]),
        kms.snapshot(),
        Some(managed(&[])),
        false,
    )
    .await;

    // All three creates were attempted despite B failing.
    assert_eq!(kms.calls(), vec!["create:A", "create:B", "create:C"]);
    assert_eq!(outcome.failed_to_create, vec!["B".to_string()]);
    assert_eq!(outcome.managed.len(), 2);
    assert!(outcome.managed.values().any(|key| key == "A"));
    assert!(outcome.managed.values().any(|key| key == "C"));
}

#[tokio::test]
async fn ownership_map_stays_consistent_after_each_pass() {
    // Every id recorded after a pass corresponds to a live remote secret
    // whose key equals the recorded local key.
    let kms = FakeKms::new();
    kms.seed("id-a", "A", "1");

    let first = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("A", "1"), ("B", "2")]),
        kms.snapshot(),
        None,
        true,
    )
    .await;

    let second = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[("A", "1"), ("B", "2")]),
        kms.snapshot(),
        Some(first.managed.clone()),
        true,
    )
    .await;

    for (id, local_key) in &second.managed {
        let remote = kms.snapshot();
        let matching = remote.iter().find(|s| &s.id == id).unwrap();
        assert_eq!(&matching.key, local_key);
    }
}

#[tokio::test]
async fn deletion_sweep_removes_only_live_managed_ids() {
    let kms = FakeKms::new();
    kms.seed("id-a", "A", "1");
    kms.seed("id-other", "OTHER", "x");

    // id-b is recorded but no longer exists remotely.
    let owned = managed(&[("id-a", "A"), ("id-b", "B")]);
    delete_managed_secrets(&kms, &destination(), &owned)
        .await
        .unwrap();

    assert_eq!(kms.calls(), vec!["delete:A"]);
    let remote = kms.snapshot();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].key, "OTHER");
}

#[tokio::test]
async fn deletion_sweep_continues_past_failures() {
    let kms = FakeKms::new();
    kms.seed("id-a", "A", "1");
    kms.seed("id-b", "B", "2");
    kms.fail_on("delete:A");

    let owned = managed(&[("id-a", "A"), ("id-b", "B")]);
    delete_managed_secrets(&kms, &destination(), &owned)
        .await
        .unwrap();

    let calls = kms.calls();
    assert!(calls.contains(&"delete:A".to_string()));
    assert!(calls.contains(&"delete:B".to_string()));
    assert!(kms.snapshot().iter().any(|s| s.key == "A"));
    assert!(!kms.snapshot().iter().any(|s| s.key == "B"));
}

#[tokio::test]
async fn stale_managed_entry_for_vanished_remote_is_left_alone() {
    // The remote secret behind id-gone was deleted out of band. The pass
    // neither detects nor recreates it, and removal only fires when the key
    // still exists remotely, so the stale entry survives untouched.
    let kms = FakeKms::new();

    let outcome = sync_push_secrets(
        &kms,
        &destination(),
        &processed(&[]),
        Vec::<KmsSecret>::new(),
        Some(managed(&[("id-gone", "GONE")])),
        false,
    )
    .await;

    assert!(kms.calls().is_empty());
    assert_eq!(outcome.managed, managed(&[("id-gone", "GONE")]));
}
