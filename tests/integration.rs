//! Integration tests for the clinical record vault.

use clinvault::{
    AuditDetails, ChangeType, ContributionDataType, ContributionState, EhrCreateRequest, FolderId,
    FolderNode, FolderSpec, ObjectId, ObjectRef, StatusInput, SubjectRef, Timestamp, Vault,
    VaultConfig, VaultError,
};
use serde_json::json;
use tempfile::TempDir;

fn test_vault(dir: &TempDir) -> Vault {
    Vault::create(VaultConfig {
        path: dir.path().join("vault"),
        ..Default::default()
    })
    .unwrap()
}

fn t(micros: i64) -> Timestamp {
    Timestamp(micros)
}

fn subject(id: &str) -> SubjectRef {
    SubjectRef::new("test.namespace", id)
}

fn audit() -> AuditDetails {
    AuditDetails::default()
}

/// Depth 3 with at least two children per level, items on several nodes.
fn deep_spec() -> FolderSpec {
    FolderSpec::new("root")
        .with_item(ObjectRef::new(ObjectId(9000), "local", "COMPOSITION"))
        .with_child(
            FolderSpec::new("episodes")
                .with_child(
                    FolderSpec::new("2025")
                        .with_item(ObjectRef::new(ObjectId(9001), "local", "COMPOSITION"))
                        .with_item(ObjectRef::new(ObjectId(9002), "local", "COMPOSITION")),
                )
                .with_child(FolderSpec::new("2026")),
        )
        .with_child(
            FolderSpec::new("reports")
                .with_child(FolderSpec::new("labs"))
                .with_child(FolderSpec::new("imaging").inactive()),
        )
}

fn names(node: &FolderNode) -> Vec<&str> {
    node.children.iter().map(|c| c.name.as_str()).collect()
}

// --- Workflow Tests ---

#[test]
fn test_ehr_lifecycle_workflow() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(
            EhrCreateRequest::new(subject("patient-1"))
                .with_other_details(json!({"birth_year": 1974}))
                .with_audit(AuditDetails::described("registration")),
            t(1_000),
        )
        .unwrap();

    // The status and its audit trail are in place.
    let status = vault.status(ehr).unwrap();
    assert_eq!(status.other_details, Some(json!({"birth_year": 1974})));
    let contribution = vault.contribution(status.in_contribution).unwrap();
    assert_eq!(contribution.change_type, ChangeType::Creation);
    assert_eq!(contribution.description.as_deref(), Some("registration"));
    assert_eq!(contribution.ehr_id, Some(ehr));

    // Update the status; a fresh modification contribution is recorded.
    let changed = vault
        .update_status_at(
            ehr,
            &StatusInput {
                is_queryable: false,
                other_details: Some(json!({"birth_year": 1974})),
                ..Default::default()
            },
            false,
            t(2_000),
            &audit(),
        )
        .unwrap();
    assert!(changed);

    let status2 = vault.status(ehr).unwrap();
    assert_eq!(status2.id, status.id);
    assert!(!status2.is_queryable);
    assert_ne!(status2.in_contribution, status.in_contribution);
    let contribution2 = vault.contribution(status2.in_contribution).unwrap();
    assert_eq!(contribution2.change_type, ChangeType::Modification);
}

#[test]
fn test_directory_workflow() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("patient-1")), t(1_000))
        .unwrap();
    let root = vault
        .create_directory_at(ehr, &deep_spec(), t(2_000), &audit())
        .unwrap();

    assert_eq!(vault.ehr(ehr).unwrap().directory, Some(root));

    let tree = vault.directory(ehr).unwrap();
    assert_eq!(tree.id, root);
    assert_eq!(tree.node_count(), 7);

    // Every node and edge of the build shares one contribution.
    let contribution = tree.in_contribution;
    fn check_contribution(node: &FolderNode, expected: clinvault::ContributionId) {
        assert_eq!(node.in_contribution, expected);
        for child in &node.children {
            check_contribution(child, expected);
        }
    }
    check_contribution(&tree, contribution);
    assert_eq!(
        vault.contribution(contribution).unwrap().data_type,
        ContributionDataType::Folder
    );

    // A second directory for the same EHR is refused.
    let err = vault
        .create_directory_at(ehr, &FolderSpec::new("other"), t(3_000), &audit())
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidState(_)));
}

// --- Versioning Monotonicity ---

#[test]
fn test_status_version_increases_by_one_per_update() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t(1_000))
        .unwrap();

    for version in 2..=5u32 {
        let at = t(1_000 * version as i64);
        vault
            .update_status_at(
                ehr,
                &StatusInput {
                    other_details: Some(json!({ "revision": version })),
                    ..Default::default()
                },
                false,
                at,
                &audit(),
            )
            .unwrap();
        assert_eq!(vault.status_version_at(ehr, at).unwrap(), version);
    }

    // Every prior version stays retrievable by ordinal.
    for version in 1..=5u32 {
        let row = vault.status_at_version(ehr, version).unwrap();
        if version == 1 {
            assert_eq!(row.other_details, None);
        } else {
            assert_eq!(row.other_details, Some(json!({ "revision": version })));
        }
    }
    assert!(vault.status_has_previous_version(ehr).unwrap());
}

#[test]
fn test_folder_version_increases_by_one_per_update() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t(500))
        .unwrap();
    let root = vault
        .create_directory_at(ehr, &FolderSpec::new("v1"), t(1_000), &audit())
        .unwrap();
    assert_eq!(vault.folder_latest_version(root).unwrap(), 1);

    for version in 2..=4u32 {
        let at = t(1_000 * version as i64);
        vault
            .update_folder_tree_at(root, &FolderSpec::new(format!("v{version}")), at, &audit())
            .unwrap();
        assert_eq!(vault.folder_version_at(root, at).unwrap(), version);
        assert_eq!(vault.folder_latest_version(root).unwrap(), version);
    }
    assert!(vault.folder_has_previous_version(root));
}

// --- Atomicity ---

#[test]
fn test_failed_build_leaves_no_rows() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t(1_000))
        .unwrap();
    let stats_before = vault.stats();

    // A child deep in the tree is invalid; the parent and valid siblings
    // staged before it must not survive.
    let bad = FolderSpec::new("root")
        .with_child(FolderSpec::new("ok").with_child(FolderSpec::new("fine")))
        .with_child(FolderSpec::new("   "));
    let err = vault
        .create_directory_at(ehr, &bad, t(2_000), &audit())
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidArgument(_)));

    let stats_after = vault.stats();
    assert_eq!(stats_after.folder_count, 0);
    assert_eq!(stats_after.edge_count, 0);
    assert_eq!(stats_after.contribution_count, stats_before.contribution_count);
    assert_eq!(vault.ehr(ehr).unwrap().directory, None);
}

// --- Round-Trip ---

#[test]
fn test_build_retrieve_roundtrip_preserves_structure() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t(500))
        .unwrap();
    let root = vault
        .create_directory_at(ehr, &deep_spec(), t(1_000), &audit())
        .unwrap();

    let tree = vault.folder_tree(root).unwrap();
    assert_eq!(tree.name, "root");
    assert_eq!(tree.archetype_node_id, "openEHR-EHR-FOLDER.generic.v1");
    assert_eq!(tree.items, vec![ObjectRef::new(ObjectId(9000), "local", "COMPOSITION")]);
    assert_eq!(names(&tree), ["episodes", "reports"]);

    let episodes = &tree.children[0];
    assert_eq!(names(episodes), ["2025", "2026"]);
    assert_eq!(
        episodes.children[0].items,
        vec![
            ObjectRef::new(ObjectId(9001), "local", "COMPOSITION"),
            ObjectRef::new(ObjectId(9002), "local", "COMPOSITION"),
        ]
    );
    assert!(episodes.children[1].items.is_empty());

    let reports = &tree.children[1];
    assert_eq!(names(reports), ["labs", "imaging"]);
    assert!(reports.children[0].active);
    assert!(!reports.children[1].active);
}

// --- Replace Semantics ---

#[test]
fn test_update_is_full_replace_and_history_survives() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t(500))
        .unwrap();
    let root = vault
        .create_directory_at(ehr, &deep_spec(), t(1_000), &audit())
        .unwrap();
    let old_child_ids: Vec<FolderId> = vault
        .folder_tree(root)
        .unwrap()
        .children
        .iter()
        .map(|c| c.id)
        .collect();

    let replacement = FolderSpec::new("root")
        .with_child(FolderSpec::new("archive").with_item(ObjectRef::new(
            ObjectId(9100),
            "local",
            "COMPOSITION",
        )));
    let changed = vault
        .update_folder_tree_at(root, &replacement, t(2_000), &audit())
        .unwrap();
    assert!(changed);

    // The current tree is exactly the replacement.
    let tree = vault.folder_tree(root).unwrap();
    assert_eq!(tree.id, root);
    assert_eq!(tree.node_count(), 2);
    assert_eq!(names(&tree), ["archive"]);

    // Old nodes are no longer reachable as current trees.
    for id in &old_child_ids {
        assert!(matches!(
            vault.folder_tree(*id),
            Err(VaultError::FolderNotFound(_))
        ));
    }

    // The pre-update instant still reconstructs the original tree.
    let before = vault.folder_tree_at(root, t(1_500)).unwrap();
    assert_eq!(before.node_count(), 7);
    assert_eq!(names(&before), ["episodes", "reports"]);
    assert_eq!(before.items[0].object_id, ObjectId(9000));
}

// --- Timestamp Resolution Boundaries ---

#[test]
fn test_tree_at_boundaries() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let t0 = t(10_000);
    let t1 = t(20_000);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t(500))
        .unwrap();
    let root = vault
        .create_directory_at(
            ehr,
            &FolderSpec::new("before").with_child(FolderSpec::new("old")),
            t0,
            &audit(),
        )
        .unwrap();
    vault
        .update_folder_tree_at(
            root,
            &FolderSpec::new("after").with_child(FolderSpec::new("new")),
            t1,
            &audit(),
        )
        .unwrap();

    // Before creation: no version.
    assert!(matches!(
        vault.folder_tree_at(root, t(9_999)),
        Err(VaultError::NoVersionAtTime(_))
    ));

    // t0 <= at < t1: the original tree.
    for at in [t0, t(15_000), t(19_999)] {
        let tree = vault.folder_tree_at(root, at).unwrap();
        assert_eq!(tree.name, "before");
        assert_eq!(names(&tree), ["old"]);
    }

    // at >= t1: the replacement.
    for at in [t1, t(25_000)] {
        let tree = vault.folder_tree_at(root, at).unwrap();
        assert_eq!(tree.name, "after");
        assert_eq!(names(&tree), ["new"]);
    }

    // Contribution resolution follows the same boundary.
    let c1 = vault.folder_contribution_at(root, t(15_000)).unwrap();
    let c2 = vault.folder_contribution_at(root, t(25_000)).unwrap();
    assert_ne!(c1, c2);
    assert_eq!(
        vault.contribution(c2).unwrap().change_type,
        ChangeType::Modification
    );
}

#[test]
fn test_status_version_at_boundaries() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let t0 = t(10_000);
    let t1 = t(20_000);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t0)
        .unwrap();
    vault
        .update_status_at(
            ehr,
            &StatusInput {
                is_modifiable: false,
                ..Default::default()
            },
            false,
            t1,
            &audit(),
        )
        .unwrap();

    assert!(matches!(
        vault.status_version_at(ehr, t(9_999)),
        Err(VaultError::NoVersionAtTime(_))
    ));
    assert_eq!(vault.status_version_at(ehr, t0).unwrap(), 1);
    assert_eq!(vault.status_version_at(ehr, t(19_999)).unwrap(), 1);
    assert_eq!(vault.status_version_at(ehr, t1).unwrap(), 2);
    assert_eq!(vault.status_version_at(ehr, t(99_999)).unwrap(), 2);
}

// --- Subject Uniqueness ---

#[test]
fn test_subject_uniqueness() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    vault
        .create_ehr(EhrCreateRequest::new(subject("patient-1")))
        .unwrap();

    let err = vault
        .create_ehr(EhrCreateRequest::new(subject("patient-1")))
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidArgument(_)));

    // A different subject in the same namespace is fine.
    vault
        .create_ehr(EhrCreateRequest::new(subject("patient-2")))
        .unwrap();
    assert_eq!(vault.stats().ehr_count, 2);
}

// --- Delete Cascade ---

#[test]
fn test_delete_cascade() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t(500))
        .unwrap();
    let root = vault
        .create_directory_at(ehr, &deep_spec(), t(1_000), &audit())
        .unwrap();

    let descendants: Vec<FolderId> = {
        fn collect(node: &FolderNode, out: &mut Vec<FolderId>) {
            out.push(node.id);
            for child in &node.children {
                collect(child, out);
            }
        }
        let mut out = Vec::new();
        collect(&vault.folder_tree(root).unwrap(), &mut out);
        out
    };
    assert_eq!(descendants.len(), 7);

    let removed = vault.delete_directory_at(ehr, t(2_000), &audit()).unwrap();
    assert_eq!(removed, 7);
    assert_eq!(vault.ehr(ehr).unwrap().directory, None);

    for id in descendants {
        assert!(matches!(
            vault.folder_tree(id),
            Err(VaultError::FolderNotFound(_))
        ));
    }

    // The deletion is audited.
    let stats = vault.stats();
    assert_eq!(stats.folder_count, 0);
    assert_eq!(stats.edge_count, 0);
    assert_eq!(stats.item_count, 0);
}

#[test]
fn test_delete_subfolder_keeps_the_rest() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr_at(EhrCreateRequest::new(subject("p")), t(500))
        .unwrap();
    let root = vault
        .create_directory_at(ehr, &deep_spec(), t(1_000), &audit())
        .unwrap();
    let episodes = vault.folder_tree(root).unwrap().children[0].id;

    let removed = vault
        .delete_folder_tree_at(episodes, t(2_000), &audit())
        .unwrap();
    assert_eq!(removed, 3);

    let tree = vault.folder_tree(root).unwrap();
    assert_eq!(tree.node_count(), 4);
    assert_eq!(names(&tree), ["reports"]);
    // The root binding is untouched since the root itself survives.
    assert_eq!(vault.ehr(ehr).unwrap().directory, Some(root));
}

// --- Recovered Lookups ---

#[test]
fn test_subject_and_status_lookups() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let ehr = vault
        .create_ehr(EhrCreateRequest::new(subject("patient-1")))
        .unwrap();
    let status = vault.status(ehr).unwrap();

    assert_eq!(vault.ehr_by_subject(&subject("patient-1")).unwrap(), Some(ehr));
    assert_eq!(vault.ehr_by_subject(&subject("stranger")).unwrap(), None);
    assert_eq!(vault.ehr_by_status(status.id).unwrap(), ehr);
}

// --- Persistence ---

#[test]
fn test_full_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let config = VaultConfig {
        path: dir.path().join("vault"),
        ..Default::default()
    };

    let (ehr, root);
    {
        let vault = Vault::create(config.clone()).unwrap();
        ehr = vault
            .create_ehr_at(EhrCreateRequest::new(subject("p")), t(500))
            .unwrap();
        root = vault
            .create_directory_at(ehr, &deep_spec(), t(1_000), &audit())
            .unwrap();
        vault
            .update_folder_tree_at(root, &FolderSpec::new("v2"), t(2_000), &audit())
            .unwrap();
        vault.sync().unwrap();
    }

    {
        let vault = Vault::open(config).unwrap();

        // Current state.
        assert_eq!(vault.folder_tree(root).unwrap().name, "v2");
        assert_eq!(vault.folder_latest_version(root).unwrap(), 2);

        // History still reconstructs.
        let before = vault.folder_tree_at(root, t(1_500)).unwrap();
        assert_eq!(before.name, "root");
        assert_eq!(before.node_count(), 7);

        // Versioning still appends cleanly after reopen.
        vault
            .update_folder_tree_at(root, &FolderSpec::new("v3"), t(3_000), &audit())
            .unwrap();
        assert_eq!(vault.folder_latest_version(root).unwrap(), 3);
    }
}

// --- Contribution State Round-Trips ---

#[test]
fn test_incomplete_contribution_state_is_allowed() {
    let dir = TempDir::new().unwrap();
    let vault = test_vault(&dir);

    let id = vault.open_contribution(None).unwrap();
    vault
        .commit_contribution(
            id,
            t(1_000),
            &AuditDetails::described("partial import"),
            ContributionDataType::Folder,
            ContributionState::Incomplete,
            ChangeType::Synthesis,
        )
        .unwrap();

    let contribution = vault.contribution(id).unwrap();
    assert_eq!(contribution.state, ContributionState::Incomplete);
    assert_eq!(contribution.change_type, ChangeType::Synthesis);
    assert!(!contribution.is_draft());
}
