use citusha_common::*;
use citusha_storage::{FileRoleStateStore, RoleStateStore};

fn three_groups() -> RoleMapping {
    let mut mapping = RoleMapping::new();
    for n in 1..=3 {
        mapping.insert(
            GroupId::new(format!("worker{}", n)),
            RoleAssignment::new(
                HostRef::pg(format!("primary{}", n)),
                HostRef::pg(format!("secondary{}", n)),
            )
            .unwrap(),
        );
    }
    mapping
}

#[tokio::test]
async fn test_save_then_reload_after_restart() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("state").join("roles.state");

    let mut mapping = three_groups();
    mapping
        .promote(&GroupId::from("worker1"), &HostRef::pg("secondary1"))
        .unwrap();

    {
        let store = FileRoleStateStore::new(&path);
        store.save(&mapping).await.unwrap();
    }

    // A fresh store instance stands in for a restarted process
    let reopened = FileRoleStateStore::new(&path);
    let loaded = reopened.load().await.unwrap().unwrap();
    assert_eq!(loaded, mapping);

    let worker1 = loaded.get(&GroupId::from("worker1")).unwrap();
    assert_eq!(worker1.primary(), &HostRef::pg("secondary1"));
    assert_eq!(worker1.secondary(), &HostRef::pg("primary1"));
}

#[tokio::test]
async fn test_save_overwrites_in_full_and_leaves_no_temp_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("roles.state");
    let store = FileRoleStateStore::new(&path);

    store.save(&three_groups()).await.unwrap();

    let mut smaller = RoleMapping::new();
    smaller.insert(
        GroupId::from("worker2"),
        RoleAssignment::new(HostRef::pg("secondary2"), HostRef::pg("primary2")).unwrap(),
    );
    store.save(&smaller).await.unwrap();

    assert_eq!(store.load().await.unwrap().unwrap(), smaller);

    let entries: Vec<_> = std::fs::read_dir(temp_dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(entries, vec!["roles.state".to_string()]);
}

#[tokio::test]
async fn test_stale_temp_file_does_not_affect_load() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("roles.state");
    let store = FileRoleStateStore::new(&path);
    store.save(&three_groups()).await.unwrap();

    // Simulate a crash between writing the temp file and renaming it
    std::fs::write(temp_dir.path().join("roles.state.tmp"), "primary:worker1=garb").unwrap();

    assert_eq!(store.load().await.unwrap().unwrap(), three_groups());

    // The next save replaces the leftover
    store.save(&three_groups()).await.unwrap();
    assert!(!temp_dir.path().join("roles.state.tmp").exists());
}

#[tokio::test]
async fn test_corrupt_file_is_an_error() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("roles.state");
    std::fs::write(&path, "primary:worker1=primary1\n").unwrap();

    let store = FileRoleStateStore::new(&path);
    let err = store.load().await.unwrap_err();
    assert!(err.is_persistence());
}

#[tokio::test]
async fn test_file_is_operator_readable() {
    let temp_dir = tempfile::tempdir().unwrap();
    let path = temp_dir.path().join("roles.state");
    let store = FileRoleStateStore::new(&path);
    store.save(&three_groups()).await.unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("primary:worker1=primary1:5432"));
    assert!(text.contains("secondary:worker3=secondary3:5432"));
}
