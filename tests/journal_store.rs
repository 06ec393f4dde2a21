//! Journal durability contract: save/load identity with fully populated
//! records, and pending enumeration across the state machine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use atomic_shell::journal::{self, Journal, State};
use atomic_shell::types::{BackupRef, Baseline, NodeType, Operation};
use time::OffsetDateTime;

fn populated(run_id: &str, state: State) -> Journal {
    let mut file_op = Operation::upsert(
        PathBuf::from("/etc/app/app.conf"),
        PathBuf::from("/var/lib/atomic-shell/runs/r/upper-root/etc/app/app.conf"),
        NodeType::File,
    );
    file_op.baseline = Baseline {
        exists: true,
        mode: 0o100_644,
        uid: 0,
        gid: 0,
        size: 512,
        ctime_ns: 1_700_000_000_123_456_789,
        mtime_ns: 1_699_999_999_000_000_000,
        inode: 42,
        dev: 2049,
    };
    let mut dir_op = Operation::upsert(
        PathBuf::from("/etc/app"),
        PathBuf::from("/var/lib/atomic-shell/runs/r/upper-root/etc/app"),
        NodeType::Directory,
    );
    dir_op.opaque = true;

    let mut backup_refs = BTreeMap::new();
    backup_refs.insert(
        PathBuf::from("/etc/app"),
        BackupRef {
            exists: true,
            path: PathBuf::from("/var/lib/atomic-shell/backups/r/etc/app"),
        },
    );
    backup_refs.insert(PathBuf::from("/etc/app/app.conf"), BackupRef::default());

    Journal {
        run_id: run_id.to_string(),
        state,
        ops: vec![dir_op, file_op, Operation::delete(PathBuf::from("/etc/stale"))],
        applied_index: 1,
        backup_refs,
        txn_start: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        run_dir: PathBuf::from("/var/lib/atomic-shell/runs/r"),
        backup_dir: PathBuf::from("/var/lib/atomic-shell/backups/r"),
        keep_artifacts: true,
    }
}

#[test]
fn save_load_is_the_identity_function() {
    let td = tempfile::tempdir().unwrap();
    let path = Journal::file_path(td.path(), "full");
    let original = populated("full", State::Committing);
    journal::save(&path, &original).unwrap();
    let loaded = journal::load(&path).unwrap();

    assert_eq!(loaded.run_id, original.run_id);
    assert_eq!(loaded.state, original.state);
    assert_eq!(loaded.ops, original.ops);
    assert_eq!(loaded.applied_index, original.applied_index);
    assert_eq!(loaded.backup_refs, original.backup_refs);
    assert_eq!(loaded.txn_start, original.txn_start);
    assert_eq!(loaded.run_dir, original.run_dir);
    assert_eq!(loaded.backup_dir, original.backup_dir);
    assert_eq!(loaded.keep_artifacts, original.keep_artifacts);
}

#[test]
fn save_overwrites_previous_record_atomically() {
    let td = tempfile::tempdir().unwrap();
    let path = Journal::file_path(td.path(), "evolving");
    let mut j = populated("evolving", State::Committing);
    journal::save(&path, &j).unwrap();

    j.applied_index = 2;
    j.state = State::Committed;
    journal::save(&path, &j).unwrap();

    let loaded = journal::load(&path).unwrap();
    assert_eq!(loaded.applied_index, 2);
    assert_eq!(loaded.state, State::Committed);
}

#[test]
fn pending_enumeration_reflects_the_state_machine() {
    let td = tempfile::tempdir().unwrap();
    for (id, state) in [
        ("run-2", State::RollingBack),
        ("run-1", State::Committing),
        ("run-3", State::Committed),
        ("run-4", State::RolledBack),
    ] {
        journal::save(&Journal::file_path(td.path(), id), &populated(id, state)).unwrap();
    }
    let pending = journal::list_pending(td.path()).unwrap();
    let names: Vec<_> = pending
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["run-1.json", "run-2.json"]);
}

#[test]
fn non_journal_files_are_ignored() {
    let td = tempfile::tempdir().unwrap();
    std::fs::write(td.path().join("README"), b"not a journal").unwrap();
    std::fs::write(td.path().join("stray.tmp"), b"half-written").unwrap();
    journal::save(
        &Journal::file_path(td.path(), "real"),
        &populated("real", State::Committing),
    )
    .unwrap();
    let pending = journal::list_pending(td.path()).unwrap();
    assert_eq!(pending.len(), 1);
}
