//! `tl dir` lists log files

use crate::prelude::*;

#[test]
fn dir_lists_files_in_lsn_order() {
    let temp = LogFixture::empty();
    let first = temp.wal(1, 3);
    let second = temp.wal(4, 2);
    let run = temp.tl().arg("dir").arg(temp.wal_dir()).passes();

    let lines: Vec<&str> = run.stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{}", run.stdout);
    assert!(lines[0].starts_with("XLOG"));
    assert!(lines[0].ends_with(&first.display().to_string()));
    assert!(lines[1].ends_with(&second.display().to_string()));
}

#[test]
fn dir_marks_unfinished_files() {
    let temp = LogFixture::empty();
    temp.wal(1, 2);
    let sealed = temp.wal(3, 2);
    let unfinished = sealed.with_extension("xlog.inprogress");
    std::fs::rename(&sealed, &unfinished).unwrap();

    temp.tl()
        .arg("dir")
        .arg(temp.wal_dir())
        .passes()
        .stdout_has(" inprogress ");
}

#[test]
fn dir_shows_snapshots_and_wal_together() {
    let temp = LogFixture::empty();
    temp.wal(1, 2);
    temp.snap(2, true);
    let shared = temp.path().join("shared");
    std::fs::create_dir(&shared).unwrap();
    for dir in [temp.wal_dir(), temp.snap_dir()] {
        for entry in std::fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            std::fs::rename(entry.path(), shared.join(entry.file_name())).unwrap();
        }
    }

    temp.tl()
        .arg("dir")
        .arg(&shared)
        .passes()
        .stdout_has("SNAP")
        .stdout_has("XLOG");
}
