//! `tl verify` checks rows and exits non-zero on corruption

use crate::prelude::*;

#[test]
fn clean_directory_passes() {
    let temp = LogFixture::empty();
    temp.wal(1, 3);
    temp.wal(4, 3);
    temp.tl()
        .arg("verify")
        .arg(temp.wal_dir())
        .passes()
        .stdout_has("ok ")
        .stdout_lacks("CORRUPT");
}

#[test]
fn torn_tail_passes_with_a_note() {
    let temp = LogFixture::empty();
    temp.wal(1, 3);
    let newest = temp.wal(4, 3);
    tear(&newest);
    temp.tl()
        .arg("verify")
        .arg(temp.wal_dir())
        .passes()
        .stdout_has("tail ");
}

#[test]
fn corruption_before_the_tail_fails() {
    let temp = LogFixture::empty();
    let older = temp.wal(1, 3);
    temp.wal(4, 3);
    corrupt_last_row(&older);
    temp.tl()
        .arg("verify")
        .arg(temp.wal_dir())
        .fails()
        .stdout_has("CORRUPT")
        .stderr_has("1 of 2 files corrupt");
}

#[test]
fn snapshot_missing_its_final_row_fails() {
    let temp = LogFixture::empty();
    temp.snap(3, false);
    temp.tl()
        .arg("verify")
        .arg(temp.snap_dir())
        .fails()
        .stdout_has("missing snap_final");
}
