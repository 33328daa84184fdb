//! `tl cat` prints rows

use crate::prelude::*;

#[test]
fn cat_prints_one_line_per_row() {
    let temp = LogFixture::empty();
    let file = temp.wal(1, 3);
    temp.tl().arg("cat").arg(&file).passes().stdout_eq(
        "lsn:1 shard:1 scn:0 tm:0.000 t:shard_create type:por module:hash peers:[]\n\
         lsn:2 shard:1 scn:1 tm:0.000 t:wal_data put 6b32 76\n\
         lsn:3 shard:1 scn:2 tm:0.000 t:wal_data put 6b33 76\n",
    );
}

#[test]
fn cat_filters_by_shard() {
    let temp = LogFixture::empty();
    let file = temp.wal(1, 3);
    temp.tl()
        .arg("cat")
        .arg(&file)
        .args(&["--shard", "2"])
        .passes()
        .stdout_eq("");
}

#[test]
fn cat_json_output() {
    let temp = LogFixture::empty();
    let file = temp.wal(1, 2);
    temp.tl()
        .args(&["-o", "json", "cat"])
        .arg(&file)
        .passes()
        .stdout_has("\"lsn\": 2")
        .stdout_has("\"tag\": \"wal_data\"");
}

#[test]
fn cat_stops_at_a_torn_row() {
    let temp = LogFixture::empty();
    let file = temp.wal(1, 3);
    tear(&file);
    temp.tl()
        .arg("cat")
        .arg(&file)
        .passes()
        .stdout_has("lsn:2 ")
        .stdout_lacks("lsn:3 ")
        .stderr_has("stopped at offset");
}

#[test]
fn cat_decodes_snapshot_headers() {
    let temp = LogFixture::empty();
    let file = temp.snap(5, true);
    temp.tl()
        .arg("cat")
        .arg(&file)
        .passes()
        .stdout_has("t:snap_initial count:0")
        .stdout_has("t:snap_final");
}
