//! `tld` startup failures exit non-zero

use crate::prelude::*;

#[test]
fn missing_config_fails() {
    let temp = LogFixture::empty();
    temp.tld()
        .arg("absent.toml")
        .fails()
        .stderr_has("cannot read");
}

#[test]
fn unknown_config_keys_fail() {
    let temp = LogFixture::empty();
    temp.file("tld.toml", "wal_directory = \"wal\"\n");
    temp.tld()
        .arg("tld.toml")
        .fails()
        .stderr_has("wal_directory");
}

#[test]
fn boot_corruption_fails_and_is_logged() {
    let temp = LogFixture::empty();
    let older = temp.wal(1, 3);
    temp.wal(4, 3);
    corrupt_last_row(&older);
    temp.file(
        "tld.toml",
        "wal_dir = \"wal\"\nsnap_dir = \"snap\"\nlog_path = \"tld.log\"\n",
    );

    temp.tld().arg("tld.toml").fails().stderr_has("Corrupt");
    let log = std::fs::read_to_string(temp.path().join("tld.log")).unwrap();
    assert!(log.contains("--- tld: starting (pid: "), "{log}");
    assert!(log.contains("Failed to start daemon"), "{log}");
}
