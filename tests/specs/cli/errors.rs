//! Error reporting for bad arguments

use crate::prelude::*;

#[test]
fn cat_of_a_missing_file_fails() {
    let temp = LogFixture::empty();
    temp.tl()
        .args(&["cat", "00000000000000000001.xlog"])
        .fails()
        .stderr_has("cannot open");
}

#[test]
fn cat_refuses_files_that_are_not_logs() {
    let temp = LogFixture::empty();
    temp.file("notes.txt", "hello");
    temp.tl()
        .args(&["cat", "notes.txt"])
        .fails()
        .stderr_has("not a .xlog or .snap file");
}

#[test]
fn dir_of_a_missing_directory_fails() {
    let temp = LogFixture::empty();
    temp.tl()
        .args(&["dir", "nowhere"])
        .fails()
        .stderr_has("not a directory");
}

#[test]
fn unknown_command_fails() {
    let temp = LogFixture::empty();
    temp.tl().args(&["replay"]).fails().stderr_has("replay");
}
