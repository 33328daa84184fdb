//! Help and version output

use crate::prelude::*;

#[test]
fn help_lists_every_command() {
    let temp = LogFixture::empty();
    temp.tl()
        .args(&["--help"])
        .passes()
        .stdout_has("cat")
        .stdout_has("dir")
        .stdout_has("verify");
}

#[test]
fn version_is_reported() {
    let temp = LogFixture::empty();
    temp.tl().args(&["--version"]).passes().stdout_has("tl ");
}
