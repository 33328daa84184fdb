//! Shared fixtures for the behavioral specs.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use tempfile::TempDir;
use tl_core::{KvOp, Row, ShardOp, ShardType, SnapInitial, Tag, TagKind};
use tl_storage::{FileHeader, FileKind, LogDir, XlogWriter};

/// A scratch directory holding `wal/` and `snap/` log directories
pub struct LogFixture {
    dir: TempDir,
}

impl LogFixture {
    pub fn empty() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.path().join("wal")
    }

    pub fn snap_dir(&self) -> PathBuf {
        self.path().join("snap")
    }

    /// Seal a WAL file holding a shard create at `first` when `first == 1`,
    /// then puts of `k<lsn>` up to `rows` rows in total
    pub fn wal(&self, first: i64, rows: i64) -> PathBuf {
        let dir = LogDir::wal(self.wal_dir()).unwrap();
        let mut writer = XlogWriter::create(&dir, first, &FileHeader::new(FileKind::Xlog)).unwrap();
        for lsn in first..first + rows {
            let row = if lsn == 1 {
                let op = ShardOp::new(ShardType::Por, "hash", Vec::new());
                Row::new(Tag::sys(TagKind::ShardCreate), 1, 0, op.encode().unwrap())
            } else {
                let put = KvOp::put(format!("k{lsn}"), "v").encode();
                Row::new(Tag::wal(TagKind::WalData), 1, lsn - 1, put)
            };
            writer.append(&row.with_lsn(lsn)).unwrap();
        }
        writer.close().unwrap()
    }

    /// Seal a snapshot with no shards; `complete` adds `snap_final`
    pub fn snap(&self, lsn: i64, complete: bool) -> PathBuf {
        let dir = LogDir::snap(self.snap_dir()).unwrap();
        let mut writer = XlogWriter::create(&dir, lsn, &FileHeader::new(FileKind::Snap)).unwrap();
        let initial = Row::new(Tag::snap(TagKind::SnapInitial), 0, 0, SnapInitial::default().encode());
        writer.append(&initial.with_lsn(lsn)).unwrap();
        if complete {
            let last = Row::new(Tag::snap(TagKind::SnapFinal), 0, 0, &b""[..]);
            writer.append(&last.with_lsn(lsn + 1)).unwrap();
        }
        writer.close().unwrap()
    }

    pub fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    pub fn tl(&self) -> CliBuilder {
        CliBuilder::new("tl", self.path())
    }

    pub fn tld(&self) -> CliBuilder {
        CliBuilder::new("tld", self.path())
    }
}

/// Flip a byte inside the payload of the last row of a sealed file
pub fn corrupt_last_row(path: &Path) {
    let mut bytes = std::fs::read(path).unwrap();
    let at = bytes.len() - 6;
    bytes[at] ^= 0xff;
    std::fs::write(path, bytes).unwrap();
}

/// Cut a sealed file inside its last row, as a crash mid-write would
pub fn tear(path: &Path) {
    let bytes = std::fs::read(path).unwrap();
    std::fs::write(path, &bytes[..bytes.len() - 8]).unwrap();
}

pub struct CliBuilder {
    cmd: Command,
}

impl CliBuilder {
    fn new(bin: &str, cwd: &Path) -> Self {
        let mut cmd = Command::cargo_bin(bin).unwrap();
        cmd.current_dir(cwd).env_remove("RUST_LOG");
        Self { cmd }
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.cmd.args(args);
        self
    }

    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.cmd.arg(arg);
        self
    }

    pub fn passes(mut self) -> RunAssert {
        let output = self.cmd.output().unwrap();
        let run = RunAssert::from(output.clone());
        assert!(
            output.status.success(),
            "expected success, got {:?}\nstdout:\n{}\nstderr:\n{}",
            output.status,
            run.stdout,
            run.stderr
        );
        run
    }

    pub fn fails(mut self) -> RunAssert {
        let output = self.cmd.output().unwrap();
        let run = RunAssert::from(output.clone());
        assert!(
            !output.status.success(),
            "expected failure\nstdout:\n{}\nstderr:\n{}",
            run.stdout,
            run.stderr
        );
        run
    }
}

pub struct RunAssert {
    pub stdout: String,
    pub stderr: String,
}

impl From<std::process::Output> for RunAssert {
    fn from(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

impl RunAssert {
    pub fn stdout_has(self, expected: &str) -> Self {
        assert!(
            self.stdout.contains(expected),
            "stdout missing {:?}:\n{}",
            expected,
            self.stdout
        );
        self
    }

    pub fn stdout_lacks(self, unexpected: &str) -> Self {
        assert!(
            !self.stdout.contains(unexpected),
            "stdout has {:?}:\n{}",
            unexpected,
            self.stdout
        );
        self
    }

    pub fn stderr_has(self, expected: &str) -> Self {
        assert!(
            self.stderr.contains(expected),
            "stderr missing {:?}:\n{}",
            expected,
            self.stderr
        );
        self
    }

    pub fn stdout_eq(self, expected: &str) -> Self {
        similar_asserts::assert_eq!(self.stdout, expected);
        self
    }
}
