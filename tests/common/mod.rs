//! Shared test infrastructure for integration tests.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// A scratch directory holding the documents for one scenario run.
pub struct TestFixture {
    pub dir: TempDir,
}

impl TestFixture {
    pub fn new() -> Self {
        TestFixture {
            dir: tempfile::tempdir().expect("create fixture dir"),
        }
    }

    /// Write a markdown (or any) file into the fixture and return its path.
    pub fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).expect("write fixture file");
        path
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// Run the engine binary with the given arguments, logging into the fixture
/// directory so runs do not clobber each other's log files.
pub fn run_ie(fixture: &TestFixture, args: &[&str]) -> Output {
    let log_path = fixture.dir.path().join("ie.log");
    Command::new(env!("CARGO_BIN_EXE_ie"))
        .args(args)
        .arg("--log-path")
        .arg(&log_path)
        .current_dir(fixture.path())
        .output()
        .expect("run ie binary")
}

pub fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}
