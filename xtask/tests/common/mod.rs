//! Scratch project with `sh` scripts standing in for the build, unit-test,
//! emulator and lab collaborators.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use xtask::HarnessConfig;

pub struct Project {
    pub dir: TempDir,
}

impl Project {
    pub fn new() -> Self {
        Project {
            dir: tempfile::tempdir().expect("tempdir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write a shell script; it is always run through `sh`, so no exec bit.
    pub fn script(&self, name: &str, body: &str) {
        fs::write(self.path(name), format!("#!/bin/sh\n{}\n", body)).expect("write script");
    }

    pub fn mkdir(&self, name: &str) {
        fs::create_dir_all(self.path(name)).expect("mkdir");
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.path(name)).unwrap_or_default()
    }

    /// Write `checklist.toml`: harness commands wired to the scratch scripts,
    /// followed by `cases`.
    pub fn checklist(&self, unit_tests: &[&str], cases: &str) -> PathBuf {
        let modules = unit_tests
            .iter()
            .map(|m| format!("{:?}", m))
            .collect::<Vec<_>>()
            .join(", ");
        let text = format!(
            r#"
[harness]
root = "."
build = ["sh", "build.sh"]
launch = ["sh", "emu.sh"]
unit_test = ["sh", "{unit}"]
unit_tests = [{modules}]
boot_delay_secs = 0
drain_grace_ms = 100

[lab]
command = ["sh", "lab.sh"]
timeout_secs = 1
expect = "system self-test finished"

{cases}
"#,
            unit = self.path("unit.sh").display(),
        );
        let path = self.path("checklist.toml");
        fs::write(&path, text).expect("write checklist");
        path
    }

    pub fn load(&self, unit_tests: &[&str], cases: &str) -> HarnessConfig {
        let path = self.checklist(unit_tests, cases);
        HarnessConfig::load(&path).expect("valid checklist")
    }

    /// Builds that log each invocation and a unit-test script that passes.
    pub fn passing_collaborators(&self) {
        self.script("build.sh", "echo build >> builds.log");
        self.script("unit.sh", "basename \"$PWD\" >> ../units.log");
    }
}

/// The single case used by the end-to-end scenarios.
pub const BOOT_CASE: &str = r#"
[[case]]
name = "boot"
timeout_secs = 1
expect = ["init started", "init ready"]
"#;

/// Whether `pid` is still a live (non-zombie) process.
#[cfg(target_os = "linux")]
pub fn is_alive(pid: i32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            let state = stat
                .rsplit(')')
                .next()
                .and_then(|rest| rest.trim_start().chars().next());
            !matches!(state, Some('Z') | Some('X') | None)
        }
        Err(_) => false,
    }
}

/// Poll until `pid` is gone or `timeout` passes.
#[cfg(target_os = "linux")]
pub fn wait_dead(pid: i32, timeout: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if !is_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    !is_alive(pid)
}

/// Read a pid written by a script, waiting briefly for it to appear.
pub fn read_pid(project: &Project, name: &str) -> i32 {
    let start = Instant::now();
    loop {
        if let Ok(pid) = project.read(name).trim().parse() {
            return pid;
        }
        assert!(start.elapsed() < Duration::from_secs(5), "{} never written", name);
        thread::sleep(Duration::from_millis(20));
    }
}
