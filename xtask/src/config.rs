//! Checklist registry and collaborator configuration.
//!
//! Everything the harness needs is declared in one TOML file (by default
//! `test/checklist.toml`). The raw file is deserialized with serde and then
//! validated into immutable, strongly typed values; a malformed entry is a
//! [`ConfigError`] at load time and never surfaces mid-run.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Default checklist location, relative to the working directory.
pub const DEFAULT_CONFIG: &str = "test/checklist.toml";

/// Fixed warm-up before a case's budget starts. The booted system gives no
/// readiness signal, so this is a worst-case boot latency, not a measurement.
pub const DEFAULT_BOOT_DELAY_SECS: u64 = 5;
pub const DEFAULT_DRAIN_GRACE_MS: u64 = 100;
/// Per-stream capture limit; past it the oldest bytes are discarded.
pub const DEFAULT_MAX_CAPTURE_BYTES: u64 = 64 * 1024 * 1024;

pub const DEFAULT_LAB_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LAB_FRAGMENT: &str = "system self-test finished";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read checklist {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed checklist: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("checklist declares no cases")]
    NoCases,
    #[error("case #{index} has an empty name")]
    EmptyName { index: usize },
    #[error("duplicate case name `{0}`")]
    DuplicateCase(String),
    #[error("case `{0}` must have a positive timeout_secs")]
    ZeroTimeout(String),
    #[error("case `{0}` has no expected fragments")]
    NoFragments(String),
    #[error("case `{case}` has an empty fragment at position {position}")]
    EmptyFragment { case: String, position: usize },
    #[error("`{0}` command is empty")]
    EmptyCommand(&'static str),
    #[error("lab test must have a positive timeout_secs")]
    ZeroLabTimeout,
    #[error("lab test has an empty expected fragment")]
    EmptyLabFragment,
    #[error("unit test module path is empty")]
    EmptyModule,
    #[error("unknown case `{0}`")]
    UnknownCase(String),
}

/// An external collaborator invocation: program followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec(Vec<String>);

impl CommandSpec {
    fn parse(name: &'static str, argv: Vec<String>) -> Result<Self, ConfigError> {
        match argv.first() {
            Some(program) if !program.is_empty() => Ok(CommandSpec(argv)),
            _ => Err(ConfigError::EmptyCommand(name)),
        }
    }

    pub fn program(&self) -> &str {
        &self.0[0]
    }

    pub fn args(&self) -> &[String] {
        &self.0[1..]
    }

    /// Build a `Command` for this invocation running inside `cwd`.
    pub fn command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(self.program());
        cmd.args(self.args()).current_dir(cwd);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" "))
    }
}

/// One named checklist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    /// Wall-clock budget after the warm-up before the group is killed.
    pub timeout: Duration,
    /// Passed to the launch collaborator; `None` selects its default target.
    pub target: Option<String>,
    /// Overrides [`HarnessConfig::boot_delay`] for this case.
    pub boot_delay: Option<Duration>,
    /// Must all be present in the captured output, checked in this order.
    pub fragments: Vec<String>,
}

/// Ordered, immutable collection of test cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checklist {
    cases: Vec<TestCase>,
}

impl Checklist {
    /// Cases in declaration order.
    pub fn iter(&self) -> std::slice::Iter<'_, TestCase> {
        self.cases.iter()
    }

    pub fn get(&self, name: &str) -> Option<&TestCase> {
        self.cases.iter().find(|case| case.name == name)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Restrict to the named cases, keeping declaration order.
    pub fn select(&self, names: &[String]) -> Result<Checklist, ConfigError> {
        if let Some(unknown) = names.iter().find(|name| self.get(name).is_none()) {
            return Err(ConfigError::UnknownCase(unknown.clone()));
        }
        Ok(Checklist {
            cases: self
                .cases
                .iter()
                .filter(|case| names.contains(&case.name))
                .cloned()
                .collect(),
        })
    }
}

impl<'a> IntoIterator for &'a Checklist {
    type Item = &'a TestCase;
    type IntoIter = std::slice::Iter<'a, TestCase>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// The auxiliary smoke-test session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabTest {
    pub command: CommandSpec,
    pub timeout: Duration,
    pub fragment: String,
}

/// Fully validated harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Directory holding the config file; commands run from here.
    pub base_dir: PathBuf,
    /// Project root that unit-test module paths are relative to.
    pub root: PathBuf,
    pub build: CommandSpec,
    pub launch: CommandSpec,
    pub unit_test: CommandSpec,
    pub unit_tests: Vec<String>,
    pub boot_delay: Duration,
    /// How long a drain keeps polling an open pipe before giving up on EOF.
    pub drain_grace: Duration,
    /// Most bytes kept per captured stream; `None` keeps everything.
    pub capture_limit: Option<usize>,
    pub lab: LabTest,
    pub checklist: Checklist,
}

impl HarnessConfig {
    /// Read and validate the checklist file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        Self::from_toml_str(&text, base_dir)
    }

    /// Parse and validate checklist text; relative paths resolve against `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        raw.validate(base_dir.into())
    }

    /// The checklist, for modes that run or inspect cases. Lab mode does
    /// not need any.
    pub fn cases(&self) -> Result<&Checklist, ConfigError> {
        if self.checklist.is_empty() {
            return Err(ConfigError::NoCases);
        }
        Ok(&self.checklist)
    }

    /// Working directory for a unit-test module.
    pub fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join(module.trim_start_matches('/'))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    harness: RawHarness,
    #[serde(default)]
    lab: RawLab,
    #[serde(default, rename = "case")]
    cases: Vec<RawCase>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawHarness {
    root: PathBuf,
    build: Vec<String>,
    launch: Vec<String>,
    unit_test: Vec<String>,
    unit_tests: Vec<String>,
    boot_delay_secs: u64,
    drain_grace_ms: u64,
    max_capture_bytes: u64,
}

impl Default for RawHarness {
    fn default() -> Self {
        RawHarness {
            root: PathBuf::from("."),
            build: vec!["./clean_and_make.sh".into()],
            launch: vec!["./make_and_run.sh".into()],
            unit_test: vec!["cargo".into(), "test".into()],
            unit_tests: Vec::new(),
            boot_delay_secs: DEFAULT_BOOT_DELAY_SECS,
            drain_grace_ms: DEFAULT_DRAIN_GRACE_MS,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawLab {
    command: Vec<String>,
    timeout_secs: u64,
    expect: String,
}

impl Default for RawLab {
    fn default() -> Self {
        RawLab {
            command: vec!["./lab_test.sh".into()],
            timeout_secs: DEFAULT_LAB_TIMEOUT_SECS,
            expect: DEFAULT_LAB_FRAGMENT.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCase {
    name: String,
    timeout_secs: u64,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    boot_delay_secs: Option<u64>,
    expect: Vec<String>,
}

impl RawConfig {
    fn validate(self, base_dir: PathBuf) -> Result<HarnessConfig, ConfigError> {
        let RawConfig {
            harness,
            lab,
            cases,
        } = self;

        let mut seen = HashSet::new();
        let mut checked = Vec::with_capacity(cases.len());
        for (index, case) in cases.into_iter().enumerate() {
            if case.name.trim().is_empty() {
                return Err(ConfigError::EmptyName { index });
            }
            if !seen.insert(case.name.clone()) {
                return Err(ConfigError::DuplicateCase(case.name));
            }
            if case.timeout_secs == 0 {
                return Err(ConfigError::ZeroTimeout(case.name));
            }
            if case.expect.is_empty() {
                return Err(ConfigError::NoFragments(case.name));
            }
            if let Some(position) = case.expect.iter().position(String::is_empty) {
                return Err(ConfigError::EmptyFragment {
                    case: case.name,
                    position,
                });
            }
            checked.push(TestCase {
                name: case.name,
                timeout: Duration::from_secs(case.timeout_secs),
                target: case.target.filter(|target| !target.trim().is_empty()),
                boot_delay: case.boot_delay_secs.map(Duration::from_secs),
                fragments: case.expect,
            });
        }

        if lab.timeout_secs == 0 {
            return Err(ConfigError::ZeroLabTimeout);
        }
        if lab.expect.is_empty() {
            return Err(ConfigError::EmptyLabFragment);
        }
        if harness.unit_tests.iter().any(|m| m.trim().is_empty()) {
            return Err(ConfigError::EmptyModule);
        }

        Ok(HarnessConfig {
            root: base_dir.join(&harness.root),
            build: CommandSpec::parse("build", harness.build)?,
            launch: CommandSpec::parse("launch", harness.launch)?,
            unit_test: CommandSpec::parse("unit_test", harness.unit_test)?,
            unit_tests: harness.unit_tests,
            boot_delay: Duration::from_secs(harness.boot_delay_secs),
            drain_grace: Duration::from_millis(harness.drain_grace_ms),
            // 0 means unlimited.
            capture_limit: match harness.max_capture_bytes {
                0 => None,
                n => Some(usize::try_from(n).unwrap_or(usize::MAX)),
            },
            lab: LabTest {
                command: CommandSpec::parse("lab", lab.command)?,
                timeout: Duration::from_secs(lab.timeout_secs),
                fragment: lab.expect,
            },
            checklist: Checklist { cases: checked },
            base_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = r#"
        [harness]
        root = ".."
        unit_tests = ["/crate/memory"]

        [[case]]
        name = "main"
        timeout_secs = 5
        target = ""
        expect = [
            "idle proc start correctly",
            "init proc start correctly",
            "init proc exited correctly",
        ]

        [[case]]
        name = "fs"
        timeout_secs = 8
        target = "fs"
        boot_delay_secs = 2
        expect = ["mounted root"]
    "#;

    fn parse(text: &str) -> Result<HarnessConfig, ConfigError> {
        HarnessConfig::from_toml_str(text, "/work/test")
    }

    #[test]
    fn cases_keep_declaration_order() {
        let config = parse(MAIN).unwrap();
        let names: Vec<_> = config.checklist.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["main", "fs"]);

        let main = config.checklist.get("main").unwrap();
        assert_eq!(main.timeout, Duration::from_secs(5));
        assert_eq!(main.target, None);
        assert_eq!(main.boot_delay, None);
        assert_eq!(main.fragments.len(), 3);

        let fs = config.checklist.get("fs").unwrap();
        assert_eq!(fs.target.as_deref(), Some("fs"));
        assert_eq!(fs.boot_delay, Some(Duration::from_secs(2)));
    }

    #[test]
    fn defaults_match_legacy_harness() {
        let config = parse(MAIN).unwrap();
        assert_eq!(config.boot_delay, Duration::from_secs(5));
        assert_eq!(config.build.to_string(), "./clean_and_make.sh");
        assert_eq!(config.launch.program(), "./make_and_run.sh");
        assert_eq!(config.unit_test.args(), ["test".to_string()]);
        assert_eq!(config.lab.timeout, Duration::from_secs(30));
        assert_eq!(config.lab.fragment, "system self-test finished");
    }

    #[test]
    fn module_dirs_resolve_under_root() {
        let config = parse(MAIN).unwrap();
        assert_eq!(
            config.module_dir("/crate/memory"),
            PathBuf::from("/work/test/../crate/memory")
        );
    }

    #[test]
    fn shipped_checklist_is_valid() {
        let text = include_str!("../../test/checklist.toml");
        let config = HarnessConfig::from_toml_str(text, "test").unwrap();
        assert_eq!(config.root, PathBuf::from("test/.."));
        assert_eq!(config.unit_tests, ["crate/memory"]);
        let main = config.checklist.get("main").unwrap();
        assert_eq!(main.fragments[0], "idle proc start correctly");
    }

    #[test]
    fn lab_only_config_has_no_cases() {
        let config = parse("[lab]\ntimeout_secs = 10\n").unwrap();
        assert_eq!(config.lab.timeout, Duration::from_secs(10));
        assert!(matches!(config.cases(), Err(ConfigError::NoCases)));
        assert!(parse(MAIN).unwrap().cases().is_ok());
    }

    #[test]
    fn capture_limit_defaults_and_zero_disables() {
        let config = parse(MAIN).unwrap();
        assert_eq!(config.capture_limit, Some(64 * 1024 * 1024));

        let config = parse("[harness]\nmax_capture_bytes = 0\n").unwrap();
        assert_eq!(config.capture_limit, None);
    }

    #[test]
    fn rejects_duplicate_names() {
        let text = r#"
            [[case]]
            name = "boot"
            timeout_secs = 1
            expect = ["a"]
            [[case]]
            name = "boot"
            timeout_secs = 1
            expect = ["b"]
        "#;
        assert!(matches!(parse(text), Err(ConfigError::DuplicateCase(n)) if n == "boot"));
    }

    #[test]
    fn rejects_zero_timeout() {
        let text = "[[case]]\nname = \"boot\"\ntimeout_secs = 0\nexpect = [\"a\"]\n";
        assert!(matches!(parse(text), Err(ConfigError::ZeroTimeout(_))));
    }

    #[test]
    fn rejects_missing_and_empty_fragments() {
        let none = "[[case]]\nname = \"boot\"\ntimeout_secs = 1\nexpect = []\n";
        assert!(matches!(parse(none), Err(ConfigError::NoFragments(_))));

        let empty = "[[case]]\nname = \"boot\"\ntimeout_secs = 1\nexpect = [\"a\", \"\"]\n";
        assert!(matches!(
            parse(empty),
            Err(ConfigError::EmptyFragment { position: 1, .. })
        ));
    }

    #[test]
    fn rejects_unknown_fields() {
        let text = "[[case]]\nname = \"boot\"\ntime = 5\nexpect = [\"a\"]\n";
        assert!(matches!(parse(text), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn rejects_empty_commands() {
        assert!(matches!(
            parse("[harness]\nlaunch = []\n"),
            Err(ConfigError::EmptyCommand("launch"))
        ));
    }

    #[test]
    fn select_filters_and_rejects_unknown() {
        let config = parse(MAIN).unwrap();
        let only = config.checklist.select(&["fs".to_string()]).unwrap();
        assert_eq!(only.len(), 1);
        assert!(only.get("main").is_none());

        let err = config.checklist.select(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownCase(n) if n == "nope"));
    }
}
