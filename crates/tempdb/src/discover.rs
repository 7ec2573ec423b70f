//! PostgreSQL installation discovery.
//!
//! Walks a platform-specific list of glob patterns (package manager trees,
//! app bundles, then generic fallbacks), keeps directories that hold both
//! `initdb` and `postgres`, and tags each with the version reported by
//! `postgres --version`.
//!
//! All host access goes through [`SystemProbe`] and the platform is passed
//! in, so discovery is deterministic under a fake probe.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, TempDbError};
use crate::version::Version;

pub const INITDB_BIN: &str = "initdb";
pub const POSTGRES_BIN: &str = "postgres";

/// Executables a directory must contain to count as an installation.
const REQUIRED_BINS: &[&str] = &[INITDB_BIN, POSTGRES_BIN];

/// Tried after the platform-specific patterns, on every platform.
const FALLBACK_PATTERNS: &[&str] = &["/usr/local/pgsql/bin", "/usr/local/bin", "/usr/bin"];

/// Operating system family, selecting the search strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Darwin,
    Other(String),
}

impl Platform {
    /// The platform this binary runs on.
    pub fn current() -> Self {
        Self::from_os(std::env::consts::OS)
    }

    /// Map an OS identifier (`std::env::consts::OS` or `uname -s` style).
    pub fn from_os(os: &str) -> Self {
        match os.to_ascii_lowercase().as_str() {
            "linux" => Platform::Linux,
            "macos" | "darwin" => Platform::Darwin,
            _ => Platform::Other(os.to_string()),
        }
    }
}

/// Host access needed by discovery.
pub trait SystemProbe {
    /// Paths matching a glob pattern, in expansion order.
    fn glob(&self, pattern: &str) -> Vec<PathBuf>;

    /// Entry names of a directory. Errors when `dir` is not a directory.
    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>>;

    /// Run a program to completion and return its stdout. A non-zero exit
    /// is an error.
    fn run(&self, program: &Path, args: &[&str]) -> io::Result<String>;

    fn home_dir(&self) -> Option<PathBuf>;
}

impl<P: SystemProbe + ?Sized> SystemProbe for &P {
    fn glob(&self, pattern: &str) -> Vec<PathBuf> {
        (**self).glob(pattern)
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        (**self).list_dir(dir)
    }

    fn run(&self, program: &Path, args: &[&str]) -> io::Result<String> {
        (**self).run(program, args)
    }

    fn home_dir(&self) -> Option<PathBuf> {
        (**self).home_dir()
    }
}

/// The real filesystem and process table.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostSystem;

impl SystemProbe for HostSystem {
    fn glob(&self, pattern: &str) -> Vec<PathBuf> {
        match glob::glob(pattern) {
            Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
            Err(e) => {
                warn!("Invalid search pattern {}: {}", pattern, e);
                Vec::new()
            }
        }
    }

    fn list_dir(&self, dir: &Path) -> io::Result<Vec<String>> {
        std::fs::read_dir(dir)?
            .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
            .collect()
    }

    fn run(&self, program: &Path, args: &[&str]) -> io::Result<String> {
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!(
                    "{} exited with {}: {}",
                    program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn home_dir(&self) -> Option<PathBuf> {
        dirs::home_dir()
    }
}

/// A bin directory with a matched `initdb` / `postgres` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Installation {
    pub bin_dir: PathBuf,
    pub version: Version,
}

impl Installation {
    pub fn initdb(&self) -> PathBuf {
        self.bin_dir.join(INITDB_BIN)
    }

    pub fn postgres(&self) -> PathBuf {
        self.bin_dir.join(POSTGRES_BIN)
    }
}

/// Version reported by `<postgres> --version`.
pub fn detect_version<P: SystemProbe>(probe: &P, postgres: &Path) -> Result<Version> {
    let output = probe.run(postgres, &["--version"])?;
    Version::parse(&output)
}

/// Installation search over an injected probe and platform.
pub struct Discovery<P = HostSystem> {
    probe: P,
    platform: Platform,
}

impl Discovery<HostSystem> {
    /// Discovery against the running host.
    pub fn host() -> Self {
        Self::new(HostSystem, Platform::current())
    }
}

impl<P: SystemProbe> Discovery<P> {
    pub fn new(probe: P, platform: Platform) -> Self {
        Self { probe, platform }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Ordered glob patterns for this platform.
    pub fn search_patterns(&self) -> Result<Vec<String>> {
        let mut patterns = Vec::new();
        match &self.platform {
            Platform::Linux => {
                // Debian / Ubuntu
                patterns.push("/usr/lib/postgresql/*/bin".to_string());
                // CentOS / RHEL / Fedora (PGDG packages)
                patterns.push("/usr/pgsql-*/bin".to_string());
            }
            Platform::Darwin => {
                // Homebrew, only when brew itself is installed
                match self.probe.run(Path::new("brew"), &["--cellar"]) {
                    Ok(out) => {
                        let cellar = glob::Pattern::escape(out.trim());
                        patterns.push(format!("{}/postgresql/*/bin", cellar));
                        patterns.push(format!("{}/postgresql@*/*/bin", cellar));
                    }
                    Err(e) => debug!("Skipping Homebrew cellar: {}", e),
                }

                // MacPorts
                patterns.push("/opt/local/lib/postgresql*/bin".to_string());

                // Postgres.app
                if let Some(home) = self.probe.home_dir() {
                    let home = glob::Pattern::escape(&home.to_string_lossy());
                    patterns.push(format!(
                        "{}/Applications/Postgres.app/Contents/Versions/*/bin",
                        home
                    ));
                }
                patterns.push("/Applications/Postgres.app/Contents/Versions/*/bin".to_string());
            }
            Platform::Other(os) => {
                return Err(TempDbError::UnsupportedPlatform(os.clone()));
            }
        }

        patterns.extend(FALLBACK_PATTERNS.iter().map(|p| p.to_string()));
        Ok(patterns)
    }

    /// Lazily discovered installations, in pattern order then glob order.
    pub fn iter_installations(&self) -> Result<Installations<&P>> {
        let patterns = self.search_patterns()?;
        Ok(Installations::new(&self.probe, patterns))
    }

    /// Owning variant of [`Discovery::iter_installations`].
    pub fn into_installations(self) -> Result<Installations<P>> {
        let patterns = self.search_patterns()?;
        Ok(Installations::new(self.probe, patterns))
    }

    /// Pick a bin directory.
    ///
    /// Without a hint the highest version wins. With a hint, an installation
    /// of exactly that version is preferred, then the highest version the
    /// hint matches. Within one version the first discovered directory wins.
    /// `Ok(None)` means installations exist but none matches the hint.
    pub fn find_installation(&self, hint: Option<&Version>) -> Result<Option<PathBuf>> {
        let mut by_version: BTreeMap<Version, Vec<PathBuf>> = BTreeMap::new();
        for installation in self.iter_installations()? {
            by_version
                .entry(installation.version)
                .or_default()
                .push(installation.bin_dir);
        }

        if by_version.is_empty() {
            return Err(TempDbError::NoInstallation);
        }

        let chosen = match hint {
            None => by_version.iter().next_back(),
            Some(hint) => by_version
                .get_key_value(hint)
                .or_else(|| by_version.iter().rev().find(|(v, _)| hint.matches(v))),
        };

        match chosen {
            Some((version, dirs)) => {
                debug!(%version, "Selected PostgreSQL installation");
                Ok(dirs.first().cloned())
            }
            None => Ok(None),
        }
    }
}

/// Iterator over discovered installations. Each directory is reported once.
pub struct Installations<P> {
    probe: P,
    patterns: std::vec::IntoIter<String>,
    pending: std::vec::IntoIter<PathBuf>,
    seen: HashSet<PathBuf>,
}

impl<P: SystemProbe> Installations<P> {
    fn new(probe: P, patterns: Vec<String>) -> Self {
        Self {
            probe,
            patterns: patterns.into_iter(),
            pending: Vec::new().into_iter(),
            seen: HashSet::new(),
        }
    }

    fn inspect_dir(&self, dir: PathBuf) -> Option<Installation> {
        // Not a directory, or unreadable
        let names = self.probe.list_dir(&dir).ok()?;
        if !REQUIRED_BINS
            .iter()
            .all(|bin| names.iter().any(|name| name.as_str() == *bin))
        {
            return None;
        }

        match detect_version(&self.probe, &dir.join(POSTGRES_BIN)) {
            Ok(version) => Some(Installation {
                bin_dir: dir,
                version,
            }),
            Err(e) => {
                warn!("Skipping {}: unable to determine version: {}", dir.display(), e);
                None
            }
        }
    }
}

impl<P: SystemProbe> Iterator for Installations<P> {
    type Item = Installation;

    fn next(&mut self) -> Option<Installation> {
        loop {
            if let Some(dir) = self.pending.next() {
                if !self.seen.insert(dir.clone()) {
                    continue;
                }
                if let Some(installation) = self.inspect_dir(dir) {
                    return Some(installation);
                }
                continue;
            }

            let pattern = self.patterns.next()?;
            debug!("Expanding search pattern {}", pattern);
            self.pending = self.probe.glob(&pattern).into_iter();
        }
    }
}

/// Installations on this host.
pub fn iter_installations() -> Result<Installations<HostSystem>> {
    Discovery::host().into_installations()
}

/// Best bin directory on this host for an optional version hint.
pub fn find_installation(hint: Option<&Version>) -> Result<Option<PathBuf>> {
    Discovery::host().find_installation(hint)
}
