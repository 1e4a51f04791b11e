//! Exclusion rules for release staging
//!
//! Keeps build caches, bytecode, and VCS metadata out of staged releases.
//! Handles default exclusions and .cutoverignore files.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs;
use std::path::Path;

/// Default patterns excluded from every staged release
const DEFAULT_EXCLUDES: &[&str] = &[
    ".git/**",
    ".git",
    ".DS_Store",
    "**/.DS_Store",
    "**/__pycache__",
    "**/__pycache__/**",
    "**/*.pyc",
    "**/*.pyo",
    "node_modules/**",
    "node_modules",
    "**/node_modules",
    "**/node_modules/**",
    "target/**",
    "target",
    ".venv/**",
    ".venv",
    "**/.pytest_cache",
    "**/.pytest_cache/**",
    "**/*.egg-info",
    "**/*.egg-info/**",
    ".cutover/**",
    ".cutover",
];

/// Errors for exclusion rules
#[derive(Debug, thiserror::Error)]
pub enum ExcludeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("glob pattern error: {0}")]
    Glob(#[from] globset::Error),
}

/// Exclusion rules for filtering staged files
#[derive(Debug)]
pub struct ExcludeRules {
    glob_set: GlobSet,
    extra: Vec<String>,
}

impl Default for ExcludeRules {
    fn default() -> Self {
        Self::new().expect("default exclude patterns are valid")
    }
}

impl ExcludeRules {
    /// Create new exclusion rules with defaults
    pub fn new() -> Result<Self, ExcludeError> {
        Self::build(&[])
    }

    /// Add patterns from an ignore file (one glob per line, '#' comments)
    pub fn with_ignore_file(self, path: &Path) -> Result<Self, ExcludeError> {
        let contents = fs::read_to_string(path)?;
        let patterns: Vec<&str> = contents
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        self.with_patterns(&patterns)
    }

    /// Add additional patterns
    pub fn with_patterns(self, patterns: &[&str]) -> Result<Self, ExcludeError> {
        let mut extra = self.extra;
        extra.extend(patterns.iter().filter(|p| !p.is_empty()).map(|p| p.to_string()));
        Self::build(&extra)
    }

    fn build(extra: &[String]) -> Result<Self, ExcludeError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES {
            builder.add(Glob::new(pattern)?);
        }
        for pattern in extra {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            glob_set: builder.build()?,
            extra: extra.to_vec(),
        })
    }

    /// Check if a path should be excluded
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.glob_set.is_match(path_str.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_excludes_vcs_and_caches() {
        let rules = ExcludeRules::new().unwrap();

        assert!(rules.is_excluded(Path::new(".git")));
        assert!(rules.is_excluded(Path::new(".git/config")));
        assert!(rules.is_excluded(Path::new("app/__pycache__/mod.cpython-311.pyc")));
        assert!(rules.is_excluded(Path::new("app/util.pyc")));
        assert!(rules.is_excluded(Path::new("ui/node_modules/react/index.js")));
        assert!(rules.is_excluded(Path::new("target/debug/app")));
    }

    #[test]
    fn test_release_files_not_excluded() {
        let rules = ExcludeRules::new().unwrap();

        assert!(!rules.is_excluded(Path::new("app/server.py")));
        assert!(!rules.is_excluded(Path::new("migrations/0001_init")));
        assert!(!rules.is_excluded(Path::new("ui/dist/index.html")));
    }

    #[test]
    fn test_custom_patterns() {
        let rules = ExcludeRules::new()
            .unwrap()
            .with_patterns(&["*.log", "scratch/**"])
            .unwrap();

        assert!(rules.is_excluded(Path::new("debug.log")));
        assert!(rules.is_excluded(Path::new("scratch/tmp.txt")));
        assert!(!rules.is_excluded(Path::new("app/server.py")));
    }

    #[test]
    fn test_ignore_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let ignore = dir.path().join(".cutoverignore");
        fs::write(&ignore, "# local\n*.secret\n\ndocs/**\n").unwrap();

        let rules = ExcludeRules::new().unwrap().with_ignore_file(&ignore).unwrap();

        assert!(rules.is_excluded(Path::new("api.secret")));
        assert!(rules.is_excluded(Path::new("docs/guide.md")));
        assert!(!rules.is_excluded(Path::new("app/server.py")));
    }
}
