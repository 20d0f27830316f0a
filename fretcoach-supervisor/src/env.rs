//! Environment resolution for the backend process.
//!
//! The child inherits the parent's environment, overlaid with the key/value pairs
//! of the first `.env` file found among the candidate paths. Files are never merged.

use indexmap::IndexMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Ordered environment, last write wins.
pub type EnvironmentMap = IndexMap<String, String>;

/// Result of resolving the environment for one launch.
#[derive(Debug, Clone, Default)]
pub struct ResolvedEnv {
    pub vars: EnvironmentMap,
    /// The configuration file that was applied, if any.
    pub source: Option<PathBuf>,
}

impl ResolvedEnv {
    /// Whether features that need the configuration file are available.
    pub fn has_config_file(&self) -> bool {
        self.source.is_some()
    }
}

/// Resolve against the current process environment.
pub fn resolve(candidates: &[PathBuf]) -> ResolvedEnv {
    let parent = std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)));
    resolve_with(parent, candidates)
}

/// Resolve against an explicit parent environment.
pub fn resolve_with<I>(parent: I, candidates: &[PathBuf]) -> ResolvedEnv
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut vars: EnvironmentMap = parent.into_iter().collect();

    for path in candidates {
        if !path.is_file() {
            continue;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let mut applied = 0usize;
                for (key, value) in parse_env_file(&content) {
                    vars.insert(key, value);
                    applied += 1;
                }
                info!("Loaded {} variables from {}", applied, path.display());
                return ResolvedEnv {
                    vars,
                    source: Some(path.clone()),
                };
            }
            Err(e) => {
                warn!("Skipping unreadable env file {}: {}", path.display(), e);
            }
        }
    }

    warn!("No .env file found, smart bulb features will be disabled");
    debug!("Searched: {:?}", candidates);
    ResolvedEnv { vars, source: None }
}

/// Parse `KEY=VALUE` lines. Blank lines, `#` comments and lines without `=` are skipped.
/// Only the first `=` splits, so values may contain `=`.
pub fn parse_env_file(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn parent() -> Vec<(String, String)> {
        vec![
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("TUYA_KEY".to_string(), "from-parent".to_string()),
        ]
    }

    #[test]
    fn parses_lines_and_keeps_equals_in_values() {
        let parsed = parse_env_file(
            "# comment\n\nTUYA_KEY = abc \nTOKEN=a=b=c\nbroken line\n=novalue\nEMPTY=\n",
        );
        assert_eq!(
            parsed,
            vec![
                ("TUYA_KEY".to_string(), "abc".to_string()),
                ("TOKEN".to_string(), "a=b=c".to_string()),
                ("EMPTY".to_string(), "".to_string()),
            ]
        );
    }

    #[test]
    fn only_second_candidate_exists() {
        let dir = TempDir::new().unwrap();
        let first = dir.path().join("backend/.env");
        let second = dir.path().join(".env");
        std::fs::write(&second, "TUYA_KEY=from-root\nBULB_ID=42\n").unwrap();

        let resolved = resolve_with(parent(), &[first, second.clone()]);
        assert_eq!(resolved.source, Some(second));
        assert_eq!(resolved.vars["TUYA_KEY"], "from-root");
        assert_eq!(resolved.vars["BULB_ID"], "42");
        assert_eq!(resolved.vars["PATH"], "/usr/bin");
    }

    #[test]
    fn first_candidate_wins_without_merging() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("backend")).unwrap();
        let first = dir.path().join("backend/.env");
        let second = dir.path().join(".env");
        std::fs::write(&first, "TUYA_KEY=from-backend\n").unwrap();
        std::fs::write(&second, "TUYA_KEY=from-root\nBULB_ID=42\n").unwrap();

        let resolved = resolve_with(parent(), &[first.clone(), second]);
        assert_eq!(resolved.source, Some(first));
        assert_eq!(resolved.vars["TUYA_KEY"], "from-backend");
        assert!(!resolved.vars.contains_key("BULB_ID"));
    }

    #[test]
    fn no_candidates_returns_parent_unchanged() {
        let dir = TempDir::new().unwrap();
        let resolved = resolve_with(parent(), &[dir.path().join(".env")]);
        assert!(!resolved.has_config_file());
        assert_eq!(resolved.vars.len(), 2);
        assert_eq!(resolved.vars["TUYA_KEY"], "from-parent");
    }

    #[test]
    fn resolution_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "A=1\nA=2\n").unwrap();
        let candidates = vec![path];
        let a = resolve_with(parent(), &candidates);
        let b = resolve_with(parent(), &candidates);
        assert_eq!(a.vars, b.vars);
        assert_eq!(a.vars["A"], "2");
    }
}
