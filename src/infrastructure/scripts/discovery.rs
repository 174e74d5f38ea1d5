//! Script discovery and builtin seeding
//!
//! The builtin subdirectory is re-seeded from packaged assets on every start
//! and self-heals against tampering: an on-disk builtin that fails signature
//! and digest checks is overwritten with the packaged copy before loading.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sha2::{Digest, Sha512};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::application::errors::ScriptError;

use super::metadata::{parse_meta, ScriptDescriptor};
use super::signature::{SignatureVerifier, TrustLevel};

/// Subdirectory holding host-packaged scripts
pub const BUILTIN_DIR: &str = "_builtin";

/// A script shipped inside the host binary
pub struct PackagedScript {
    pub name: &'static str,
    pub data: &'static str,
}

/// Scripts seeded into the builtin directory on every start
pub const PACKAGED_SCRIPTS: &[PackagedScript] = &[PackagedScript {
    name: "core.js",
    data: include_str!("../../../assets/scripts/core.js"),
}];

fn is_script_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("js") || ext.eq_ignore_ascii_case("ts")
    )
}

fn install_time(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(|| Utc::now().timestamp())
}

/// Discovers scripts on disk and classifies their trust
pub struct ScriptDiscovery {
    scripts_dir: PathBuf,
    verifier: SignatureVerifier,
    /// Digests of the packaged builtin scripts
    packaged_digests: HashSet<String>,
}

impl ScriptDiscovery {
    pub fn new(scripts_dir: impl Into<PathBuf>, verifier: SignatureVerifier) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            verifier,
            packaged_digests: HashSet::new(),
        }
    }

    pub fn builtin_dir(&self) -> PathBuf {
        self.scripts_dir.join(BUILTIN_DIR)
    }

    /// Whether an on-disk builtin is acceptable as-is: verified official, or
    /// byte-identical to a packaged copy (covers hosts without a trust key).
    fn builtin_ok(&self, data: &[u8]) -> bool {
        self.verifier.classify(data) == TrustLevel::Official
            || self.packaged_digests.contains(&hex::encode(Sha512::digest(data)))
    }

    /// Seed the builtin directory from packaged assets, overwriting any
    /// on-disk copy that fails verification.
    pub fn seed_builtins(&mut self) -> Result<(), ScriptError> {
        let builtin_dir = self.builtin_dir();
        fs::create_dir_all(&builtin_dir)?;

        for packaged in PACKAGED_SCRIPTS {
            self.packaged_digests
                .insert(hex::encode(Sha512::digest(packaged.data.as_bytes())));
            let target = builtin_dir.join(packaged.name);
            match fs::read(&target) {
                Err(_) => fs::write(&target, packaged.data)?,
                Ok(existing) => {
                    if !self.builtin_ok(&existing) {
                        warn!(
                            "builtin script '{}' failed verification, restoring packaged copy",
                            packaged.name
                        );
                        fs::write(&target, packaged.data)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Scan builtin then third-party scripts. Descriptors with metadata
    /// errors are returned disabled; the persisted disabled set applies to
    /// healthy descriptors.
    pub fn scan(&self, disabled: &HashMap<String, bool>) -> Vec<ScriptDescriptor> {
        let mut descriptors = Vec::new();
        let builtin_dir = self.builtin_dir();

        for entry in WalkDir::new(&builtin_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || !is_script_file(path) {
                continue;
            }
            info!("reading builtin script: {}", path.display());
            let data = match fs::read(path) {
                Ok(d) => d,
                Err(e) => {
                    warn!("cannot read builtin script {}: {}", path.display(), e);
                    continue;
                }
            };
            if !self.builtin_ok(&data) {
                warn!(
                    "builtin script {} failed verification, refusing to load",
                    path.display()
                );
                continue;
            }
            // passing builtin_ok makes the script trusted, key or not
            descriptors.push(self.describe(path, &data, true, TrustLevel::Official, disabled));
        }

        for entry in WalkDir::new(&self.scripts_dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                !(e.file_type().is_dir() && e.file_name().to_str() == Some(BUILTIN_DIR))
            })
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || !is_script_file(path) {
                continue;
            }
            info!("reading script: {}", path.display());
            let data = match fs::read(path) {
                Ok(d) => d,
                Err(e) => {
                    warn!("cannot read script {}: {}", path.display(), e);
                    continue;
                }
            };
            let trust = self.verifier.classify(&data);
            descriptors.push(self.describe(path, &data, false, trust, disabled));
        }

        descriptors
    }

    fn describe(
        &self,
        path: &Path,
        data: &[u8],
        builtin: bool,
        trust: TrustLevel,
        disabled: &HashMap<String, bool>,
    ) -> ScriptDescriptor {
        let (mut info, errors) = parse_meta(path, install_time(path), data, builtin, trust);
        for err in &errors {
            warn!("script metadata error: {}", err);
        }
        if info.enabled && disabled.get(&info.name).copied().unwrap_or(false) {
            info.enabled = false;
        }
        if path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("ts"))
        {
            info.needs_compilation = true;
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn discovery(dir: &Path) -> ScriptDiscovery {
        let mut d = ScriptDiscovery::new(dir, SignatureVerifier::new(None));
        d.seed_builtins().unwrap();
        d
    }

    #[test]
    fn seeding_creates_builtins() {
        let tmp = tempdir().unwrap();
        let d = discovery(tmp.path());
        assert!(d.builtin_dir().join("core.js").exists());
    }

    #[test]
    fn tampered_builtin_is_restored() {
        let tmp = tempdir().unwrap();
        let mut d = ScriptDiscovery::new(tmp.path(), SignatureVerifier::new(None));
        d.seed_builtins().unwrap();

        let target = d.builtin_dir().join("core.js");
        fs::write(&target, "// tampered\n").unwrap();
        d.seed_builtins().unwrap();

        let healed = fs::read_to_string(&target).unwrap();
        assert!(healed.contains("==UserScript=="));
    }

    #[test]
    fn scan_separates_builtin_from_third_party() {
        let tmp = tempdir().unwrap();
        let d = discovery(tmp.path());
        fs::write(
            tmp.path().join("mine.js"),
            "// ==UserScript==\n// @name mine\n// @author me\n// @version 1.0.0\n// ==/UserScript==\n",
        )
        .unwrap();

        let scripts = d.scan(&HashMap::new());
        assert_eq!(scripts.len(), 2);
        assert!(scripts.iter().any(|s| s.builtin && s.name == "core"));
        assert!(scripts.iter().any(|s| !s.builtin && s.name == "mine"));
    }

    #[test]
    fn builtin_dir_skipped_during_third_party_walk() {
        let tmp = tempdir().unwrap();
        let d = discovery(tmp.path());
        let scripts = d.scan(&HashMap::new());
        // core.js appears once (as builtin), not again from the outer walk
        assert_eq!(scripts.iter().filter(|s| s.name == "core").count(), 1);
    }

    #[test]
    fn nested_third_party_scripts_are_found() {
        let tmp = tempdir().unwrap();
        let d = discovery(tmp.path());
        let nested = tmp.path().join("pack");
        fs::create_dir_all(&nested).unwrap();
        fs::write(
            nested.join("deep.js"),
            "// ==UserScript==\n// @name deep\n// @author me\n// @version 1.0.0\n// ==/UserScript==\n",
        )
        .unwrap();

        let scripts = d.scan(&HashMap::new());
        assert!(scripts.iter().any(|s| s.name == "deep"));
    }

    #[test]
    fn disabled_set_applies_to_healthy_scripts() {
        let tmp = tempdir().unwrap();
        let d = discovery(tmp.path());
        fs::write(
            tmp.path().join("mine.js"),
            "// ==UserScript==\n// @name mine\n// @author me\n// @version 1.0.0\n// ==/UserScript==\n",
        )
        .unwrap();

        let mut disabled = HashMap::new();
        disabled.insert("mine".to_string(), true);
        let scripts = d.scan(&disabled);
        let mine = scripts.iter().find(|s| s.name == "mine").unwrap();
        assert!(!mine.enabled);
        assert!(mine.err_text.is_none(), "disabled is not an error");
    }

    #[test]
    fn typescript_scripts_need_compilation() {
        let tmp = tempdir().unwrap();
        let d = discovery(tmp.path());
        fs::write(
            tmp.path().join("typed.ts"),
            "// ==UserScript==\n// @name typed\n// @author me\n// @version 1.0.0\n// ==/UserScript==\n",
        )
        .unwrap();

        let scripts = d.scan(&HashMap::new());
        let typed = scripts.iter().find(|s| s.name == "typed").unwrap();
        assert!(typed.needs_compilation);
    }
}
