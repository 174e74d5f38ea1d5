//! Script metadata parsing
//!
//! Scripts declare themselves through a userscript-style comment header:
//!
//! ```text
//! // ==UserScript==
//! // @name        Story Log
//! // @author      aria
//! // @version     1.2.0
//! // @depends     aria:dice-core:>=1.0.0
//! // @hostVersion >=1.2.0
//! // ==/UserScript==
//! ```
//!
//! Malformed fields never abort the parse; they accumulate as descriptor
//! errors and disable the script while leaving siblings untouched.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex_lite::Regex;
use semver::{Version, VersionReq};
use sha2::{Digest, Sha512};

use super::signature::TrustLevel;

/// Version of the scripting API this host implements
pub static HOST_VERSION: Lazy<Version> =
    Lazy::new(|| Version::parse("1.2.0").expect("valid host version"));

/// Historical host versions whose scripting API is still compatible; loose
/// host-version constraints are checked against this set instead of the
/// running version alone.
pub static HOST_API_COMPATIBLE: Lazy<Vec<Version>> = Lazy::new(|| {
    ["1.0.0", "1.1.0", "1.2.0"]
        .iter()
        .map(|v| Version::parse(v).expect("valid compat version"))
        .collect()
});

static HEADER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)//[ \t]*==UserScript==[ \t]*\r?\n(.*)//[ \t]*==/UserScript==")
        .expect("valid regex")
});
static KV_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"//[ \t]*@(\S+)[ \t]+([^\r\n]+)").expect("valid regex"));
static NEED_COMPILED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"//[ \t]*@needCompiled\b").expect("valid regex"));

/// A declared dependency on another script
#[derive(Debug, Clone)]
pub struct DependencyEdge {
    pub author: String,
    pub name: String,
    /// `None` means "any version"
    pub constraint: Option<VersionReq>,
    /// Raw declaration text, kept for diagnostics
    pub raw: String,
}

impl DependencyEdge {
    pub fn key(&self) -> String {
        format!("{}:{}", self.author, self.name)
    }

    pub fn constraint_text(&self) -> String {
        self.constraint
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "*".to_string())
    }
}

/// Parsed metadata record for a script, prior to runtime registration
#[derive(Debug, Clone)]
pub struct ScriptDescriptor {
    pub name: String,
    pub author: String,
    pub version: String,
    pub license: String,
    pub homepage: String,
    pub desc: String,
    pub update_time: i64,
    pub install_time: i64,
    pub update_urls: Vec<String>,
    pub etag: String,
    pub depends: Vec<DependencyEdge>,
    pub builtin: bool,
    pub enabled: bool,
    pub trust: TrustLevel,
    /// SHA-512 hex digest of the raw file contents
    pub digest: String,
    pub err_text: Option<String>,
    pub path: PathBuf,
    pub needs_compilation: bool,
}

impl ScriptDescriptor {
    /// Identity key, unique across a load batch
    pub fn key(&self) -> String {
        format!("{}:{}", self.author, self.name)
    }

    pub fn official(&self) -> bool {
        self.trust == TrustLevel::Official
    }

    pub fn record_errors(&mut self, errors: &[String]) {
        if !errors.is_empty() {
            self.enabled = false;
            self.err_text = Some(errors.join("\n"));
        }
    }
}

/// Parse a semver range expression the way script headers use them: empty
/// means any, `a - b` is a hyphen range, and a bare version pins exactly.
pub fn parse_constraint(s: &str) -> Result<VersionReq, semver::Error> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(VersionReq::STAR);
    }
    if let Some((lo, hi)) = s.split_once(" - ") {
        return VersionReq::parse(&format!(">={}, <={}", lo.trim(), hi.trim()));
    }
    if !s.contains(['~', '*', '^', '<', '=', '>', '|']) && !s.contains(',') {
        return VersionReq::parse(&format!("={s}"));
    }
    VersionReq::parse(s)
}

/// Whether a host-version constraint is "strict" (carries comparison
/// operators) or loose (a bare version checked against the compat set).
fn is_strict_constraint(s: &str) -> bool {
    s.contains(['~', '*', '^', '<', '=', '>', '|']) || s.contains(" - ")
}

fn parse_timestamp(v: &str) -> Option<i64> {
    if let Ok(epoch) = v.parse::<i64>() {
        return Some(epoch);
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(v) {
        return Some(t.timestamp());
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(v, "%Y-%m-%d %H:%M:%S") {
        return Some(t.and_utc().timestamp());
    }
    if let Ok(d) = NaiveDate::parse_from_str(v, "%Y-%m-%d") {
        return Some(d.and_hms_opt(0, 0, 0)?.and_utc().timestamp());
    }
    None
}

/// Extract a descriptor from raw script bytes. Errors are returned alongside
/// the descriptor, which is marked disabled but still usable for diagnostics.
pub fn parse_meta(
    path: &Path,
    install_time: i64,
    data: &[u8],
    builtin: bool,
    trust: TrustLevel,
) -> (ScriptDescriptor, Vec<String>) {
    let mut info = ScriptDescriptor {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        author: String::new(),
        version: String::new(),
        license: String::new(),
        homepage: String::new(),
        desc: String::new(),
        update_time: 0,
        install_time,
        update_urls: Vec::new(),
        etag: String::new(),
        depends: Vec::new(),
        builtin,
        enabled: true,
        trust,
        digest: hex::encode(Sha512::digest(data)),
        err_text: None,
        path: path.to_path_buf(),
        needs_compilation: false,
    };
    let mut errors: Vec<String> = Vec::new();

    let text = String::from_utf8_lossy(data);
    if let Some(m) = HEADER_RE.find(&text) {
        let header = m.as_str();
        if NEED_COMPILED_RE.is_match(header) {
            info.needs_compilation = true;
        }
        for caps in KV_RE.captures_iter(header) {
            let key = &caps[1];
            let value = caps[2].trim();
            match key {
                "name" => info.name = value.to_string(),
                "author" => info.author = value.to_string(),
                "version" => info.version = value.to_string(),
                "license" => info.license = value.to_string(),
                "homepageURL" => info.homepage = value.to_string(),
                "description" => info.desc = value.replace("\\n", "\n"),
                "etag" => info.etag = value.to_string(),
                "updateUrl" => info.update_urls.push(value.to_string()),
                "timestamp" => {
                    if let Some(epoch) = parse_timestamp(value) {
                        info.update_time = epoch;
                    }
                }
                "depends" => match parse_depends(value) {
                    Ok(edge) => info.depends.push(edge),
                    Err(()) => errors.push(format!(
                        "script '{}' has a malformed dependency, expected \
                         author:name[:semver-constraint], got '{}'",
                        info.name, value
                    )),
                },
                "hostVersion" | "sealVersion" => {
                    check_host_version(&info.name, value, &mut errors);
                }
                _ => {}
            }
        }
    }

    info.record_errors(&errors);
    (info, errors)
}

fn parse_depends(value: &str) -> Result<DependencyEdge, ()> {
    let (author, rest) = value.split_once(':').ok_or(())?;
    if author.is_empty() || rest.is_empty() {
        return Err(());
    }
    let (name, constraint) = match rest.split_once(':') {
        Some((name, expr)) => {
            let req = parse_constraint(expr).map_err(|_| ())?;
            (name, Some(req))
        }
        None => (rest, None),
    };
    if name.is_empty() {
        return Err(());
    }
    Ok(DependencyEdge {
        author: author.to_string(),
        name: name.to_string(),
        constraint,
        raw: value.to_string(),
    })
}

/// Check a declared host-version constraint against the running host.
/// Constraints with comparison operators are checked strictly against the
/// current version; loose ones pass if any compatible API version satisfies
/// them.
fn check_host_version(script_name: &str, value: &str, errors: &mut Vec<String>) {
    let req = match parse_constraint(value) {
        Ok(req) => req,
        Err(_) => {
            errors.push(format!(
                "script '{}' has a malformed host version constraint '{}', expected a \
                 semver range such as '1.2.0', '>=1.2.0'",
                script_name, value
            ));
            return;
        }
    };
    let ok = if is_strict_constraint(value) {
        req.matches(&HOST_VERSION)
    } else {
        HOST_API_COMPATIBLE.iter().any(|v| req.matches(v))
    };
    if !ok {
        errors.push(format!(
            "script '{}' requires host version {}, incompatible with this host ({})",
            script_name, value, *HOST_VERSION
        ));
    }
}
