//! Script update checks against declared update URLs

use std::fs;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use sha2::{Digest, Sha512};
use tracing::{info, warn};

use crate::application::errors::ScriptError;

use super::metadata::{parse_meta, ScriptDescriptor};

/// Outcome of an update probe
#[derive(Debug)]
pub enum UpdateStatus {
    UpToDate,
    Available {
        data: Vec<u8>,
        new_version: String,
        etag: String,
    },
}

/// Strip a UTF-8 BOM and normalize CRLF line endings, so scripts fetched
/// from different hosting behave identically to local ones.
fn normalize_payload(data: &[u8]) -> Vec<u8> {
    let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF][..]).unwrap_or(data);
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == b'\r' && data.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        out.push(data[i]);
        i += 1;
    }
    out
}

fn fetch(client: &Client, url: &str, etag: &str) -> Result<Option<(Vec<u8>, String)>, ScriptError> {
    let mut request = client.get(url);
    if !etag.is_empty() {
        request = request.header(IF_NONE_MATCH, etag);
    }
    let response = request
        .send()
        .map_err(|e| ScriptError::Update(format!("fetch {url}: {e}")))?;

    if response.status() == StatusCode::NOT_MODIFIED {
        return Ok(None);
    }
    if !response.status().is_success() {
        return Err(ScriptError::Update(format!(
            "fetch {url}: http {}",
            response.status()
        )));
    }
    let new_etag = response
        .headers()
        .get(ETAG)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = response
        .bytes()
        .map_err(|e| ScriptError::Update(format!("fetch {url}: {e}")))?;
    Ok(Some((body.to_vec(), new_etag)))
}

/// Probe the script's update URLs in order, stopping at the first that
/// answers. An ETag match or an identical payload both count as up to date.
pub fn check_update(desc: &ScriptDescriptor) -> Result<UpdateStatus, ScriptError> {
    if desc.builtin {
        return Err(ScriptError::Update(
            "builtin scripts update with the host".to_string(),
        ));
    }
    if desc.update_urls.is_empty() {
        return Err(ScriptError::Update(format!(
            "script '{}' declares no update url",
            desc.name
        )));
    }

    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| ScriptError::Update(e.to_string()))?;

    let mut last_err = None;
    for url in &desc.update_urls {
        match fetch(&client, url, &desc.etag) {
            Ok(None) => return Ok(UpdateStatus::UpToDate),
            Ok(Some((body, etag))) => {
                let data = normalize_payload(&body);
                if hex::encode(Sha512::digest(&data)) == desc.digest {
                    return Ok(UpdateStatus::UpToDate);
                }
                let (remote, errors) =
                    parse_meta(&desc.path, desc.install_time, &data, false, desc.trust);
                if !errors.is_empty() {
                    return Err(ScriptError::Update(format!(
                        "update for '{}' has invalid metadata: {}",
                        desc.name,
                        errors.join("; ")
                    )));
                }
                if remote.key() != desc.key() {
                    return Err(ScriptError::Update(format!(
                        "update url serves '{}' instead of '{}'",
                        remote.key(),
                        desc.key()
                    )));
                }
                info!(
                    "update available for '{}': {} -> {}",
                    desc.key(),
                    desc.version,
                    remote.version
                );
                return Ok(UpdateStatus::Available {
                    data,
                    new_version: remote.version,
                    etag,
                });
            }
            Err(e) => {
                warn!("update probe failed: {}", e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ScriptError::Update("no update source answered".to_string())))
}

/// Overwrite the on-disk script with fetched data. Takes effect on the
/// next reload.
pub fn apply_update(desc: &ScriptDescriptor, data: &[u8]) -> Result<(), ScriptError> {
    fs::write(&desc.path, data)?;
    info!("updated script file {}", desc.path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::scripts::signature::TrustLevel;
    use std::path::Path;

    fn descriptor(builtin: bool, urls: Vec<String>) -> ScriptDescriptor {
        let (mut d, _) = parse_meta(
            Path::new("s.js"),
            0,
            b"// ==UserScript==\n// @name s\n// @author a\n// @version 1.0.0\n// ==/UserScript==\n",
            builtin,
            TrustLevel::Unknown,
        );
        d.update_urls = urls;
        d
    }

    #[test]
    fn bom_and_crlf_are_normalized() {
        let raw = b"\xEF\xBB\xBF// a\r\n// b\r\nplain\n";
        assert_eq!(normalize_payload(raw), b"// a\n// b\nplain\n");
        assert_eq!(normalize_payload(b"untouched\n"), b"untouched\n");
    }

    #[test]
    fn lone_carriage_returns_survive() {
        assert_eq!(normalize_payload(b"a\rb"), b"a\rb");
    }

    #[test]
    fn builtin_scripts_are_not_updatable() {
        let err = check_update(&descriptor(true, vec!["http://x".to_string()])).unwrap_err();
        assert!(err.to_string().contains("builtin"));
    }

    #[test]
    fn missing_update_url_is_an_error() {
        let err = check_update(&descriptor(false, Vec::new())).unwrap_err();
        assert!(err.to_string().contains("no update url"));
    }
}
