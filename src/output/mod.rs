//! Write the full set of subscription artifacts for one run.
//!
//! The raw list is the only format whose write failure aborts the run;
//! everything else is best-effort — a broken CSV formatter shouldn't stop
//! Clash users from getting their YAML.

pub mod formats;

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::models::ConfigResult;
use crate::utils::atomic_write;

/// Every format token `--formats` / [`OutputRequest::formats`] accepts.
/// `"all"` is a wildcard handled separately by [`OutputRequest::wants`].
pub const KNOWN_FORMATS: &[&str] = &[
    "raw",
    "base64",
    "csv",
    "singbox",
    "clash",
    "clash_proxies",
    "surge",
    "qx",
    "xyz",
    "html",
    "all",
];

/// Which optional formats to emit, beyond the always-on raw + JSON report.
#[derive(Debug, Clone)]
pub struct OutputRequest {
    pub output_dir: PathBuf,
    pub prefix: String,
    pub formats: HashSet<String>,
    pub surge_path: Option<PathBuf>,
    pub qx_path: Option<PathBuf>,
    pub xyz_path: Option<PathBuf>,
}

impl OutputRequest {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            prefix: String::new(),
            formats: ["raw", "base64", "csv", "singbox", "clash"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            surge_path: None,
            qx_path: None,
            xyz_path: None,
        }
    }

    fn wants(&self, format: &str) -> bool {
        self.formats.contains("all") || self.formats.contains(format)
    }

    fn path(&self, name: &str) -> PathBuf {
        self.output_dir.join(format!("{}{name}", self.prefix))
    }

    /// Reject any format token that isn't in [`KNOWN_FORMATS`]. Called
    /// before a run starts so a typo'd `--formats` fails fast with a
    /// `ConfigError` instead of silently writing nothing for it.
    pub fn validate_formats(&self) -> AppResult<()> {
        for format in &self.formats {
            if !KNOWN_FORMATS.contains(&format.as_str()) {
                return Err(AppError::ConfigError(format!(
                    "unknown output format '{format}' (known: {})",
                    KNOWN_FORMATS.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// Paths this run actually wrote, surfaced back to the caller (and into
/// `vpn_report.json`'s `output_files` map).
#[derive(Debug, Default)]
pub struct OutputManifest {
    pub written: Vec<(String, PathBuf)>,
}

/// Write every requested format for `results`, returning once the
/// mandatory raw file has landed. `stats` is an arbitrary caller-supplied
/// JSON blob folded into the generation report's `statistics` field.
pub async fn write_outputs(
    results: &[ConfigResult],
    stats: serde_json::Value,
    started_at: Instant,
    total_sources: usize,
    req: &OutputRequest,
) -> AppResult<OutputManifest> {
    req.validate_formats()?;
    tokio::fs::create_dir_all(&req.output_dir).await?;
    let mut manifest = OutputManifest::default();

    let raw_path = req.path("vpn_subscription_raw.txt");
    atomic_write(&raw_path, &formats::to_raw(results)).await?;
    manifest.written.push(("raw".to_string(), raw_path.clone()));

    if req.wants("base64") {
        let path = req.path("vpn_subscription_base64.txt");
        match atomic_write(&path, &formats::to_base64(results)).await {
            Ok(()) => manifest.written.push(("base64".to_string(), path)),
            Err(e) => warn!(error = %e, "failed to write base64 output"),
        }
    }

    if req.wants("csv") {
        let path = req.path("vpn_detailed.csv");
        match atomic_write(&path, &formats::to_csv(results)).await {
            Ok(()) => manifest.written.push(("detailed_csv".to_string(), path)),
            Err(e) => warn!(error = %e, "failed to write csv output"),
        }
    }

    if req.wants("html") {
        let path = req.path("vpn_report.html");
        match atomic_write(&path, &formats::to_html_report(results)).await {
            Ok(()) => manifest.written.push(("html_report".to_string(), path)),
            Err(e) => warn!(error = %e, "failed to write html report"),
        }
    }

    let singbox_path = req.path("vpn_singbox.json");
    let singbox_body = serde_json::to_string_pretty(&formats::to_singbox_json(results))
        .unwrap_or_else(|_| "{\"outbounds\":[]}".to_string());
    match atomic_write(&singbox_path, &singbox_body).await {
        Ok(()) => manifest.written.push(("singbox".to_string(), singbox_path)),
        Err(e) => warn!(error = %e, "failed to write sing-box output"),
    }

    let needs_proxies = req.wants("clash")
        || req.wants("clash_proxies")
        || req.surge_path.is_some()
        || req.qx_path.is_some()
        || req.xyz_path.is_some();
    let proxies = if needs_proxies {
        formats::to_clash_proxies(results)
    } else {
        Vec::new()
    };

    if req.wants("clash") {
        let path = req.path("clash.yaml");
        match atomic_write(&path, &formats::to_clash_yaml(results)).await {
            Ok(()) => manifest.written.push(("clash".to_string(), path)),
            Err(e) => warn!(error = %e, "failed to write clash output"),
        }
    }

    if req.wants("clash_proxies") {
        let path = req.path("vpn_clash_proxies.yaml");
        let body = if proxies.is_empty() {
            String::new()
        } else {
            serde_yaml::to_string(&json!({ "proxies": proxies })).unwrap_or_default()
        };
        match atomic_write(&path, &body).await {
            Ok(()) => manifest.written.push(("clash_proxies".to_string(), path)),
            Err(e) => warn!(error = %e, "failed to write clash proxies output"),
        }
    }

    if let Some(path) = &req.surge_path {
        match atomic_write(path, &formats::to_surge_conf(&proxies)).await {
            Ok(()) => manifest.written.push(("surge".to_string(), path.clone())),
            Err(e) => warn!(error = %e, "failed to write surge output"),
        }
    }
    if let Some(path) = &req.qx_path {
        match atomic_write(path, &formats::to_qx_conf(&proxies)).await {
            Ok(()) => manifest.written.push(("qx".to_string(), path.clone())),
            Err(e) => warn!(error = %e, "failed to write quantumult x output"),
        }
    }
    if let Some(path) = &req.xyz_path {
        match atomic_write(path, &formats::to_xyz_lines(&proxies)).await {
            Ok(()) => manifest.written.push(("xyz".to_string(), path.clone())),
            Err(e) => warn!(error = %e, "failed to write xyz output"),
        }
    }

    let report_path = req.path("vpn_report.json");
    let output_files: serde_json::Map<String, serde_json::Value> = manifest
        .written
        .iter()
        .map(|(name, path)| (name.clone(), json!(path.display().to_string())))
        .collect();
    let report = json!({
        "generation_info": {
            "timestamp_utc": Utc::now().to_rfc3339(),
            "processing_time_seconds": started_at.elapsed().as_secs_f64(),
        },
        "statistics": stats,
        "source_categories": { "total_unique_sources": total_sources },
        "output_files": output_files,
        "usage_instructions": {
            "base64_subscription": "Copy the base64 file's contents as a subscription URL",
            "raw_subscription": "Host the raw file and use its URL as a subscription link",
            "csv_analysis": "Use the CSV file for detailed analysis and custom filtering",
            "clash_yaml": "Load clash.yaml in Clash Meta or Stash",
            "clash_proxies_yaml": "Import vpn_clash_proxies.yaml as a simple provider",
            "supported_clients": [
                "V2rayNG", "V2rayN", "Hiddify Next", "Shadowrocket", "NekoBox",
                "Clash Meta", "Sing-Box", "Streisand", "Karing",
            ],
        },
    });
    let report_body = serde_json::to_string_pretty(&report)
        .unwrap_or_else(|_| "{}".to_string());
    atomic_write(&report_path, &report_body).await?;
    manifest.written.push(("json_report".to_string(), report_path));

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Protocol, SemanticHash};

    fn sample() -> ConfigResult {
        ConfigResult::new(
            "vmess://x",
            Protocol::VMess,
            Some("1.2.3.4".into()),
            Some(443),
            "https://s1",
            SemanticHash(1),
        )
    }

    #[tokio::test]
    async fn writes_raw_and_json_report_at_minimum() {
        let dir = tempfile::tempdir().expect("tempdir");
        let req = OutputRequest::new(dir.path());
        let results = vec![sample()];
        let manifest = write_outputs(&results, json!({}), Instant::now(), 1, &req)
            .await
            .expect("writes succeed");

        assert!(manifest.written.iter().any(|(n, _)| n == "raw"));
        assert!(manifest.written.iter().any(|(n, _)| n == "json_report"));
        assert!(dir.path().join("vpn_subscription_raw.txt").exists());
        assert!(dir.path().join("vpn_report.json").exists());
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut req = OutputRequest::new("/tmp/unused");
        req.formats = ["raw", "not-a-real-format"].into_iter().map(str::to_string).collect();
        let err = req.validate_formats().expect_err("unknown token must be rejected");
        assert!(matches!(err, crate::error::AppError::ConfigError(_)));
    }

    #[tokio::test]
    async fn unknown_format_fails_write_outputs_before_touching_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut req = OutputRequest::new(dir.path());
        req.formats = ["bogus".to_string()].into_iter().collect();
        let results = vec![sample()];
        let err = write_outputs(&results, json!({}), Instant::now(), 1, &req)
            .await
            .expect_err("unknown format must fail the run");
        assert!(matches!(err, crate::error::AppError::ConfigError(_)));
        assert!(!dir.path().join("vpn_subscription_raw.txt").exists());
    }

    #[tokio::test]
    async fn prefix_is_applied_to_every_file_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut req = OutputRequest::new(dir.path());
        req.prefix = "nightly_".to_string();
        let results = vec![sample()];
        write_outputs(&results, json!({}), Instant::now(), 1, &req)
            .await
            .expect("writes succeed");
        assert!(dir.path().join("nightly_vpn_subscription_raw.txt").exists());
    }
}
