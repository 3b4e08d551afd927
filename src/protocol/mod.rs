//! Categorize a config URI, extract its endpoint, and compute the
//! semantic hash used for deduplication.

pub mod clash;

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use regex::Regex;
use std::sync::LazyLock;
use url::Url;

use crate::error::{AppError, AppResult};
use crate::models::{Protocol, SemanticHash};

/// Maximum size of a base64 payload this parser will attempt to decode
/// (vmess JSON bodies), matching the fetcher's decode-path size cap.
pub const MAX_DECODE_SIZE: usize = 256 * 1024;

static SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(vmess|vless|reality|ssr|ss|trojan|hysteria2|hy2|hysteria|tuic|wireguard|wg|naive|brook|snell|shadowtls|juicity|socks5|socks4|socks|https|http)://")
        .expect("static scheme regex is valid")
});

/// Identify the protocol from a config URI's scheme prefix, case-insensitive.
pub fn categorize(line: &str) -> Option<Protocol> {
    let caps = SCHEME_RE.captures(line.trim())?;
    let scheme = caps.get(1)?.as_str().to_lowercase();
    Some(match scheme.as_str() {
        "vmess" => Protocol::VMess,
        "vless" => Protocol::VLess,
        "reality" => Protocol::Reality,
        "trojan" => Protocol::Trojan,
        "ss" => Protocol::Shadowsocks,
        "ssr" => Protocol::ShadowsocksR,
        "hysteria" => Protocol::Hysteria,
        "hysteria2" | "hy2" => Protocol::Hysteria2,
        "tuic" => Protocol::Tuic,
        "wireguard" | "wg" => Protocol::WireGuard,
        "naive" => Protocol::Naive,
        "brook" => Protocol::Brook,
        "snell" => Protocol::Snell,
        "shadowtls" => Protocol::ShadowTls,
        "juicity" => Protocol::Juicity,
        "socks5" | "socks4" | "socks" => Protocol::Socks,
        "http" | "https" => Protocol::Http,
        other => Protocol::Other(other.to_string()),
    })
}

/// Tolerant base64 decode: tries the standard alphabet, then URL-safe,
/// padding to a multiple of 4 first, since vmess links in the wild mix
/// both encodings and sometimes drop padding.
pub fn decode_base64_tolerant(input: &str) -> Option<Vec<u8>> {
    let trimmed = input.trim();
    if trimmed.len() > MAX_DECODE_SIZE {
        return None;
    }
    let padded = pad_to_multiple_of_4(trimmed);
    STANDARD
        .decode(&padded)
        .or_else(|_| URL_SAFE.decode(&padded))
        .ok()
}

fn pad_to_multiple_of_4(s: &str) -> String {
    let rem = s.len() % 4;
    if rem == 0 {
        s.to_string()
    } else {
        format!("{s}{}", "=".repeat(4 - rem))
    }
}

/// Reject hosts/ports that are structurally invalid or unsafe: embedded
/// whitespace/control characters in the host, or a port outside 1..=65535.
pub fn sanitize_host_port(host: &str, port_str: Option<&str>) -> AppResult<(String, u16)> {
    let host = host.trim();
    if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AppError::SecurityReject(format!(
            "invalid host: {host:?}"
        )));
    }

    let port: u16 = match port_str {
        Some(p) => p
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|v| *v >= 1 && *v <= 65535)
            .map(|v| v as u16)
            .ok_or_else(|| AppError::SecurityReject(format!("invalid port: {p:?}")))?,
        None => {
            return Err(AppError::SecurityReject("missing port".to_string()));
        }
    };

    Ok((host.to_lowercase(), port))
}

/// Extract `(host, port)` from a config line. vmess carries a base64 JSON
/// payload; every other protocol is a URL the scheme's authority can be
/// parsed from directly.
pub fn extract_endpoint(line: &str) -> AppResult<(String, u16)> {
    let protocol =
        categorize(line).ok_or_else(|| AppError::ParseError("unrecognized scheme".to_string()))?;

    if matches!(protocol, Protocol::VMess) {
        let payload = line
            .splitn(2, "://")
            .nth(1)
            .ok_or_else(|| AppError::ParseError("vmess uri missing payload".to_string()))?
            .split(['#', '?'])
            .next()
            .unwrap_or("");
        let decoded = decode_base64_tolerant(payload)
            .ok_or_else(|| AppError::ParseError("vmess payload is not valid base64".to_string()))?;
        let json: serde_json::Value = serde_json::from_slice(&decoded)
            .map_err(|e| AppError::ParseError(format!("vmess payload is not valid json: {e}")))?;
        let host = json
            .get("add")
            .or_else(|| json.get("host"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::ParseError("vmess payload missing add/host".to_string()))?;
        let port = json.get("port").and_then(|v| {
            v.as_str()
                .map(str::to_string)
                .or_else(|| v.as_u64().map(|n| n.to_string()))
        });
        return sanitize_host_port(host, port.as_deref());
    }

    let url = Url::parse(line).map_err(|e| AppError::ParseError(format!("not a url: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| AppError::ParseError("url has no host".to_string()))?;
    let port = url.port().map(|p| p.to_string());
    sanitize_host_port(host, port.as_deref())
}

/// Canonicalize query parameters into a sorted `key=value` list so the
/// hash is invariant to ordering, matching `sorted-canonical-params`.
fn canonical_params(line: &str) -> String {
    let Ok(url) = Url::parse(line) else {
        return String::new();
    };
    let mut params: BTreeMap<String, String> = BTreeMap::new();
    for (k, v) in url.query_pairs() {
        params.insert(k.to_lowercase(), v.to_lowercase());
    }
    params
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Compute the 128-bit semantic hash over `{protocol, normalized-host,
/// port, sorted-canonical-params}`, never over tags/remarks/fragments.
pub fn semantic_hash(line: &str) -> AppResult<SemanticHash> {
    let protocol = categorize(line).ok_or_else(|| AppError::ParseError("unrecognized scheme".to_string()))?;
    let (host, port) = extract_endpoint(line)?;
    let params = canonical_params(line);

    let material = format!("{}|{}|{}|{}", protocol.key(), host, port, params);
    let digest = blake3::hash(material.as_bytes());
    let bytes = digest.as_bytes();
    let mut value: u128 = 0;
    for b in &bytes[..16] {
        value = (value << 8) | (*b as u128);
    }
    Ok(SemanticHash(value))
}

/// Whether `line` looks like a structurally valid config worth keeping for
/// raw/base64 output even when endpoint extraction failed.
pub fn is_valid_config(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.len() < 10 {
        return false;
    }
    categorize(trimmed).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_known_schemes_case_insensitively() {
        assert_eq!(categorize("VMESS://abc"), Some(Protocol::VMess));
        assert_eq!(categorize("trojan://pw@host:443"), Some(Protocol::Trojan));
        assert_eq!(categorize("ssr://abc"), Some(Protocol::ShadowsocksR));
        assert_eq!(categorize("not-a-scheme text"), None);
    }

    #[test]
    fn hash_is_stable_across_param_order_and_fragment() {
        let a = "vless://u@h:443?security=tls&type=ws&path=/a#s1";
        let b = "vless://u@h:443?type=ws&security=tls&path=/a#s2";
        assert_eq!(semantic_hash(a).unwrap().0, semantic_hash(b).unwrap().0);
    }

    #[test]
    fn hash_differs_across_hosts() {
        let a = semantic_hash("vless://u@h1:443?type=ws").unwrap();
        let b = semantic_hash("vless://u@h2:443?type=ws").unwrap();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn vmess_endpoint_decodes_standard_and_urlsafe_base64() {
        let json = r#"{"add":"1.2.3.4","port":"443","id":"u1"}"#;
        let std_b64 = STANDARD.encode(json);
        let line = format!("vmess://{std_b64}");
        let (host, port) = extract_endpoint(&line).unwrap();
        assert_eq!(host, "1.2.3.4");
        assert_eq!(port, 443);
    }

    #[test]
    fn rejects_bad_host_with_whitespace() {
        let line = "vless://u@bad host:443";
        assert!(extract_endpoint(line).is_err());
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(sanitize_host_port("host.example", Some("70000")).is_err());
        assert!(sanitize_host_port("host.example", Some("0")).is_err());
        assert!(sanitize_host_port("host.example", Some("notaport")).is_err());
    }

    #[test]
    fn is_valid_config_requires_known_scheme_and_length() {
        assert!(is_valid_config("trojan://pw@host.example:443#t"));
        assert!(!is_valid_config("short"));
        assert!(!is_valid_config("this is not a config at all"));
    }
}
