//! Per-format serialization of a result set. Each function is pure and
//! infallible over its input — I/O and failure semantics live in
//! `output::mod`.

use std::collections::BTreeSet;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value, json};

use crate::models::ConfigResult;
use crate::protocol::clash;

pub fn to_raw(results: &[ConfigResult]) -> String {
    results
        .iter()
        .map(|r| r.raw_config.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn to_base64(results: &[ConfigResult]) -> String {
    STANDARD.encode(to_raw(results))
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Header is `Config,Protocol,Host,Port,Ping_MS,Reachable,Source`, extended
/// with `Handshake` and one `<Name>_OK` column per distinct app test seen
/// across the result set.
pub fn to_csv(results: &[ConfigResult]) -> String {
    let mut app_tests: BTreeSet<&str> = BTreeSet::new();
    for r in results {
        for key in r.app_test_results.keys() {
            app_tests.insert(key.as_str());
        }
    }

    let mut header = vec![
        "Config".to_string(),
        "Protocol".to_string(),
        "Host".to_string(),
        "Port".to_string(),
        "Ping_MS".to_string(),
        "Reachable".to_string(),
        "Source".to_string(),
        "Handshake".to_string(),
    ];
    for name in &app_tests {
        header.push(format!("{name}_OK"));
    }

    let mut lines = vec![header.join(",")];
    for r in results {
        let ping_ms = r
            .ping_time_s
            .map(|t| format!("{:.2}", t * 1000.0))
            .unwrap_or_default();
        let mut row = vec![
            csv_escape(&r.raw_config),
            r.protocol.display_name(),
            r.host.clone().unwrap_or_default(),
            r.port.map(|p| p.to_string()).unwrap_or_default(),
            ping_ms,
            r.is_reachable.to_string(),
            csv_escape(&r.source_url),
            r.handshake_ok.map(|b| b.to_string()).unwrap_or_default(),
        ];
        for name in &app_tests {
            let value = r
                .app_test_results
                .get(*name)
                .and_then(|v| *v)
                .map(|b| b.to_string())
                .unwrap_or_default();
            row.push(value);
        }
        lines.push(row.join(","));
    }
    lines.join("\n")
}

/// Tag is sanitized to `[A-Za-z0-9_-]+` to stay a valid sing-box outbound
/// tag even when the source `name`/protocol carries odd characters.
fn sanitize_tag(raw: &str) -> String {
    let sanitized: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect();
    let mut collapsed = String::with_capacity(sanitized.len());
    let mut last_dash = false;
    for c in sanitized.chars() {
        if c == '-' {
            if !last_dash {
                collapsed.push(c);
            }
            last_dash = true;
        } else {
            collapsed.push(c);
            last_dash = false;
        }
    }
    collapsed.trim_matches('-').to_string()
}

pub fn to_singbox_json(results: &[ConfigResult]) -> Value {
    let outbounds: Vec<Value> = results
        .iter()
        .enumerate()
        .map(|(idx, r)| {
            let tag = sanitize_tag(&format!("{}-{idx}", r.protocol.key()));
            let mut ob = json!({
                "type": r.protocol.key(),
                "tag": tag,
                "server": r.host.clone().unwrap_or_default(),
                "server_port": r.port,
                "raw": r.raw_config,
            });
            if let Some(country) = r.country() {
                ob["country"] = json!(country);
            }
            ob
        })
        .collect();
    json!({ "outbounds": outbounds })
}

pub fn to_html_report(results: &[ConfigResult]) -> String {
    let rows: String = results
        .iter()
        .map(|r| {
            let latency = r
                .ping_time_s
                .map(|t| format!("{:.2}", t * 1000.0))
                .unwrap_or_default();
            let country = r.country().unwrap_or_default();
            let host = r.host.as_deref().unwrap_or_default();
            format!(
                "<tr><td>{}</td><td>{host}</td><td>{latency}</td><td>{country}</td></tr>",
                r.protocol.display_name()
            )
        })
        .collect();
    format!(
        "<html><head><meta charset='utf-8'><title>VPN Report</title></head><body>\
         <table border='1'><tr><th>Protocol</th><th>Host</th><th>Latency (ms)</th><th>Country</th></tr>\
         {rows}</table></body></html>"
    )
}

/// Clash proxy stanzas for every result whose protocol has a Clash mapping.
pub fn to_clash_proxies(results: &[ConfigResult]) -> Vec<Value> {
    results
        .iter()
        .enumerate()
        .filter_map(|(idx, r)| {
            let country = r.country().unwrap_or_default();
            let flag = clash::flag_emoji(country);
            let host = r.host.as_deref().unwrap_or("unknown");
            let latency = r
                .ping_time_s
                .map(|t| format!("{:.0}ms", t * 1000.0))
                .unwrap_or_else(|| "?".to_string());
            let name = format!("{flag} {country} - {host} - {latency}").trim().to_string();
            clash::parse_to_clash(&r.raw_config, &format!("{name}-{idx}"), &r.protocol)
        })
        .collect()
}

pub fn to_clash_yaml(results: &[ConfigResult]) -> String {
    let proxies = to_clash_proxies(results);
    if proxies.is_empty() {
        return String::new();
    }
    let cfg = clash::build_clash_config(proxies);
    serde_yaml::to_string(&cfg).unwrap_or_default()
}

pub fn to_surge_conf(proxies: &[Value]) -> String {
    proxies
        .iter()
        .filter_map(|p| {
            let name = p.get("name")?.as_str()?;
            let typ = p.get("type")?.as_str()?;
            let server = p.get("server")?.as_str()?;
            let port = p.get("port")?.as_u64()?;
            let mut fields = vec![typ.to_string(), server.to_string(), port.to_string()];
            if let Some(password) = p.get("password").and_then(|v| v.as_str()) {
                fields.push(format!("password={password}"));
            }
            if let Some(cipher) = p.get("cipher").and_then(|v| v.as_str()) {
                fields.push(format!("encrypt-method={cipher}"));
            }
            Some(format!("{name} = {}", fields.join(", ")))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn to_qx_conf(proxies: &[Value]) -> String {
    proxies
        .iter()
        .filter_map(|p| {
            let name = p.get("name")?.as_str()?;
            let typ = p.get("type")?.as_str()?;
            let server = p.get("server")?.as_str()?;
            let port = p.get("port")?.as_u64()?;
            let mut fields = vec![format!("{typ}={server}:{port}")];
            if let Some(password) = p.get("password").and_then(|v| v.as_str()) {
                fields.push(format!("password={password}"));
            }
            fields.push(format!("tag={name}"));
            Some(fields.join(", "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn to_xyz_lines(proxies: &[Value]) -> String {
    proxies
        .iter()
        .filter_map(|p| {
            let name = p.get("name")?.as_str()?;
            let server = p.get("server")?.as_str()?;
            let port = p.get("port")?.as_u64()?;
            Some(format!("{name},{server},{port}"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Protocol, SemanticHash};

    fn sample() -> ConfigResult {
        let mut r = ConfigResult::new(
            "vmess://x",
            Protocol::VMess,
            Some("1.2.3.4".into()),
            Some(443),
            "https://s1",
            SemanticHash(1),
        );
        r.apply_test_outcome(Some(0.123), 5000);
        r
    }

    #[test]
    fn csv_header_matches_contract_and_extends_with_app_tests() {
        let mut r = sample();
        r.app_test_results.insert("youtube".to_string(), Some(true));
        let csv = to_csv(&[r]);
        let header = csv.lines().next().expect("header line");
        assert_eq!(
            header,
            "Config,Protocol,Host,Port,Ping_MS,Reachable,Source,Handshake,youtube_OK"
        );
    }

    #[test]
    fn base64_round_trips_raw_contents() {
        let results = vec![sample()];
        let raw = to_raw(&results);
        let b64 = to_base64(&results);
        let decoded = STANDARD.decode(b64).expect("valid base64");
        assert_eq!(String::from_utf8(decoded).expect("utf8"), raw);
    }

    #[test]
    fn singbox_tags_are_sanitized_and_unique() {
        let results = vec![sample(), sample()];
        let doc = to_singbox_json(&results);
        let outbounds = doc["outbounds"].as_array().expect("array");
        assert_eq!(outbounds.len(), 2);
        assert_ne!(outbounds[0]["tag"], outbounds[1]["tag"]);
    }

    #[test]
    fn singbox_outbound_carries_the_raw_config() {
        let results = vec![sample()];
        let doc = to_singbox_json(&results);
        assert_eq!(doc["outbounds"][0]["raw"], "vmess://x");
    }

    #[test]
    fn xyz_lines_are_name_server_port() {
        let proxies = vec![json!({"name": "p1", "server": "1.2.3.4", "port": 443})];
        assert_eq!(to_xyz_lines(&proxies), "p1,1.2.3.4,443");
    }
}
