//! Translate a config URI into a Clash proxy stanza.
//!
//! Mirrors the per-protocol field mapping of a Clash-compatible merger:
//! each protocol gets its own branch because Clash's proxy schema has no
//! shared shape across vmess/vless/trojan/shadowsocks/etc.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use serde_json::{Map, Value, json};
use url::Url;

use super::decode_base64_tolerant;
use crate::models::Protocol;

/// Regional-indicator flag emoji for a 2-letter country code, e.g. `"US"`
/// → 🇺🇸. Falls back to the empty string for anything that isn't exactly
/// two ASCII letters.
pub fn flag_emoji(country: &str) -> String {
    let upper = country.to_uppercase();
    let chars: Vec<char> = upper.chars().collect();
    if chars.len() != 2 || !chars.iter().all(|c| c.is_ascii_alphabetic()) {
        return String::new();
    }
    chars
        .into_iter()
        .map(|c| char::from_u32(0x1F1E6 + (c as u32 - 'A' as u32)).unwrap_or(c))
        .collect()
}

fn decode_urlsafe_b64(s: &str) -> Option<String> {
    URL_SAFE_NO_PAD
        .decode(s.trim_end_matches('='))
        .ok()
        .and_then(|b| String::from_utf8(b).ok())
}

fn query_map(url: &Url) -> BTreeMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn first_present<'a>(map: &'a BTreeMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| map.get(*k)).map(String::as_str)
}

/// Build a Clash proxy stanza (as a JSON object, matching the shape Clash's
/// YAML serializer expects) for one config line, or `None` if the protocol
/// has no Clash representation or the line fails to parse.
pub fn parse_to_clash(line: &str, name: &str, protocol: &Protocol) -> Option<Value> {
    match protocol {
        Protocol::VMess => vmess_proxy(line, name),
        Protocol::VLess | Protocol::Reality => vless_proxy(line, name),
        Protocol::Trojan => trojan_proxy(line, name),
        Protocol::Shadowsocks => shadowsocks_proxy(line, name),
        Protocol::ShadowsocksR => shadowsocksr_proxy(line, name),
        Protocol::Naive => naive_proxy(line, name),
        Protocol::Hysteria | Protocol::Hysteria2 => hysteria_proxy(line, name, protocol),
        Protocol::Tuic => tuic_proxy(line, name),
        Protocol::Socks | Protocol::Http => socks_or_http_proxy(line, name, protocol),
        _ => None,
    }
}

fn vmess_proxy(line: &str, name: &str) -> Option<Value> {
    let payload = line.splitn(2, "://").nth(1)?.split(['#', '?']).next()?;
    let decoded = decode_base64_tolerant(payload)?;
    let json: Value = serde_json::from_slice(&decoded).ok()?;
    let host = json.get("add").and_then(Value::as_str)?;
    let port = json
        .get("port")
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_u64().map(|n| n.to_string())))?
        .parse::<u16>()
        .ok()?;
    let uuid = json.get("id").and_then(Value::as_str).unwrap_or_default();
    let aid = json
        .get("aid")
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0);
    let network = json.get("net").and_then(Value::as_str).unwrap_or("tcp");
    let tls = json.get("tls").and_then(Value::as_str).unwrap_or("");

    let mut proxy = json!({
        "name": name,
        "type": "vmess",
        "server": host,
        "port": port,
        "uuid": uuid,
        "alterId": aid,
        "cipher": "auto",
        "network": network,
        "tls": tls == "tls",
    });
    if let Some(sni) = json.get("sni").and_then(Value::as_str) {
        proxy["servername"] = json!(sni);
    }
    if network == "ws" {
        let path = json.get("path").and_then(Value::as_str).unwrap_or("/");
        let host_header = json.get("host").and_then(Value::as_str).unwrap_or("");
        proxy["ws-opts"] = json!({
            "path": path,
            "headers": { "Host": host_header },
        });
    }
    Some(proxy)
}

fn vless_proxy(line: &str, name: &str) -> Option<Value> {
    let url = Url::parse(line).ok()?;
    let host = url.host_str()?;
    let port = url.port()?;
    let uuid = url.username();
    let params = query_map(&url);

    let mut proxy = json!({
        "name": name,
        "type": "vless",
        "server": host,
        "port": port,
        "uuid": uuid,
        "network": params.get("type").cloned().unwrap_or_else(|| "tcp".to_string()),
        "tls": matches!(params.get("security").map(String::as_str), Some("tls") | Some("reality")),
    });
    if let Some(sni) = first_present(&params, &["sni", "servername"]) {
        proxy["servername"] = json!(sni);
    }
    if params.get("security").map(String::as_str) == Some("reality") {
        let mut reality = Map::new();
        if let Some(pbk) = first_present(&params, &["pbk", "publicKey"]) {
            reality.insert("public-key".to_string(), json!(pbk));
        }
        if let Some(sid) = first_present(&params, &["sid", "shortId"]) {
            reality.insert("short-id".to_string(), json!(sid));
        }
        if let Some(spx) = first_present(&params, &["spx", "spiderX"]) {
            reality.insert("spider-x".to_string(), json!(spx));
        }
        proxy["reality-opts"] = Value::Object(reality);
    }
    if params.get("type").map(String::as_str) == Some("ws") {
        let path = params.get("path").cloned().unwrap_or_else(|| "/".to_string());
        let headers = params
            .get("headers")
            .and_then(|h| decode_urlsafe_b64(h))
            .and_then(|s| serde_json::from_str::<Value>(&s).ok())
            .unwrap_or_else(|| json!({}));
        proxy["ws-opts"] = json!({ "path": path, "headers": headers });
    }
    Some(proxy)
}

fn trojan_proxy(line: &str, name: &str) -> Option<Value> {
    let url = Url::parse(line).ok()?;
    let host = url.host_str()?;
    let port = url.port()?;
    let password = url.username();
    let params = query_map(&url);

    let mut proxy = json!({
        "name": name,
        "type": "trojan",
        "server": host,
        "port": port,
        "password": password,
        "udp": true,
    });
    if let Some(sni) = first_present(&params, &["sni", "peer"]) {
        proxy["sni"] = json!(sni);
    }
    if params.get("type").map(String::as_str) == Some("ws") {
        proxy["network"] = json!("ws");
        let path = params.get("path").cloned().unwrap_or_else(|| "/".to_string());
        proxy["ws-opts"] = json!({ "path": path });
    }
    Some(proxy)
}

fn shadowsocks_proxy(line: &str, name: &str) -> Option<Value> {
    let body = line.splitn(2, "://").nth(1)?;
    let body = body.split('#').next()?;

    // Path 1: `method:password` is base64 before the `@host:port`.
    if let Some((user_b64, hostport)) = body.split_once('@') {
        if let Some(decoded) = decode_base64_tolerant(user_b64) {
            if let Ok(creds) = String::from_utf8(decoded) {
                if let Some((method, password)) = creds.split_once(':') {
                    let (host, port_str) = hostport.split_once(':')?;
                    let port: u16 = port_str.trim_end_matches('/').parse().ok()?;
                    return Some(json!({
                        "name": name,
                        "type": "ss",
                        "server": host,
                        "port": port,
                        "cipher": method,
                        "password": password,
                        "udp": true,
                    }));
                }
            }
        }
    }

    // Path 2: the entire `method:password@host:port` blob is base64-encoded.
    let decoded = decode_base64_tolerant(body)?;
    let text = String::from_utf8(decoded).ok()?;
    let (creds, hostport) = text.split_once('@')?;
    let (method, password) = creds.split_once(':')?;
    let (host, port_str) = hostport.split_once(':')?;
    let port: u16 = port_str.parse().ok()?;
    Some(json!({
        "name": name,
        "type": "ss",
        "server": host,
        "port": port,
        "cipher": method,
        "password": password,
        "udp": true,
    }))
}

fn shadowsocksr_proxy(line: &str, name: &str) -> Option<Value> {
    let body = line.splitn(2, "://").nth(1)?;
    let decoded = decode_base64_tolerant(body)?;
    let text = String::from_utf8(decoded).ok()?;
    let (main, query) = text.split_once('?').unwrap_or((text.as_str(), ""));
    let mut parts = main.splitn(6, ':');
    let host = parts.next()?;
    let port: u16 = parts.next()?.parse().ok()?;
    let protocol = parts.next()?;
    let method = parts.next()?;
    let obfs = parts.next()?;
    let password_b64 = parts.next()?;
    let password = decode_urlsafe_b64(password_b64).unwrap_or_else(|| password_b64.to_string());

    let mut params = BTreeMap::new();
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            let decoded_v = decode_urlsafe_b64(v).unwrap_or_else(|| v.to_string());
            params.insert(k.to_string(), decoded_v);
        }
    }

    Some(json!({
        "name": name,
        "type": "ssr",
        "server": host,
        "port": port,
        "cipher": method,
        "password": password,
        "protocol": protocol,
        "obfs": obfs,
        "protocol-param": params.get("protoparam").cloned().unwrap_or_default(),
        "obfs-param": params.get("obfsparam").cloned().unwrap_or_default(),
        "udp": true,
    }))
}

fn naive_proxy(line: &str, name: &str) -> Option<Value> {
    let url = Url::parse(line).ok()?;
    let host = url.host_str()?;
    let port = url.port()?;
    Some(json!({
        "name": name,
        "type": "http",
        "server": host,
        "port": port,
        "username": url.username(),
        "password": url.password().unwrap_or(""),
        "tls": true,
    }))
}

fn hysteria_proxy(line: &str, name: &str, protocol: &Protocol) -> Option<Value> {
    let url = Url::parse(line).ok()?;
    let host = url.host_str()?;
    let port = url.port()?;
    let params = query_map(&url);
    let password = if !url.password().unwrap_or_default().is_empty() {
        url.password().unwrap_or_default().to_string()
    } else {
        first_present(&params, &["auth", "password"])
            .unwrap_or_default()
            .to_string()
    };

    let clash_type = if matches!(protocol, Protocol::Hysteria2) {
        "hysteria2"
    } else {
        "hysteria"
    };

    let mut proxy = json!({
        "name": name,
        "type": clash_type,
        "server": host,
        "port": port,
        "password": password,
        "skip-cert-verify": params.get("insecure").map(String::as_str) == Some("1"),
    });
    if let Some(sni) = first_present(&params, &["peer", "sni"]) {
        proxy["sni"] = json!(sni);
    }
    if let Some(alpn) = params.get("alpn") {
        proxy["alpn"] = json!(alpn.split(',').collect::<Vec<_>>());
    }
    if let Some(obfs) = params.get("obfs") {
        proxy["obfs"] = json!(obfs);
    }
    if let Some(obfs_password) = first_present(&params, &["obfs-password", "obfsParam"]) {
        proxy["obfs-password"] = json!(obfs_password);
    }
    if let Some(up) = first_present(&params, &["upmbps", "up"]) {
        proxy["up"] = json!(up);
    }
    if let Some(down) = first_present(&params, &["downmbps", "down"]) {
        proxy["down"] = json!(down);
    }
    Some(proxy)
}

fn tuic_proxy(line: &str, name: &str) -> Option<Value> {
    let url = Url::parse(line).ok()?;
    let host = url.host_str()?;
    let port = url.port()?;
    let params = query_map(&url);

    let uuid = if !url.username().is_empty() {
        url.username().to_string()
    } else {
        params.get("uuid").cloned().unwrap_or_default()
    };
    let password = if !url.password().unwrap_or_default().is_empty() {
        url.password().unwrap_or_default().to_string()
    } else {
        params.get("password").cloned().unwrap_or_default()
    };

    let mut proxy = json!({
        "name": name,
        "type": "tuic",
        "server": host,
        "port": port,
        "uuid": uuid,
        "password": password,
    });
    if let Some(alpn) = params.get("alpn") {
        proxy["alpn"] = json!(alpn.split(',').collect::<Vec<_>>());
    }
    if let Some(cc) = first_present(&params, &["congestion_control", "congestion-control"]) {
        proxy["congestion-controller"] = json!(cc);
    }
    if let Some(mode) = first_present(&params, &["udp_relay_mode", "udp-relay-mode"]) {
        proxy["udp-relay-mode"] = json!(mode);
    }
    Some(proxy)
}

fn socks_or_http_proxy(line: &str, name: &str, protocol: &Protocol) -> Option<Value> {
    let url = Url::parse(line).ok()?;
    let host = url.host_str()?;
    let port = url.port()?;
    let clash_type = if matches!(protocol, Protocol::Socks) {
        "socks5"
    } else {
        "http"
    };
    Some(json!({
        "name": name,
        "type": clash_type,
        "server": host,
        "port": port,
        "username": url.username(),
        "password": url.password().unwrap_or(""),
    }))
}

/// Build the full Clash config document: `proxies`, an auto-select group,
/// a manual-select group, and a catch-all `MATCH` rule.
pub fn build_clash_config(proxies: Vec<Value>) -> Value {
    let names: Vec<Value> = proxies
        .iter()
        .filter_map(|p| p.get("name").cloned())
        .collect();

    json!({
        "proxies": proxies,
        "proxy-groups": [
            {
                "name": "⚡ Auto-Select",
                "type": "url-test",
                "proxies": names.clone(),
                "url": "http://www.gstatic.com/generate_204",
                "interval": 300,
            },
            {
                "name": "🔰 MANUAL",
                "type": "select",
                "proxies": names,
            },
        ],
        "rules": ["MATCH,🔰 MANUAL"],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_emoji_builds_regional_indicator_pair() {
        assert_eq!(flag_emoji("us"), "🇺🇸");
        assert_eq!(flag_emoji("DE"), "🇩🇪");
        assert_eq!(flag_emoji("usa"), "");
    }

    #[test]
    fn vless_reality_proxy_carries_reality_opts() {
        let line = "vless://uuid-1@host.example:443?security=reality&pbk=PBK&sid=SID&type=tcp&sni=sni.example";
        let proxy = vless_proxy(line, "test").expect("parses");
        assert_eq!(proxy["type"], "vless");
        assert_eq!(proxy["reality-opts"]["public-key"], "PBK");
        assert_eq!(proxy["reality-opts"]["short-id"], "SID");
    }

    #[test]
    fn trojan_proxy_extracts_password_and_sni() {
        let line = "trojan://secret@host.example:443?sni=sni.example";
        let proxy = trojan_proxy(line, "t").expect("parses");
        assert_eq!(proxy["password"], "secret");
        assert_eq!(proxy["sni"], "sni.example");
    }

    #[test]
    fn shadowsocks_decodes_userinfo_base64() {
        let creds = STANDARD.encode("aes-256-gcm:pw123");
        let line = format!("ss://{creds}@host.example:8388#name");
        let proxy = shadowsocks_proxy(&line, "s").expect("parses");
        assert_eq!(proxy["cipher"], "aes-256-gcm");
        assert_eq!(proxy["password"], "pw123");
        assert_eq!(proxy["port"], 8388);
    }

    #[test]
    fn build_clash_config_includes_autoselect_and_manual_groups() {
        let proxies = vec![json!({"name": "p1"})];
        let cfg = build_clash_config(proxies);
        let groups = cfg["proxy-groups"].as_array().expect("array");
        assert_eq!(groups.len(), 2);
        assert_eq!(cfg["rules"][0], "MATCH,🔰 MANUAL");
    }
}
