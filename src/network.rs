//! WiFi scan for the network picker.
//!
//! Parses `nmcli -t -f SSID,SIGNAL,SECURITY device wifi list` output. Each
//! SSID is reported once with its strongest signal, strongest first.

use crate::command_executor::{CommandSpec, Executor};
use crate::error::InstallError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiNetwork {
    pub ssid: String,
    /// 0-100
    pub signal: u8,
    /// Empty for open networks
    pub security: String,
}

impl WifiNetwork {
    pub fn is_open(&self) -> bool {
        self.security.is_empty() || self.security == "--"
    }
}

/// Split a terse nmcli line on unescaped `:`.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            ':' => fields.push(String::new()),
            _ => {
                let c = if c == '\\' { chars.next().unwrap_or(c) } else { c };
                if let Some(f) = fields.last_mut() {
                    f.push(c);
                }
            }
        }
    }
    fields
}

fn parse_line(line: &str) -> Option<WifiNetwork> {
    let fields = split_terse(line);
    let ssid = fields.first()?.trim();
    if ssid.is_empty() {
        return None;
    }
    Some(WifiNetwork {
        ssid: ssid.to_string(),
        signal: fields.get(1)?.trim().parse::<u8>().ok()?.min(100),
        security: fields.get(2).map(|s| s.trim().to_string()).unwrap_or_default(),
    })
}

/// Deduplicate by SSID keeping the strongest entry, sorted by signal
/// descending (ties by SSID). Hidden and malformed entries are dropped.
pub fn parse_wifi_list<S: AsRef<str>>(lines: &[S]) -> Vec<WifiNetwork> {
    let mut best: HashMap<String, WifiNetwork> = HashMap::new();
    for network in lines.iter().filter_map(|l| parse_line(l.as_ref())) {
        match best.get(&network.ssid) {
            Some(existing) if existing.signal >= network.signal => {}
            _ => {
                best.insert(network.ssid.clone(), network);
            }
        }
    }
    let mut networks: Vec<_> = best.into_values().collect();
    networks.sort_by(|a, b| b.signal.cmp(&a.signal).then_with(|| a.ssid.cmp(&b.ssid)));
    networks
}

/// Scan visible networks.
pub fn scan_wifi(exec: &dyn Executor) -> Result<Vec<WifiNetwork>, InstallError> {
    let out = exec.execute(
        &CommandSpec::new("nmcli")
            .args(["-t", "-f", "SSID,SIGNAL,SECURITY", "device", "wifi", "list", "--rescan", "yes"])
            .read_only(),
    )?;
    let lines: Vec<&str> = out.stdout.lines().collect();
    let networks = parse_wifi_list(&lines);
    log::info!("WiFi scan found {} network(s)", networks.len());
    Ok(networks)
}
