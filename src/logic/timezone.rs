//! Best-effort timezone resolution by IP geolocation.
//!
//! Never fails: any problem with the lookup yields the configured fallback.

use crate::command_executor::{CommandSpec, Executor};
use crate::config_file::{is_valid_timezone_name, InstallerConfig};
use std::time::Duration;

/// Extra time the executor allows beyond curl's own `--max-time`.
const CURL_SLACK: Duration = Duration::from_secs(2);

/// Extract a zone name from the geolocation endpoint's plain-text body.
pub fn parse_timezone_response(body: &str) -> Option<String> {
    let tz = body.trim();
    is_valid_timezone_name(tz).then(|| tz.to_string())
}

fn lookup_spec(config: &InstallerConfig) -> CommandSpec {
    let limit = config.geolocation_timeout();
    CommandSpec::new("curl")
        .args(["-fsS", "--max-time"])
        .arg(limit.as_secs().to_string())
        .arg(config.geolocation_url.as_str())
        .read_only()
        .timeout(limit + CURL_SLACK)
}

/// Resolve the timezone for the new system.
pub fn resolve_timezone(exec: &dyn Executor, config: &InstallerConfig) -> String {
    match exec.execute(&lookup_spec(config)) {
        Ok(out) => match parse_timezone_response(&out.stdout) {
            Some(tz) => {
                log::info!("Geolocated timezone: {}", tz);
                tz
            }
            None => {
                log::warn!(
                    "Geolocation returned an unusable timezone {:?}, using {}",
                    out.stdout.trim(),
                    config.fallback_timezone
                );
                config.fallback_timezone.clone()
            }
        },
        Err(e) => {
            log::warn!("Timezone lookup failed, using {}: {}", config.fallback_timezone, e);
            config.fallback_timezone.clone()
        }
    }
}
