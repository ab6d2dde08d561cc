use std::time::Duration;

/// Tunables for the sync engine. The binary fills these from CLI flags.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// How long a configuration stream may take before the session is reset.
    pub handshake_timeout: Duration,
    /// How long `scan` listens for advertisements.
    pub scan_duration: Duration,
    pub connect_timeout: Duration,
    /// Hop limit stamped on outbound admin and text packets.
    pub hop_limit: u32,
    /// Channel index admin packets are sent on.
    pub admin_channel: u32,
    /// Oldest firmware the client supports, as `major.minor.patch`.
    pub min_firmware_version: String,
    /// Capacity of the link event and sync event channels.
    pub event_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            scan_duration: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            hop_limit: 3,
            admin_channel: 0,
            min_firmware_version: "2.0.0".to_string(),
            event_capacity: 256,
        }
    }
}

/// Parse a dotted firmware version (`2.3.15.deb7c27`) into its first three numbers.
pub fn parse_firmware_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().split('.').map(|p| p.parse::<u32>());
    let major = parts.next()?.ok()?;
    let minor = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.ok()).unwrap_or(0);
    Some((major, minor, patch))
}

/// `true` when `reported` is at least `minimum`. Unparseable versions are accepted.
pub fn firmware_supported(reported: &str, minimum: &str) -> bool {
    match (parse_firmware_version(reported), parse_firmware_version(minimum)) {
        (Some(reported), Some(minimum)) => reported >= minimum,
        _ => true,
    }
}
