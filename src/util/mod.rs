//! Shared helpers used across the stack.

pub mod enum_macros;

/// Format a data-link MAC address for log output, e.g. `c0:a8:01:01:ba:c0`.
pub fn format_mac(mac: &[u8]) -> String {
    if mac.is_empty() {
        return "broadcast".to_string();
    }
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
