//! Debug probe registration and dispatch
//!
//! Probe specifications are a probe name followed by comma-separated
//! key=value parameters, e.g. `dummy,flash-size=64k,ram-size=4096`.

use wchflash_dummy::{SimConfig, SimTarget};

/// Information about a probe backend
pub struct ProbeInfo {
    /// Primary name (used for matching)
    pub name: &'static str,
    /// Short description including accepted parameters
    pub description: &'static str,
}

/// All probe backends enabled at compile time
pub fn available_probes() -> Vec<ProbeInfo> {
    vec![ProbeInfo {
        name: "dummy",
        description: "In-memory CH32F2x emulator (flash-size=<bytes>, ram-size=<bytes>)",
    }]
}

/// Short list of probe names for CLI help
pub fn probe_names_short() -> String {
    let names: Vec<&str> = available_probes().iter().map(|p| p.name).collect();
    names.join(", ")
}

/// Parse a size value, accepting a trailing `k`/`K` for KiB
fn parse_size(value: &str) -> Result<u32, String> {
    let (digits, scale) = match value.strip_suffix(['k', 'K']) {
        Some(digits) => (digits, 1024),
        None => (value, 1),
    };
    let base = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).map_err(|e| format!("invalid size: {}", e))
    } else {
        digits.parse::<u32>().map_err(|e| format!("invalid size: {}", e))
    }?;
    base.checked_mul(scale).ok_or_else(|| "size too large".to_string())
}

fn open_dummy(params: &str) -> Result<SimTarget, String> {
    let mut config = SimConfig::default();
    for param in params.split(',').filter(|p| !p.is_empty()) {
        let (key, value) = param
            .split_once('=')
            .ok_or_else(|| format!("malformed probe parameter '{}'", param))?;
        match key {
            "flash-size" => config.flash_size = parse_size(value)?,
            "ram-size" => config.ram_size = parse_size(value)?,
            _ => return Err(format!("unknown probe parameter '{}'", key)),
        }
    }
    log::info!(
        "dummy probe: {} KiB flash, {} KiB RAM",
        config.flash_size / 1024,
        config.ram_size / 1024
    );
    Ok(SimTarget::new(config))
}

/// Open the probe described by `spec`
pub fn open(spec: &str) -> Result<SimTarget, String> {
    let (name, params) = spec.split_once(',').unwrap_or((spec, ""));
    match name {
        "dummy" => open_dummy(params),
        other => Err(format!(
            "unknown probe '{}' [available: {}]",
            other,
            probe_names_short()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_accept_kib_suffix_and_hex() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64k"), Ok(64 * 1024));
        assert_eq!(parse_size("0x1000"), Ok(4096));
        assert!(parse_size("64q").is_err());
    }

    #[test]
    fn dummy_spec_parses_parameters() {
        assert!(open("dummy").is_ok());
        assert!(open("dummy,flash-size=64k,ram-size=2048").is_ok());
        assert!(open("dummy,bogus=1").is_err());
        assert!(open("stlink").is_err());
    }
}
