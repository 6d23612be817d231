use anyhow::{bail, Context, Result};

use crate::error::ScanError;

pub const MIN_PORT: u16 = 1;
pub const MAX_PORT: u16 = 65535;

/// Range used when no preference has been persisted yet.
pub const DEFAULT_RANGE: (u16, u16) = (1, 1024);

/// Check raw bounds and narrow them to `u16`.
///
/// Fails with `InvalidRange` when either bound lies outside `1..=65535` or
/// `low > high`.
pub fn validate_bounds(low: i64, high: i64) -> Result<(u16, u16), ScanError> {
    let in_range = |p: i64| (i64::from(MIN_PORT)..=i64::from(MAX_PORT)).contains(&p);
    if !in_range(low) || !in_range(high) || low > high {
        return Err(ScanError::InvalidRange { low, high });
    }
    Ok((low as u16, high as u16))
}

/// Parse a CLI range argument into inclusive bounds.
///
/// Supported forms:
/// - single port: `80`
/// - inclusive range: `1-1024`
pub fn parse_range_str(s: &str) -> Result<(u16, u16)> {
    let s = s.trim();
    if let Some((a, b)) = s.split_once('-') {
        let low = parse_port_str(a.trim()).with_context(|| format!("invalid start in range: {a}"))?;
        let high = parse_port_str(b.trim()).with_context(|| format!("invalid end in range: {b}"))?;
        if low > high {
            bail!("invalid range {low}-{high} (start > end)");
        }
        return Ok((low, high));
    }
    let p = parse_port_str(s).with_context(|| format!("invalid port value: {s}"))?;
    Ok((p, p))
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > u32::from(MAX_PORT) {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
