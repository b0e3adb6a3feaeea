/// Base-1024 multipliers for the size suffixes printed by `zfs` and `zpool`
const MULTIPLIERS: [(char, u64); 7] = [
    ('B', 1),
    ('K', 1 << 10),
    ('M', 1 << 20),
    ('G', 1 << 30),
    ('T', 1 << 40),
    ('P', 1 << 50),
    ('E', 1 << 60),
];

/// Parse a size string into bytes (e.g., "4.2G", "512K", "10737418240")
///
/// Accepts the suffix forms `G`, `GB`, `Gi` and `GiB` (case-insensitive); all of
/// them are base-1024. Fractional values are rounded to the nearest byte.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size value".to_string());
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() {
        return Err(format!("Invalid size format: {}", s));
    }

    let multiplier = suffix_multiplier(suffix)
        .ok_or_else(|| format!("Unknown size suffix '{}' in '{}'", suffix, s))?;

    if number.contains('.') {
        let value = number
            .parse::<f64>()
            .map_err(|e| format!("Invalid size value '{}': {}", number, e))?;
        let bytes = (value * multiplier as f64).round();
        if !bytes.is_finite() || bytes > u64::MAX as f64 {
            return Err(format!("Size out of range: {}", s));
        }
        Ok(bytes as u64)
    } else {
        number
            .parse::<u64>()
            .map_err(|e| format!("Invalid size value '{}': {}", number, e))?
            .checked_mul(multiplier)
            .ok_or_else(|| format!("Size out of range: {}", s))
    }
}

fn suffix_multiplier(suffix: &str) -> Option<u64> {
    let upper = suffix.to_ascii_uppercase();
    let unit = match upper.as_str() {
        "" => return Some(1),
        u => u
            .strip_suffix("IB")
            .or_else(|| u.strip_suffix('I'))
            .filter(|rest| !rest.is_empty())
            .or_else(|| u.strip_suffix('B').filter(|rest| !rest.is_empty()))
            .unwrap_or(u),
    };

    let mut chars = unit.chars();
    let c = chars.next()?;
    if chars.next().is_some() {
        return None;
    }
    MULTIPLIERS
        .iter()
        .find(|(suffix, _)| *suffix == c)
        .map(|(_, m)| *m)
}

/// Render bytes using the largest clean unit: "5G", "512M", "8K" or raw bytes.
pub fn format_size(bytes: u64) -> String {
    for (suffix, multiplier) in MULTIPLIERS.iter().rev() {
        if *multiplier > 1 && bytes > 0 && bytes % multiplier == 0 {
            return format!("{}{}", bytes / multiplier, suffix);
        }
    }
    format!("{}", bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1 << 30;

    #[test]
    fn test_parse_plain_bytes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("  42  ").unwrap(), 42);
    }

    #[test]
    fn test_parse_suffixes() {
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("128M").unwrap(), 128 * 1024 * 1024);
        assert_eq!(parse_size("10G").unwrap(), 10 * GIB);
        assert_eq!(parse_size("2T").unwrap(), 2 << 40);
        assert_eq!(parse_size("1Gi").unwrap(), GIB);
        assert_eq!(parse_size("1GiB").unwrap(), GIB);
        assert_eq!(parse_size("1gb").unwrap(), GIB);
        assert_eq!(parse_size("512B").unwrap(), 512);
    }

    #[test]
    fn test_parse_fractional_rounds() {
        let expected = (4.2 * GIB as f64).round() as u64;
        assert_eq!(parse_size("4.2G").unwrap(), expected);
        assert_eq!(parse_size("0.5K").unwrap(), 512);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("10X").is_err());
        assert!(parse_size("10GG").is_err());
        assert!(parse_size("none").is_err());
        assert!(parse_size("1.2.3G").is_err());
        assert!(parse_size("99999999999E").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(5 * GIB), "5G");
        assert_eq!(format_size(512 * 1024 * 1024), "512M");
        assert_eq!(format_size(8192), "8K");
        assert_eq!(format_size(1500 * 1024 * 1024), "1500M");
        assert_eq!(format_size(1023), "1023");
        assert_eq!(format_size(0), "0");
    }
}
