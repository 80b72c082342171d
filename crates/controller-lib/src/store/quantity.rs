//! Kubernetes resource quantity parsing
//!
//! Handles the suffixes the API server actually emits: decimal SI
//! (`n`, `u`, `m`, `k`, `M`, `G`, `T`, `P`, `E`), binary (`Ki`..`Ei`) and
//! exponent notation (`1e3`). Unparseable input yields `None`.

/// Parse a quantity into its plain numeric value
pub fn parse_quantity(raw: &str) -> Option<f64> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }

    let (number, multiplier) = split_suffix(s)?;
    let value: f64 = number.parse().ok()?;
    let result = value * multiplier;
    result.is_finite().then_some(result)
}

fn split_suffix(s: &str) -> Option<(&str, f64)> {
    const BINARY: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1_048_576.0),
        ("Gi", 1_073_741_824.0),
        ("Ti", 1_099_511_627_776.0),
        ("Pi", 1_125_899_906_842_624.0),
        ("Ei", 1_152_921_504_606_846_976.0),
    ];
    const DECIMAL: &[(char, f64)] = &[
        ('n', 1e-9),
        ('u', 1e-6),
        ('m', 1e-3),
        ('k', 1e3),
        ('M', 1e6),
        ('G', 1e9),
        ('T', 1e12),
        ('P', 1e15),
        ('E', 1e18),
    ];

    for (suffix, mult) in BINARY {
        if let Some(number) = s.strip_suffix(suffix) {
            return Some((number, *mult));
        }
    }

    // `1e3` is exponent notation, not the exa suffix
    if s.contains(['e', 'E']) && s.parse::<f64>().is_ok() {
        return Some((s, 1.0));
    }

    let last = s.chars().last()?;
    for (suffix, mult) in DECIMAL {
        if last == *suffix {
            return Some((&s[..s.len() - 1], *mult));
        }
    }
    Some((s, 1.0))
}

/// CPU quantity in cores
pub fn parse_cpu(raw: &str) -> Option<f64> {
    parse_quantity(raw).filter(|v| *v >= 0.0)
}

/// Memory quantity in bytes, rounded up like the API server does
pub fn parse_memory(raw: &str) -> Option<u64> {
    parse_quantity(raw)
        .filter(|v| *v >= 0.0)
        .map(|v| v.ceil() as u64)
}
