use std::time::Duration;

/// Renders a single rounded component in s, ms or us.
pub(crate) fn format_duration_single(d: Duration) -> String {
    let total_ns: u128 = d.as_nanos();

    const NS_PER_US: u128 = 1_000;
    const NS_PER_MS: u128 = 1_000_000;
    const NS_PER_S: u128 = 1_000_000_000;

    // Ties round up.
    fn round_div(value: u128, unit: u128) -> u128 {
        (value + (unit / 2)) / unit
    }

    if total_ns >= NS_PER_S {
        return format!("{}s", round_div(total_ns, NS_PER_S));
    }
    if total_ns >= NS_PER_MS {
        return format!("{}ms", round_div(total_ns, NS_PER_MS));
    }

    format!("{}us", round_div(total_ns, NS_PER_US))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_largest_whole_unit() {
        assert_eq!(format_duration_single(Duration::from_secs(90)), "90s");
        assert_eq!(format_duration_single(Duration::from_millis(1500)), "2s");
        assert_eq!(format_duration_single(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration_single(Duration::from_micros(40)), "40us");
        assert_eq!(format_duration_single(Duration::ZERO), "0us");
    }
}
