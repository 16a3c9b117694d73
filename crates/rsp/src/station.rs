//! Station id to station code mapping.

/// Convert a station number (raw header id / 32) to its observatory code.
///
/// Returns `None` for ids that do not correspond to a known station.
pub fn station_code(station: u16) -> Option<String> {
    let prefix = match station {
        1..=7 | 11 | 13 | 17 | 21 | 24 | 26 | 28 | 30..=32 | 101 | 103 | 201 | 301 | 302
        | 401 | 501 => "CS",
        106 | 205 | 208 | 210 | 305..=307 | 310 | 406 | 407 | 409 | 503 | 508 | 509 => "RS",
        601..=605 | 609 => "DE",
        606 => "FR",
        607 => "SE",
        608 => "UK",
        610..=612 => "PL",
        613 => "IE",
        614 => "LV",
        _ => return None,
    };
    Some(format!("{prefix}{station:03}"))
}
