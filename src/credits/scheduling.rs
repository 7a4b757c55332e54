//! Off-peak time multiplier for LLM credit actions
//!
//! Base actions always earn at M = 1.0. LLM actions earn M = 1.5 inside
//! a configured off-peak window, subject to an IP-geolocation
//! cross-check: the claimed local offset must agree with the
//! geolocation-derived offset within ±2 hours, otherwise the multiplier
//! falls back to 1.3.

/// Multiplier for base (non-LLM) actions
pub const BASE_MULTIPLIER: f64 = 1.0;
/// Off-peak multiplier for LLM actions
pub const OFF_PEAK_MULTIPLIER: f64 = 1.5;
/// Fallback when the geolocation cross-check is inconclusive
pub const INCONCLUSIVE_MULTIPLIER: f64 = 1.3;
/// Tolerated disagreement between claimed and geolocated UTC offsets
pub const GEO_TOLERANCE_HOURS: i32 = 2;

/// Configured off-peak window in local hours [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffPeakWindow {
    pub start_hour: u8,
    pub end_hour: u8,
}

impl Default for OffPeakWindow {
    fn default() -> Self {
        // 01:00–07:00 local
        Self {
            start_hour: 1,
            end_hour: 7,
        }
    }
}

impl OffPeakWindow {
    /// Whether a local hour falls inside the window (handles wrap)
    pub fn contains(&self, local_hour: u8) -> bool {
        if self.start_hour <= self.end_hour {
            (self.start_hour..self.end_hour).contains(&local_hour)
        } else {
            local_hour >= self.start_hour || local_hour < self.end_hour
        }
    }
}

/// Result of the geolocation cross-check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeoCheck {
    /// Claimed offset agrees with geolocation within tolerance
    Consistent,
    /// Geolocation unavailable or disagreeing beyond tolerance
    Inconclusive,
}

/// Cross-check a claimed UTC offset against a geolocation-derived one
pub fn cross_check(claimed_offset_hours: i32, geo_offset_hours: Option<i32>) -> GeoCheck {
    match geo_offset_hours {
        Some(geo) if (claimed_offset_hours - geo).abs() <= GEO_TOLERANCE_HOURS => {
            GeoCheck::Consistent
        }
        _ => GeoCheck::Inconclusive,
    }
}

/// The time multiplier for an LLM action performed at `utc_hour` with a
/// claimed UTC offset. Base actions never call this — they are always
/// [`BASE_MULTIPLIER`].
pub fn llm_multiplier(
    window: OffPeakWindow,
    utc_hour: u8,
    claimed_offset_hours: i32,
    geo_offset_hours: Option<i32>,
) -> f64 {
    let local_hour = ((i32::from(utc_hour) + claimed_offset_hours).rem_euclid(24)) as u8;
    if !window.contains(local_hour) {
        return BASE_MULTIPLIER;
    }
    match cross_check(claimed_offset_hours, geo_offset_hours) {
        GeoCheck::Consistent => OFF_PEAK_MULTIPLIER,
        GeoCheck::Inconclusive => INCONCLUSIVE_MULTIPLIER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_contains() {
        let w = OffPeakWindow::default();
        assert!(w.contains(1));
        assert!(w.contains(6));
        assert!(!w.contains(7));
        assert!(!w.contains(12));
    }

    #[test]
    fn test_window_wraps_midnight() {
        let w = OffPeakWindow {
            start_hour: 22,
            end_hour: 4,
        };
        assert!(w.contains(23));
        assert!(w.contains(2));
        assert!(!w.contains(12));
    }

    #[test]
    fn test_outside_window_is_base() {
        let m = llm_multiplier(OffPeakWindow::default(), 12, 0, Some(0));
        assert_eq!(m, BASE_MULTIPLIER);
    }

    #[test]
    fn test_in_window_consistent_geo() {
        // 02:00 UTC, claimed offset 0, geo agrees
        let m = llm_multiplier(OffPeakWindow::default(), 2, 0, Some(0));
        assert_eq!(m, OFF_PEAK_MULTIPLIER);
    }

    #[test]
    fn test_in_window_geo_disagrees() {
        // Claimed offset +8 puts 18:00 UTC at 02:00 local, but
        // geolocation says the peer is at UTC−1
        let m = llm_multiplier(OffPeakWindow::default(), 18, 8, Some(-1));
        assert_eq!(m, INCONCLUSIVE_MULTIPLIER);
    }

    #[test]
    fn test_in_window_geo_missing() {
        let m = llm_multiplier(OffPeakWindow::default(), 2, 0, None);
        assert_eq!(m, INCONCLUSIVE_MULTIPLIER);
    }

    #[test]
    fn test_tolerance_boundary() {
        assert_eq!(cross_check(5, Some(3)), GeoCheck::Consistent);
        assert_eq!(cross_check(5, Some(2)), GeoCheck::Inconclusive);
    }
}
