//! Coarse proximity buckets derived from signal strength.

/// Proximity bucket of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Proximity {
    /// No signal sample yet.
    #[default]
    Unknown,
    /// Within a meter or so.
    Near,
    /// A few meters away.
    Mid,
    /// Edge of useful range.
    Far,
    /// Still heard, but too weak to be considered present.
    OutOfRange,
}

impl Proximity {
    /// Bucket a signal strength sample using the default thresholds.
    pub fn from_rssi(rssi: Option<i16>) -> Self {
        ProximityThresholds::default().classify(rssi)
    }

    /// Whether the device counts as in range.
    pub fn is_in_range(&self) -> bool {
        matches!(self, Self::Near | Self::Mid | Self::Far)
    }
}

impl std::fmt::Display for Proximity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Near => write!(f, "Near"),
            Self::Mid => write!(f, "Mid"),
            Self::Far => write!(f, "Far"),
            Self::OutOfRange => write!(f, "Out of range"),
        }
    }
}

/// Signal strength cutoffs, in dBm, for each bucket.
///
/// A sample at or above `near` is [`Proximity::Near`], at or above `mid` is
/// [`Proximity::Mid`], at or above `far` is [`Proximity::Far`], and anything
/// weaker is [`Proximity::OutOfRange`]. A zero sample is what platforms report
/// when the strength is unavailable, and maps to [`Proximity::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProximityThresholds {
    /// Near cutoff.
    pub near: i16,
    /// Mid cutoff.
    pub mid: i16,
    /// Far cutoff.
    pub far: i16,
}

impl Default for ProximityThresholds {
    fn default() -> Self {
        Self {
            near: -60,
            mid: -70,
            far: -95,
        }
    }
}

impl ProximityThresholds {
    /// Bucket a signal strength sample.
    pub fn classify(&self, rssi: Option<i16>) -> Proximity {
        match rssi {
            None | Some(0) => Proximity::Unknown,
            Some(r) if r >= self.near => Proximity::Near,
            Some(r) if r >= self.mid => Proximity::Mid,
            Some(r) if r >= self.far => Proximity::Far,
            Some(_) => Proximity::OutOfRange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_buckets() {
        assert_eq!(Proximity::from_rssi(None), Proximity::Unknown);
        assert_eq!(Proximity::from_rssi(Some(0)), Proximity::Unknown);
        assert_eq!(Proximity::from_rssi(Some(-40)), Proximity::Near);
        assert_eq!(Proximity::from_rssi(Some(-60)), Proximity::Near);
        assert_eq!(Proximity::from_rssi(Some(-65)), Proximity::Mid);
        assert_eq!(Proximity::from_rssi(Some(-80)), Proximity::Far);
        assert_eq!(Proximity::from_rssi(Some(-95)), Proximity::Far);
        assert_eq!(Proximity::from_rssi(Some(-96)), Proximity::OutOfRange);
    }

    #[test]
    fn test_custom_thresholds() {
        let thresholds = ProximityThresholds {
            near: -50,
            mid: -60,
            far: -70,
        };
        assert_eq!(thresholds.classify(Some(-55)), Proximity::Mid);
        assert_eq!(thresholds.classify(Some(-75)), Proximity::OutOfRange);
    }

    #[test]
    fn test_in_range() {
        assert!(Proximity::Near.is_in_range());
        assert!(Proximity::Far.is_in_range());
        assert!(!Proximity::OutOfRange.is_in_range());
        assert!(!Proximity::Unknown.is_in_range());
    }
}
