use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::error::DetectorError;

/// The detectors the integrator knows how to describe to XDS.
///
/// Each kind carries the panel geometry needed to convert a beam center in mm
/// to pixels, the name of its XDS default-parameter file, and how its images
/// are named on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DetectorKind {
    Adsc,
    AdscBinned,
    Hf4m,
    Pilatus,
}

impl FromStr for DetectorKind {
    type Err = DetectorError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ADSC" => Ok(Self::Adsc),
            "ADSC_BINNED" => Ok(Self::AdscBinned),
            "HF4M" => Ok(Self::Hf4m),
            "PILATUS" => Ok(Self::Pilatus),
            _ => Err(DetectorError::InvalidName(s.to_string())),
        }
    }
}

impl TryFrom<String> for DetectorKind {
    type Error = DetectorError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

impl From<DetectorKind> for String {
    fn from(value: DetectorKind) -> Self {
        value.name().to_string()
    }
}

impl DetectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Adsc => "ADSC",
            Self::AdscBinned => "ADSC_binned",
            Self::Hf4m => "HF4M",
            Self::Pilatus => "PILATUS",
        }
    }

    /// Pixel edge length in mm
    pub fn pixel_size(&self) -> f64 {
        match self {
            Self::Adsc => 0.0513,
            Self::AdscBinned => 0.10259,
            Self::Hf4m => 0.150,
            Self::Pilatus => 0.172,
        }
    }

    /// Panel extent in pixels as (x, y)
    pub fn extent(&self) -> (u32, u32) {
        match self {
            Self::Adsc => (6144, 6144),
            Self::AdscBinned => (3072, 3072),
            Self::Hf4m => (2100, 2290),
            Self::Pilatus => (2463, 2527),
        }
    }

    /// File holding the fixed XDS parameters for this detector
    pub fn defaults_file(&self) -> &'static str {
        match self {
            Self::Adsc | Self::AdscBinned => "XDS-ADSC.INP",
            Self::Hf4m => "XDS-HF4M.INP",
            Self::Pilatus => "XDS-PILATUS.INP",
        }
    }

    /// Digits used for the image number in file names
    pub fn image_digits(&self) -> usize {
        match self {
            Self::Adsc | Self::AdscBinned => 3,
            Self::Hf4m | Self::Pilatus => 4,
        }
    }

    pub fn image_extension(&self) -> &'static str {
        match self {
            Self::Adsc | Self::AdscBinned => "img",
            Self::Hf4m | Self::Pilatus => "cbf",
        }
    }

    /// Seconds added to the exposure time before an image is considered late.
    ///
    /// The CCDs take far longer to read out and transfer than the pixel arrays.
    pub fn wait_slack_seconds(&self) -> u64 {
        match self {
            Self::Pilatus | Self::Hf4m => 15,
            Self::Adsc | Self::AdscBinned => 60,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!(DetectorKind::from_str("PILATUS").unwrap(), DetectorKind::Pilatus);
        assert_eq!(
            DetectorKind::from_str("ADSC_binned").unwrap(),
            DetectorKind::AdscBinned
        );
        assert_eq!(DetectorKind::from_str(" hf4m ").unwrap(), DetectorKind::Hf4m);
        assert!(DetectorKind::from_str("EIGER").is_err());
    }

    #[test]
    fn test_name_round_trip_through_yaml() {
        let yaml = serde_yaml::to_string(&DetectorKind::AdscBinned).unwrap();
        let back: DetectorKind = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, DetectorKind::AdscBinned);
    }
}
