use std::path::{Path, PathBuf};

use super::config::Config;
use super::constants::RAM_STAGING_ROOT;
use super::detector::DetectorKind;
use super::error::{ConfigError, JobFileError};

/// Immutable description of one rotation series.
///
/// Built once from the Config at the start of processing; every component reads
/// geometry and image naming from here.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSpecification {
    pub detector: DetectorKind,
    pub beam_center_x: f64,
    pub beam_center_y: f64,
    pub distance: f64,
    pub wavelength: f64,
    pub osc_range: f64,
    pub two_theta: f64,
    pub start: u32,
    pub total: u32,
    pub exposure_time: f64,
    pub image_prefix: String,
    pub run_number: u32,
    /// Full path of the images with the frame number as a run of '?'
    pub template: PathBuf,
}

impl RunSpecification {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let run = &config.run;
        let file_template = match &run.image_template {
            Some(t) => t.clone(),
            None => format!(
                "{}_{}_{}.{}",
                run.image_prefix,
                run.run_number,
                "?".repeat(run.detector.image_digits()),
                run.detector.image_extension()
            ),
        };
        if !file_template.contains('?') {
            return Err(ConfigError::Invalid(format!(
                "image template {file_template} has no frame number placeholder"
            )));
        }
        let directory = if config.uses_ram() {
            Path::new(RAM_STAGING_ROOT).join(&run.image_prefix)
        } else {
            run.directory.clone()
        };
        Ok(Self {
            detector: run.detector,
            beam_center_x: run.beam_center_x,
            beam_center_y: run.beam_center_y,
            distance: run.distance,
            wavelength: run.wavelength,
            osc_range: run.osc_range,
            two_theta: run.two_theta,
            start: run.start,
            total: run.total,
            exposure_time: run.exposure_time,
            image_prefix: run.image_prefix.clone(),
            run_number: run.run_number,
            template: directory.join(file_template),
        })
    }

    /// Number of the last image the collection should produce
    pub fn last_image(&self) -> u32 {
        self.start + self.total.saturating_sub(1)
    }

    pub fn contains(&self, image: u32) -> bool {
        image >= self.start && image <= self.last_image()
    }

    pub fn image_path(&self, image: u32) -> PathBuf {
        PathBuf::from(fill_template(&self.template.to_string_lossy(), image))
    }

    pub fn template_string(&self) -> String {
        self.template.to_string_lossy().to_string()
    }

    pub fn pixel_size(&self) -> f64 {
        self.detector.pixel_size()
    }

    /// Direct beam position in pixels as (ORGX, ORGY).
    ///
    /// The beamline reports the beam in the detector's own frame, which is
    /// transposed with respect to the XDS frame.
    pub fn beam_origin(&self) -> Result<(f64, f64), JobFileError> {
        let pixel = self.pixel_size();
        let (extent_x, extent_y) = self.detector.extent();
        let org_x = self.beam_center_y / pixel;
        let org_y = self.beam_center_x / pixel;
        if !(0.0..=extent_x as f64).contains(&org_x) {
            return Err(JobFileError::GeometryOutOfBounds {
                axis: "x",
                value: org_x,
                limit: extent_x,
            });
        }
        if !(0.0..=extent_y as f64).contains(&org_y) {
            return Err(JobFileError::GeometryOutOfBounds {
                axis: "y",
                value: org_y,
                limit: extent_y,
            });
        }
        Ok((org_x, org_y))
    }

    /// Number of images covering the given rotation, never less than one
    pub fn images_for_degrees(&self, degrees: f64) -> u32 {
        if self.osc_range > 0.0 {
            ((degrees / self.osc_range) as u32).max(1)
        } else {
            1
        }
    }
}

/// Substitute the first run of '?' with the zero padded frame number
pub fn fill_template(template: &str, image: u32) -> String {
    let Some(begin) = template.find('?') else {
        return template.to_string();
    };
    let width = template[begin..].chars().take_while(|c| *c == '?').count();
    format!(
        "{}{:0width$}{}",
        &template[..begin],
        image,
        &template[begin + width..],
        width = width
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CommandKind, RamNode, RamStaging};

    fn pilatus_config() -> Config {
        let mut config = Config::default();
        config.run.beam_center_x = 215.0;
        config.run.beam_center_y = 210.0;
        config.run.distance = 300.0;
        config.run.total = 900;
        config.run.directory = PathBuf::from("/data/lyso");
        config.run.image_prefix = String::from("lyso");
        config
    }

    #[test]
    fn test_default_template() {
        let spec = RunSpecification::from_config(&pilatus_config()).unwrap();
        assert_eq!(spec.template, PathBuf::from("/data/lyso/lyso_1_????.cbf"));
        assert_eq!(spec.image_path(42), PathBuf::from("/data/lyso/lyso_1_0042.cbf"));
        assert_eq!(spec.last_image(), 900);
        assert!(spec.contains(900));
        assert!(!spec.contains(901));
    }

    #[test]
    fn test_ram_template_moves_to_staging() {
        let mut config = pilatus_config();
        config.command = CommandKind::RamDistributed;
        config.preferences.ram = Some(RamStaging {
            nodes: vec![RamNode {
                name: String::from("node1"),
                first: 1,
                last: 900,
            }],
            cleanup: false,
        });
        let spec = RunSpecification::from_config(&config).unwrap();
        assert_eq!(spec.template, PathBuf::from("/dev/shm/lyso/lyso_1_????.cbf"));
    }

    #[test]
    fn test_beam_origin_is_transposed() {
        let spec = RunSpecification::from_config(&pilatus_config()).unwrap();
        let (x, y) = spec.beam_origin().unwrap();
        assert!((x - 210.0 / 0.172).abs() < 1e-9);
        assert!((y - 215.0 / 0.172).abs() < 1e-9);
    }

    #[test]
    fn test_beam_off_panel() {
        let mut config = pilatus_config();
        config.run.beam_center_y = 500.0;
        let spec = RunSpecification::from_config(&config).unwrap();
        assert!(matches!(
            spec.beam_origin(),
            Err(JobFileError::GeometryOutOfBounds { axis: "x", .. })
        ));
    }

    #[test]
    fn test_fill_template() {
        assert_eq!(fill_template("a_???.img", 7), "a_007.img");
        assert_eq!(fill_template("a_??.img", 123), "a_123.img");
        assert_eq!(fill_template("plain.img", 1), "plain.img");
    }
}
