use std::path::{Path, PathBuf};

use super::config::RamNode;
use super::constants::{
    BACKGROUND_RANGE_SPAN, LOW_RESOLUTION_LIMIT, MIN_BATCH_DEGREES, SINGLE_SPOT_RANGE_DEGREES,
    SPOT_RANGE_DEGREES, SPOT_RANGE_SEPARATION_DEGREES, SPOT_RANGE_SEPARATION_LIMIT_DEGREES,
    XDS_INPUT,
};
use super::error::JobFileError;
use super::error_classifier::ErrorSignature;
use super::run_spec::RunSpecification;

pub const JOB_KEY: &str = "JOB";
pub const DATA_RANGE_KEY: &str = "DATA_RANGE";
pub const SPOT_RANGE_KEY: &str = "SPOT_RANGE";
pub const RESOLUTION_RANGE_KEY: &str = "INCLUDE_RESOLUTION_RANGE";
pub const SPACE_GROUP_KEY: &str = "SPACE_GROUP_NUMBER";
pub const UNIT_CELL_KEY: &str = "UNIT_CELL_CONSTANTS";

/// One line of an XDS control file.
///
/// The key is the parameter name before the first '=', if the line has one.
/// Comments and blank lines are kept so the file reads back as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    text: String,
}

impl Directive {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.trim_end_matches(['\n', '\r']).to_string(),
        }
    }

    pub fn keyed(key: &str, value: &str) -> Self {
        Self {
            text: format!("{key}={value}"),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn key(&self) -> Option<&str> {
        let trimmed = self.text.trim_start();
        if trimmed.starts_with('!') {
            return None;
        }
        let (key, _) = trimmed.split_once('=')?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            None
        } else {
            Some(key)
        }
    }

    /// Value after the first '=', without any trailing comment
    pub fn value(&self) -> Option<&str> {
        self.key()?;
        let (_, rest) = self.text.split_once('=')?;
        let rest = match rest.split_once('!') {
            Some((value, _)) => value,
            None => rest,
        };
        Some(rest.trim())
    }
}

/// The JOB vocabulary used by the integrator, in the order a lineage advances
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessingStage {
    /// Every step in one run, used with RAM staged data
    Full,
    SpotSearch,
    IndexIntegrate,
    DefpixIntegrate,
    Integrate,
    Merge,
}

impl ProcessingStage {
    pub fn job_steps(&self) -> &'static str {
        match self {
            Self::Full => "XYCORR INIT COLSPOT IDXREF DEFPIX INTEGRATE CORRECT",
            Self::SpotSearch => "XYCORR INIT COLSPOT",
            Self::IndexIntegrate => "IDXREF DEFPIX INTEGRATE CORRECT",
            Self::DefpixIntegrate => "DEFPIX INTEGRATE CORRECT",
            Self::Integrate => "INTEGRATE CORRECT",
            Self::Merge => "CORRECT",
        }
    }

    /// True once indexing is no longer part of the job
    pub fn is_past_indexing(&self) -> bool {
        matches!(self, Self::DefpixIntegrate | Self::Integrate | Self::Merge)
    }

    fn directive(&self) -> Directive {
        Directive::keyed(JOB_KEY, self.job_steps())
    }
}

/// Edits applied to a control file. Unrelated directives keep their text and order.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectivePatch {
    /// Replace the last directive with this key in place, or append one
    Set { key: String, value: String },
    /// Append a raw line
    Append(String),
    /// Drop every directive with this key
    Remove(String),
    /// Replace the JOB directive
    Stage(ProcessingStage),
}

impl DirectivePatch {
    pub fn set(key: &str, value: &str) -> Self {
        Self::Set {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Mutable state of one wedge or total integration attempt
#[derive(Debug, Clone)]
pub struct JobContext {
    pub work_dir: PathBuf,
    pub data_range: (u32, u32),
    pub stage: ProcessingStage,
    pub resolution_cutoff: Option<f64>,
    pub space_group_override: Option<u32>,
    directives: Vec<Directive>,
    remediations: Vec<(ErrorSignature, ProcessingStage)>,
    runs: u32,
}

impl JobContext {
    pub fn new(work_dir: &Path, data_range: (u32, u32), directives: Vec<Directive>) -> Self {
        let mut job = Self {
            work_dir: work_dir.to_path_buf(),
            data_range,
            stage: ProcessingStage::SpotSearch,
            resolution_cutoff: None,
            space_group_override: None,
            directives,
            remediations: Vec::new(),
            runs: 0,
        };
        if let Some(stage) = job.parse_stage() {
            job.stage = stage;
        }
        job
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    /// Value of the last directive with this key; later directives win
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.directives
            .iter()
            .rev()
            .find(|d| d.key() == Some(key))
            .and_then(|d| d.value())
    }

    pub fn spot_ranges(&self) -> Vec<(u32, u32)> {
        self.directives
            .iter()
            .filter(|d| d.key() == Some(SPOT_RANGE_KEY))
            .filter_map(|d| d.value().and_then(parse_range))
            .collect()
    }

    fn parse_stage(&self) -> Option<ProcessingStage> {
        let steps = self.value_of(JOB_KEY)?;
        let steps = steps.split_whitespace().collect::<Vec<_>>().join(" ");
        [
            ProcessingStage::Full,
            ProcessingStage::SpotSearch,
            ProcessingStage::IndexIntegrate,
            ProcessingStage::DefpixIntegrate,
            ProcessingStage::Integrate,
            ProcessingStage::Merge,
        ]
        .into_iter()
        .find(|s| s.job_steps() == steps)
    }

    pub fn apply(&mut self, patch: &DirectivePatch) {
        match patch {
            DirectivePatch::Set { key, value } => {
                let replacement = Directive::keyed(key, value);
                match self
                    .directives
                    .iter()
                    .rposition(|d| d.key() == Some(key.as_str()))
                {
                    Some(idx) => self.directives[idx] = replacement,
                    None => self.directives.push(replacement),
                }
            }
            DirectivePatch::Append(line) => self.directives.push(Directive::new(line)),
            DirectivePatch::Remove(key) => {
                self.directives.retain(|d| d.key() != Some(key.as_str()))
            }
            DirectivePatch::Stage(stage) => {
                self.stage = *stage;
                match self.directives.iter().rposition(|d| d.key() == Some(JOB_KEY)) {
                    Some(idx) => self.directives[idx] = stage.directive(),
                    None => self.directives.push(stage.directive()),
                }
            }
        }
    }

    pub fn mutate(&mut self, patches: &[DirectivePatch]) {
        for patch in patches {
            self.apply(patch);
        }
    }

    pub fn set_stage(&mut self, stage: ProcessingStage) {
        self.apply(&DirectivePatch::Stage(stage));
    }

    /// Restrict the merge to the given high resolution limit
    pub fn set_resolution_cutoff(&mut self, cutoff: f64) {
        self.resolution_cutoff = Some(cutoff);
        self.apply(&DirectivePatch::set(
            RESOLUTION_RANGE_KEY,
            &format_resolution_range(LOW_RESOLUTION_LIMIT, cutoff),
        ));
    }

    pub fn force_symmetry(&mut self, space_group: u32, cell: &[f64; 6]) {
        self.space_group_override = Some(space_group);
        let cell_text = cell
            .iter()
            .map(|v| format!("{v}"))
            .collect::<Vec<_>>()
            .join(" ");
        self.mutate(&[
            DirectivePatch::set(SPACE_GROUP_KEY, &space_group.to_string()),
            DirectivePatch::set(UNIT_CELL_KEY, &cell_text),
        ]);
    }

    /// Has this signature already been remediated at the current stage
    pub fn was_remediated(&self, signature: ErrorSignature) -> bool {
        self.remediations
            .iter()
            .any(|(s, stage)| *s == signature && *stage == self.stage)
    }

    pub fn record_remediation(&mut self, signature: ErrorSignature, stage: ProcessingStage) {
        self.remediations.push((signature, stage));
    }

    /// Number of tool runs made for this job so far
    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn count_run(&mut self) {
        self.runs += 1;
    }

    pub fn render(&self) -> String {
        let mut text = self
            .directives
            .iter()
            .map(|d| d.text())
            .collect::<Vec<_>>()
            .join("\n");
        text.push('\n');
        text
    }

    pub fn control_file_path(&self) -> PathBuf {
        self.work_dir.join(XDS_INPUT)
    }

    /// Write the control file into the working directory
    pub fn write(&self) -> Result<PathBuf, JobFileError> {
        if !self.work_dir.exists() {
            std::fs::create_dir_all(&self.work_dir)?;
        }
        let path = self.control_file_path();
        std::fs::write(&path, self.render())?;
        log::debug!("Wrote {} ({})", path.to_string_lossy(), self.stage.job_steps());
        Ok(path)
    }
}

/// Builds control files for one run.
///
/// Holds the detector defaults followed by the dataset block so every job in the
/// run starts from the same text.
#[derive(Debug, Clone)]
pub struct JobFileBuilder {
    base: Vec<Directive>,
    jobs: u32,
    processors: u32,
    resolution: Option<(f64, f64)>,
}

impl JobFileBuilder {
    pub fn new(
        run_spec: &RunSpecification,
        defaults_dir: &Path,
        jobs: u32,
        processors: u32,
    ) -> Result<Self, JobFileError> {
        let defaults_path = defaults_dir.join(run_spec.detector.defaults_file());
        if !defaults_path.exists() {
            return Err(JobFileError::MissingDefaults(defaults_path));
        }
        let defaults = std::fs::read_to_string(&defaults_path)?;
        let mut base: Vec<Directive> = defaults.lines().map(Directive::new).collect();
        base.extend(dataset_directives(run_spec)?);
        Ok(Self {
            base,
            jobs,
            processors,
            resolution: None,
        })
    }

    /// Apply user resolution limits to every job this builder makes
    pub fn with_resolution(mut self, low: Option<f64>, high: Option<f64>) -> Self {
        self.resolution = high.map(|h| (low.unwrap_or(LOW_RESOLUTION_LIMIT), h));
        self
    }

    pub fn build_initial(
        &self,
        work_dir: &Path,
        data_range: (u32, u32),
        stage: ProcessingStage,
    ) -> JobContext {
        let mut directives = self.base.clone();
        directives.push(Directive::new(""));
        directives.push(Directive::keyed(
            "MAXIMUM_NUMBER_OF_PROCESSORS",
            &self.processors.to_string(),
        ));
        directives.push(Directive::keyed(
            "MAXIMUM_NUMBER_OF_JOBS",
            &self.jobs.to_string(),
        ));
        if let Some((low, high)) = self.resolution {
            directives.push(Directive::keyed(
                RESOLUTION_RANGE_KEY,
                &format_resolution_range(low, high),
            ));
        }
        directives.push(stage.directive());
        directives.push(Directive::keyed(
            DATA_RANGE_KEY,
            &format!("{} {}", data_range.0, data_range.1),
        ));
        let mut job = JobContext::new(work_dir, data_range, directives);
        job.stage = stage;
        if let Some((_, high)) = self.resolution {
            job.resolution_cutoff = Some(high);
        }
        job
    }
}

/// The dataset dependent block of the control file
pub fn dataset_directives(run_spec: &RunSpecification) -> Result<Vec<Directive>, JobFileError> {
    let (org_x, org_y) = run_spec.beam_origin()?;
    let mut lines = vec![
        Directive::new("!============ DATA SET DEPENDENT PARAMETERS===================="),
        Directive::new(&format!("ORGX={org_x:.2} ORGY={org_y:.2} !Beam center (pixels)")),
        Directive::new(&format!(
            "DETECTOR_DISTANCE={:.2} !(mm)",
            run_spec.distance
        )),
        Directive::new(&format!(
            "OSCILLATION_RANGE={:.2} !(degrees)",
            run_spec.osc_range
        )),
        Directive::new(&format!(
            "X-RAY_WAVELENGTH={:.5} !(Angstroems)",
            run_spec.wavelength
        )),
        Directive::new(""),
        Directive::keyed("NAME_TEMPLATE_OF_DATA_FRAMES", &run_spec.template_string()),
        Directive::new(""),
        Directive::keyed(
            "BACKGROUND_RANGE",
            &format!(
                "{} {}",
                run_spec.start,
                run_spec.start + BACKGROUND_RANGE_SPAN
            ),
        ),
        Directive::new(""),
    ];
    if run_spec.two_theta == 0.0 {
        lines.push(Directive::keyed("DIRECTION_OF_DETECTOR_Y-AXIS", "0.0 1.0 0.0"));
    } else {
        let two_theta = run_spec.two_theta.to_radians();
        lines.push(Directive::new("!******  Detector is inclined ****"));
        lines.push(Directive::new(&format!("! TWO_THETA = {}", run_spec.two_theta)));
        lines.push(Directive::new("!***   Reset DIRECTION_OF_DETECTOR_Y-AXIS ***"));
        lines.push(Directive::new(&format!(
            "DIRECTION_OF_DETECTOR_Y-AXIS=0.0 {:.4} {:.4}",
            two_theta.cos(),
            two_theta.sin()
        )));
        lines.push(Directive::new("!0.0 cos(2theta) sin(2theta)"));
    }
    Ok(lines)
}

pub fn format_resolution_range(low: f64, high: f64) -> String {
    format!("{low:.1} {high:.2}")
}

fn parse_range(value: &str) -> Option<(u32, u32)> {
    let mut parts = value.split_whitespace();
    let first = parts.next()?.parse().ok()?;
    let last = parts.next()?.parse().ok()?;
    Some((first, last))
}

/// Pick up to two spot ranges for peak picking.
///
/// Two 5 degree ranges 90 degrees apart when the sweep allows it, the first and
/// middle 5 degrees for shorter sweeps, the whole sweep at 10 degrees or less.
pub fn restricted_spot_ranges(first: u32, last: u32, osc: f64) -> Vec<(u32, u32)> {
    let Some(images) = last.checked_sub(first).map(|span| span.saturating_add(1)) else {
        log::warn!("No spot range for inverted image range {first}-{last}");
        return Vec::new();
    };
    let sweep = images as f64 * osc;
    if osc <= 0.0 || sweep <= SINGLE_SPOT_RANGE_DEGREES {
        return vec![(first, last)];
    }
    let span = ((SPOT_RANGE_DEGREES / osc) as u32).max(1);
    let second_start = if sweep < SPOT_RANGE_SEPARATION_LIMIT_DEGREES {
        first + images / 2
    } else {
        first + (SPOT_RANGE_SEPARATION_DEGREES / osc) as u32
    };
    vec![
        (first, first + span - 1),
        (second_start, (second_start + span - 1).min(last)),
    ]
}

/// Spot ranges on the first and last RAM nodes, one image per processor
pub fn ram_spot_ranges(nodes: &[RamNode], processors: u32) -> Vec<(u32, u32)> {
    let (Some(first_node), Some(last_node)) = (nodes.first(), nodes.last()) else {
        return Vec::new();
    };
    let per_range = processors.min(first_node.image_count()).max(1);
    let mut ranges = vec![(first_node.first, first_node.first + per_range - 1)];
    if nodes.len() > 1 {
        ranges.push((
            last_node.first,
            (last_node.first + per_range - 1).min(last_node.last),
        ));
    }
    ranges
}

/// Write the forkc/forki scripts that replace XDS's own fork scripts when the
/// images live on the compute nodes' RAM disks.
pub fn write_fork_scripts(
    dir: &Path,
    nodes: &[RamNode],
    osc: f64,
) -> Result<(PathBuf, PathBuf), JobFileError> {
    let (Some(first_node), Some(last_node)) = (nodes.first(), nodes.last()) else {
        return Err(JobFileError::BadDirective(
            "RAM nodes",
            String::from("no nodes assigned"),
        ));
    };
    let min_batch = if osc > 0.0 {
        ((MIN_BATCH_DEGREES / osc).floor() as u32).max(1)
    } else {
        1
    };

    let mut forkc = String::from("#!/bin/bash\n");
    forkc.push_str(&format!(
        "echo \"1\" | ssh -x {} \"cd $PWD && mcolspot_par\" &\n",
        first_node.name
    ));
    forkc.push_str(&format!(
        "echo \"2\" | ssh -x {} \"cd $PWD && mcolspot_par\" &\n",
        last_node.name
    ));
    forkc.push_str("wait\nrm -f mcolspot.tmp\n");

    let mut forki = String::from("#!/bin/bash\n");
    for (idx, node) in nodes.iter().enumerate() {
        let images = node.image_count();
        let batches = (images / min_batch).max(1);
        forki.push_str(&format!(
            "echo \"{} {} {} {}\" | ssh -x {} \"cd $PWD && mintegrate_par\" &\n",
            node.first,
            images,
            idx + 1,
            batches,
            node.name
        ));
    }
    forki.push_str("wait\nrm -f mintegrate.tmp\n");

    let forkc_path = dir.join("forkc");
    let forki_path = dir.join("forki");
    std::fs::write(&forkc_path, forkc)?;
    std::fs::write(&forki_path, forki)?;
    make_owner_executable(&forkc_path)?;
    make_owner_executable(&forki_path)?;
    Ok((forkc_path, forki_path))
}

#[cfg(unix)]
fn make_owner_executable(path: &Path) -> Result<(), JobFileError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
fn make_owner_executable(_path: &Path) -> Result<(), JobFileError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn spec() -> RunSpecification {
        let mut config = Config::default();
        config.run.beam_center_x = 215.0;
        config.run.beam_center_y = 210.0;
        config.run.distance = 300.0;
        config.run.wavelength = 0.97918;
        config.run.total = 900;
        config.run.directory = PathBuf::from("/data");
        config.run.image_prefix = String::from("lyso");
        RunSpecification::from_config(&config).unwrap()
    }

    fn builder(dir: &Path) -> JobFileBuilder {
        std::fs::write(
            dir.join("XDS-PILATUS.INP"),
            "DETECTOR=PILATUS MINIMUM_VALID_PIXEL_VALUE=0 OVERLOAD=1048500\nNX=2463 NY=2527 QX=0.172 QY=0.172\n",
        )
        .unwrap();
        JobFileBuilder::new(&spec(), dir, 4, 4).unwrap()
    }

    #[test]
    fn test_initial_layout() {
        let dir = tempfile::tempdir().unwrap();
        let job = builder(dir.path()).build_initial(dir.path(), (1, 900), ProcessingStage::SpotSearch);
        let text = job.render();
        assert!(text.starts_with("DETECTOR=PILATUS"));
        assert!(text.contains("ORGX=1220.93 ORGY=1250.00 !Beam center (pixels)"));
        assert!(text.contains("X-RAY_WAVELENGTH=0.97918"));
        assert!(text.contains("NAME_TEMPLATE_OF_DATA_FRAMES=/data/lyso_1_????.cbf"));
        assert!(text.contains("BACKGROUND_RANGE=1 5"));
        assert!(text.contains("DIRECTION_OF_DETECTOR_Y-AXIS=0.0 1.0 0.0"));
        assert_eq!(job.value_of(JOB_KEY), Some("XYCORR INIT COLSPOT"));
        assert_eq!(job.value_of(DATA_RANGE_KEY), Some("1 900"));
        assert_eq!(job.stage, ProcessingStage::SpotSearch);
    }

    #[test]
    fn test_tilted_detector_block() {
        let mut run = spec();
        run.two_theta = 30.0;
        let lines = dataset_directives(&run).unwrap();
        assert!(lines
            .iter()
            .any(|d| d.text() == "DIRECTION_OF_DETECTOR_Y-AXIS=0.0 0.8660 0.5000"));
    }

    #[test]
    fn test_missing_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            JobFileBuilder::new(&spec(), dir.path(), 4, 4),
            Err(JobFileError::MissingDefaults(_))
        ));
    }

    #[test]
    fn test_patch_preserves_unrelated_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut job =
            builder(dir.path()).build_initial(dir.path(), (1, 900), ProcessingStage::IndexIntegrate);
        job.mutate(&[
            DirectivePatch::Append(String::from("SPOT_RANGE=1 50")),
            DirectivePatch::Append(String::from("SPOT_RANGE=451 500")),
        ]);
        let before: Vec<String> = job
            .directives()
            .iter()
            .filter(|d| d.key() != Some(SPOT_RANGE_KEY))
            .map(|d| d.text().to_string())
            .collect();
        job.apply(&DirectivePatch::set(SPOT_RANGE_KEY, "451 550"));
        let after: Vec<String> = job
            .directives()
            .iter()
            .filter(|d| d.key() != Some(SPOT_RANGE_KEY))
            .map(|d| d.text().to_string())
            .collect();
        assert_eq!(before, after);
        assert_eq!(job.spot_ranges(), vec![(1, 50), (451, 550)]);
    }

    #[test]
    fn test_stage_and_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let mut job =
            builder(dir.path()).build_initial(dir.path(), (1, 900), ProcessingStage::IndexIntegrate);
        job.set_stage(ProcessingStage::Merge);
        job.set_resolution_cutoff(1.87);
        assert_eq!(job.value_of(JOB_KEY), Some("CORRECT"));
        assert_eq!(job.value_of(RESOLUTION_RANGE_KEY), Some("200.0 1.87"));
        assert_eq!(job.resolution_cutoff, Some(1.87));
        let path = job.write().unwrap();
        let reread = std::fs::read_to_string(path).unwrap();
        assert!(reread.contains("JOB=CORRECT\nDATA_RANGE=1 900\nINCLUDE_RESOLUTION_RANGE=200.0 1.87\n"));
    }

    #[test]
    fn test_directive_key_parsing() {
        assert_eq!(Directive::new("!JOB=CORRECT").key(), None);
        assert_eq!(Directive::new("  ORGX=1 ORGY=2").key(), Some("ORGX"));
        assert_eq!(
            Directive::new("JOB=CORRECT !XYCORR INIT").value(),
            Some("CORRECT")
        );
        assert_eq!(Directive::new("").key(), None);
    }

    #[test]
    fn test_restricted_spot_ranges() {
        assert_eq!(restricted_spot_ranges(1, 50, 0.2), vec![(1, 50)]);
        assert!(restricted_spot_ranges(50, 1, 0.2).is_empty());
        assert_eq!(
            restricted_spot_ranges(1, 900, 0.1),
            vec![(1, 50), (451, 500)]
        );
        assert_eq!(
            restricted_spot_ranges(1, 1800, 0.1),
            vec![(1, 50), (901, 950)]
        );
    }

    #[test]
    fn test_ram_spot_ranges_and_scripts() {
        let nodes = vec![
            RamNode { name: String::from("n1"), first: 1, last: 300 },
            RamNode { name: String::from("n2"), first: 301, last: 600 },
            RamNode { name: String::from("n3"), first: 601, last: 605 },
        ];
        assert_eq!(ram_spot_ranges(&nodes, 8), vec![(1, 8), (601, 605)]);

        let dir = tempfile::tempdir().unwrap();
        let (forkc, forki) = write_fork_scripts(dir.path(), &nodes, 0.1).unwrap();
        let forkc = std::fs::read_to_string(forkc).unwrap();
        assert!(forkc.contains("echo \"1\" | ssh -x n1 \"cd $PWD && mcolspot_par\" &"));
        assert!(forkc.contains("echo \"2\" | ssh -x n3 \"cd $PWD && mcolspot_par\" &"));
        let forki = std::fs::read_to_string(forki).unwrap();
        assert!(forki.contains("echo \"1 300 1 6\" | ssh -x n1"));
        assert!(forki.contains("echo \"601 5 3 1\" | ssh -x n3"));
        assert!(forki.ends_with("rm -f mintegrate.tmp\n"));
    }
}
