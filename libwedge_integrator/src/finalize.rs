use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::config::Config;
use super::constants::{
    CORRECT_LP, FINAL_DIR_PREFIX, INTEGRATE_LP, LP_ARCHIVE_DIR, RAM_STAGING_ROOT,
    WEDGE_DIR_PREFIX, XDSSTAT_LP, XDS_ASCII, XDS_INPUT, XDS_LOG,
};
use super::error::FinalizeError;
use super::orientation;
use super::results::{
    Artifact, ResultRecord, AIMLESS_COM, AIMLESS_LOG, AIMLESS_MTZ, POINTLESS_LOG, POINTLESS_MTZ,
};
use super::run_spec::RunSpecification;
use super::tool::{CancelToken, Invocation, ToolInvoker};

const TRUNCATED_MTZ: &str = "truncated.mtz";
const FREE_MTZ: &str = "freer.mtz";
const NATIVE_SCA: &str = "NATIVE.sca";
const ANOM_SCA: &str = "ANOM.sca";
const REFERENCE_MATRIX: &str = "reference.mat";
/// Line of a scalepack file holding the cell and space group
const SCALEPACK_SYMMETRY_LINE: usize = 2;
const SCALEPACK_CELL_TOKENS: usize = 6;
/// Working directory files removed once the deliverables are packed
const SCRATCH_EXTENSIONS: [&str; 4] = ["mtz", "sca", "sh", "log"];
const SCRATCH_PREFIX: &str = "junk_";

const NATIVE_LABELS: &str = "labin I=IMEAN SIGI=SIGIMEAN";
const ANOM_LABELS: &str = "labin I(+)=I(+) SIGI(+)=SIGI(+) I(-)=I(-) SIGI(-)=SIGI(-)";

/// What was delivered for a run
#[derive(Debug, Clone, PartialEq)]
pub struct DeliverableManifest {
    pub results_dir: PathBuf,
    pub archive: PathBuf,
    pub log_archive: Option<PathBuf>,
    pub files: Vec<Artifact>,
}

/// Turns the final scaled data into deliverables and tidies up after a run
#[derive(Clone)]
pub struct FinalizationPipeline {
    invoker: Arc<dyn ToolInvoker>,
    work_dir: PathBuf,
    /// "<image prefix>_<run>", names the results directory and its files
    name: String,
    cleanup: bool,
    /// Nodes whose RAM disk copies are removed at the end
    ram_nodes: Vec<String>,
}

impl FinalizationPipeline {
    pub fn new(invoker: Arc<dyn ToolInvoker>, work_dir: &Path, name: &str) -> Self {
        Self {
            invoker,
            work_dir: work_dir.to_path_buf(),
            name: name.to_string(),
            cleanup: false,
            ram_nodes: Vec::new(),
        }
    }

    pub fn from_config(config: &Config, invoker: Arc<dyn ToolInvoker>) -> Self {
        let mut pipeline = Self::new(invoker, &config.work_directory, &config.results_name())
            .with_cleanup(config.preferences.cleanup);
        if config.ram_cleanup() {
            pipeline = pipeline.with_ram_cleanup(
                config.ram_nodes().iter().map(|n| n.name.clone()).collect(),
            );
        }
        pipeline
    }

    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn with_ram_cleanup(mut self, nodes: Vec<String>) -> Self {
        self.ram_nodes = nodes;
        self
    }

    pub fn results_dir(&self) -> PathBuf {
        self.work_dir.join(&self.name)
    }

    /// Convert, export, pack and clean for the final integration in final_dir.
    ///
    /// The record gains the deliverable files. It is marked Success and written
    /// to the results directory only after every step has completed.
    pub fn finalize(
        &self,
        record: &mut ResultRecord,
        run_spec: &RunSpecification,
        final_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<DeliverableManifest, FinalizeError> {
        let scaled = record
            .artifact(AIMLESS_MTZ)
            .map(|p| p.to_path_buf())
            .ok_or_else(|| FinalizeError::MissingOutput(final_dir.join(AIMLESS_MTZ)))?;

        let truncated = self.run_ccp4(
            "truncate",
            final_dir,
            &scaled,
            TRUNCATED_MTZ,
            "ranges 60\nEND\n",
            cancel,
        )?;
        let free = self.run_ccp4("freerflag", final_dir, &truncated, FREE_MTZ, "END\n", cancel)?;
        let native =
            self.export_scalepack(final_dir, &truncated, NATIVE_SCA, NATIVE_LABELS, cancel)?;
        let anom = self.export_scalepack(final_dir, &truncated, ANOM_SCA, ANOM_LABELS, cancel)?;

        let results_dir = self.results_dir();
        std::fs::create_dir_all(&results_dir)?;
        let reference =
            orientation::write_reference_matrix(final_dir, &results_dir.join(REFERENCE_MATRIX))?;

        let mut required = vec![
            (free, self.deliverable("free.mtz")),
            (native, self.deliverable("NATIVE.sca")),
            (anom, self.deliverable("ANOM.sca")),
        ];
        let mut optional: Vec<(PathBuf, PathBuf)> = Vec::new();
        for (artifact, suffix) in [
            (AIMLESS_LOG, "aimless.log"),
            (AIMLESS_COM, "aimless.com"),
            (POINTLESS_MTZ, "mergable.mtz"),
            (POINTLESS_LOG, "pointless.log"),
        ] {
            if let Some(path) = record.artifact(artifact) {
                optional.push((path.to_path_buf(), self.deliverable(suffix)));
            }
        }
        for (file, suffix) in [
            (XDS_LOG, "XDS.LOG"),
            (XDS_INPUT, "XDS.INP"),
            (CORRECT_LP, "CORRECT.LP"),
            (INTEGRATE_LP, "INTEGRATE.LP"),
            (XDSSTAT_LP, "XDSSTAT.LP"),
            (XDS_ASCII, "XDS.HKL"),
        ] {
            optional.push((final_dir.join(file), self.deliverable(suffix)));
        }
        optional.retain(|(src, _)| {
            let present = src.exists();
            if !present {
                log::warn!("{} is missing from the deliverables", src.to_string_lossy());
            }
            present
        });
        required.append(&mut optional);
        let copied = copy_stack(&required)?;

        let mut files = vec![Artifact {
            name: String::from("reference_matrix"),
            path: reference,
        }];
        for dst in copied {
            let name = dst
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            files.push(Artifact { name, path: dst });
        }

        let log_archive = self.archive_logs(final_dir, cancel)?;
        let archive = self.work_dir.join(format!("{}.tar.bz2", self.name));
        self.tar(&archive, &self.name, cancel)?;

        if self.cleanup {
            self.clean_work_dir()?;
        }
        self.clean_ram(run_spec, cancel)?;

        for artifact in files.iter() {
            record.add_file(&artifact.name, &artifact.path);
        }
        record.add_file("archive", &archive);
        if let Some(path) = &log_archive {
            record.add_file("lp_archive", path);
        }
        record.mark_success();
        record.write(&results_dir)?;

        Ok(DeliverableManifest {
            results_dir,
            archive,
            log_archive,
            files,
        })
    }

    fn deliverable(&self, suffix: &str) -> PathBuf {
        self.results_dir().join(format!("{}_{suffix}", self.name))
    }

    /// Run one of the CCP4 filters hklin -> hklout and check it wrote its output
    fn run_ccp4(
        &self,
        program: &str,
        dir: &Path,
        hklin: &Path,
        hklout: &str,
        keywords: &str,
        cancel: &CancelToken,
    ) -> Result<PathBuf, FinalizeError> {
        let invocation = Invocation::new(program, dir, &format!("{program}.log"))
            .args(&["hklin", &hklin.to_string_lossy(), "hklout", hklout])
            .stdin(keywords);
        self.invoker.run(&invocation, cancel)?;
        let output = dir.join(hklout);
        if !output.exists() {
            return Err(FinalizeError::MissingOutput(output));
        }
        log::info!("{program} wrote {}", output.to_string_lossy());
        Ok(output)
    }

    fn export_scalepack(
        &self,
        dir: &Path,
        hklin: &Path,
        hklout: &str,
        labels: &str,
        cancel: &CancelToken,
    ) -> Result<PathBuf, FinalizeError> {
        let log_name = format!("mtz2various_{}.log", hklout.trim_end_matches(".sca"));
        let invocation = Invocation::new("mtz2various", dir, &log_name)
            .args(&["hklin", &hklin.to_string_lossy(), "hklout", hklout])
            .stdin(&format!("OUTPUT SCALEPACK\n{labels}\nEND\n"));
        self.invoker.run(&invocation, cancel)?;
        let output = dir.join(hklout);
        if !output.exists() {
            return Err(FinalizeError::MissingOutput(output));
        }
        fix_scalepack(&output)?;
        Ok(output)
    }

    /// Copy every LP file of the final integration aside and pack them
    fn archive_logs(
        &self,
        final_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<Option<PathBuf>, FinalizeError> {
        let lp_dir = self.work_dir.join(LP_ARCHIVE_DIR);
        std::fs::create_dir_all(&lp_dir)?;
        let mut count = 0;
        for entry in final_dir.read_dir()? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "LP") {
                if let Some(name) = path.file_name() {
                    std::fs::copy(&path, lp_dir.join(name))?;
                    count += 1;
                }
            }
        }
        if count == 0 {
            log::warn!("No LP files found in {}", final_dir.to_string_lossy());
            std::fs::remove_dir_all(&lp_dir)?;
            return Ok(None);
        }
        let archive = self.work_dir.join(format!("{LP_ARCHIVE_DIR}.tar.bz2"));
        self.tar(&archive, &format!("{LP_ARCHIVE_DIR}/"), cancel)?;
        std::fs::remove_dir_all(&lp_dir)?;
        Ok(Some(archive))
    }

    fn tar(&self, archive: &Path, source: &str, cancel: &CancelToken) -> Result<(), FinalizeError> {
        let invocation = Invocation::new("tar", &self.work_dir, "tar.log").args(&[
            "-cjf",
            &archive.to_string_lossy(),
            source,
        ]);
        self.invoker.run(&invocation, cancel)?;
        if !archive.exists() {
            return Err(FinalizeError::MissingOutput(archive.to_path_buf()));
        }
        Ok(())
    }

    /// Remove wedge and final pass directories and loose scratch files
    fn clean_work_dir(&self) -> Result<(), FinalizeError> {
        for entry in self.work_dir.read_dir()? {
            let path = entry?.path();
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if path.is_dir() {
                if name.starts_with(WEDGE_DIR_PREFIX) || name.starts_with(FINAL_DIR_PREFIX) {
                    log::debug!("Removing {}", path.to_string_lossy());
                    std::fs::remove_dir_all(&path)?;
                }
                continue;
            }
            let scratch = name.starts_with(SCRATCH_PREFIX)
                || path
                    .extension()
                    .is_some_and(|e| SCRATCH_EXTENSIONS.iter().any(|s| e == *s));
            if scratch {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn clean_ram(
        &self,
        run_spec: &RunSpecification,
        cancel: &CancelToken,
    ) -> Result<(), FinalizeError> {
        let staged = format!("{RAM_STAGING_ROOT}/{}", run_spec.image_prefix);
        for node in self.ram_nodes.iter() {
            log::info!("Removing staged images {staged} on {node}");
            let invocation = Invocation::new("ssh", &self.work_dir, "ram_cleanup.out")
                .args(&["-x", node, &format!("rm -rf {staged}")]);
            if let Err(e) = self.invoker.run(&invocation, cancel) {
                log::warn!("RAM cleanup on {node} failed: {e}");
            }
        }
        Ok(())
    }
}

/// Copy (source, destination) pairs, logging the total size
fn copy_stack(stack: &[(PathBuf, PathBuf)]) -> Result<Vec<PathBuf>, FinalizeError> {
    let mut total: u64 = 0;
    let mut copied = Vec::with_capacity(stack.len());
    for (src, dst) in stack {
        if !src.exists() {
            return Err(FinalizeError::MissingOutput(src.clone()));
        }
        total += std::fs::copy(src, dst)?;
        copied.push(dst.clone());
    }
    log::info!(
        "Copied {} deliverables totalling {}",
        copied.len(),
        human_bytes::human_bytes(total as f64)
    );
    Ok(copied)
}

/// mtz2various splits the space group symbol of a scalepack header over
/// several tokens ("p 43 21 2"); join it back into one.
pub fn fix_scalepack(path: &Path) -> Result<(), FinalizeError> {
    let text = std::fs::read_to_string(path)?;
    let mut lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    let line = lines
        .get(SCALEPACK_SYMMETRY_LINE)
        .ok_or_else(|| FinalizeError::ScalepackFormat(path.to_path_buf()))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() <= SCALEPACK_CELL_TOKENS {
        return Err(FinalizeError::ScalepackFormat(path.to_path_buf()));
    }
    let symbol_start = line
        .find(tokens[SCALEPACK_CELL_TOKENS])
        .ok_or_else(|| FinalizeError::ScalepackFormat(path.to_path_buf()))?;
    let fixed = format!(
        "{}{}",
        &line[..symbol_start],
        tokens[SCALEPACK_CELL_TOKENS..].concat()
    );
    lines[SCALEPACK_SYMMETRY_LINE] = fixed;
    let mut out = lines.join("\n");
    out.push('\n');
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::constants::RESULTS_FILE;
    use crate::results::ResultStatus;
    use crate::tool::testing::ScriptedInvoker;

    const SCA: &str = "    1\n -987\n    78.900    78.900    37.100    90.000    90.000    90.000 p 43 21 2\n   0   0   4  1234.5    56.7\n";
    const GXPARM_TEXT: &str = "\
 XPARM.XDS    VERSION Jan 26, 2018\n\
         1        0.0000    0.5000  1.000000  0.000000  0.000000\n\
       1.000000       0.000000       0.000000       1.000000\n\
    96    78.9000    78.9000    37.1000  90.000  90.000  90.000\n\
      78.900000       0.000000       0.000000\n\
       0.000000      78.900000       0.000000\n\
       0.000000       0.000000      37.100000\n";

    /// Writes whatever file an invocation is expected to produce
    fn producing_invoker() -> Arc<ScriptedInvoker> {
        Arc::new(ScriptedInvoker::new(|inv: &Invocation| {
            let output = match inv.program.as_str() {
                "tar" => inv.args.get(1).map(PathBuf::from),
                "ssh" => None,
                _ => inv
                    .args
                    .iter()
                    .position(|a| a == "hklout")
                    .and_then(|i| inv.args.get(i + 1))
                    .map(|name| inv.work_dir.join(name)),
            };
            if let Some(path) = output {
                let body = if path.extension().is_some_and(|e| e == "sca") {
                    SCA
                } else {
                    "data"
                };
                std::fs::write(path, body).unwrap();
            }
            String::new()
        }))
    }

    #[test]
    fn test_fix_scalepack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NATIVE.sca");
        std::fs::write(&path, SCA).unwrap();
        fix_scalepack(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let line = text.lines().nth(2).unwrap();
        assert!(line.ends_with("90.000 p43212"));
        assert!(text.lines().nth(3).unwrap().contains("1234.5"));

        std::fs::write(&path, "    1\n -987\n  78.9 78.9\n").unwrap();
        assert!(matches!(
            fix_scalepack(&path),
            Err(FinalizeError::ScalepackFormat(_))
        ));
    }

    #[test]
    fn test_finalize_delivers_and_cleans() {
        let work = tempfile::tempdir().unwrap();
        let final_dir = work.path().join("final_1_10");
        std::fs::create_dir_all(&final_dir).unwrap();
        std::fs::create_dir_all(work.path().join("wedge_1_5")).unwrap();
        std::fs::write(final_dir.join("GXPARM.XDS"), GXPARM_TEXT).unwrap();
        std::fs::write(final_dir.join(CORRECT_LP), "correct").unwrap();
        std::fs::write(final_dir.join(XDS_ASCII), "hkl").unwrap();
        std::fs::write(final_dir.join("lyso_1_aimless.mtz"), "mtz").unwrap();
        std::fs::write(work.path().join("junk_1"), "x").unwrap();
        std::fs::write(work.path().join("keep.txt"), "x").unwrap();

        let mut config = Config::default();
        config.work_directory = work.path().to_path_buf();
        config.run.image_prefix = String::from("lyso");
        config.run.run_number = 1;
        config.run.image_template = Some(String::from("lyso_1_???.img"));
        let run_spec = RunSpecification::from_config(&config).unwrap();

        let mut record = ResultRecord::working((1, 10));
        record.add_file(AIMLESS_MTZ, &final_dir.join("lyso_1_aimless.mtz"));

        let invoker = producing_invoker();
        let pipeline = FinalizationPipeline::new(invoker.clone(), work.path(), "lyso_1")
            .with_cleanup(true)
            .with_ram_cleanup(vec![String::from("node1"), String::from("node2")]);
        let manifest = pipeline
            .finalize(&mut record, &run_spec, &final_dir, &CancelToken::new())
            .unwrap();

        let results_dir = work.path().join("lyso_1");
        assert_eq!(manifest.results_dir, results_dir);
        assert!(results_dir.join("lyso_1_free.mtz").exists());
        assert!(results_dir.join("lyso_1_ANOM.sca").exists());
        assert!(results_dir.join("lyso_1_CORRECT.LP").exists());
        assert!(results_dir.join("lyso_1_XDS.HKL").exists());
        assert!(results_dir.join("reference.mat").exists());
        let stored = ResultRecord::read(&results_dir.join("results.yml")).unwrap();
        assert_eq!(stored.status, ResultStatus::Success);
        assert!(record.is_success());
        assert_eq!(manifest.archive, work.path().join("lyso_1.tar.bz2"));
        assert_eq!(
            manifest.log_archive,
            Some(work.path().join("xds_lp_files.tar.bz2"))
        );
        assert!(!work.path().join(LP_ARCHIVE_DIR).exists());

        // scratch gone, unrelated files kept
        assert!(!final_dir.exists());
        assert!(!work.path().join("wedge_1_5").exists());
        assert!(!work.path().join("junk_1").exists());
        assert!(work.path().join("keep.txt").exists());

        let calls = invoker.calls();
        let programs: Vec<&str> = calls.iter().map(|c| c.program.as_str()).collect();
        assert_eq!(
            programs,
            vec!["truncate", "freerflag", "mtz2various", "mtz2various", "tar", "tar", "ssh", "ssh"]
        );
        assert_eq!(calls[6].args, vec!["-x", "node1", "rm -rf /dev/shm/lyso"]);
        assert!(record.artifact("archive").is_some());
    }

    #[test]
    fn test_missing_scaled_data() {
        let work = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.run.image_template = Some(String::from("lyso_1_???.img"));
        let run_spec = RunSpecification::from_config(&config).unwrap();
        let pipeline = FinalizationPipeline::new(producing_invoker(), work.path(), "lyso_1");
        let mut record = ResultRecord::working((1, 10));
        assert!(matches!(
            pipeline.finalize(&mut record, &run_spec, work.path(), &CancelToken::new()),
            Err(FinalizeError::MissingOutput(_))
        ));
    }

    #[test]
    fn test_failed_conversion_is_not_success() {
        let work = tempfile::tempdir().unwrap();
        let final_dir = work.path().join("final_1_10");
        std::fs::create_dir_all(&final_dir).unwrap();
        let mut config = Config::default();
        config.run.image_template = Some(String::from("lyso_1_???.img"));
        let run_spec = RunSpecification::from_config(&config).unwrap();

        // truncate runs but writes nothing
        let invoker = Arc::new(ScriptedInvoker::new(|_: &Invocation| String::new()));
        let pipeline = FinalizationPipeline::new(invoker.clone(), work.path(), "lyso_1");
        let mut record = ResultRecord::working((1, 10));
        record.add_file(AIMLESS_MTZ, &final_dir.join("lyso_1_aimless.mtz"));
        assert!(matches!(
            pipeline.finalize(&mut record, &run_spec, &final_dir, &CancelToken::new()),
            Err(FinalizeError::MissingOutput(_))
        ));
        assert_eq!(record.status, ResultStatus::Working);
        assert!(!work.path().join("lyso_1").join(RESULTS_FILE).exists());
        assert_eq!(invoker.calls().len(), 1);
    }
}
