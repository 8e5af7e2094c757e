use std::path::Path;

use super::config::{Config, RamNode};
use super::constants::{
    CORRECT_LP, GXPARM, IDXREF_LP, POLISH_SAFE_RESOLUTION, XDS_ASCII, XDS_LOG, XPARM,
};
use super::error::{IntegrationError, JobFileError};
use super::error_classifier::{self, ErrorVerdict};
use super::job_file::{
    ram_spot_ranges, restricted_spot_ranges, write_fork_scripts, DirectivePatch, JobContext,
    JobFileBuilder, ProcessingStage, SPOT_RANGE_KEY,
};
use super::resolution::{self, CutoffResult};
use super::results::{ResultRecord, ResultStatus, ResultsAssembler, SummaryValue};
use super::run_spec::RunSpecification;
use super::symmetry::{SymmetryOutcome, SymmetryReconciler};
use super::tool::{read_log, CancelToken, Invocation, Tools};
use super::xds_log;

/// Suffix of the logs of a run superseded by a resolution cutoff
const NO_CUTOFF_SUFFIX: &str = "nocutoff";
/// Suffix of the logs of a run superseded by polishing
const POLISHED_SUFFIX: &str = "old";
/// Suffix of the logs of a run superseded by a second cutoff
const OLD_CUTOFF_SUFFIX: &str = "oldcutoff";
/// Two cutoffs closer than this are the same cutoff
const CUTOFF_TOLERANCE: f64 = 0.005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    /// Part of the collection, integrated while images keep arriving
    Wedge,
    /// Everything collected
    Final,
}

/// A finished integration attempt
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub job: JobContext,
    pub record: ResultRecord,
    pub cutoff: CutoffResult,
    pub polished: bool,
}

/// Runs one wedge or final integration from an empty directory to a result
/// record: spot search, indexing through merging, symmetry, resolution cutoff
/// and, for the final pass, polishing.
#[derive(Clone)]
pub struct Integrator {
    builder: JobFileBuilder,
    tools: Tools,
    assembler: ResultsAssembler,
    reconciler: SymmetryReconciler,
    xds_program: String,
    declared_spacegroup: Option<String>,
    target_signal_to_noise: f64,
    restricted_spot_search: bool,
    osc_range: f64,
    ram_nodes: Vec<RamNode>,
    processors: u32,
}

impl Integrator {
    pub fn from_config(
        config: &Config,
        run_spec: &RunSpecification,
        tools: Tools,
    ) -> Result<Self, JobFileError> {
        let builder = JobFileBuilder::new(
            run_spec,
            &config.detector_defaults_directory,
            config.xds_jobs(),
            config.xds_processors(),
        )?
        .with_resolution(
            config.preferences.resolution_low,
            config.preferences.resolution_high,
        );
        let assembler = ResultsAssembler::new(tools.local.clone(), &config.results_name());
        Ok(Self {
            builder,
            tools,
            assembler,
            reconciler: SymmetryReconciler::new(),
            xds_program: config.execution.xds_program.clone(),
            declared_spacegroup: config.preferences.spacegroup.clone(),
            target_signal_to_noise: config.preferences.target_signal_to_noise,
            restricted_spot_search: config.preferences.restricted_spot_search,
            osc_range: run_spec.osc_range,
            ram_nodes: config.ram_nodes().to_vec(),
            processors: config.xds_processors(),
        })
    }

    pub fn integrate(
        &self,
        work_dir: &Path,
        data_range: (u32, u32),
        kind: AttemptKind,
        cancel: &CancelToken,
    ) -> Result<AttemptOutcome, IntegrationError> {
        if work_dir.exists() {
            std::fs::remove_dir_all(work_dir)?;
        }
        std::fs::create_dir_all(work_dir)?;
        log::info!(
            "Integrating {:?} of images {}-{} in {}",
            kind,
            data_range.0,
            data_range.1,
            work_dir.to_string_lossy()
        );

        let mut job = if self.ram_nodes.is_empty() {
            let mut job =
                self.builder
                    .build_initial(work_dir, data_range, ProcessingStage::SpotSearch);
            if self.restricted_spot_search {
                add_spot_ranges(
                    &mut job,
                    &restricted_spot_ranges(data_range.0, data_range.1, self.osc_range),
                );
            }
            let mut job = self.run_until_settled(job, cancel)?;
            job.set_stage(ProcessingStage::IndexIntegrate);
            job
        } else {
            let mut job = self
                .builder
                .build_initial(work_dir, data_range, ProcessingStage::Full);
            add_spot_ranges(&mut job, &ram_spot_ranges(&self.ram_nodes, self.processors));
            write_fork_scripts(work_dir, &self.ram_nodes, self.osc_range)?;
            job
        };
        job = self.run_until_settled(job, cancel)?;
        job = self.reconcile_symmetry(job, cancel)?;

        let (mut job, mut cutoff) = self.apply_cutoff(job, NO_CUTOFF_SUFFIX, cancel)?;
        let mut polished = false;
        if kind == AttemptKind::Final {
            let safe = match cutoff {
                CutoffResult::NoCutoff => true,
                CutoffResult::Cutoff(value) => value <= POLISH_SAFE_RESOLUTION,
            };
            if safe {
                job = self.polish(job, cancel)?;
                polished = true;
            } else {
                log::info!("Cutoff {cutoff:?} is outside the polishing band, checking it again");
                let rechecked = self.apply_cutoff(job, OLD_CUTOFF_SUFFIX, cancel)?;
                job = rechecked.0;
                if rechecked.1 != CutoffResult::NoCutoff {
                    cutoff = rechecked.1;
                }
            }
        }

        let mut record =
            self.assembler
                .assemble(&work_dir.join(XDS_ASCII), work_dir, data_range, cancel)?;
        if let Some(value) = job.resolution_cutoff {
            record
                .summary
                .insert(String::from("resolution_cutoff"), SummaryValue::Number(value));
        }
        if let Some(number) = job.space_group_override {
            record.summary.insert(
                String::from("forced_spacegroup"),
                SummaryValue::Number(number as f64),
            );
        }
        // a final attempt is complete only once its deliverables exist
        if kind == AttemptKind::Wedge && record.status == ResultStatus::Working {
            record.mark_success();
        }
        record.write(work_dir)?;

        Ok(AttemptOutcome {
            job,
            record,
            cutoff,
            polished,
        })
    }

    /// Run XDS until the log shows no error, applying remediations in between
    fn run_until_settled(
        &self,
        mut job: JobContext,
        cancel: &CancelToken,
    ) -> Result<JobContext, IntegrationError> {
        loop {
            error_classifier::archive_log(&job)?;
            job.write()?;
            job.count_run();
            let invocation = Invocation::new(&self.xds_program, &job.work_dir, XDS_LOG);
            let outcome = self.tools.integrate.run(&invocation, cancel)?;
            match error_classifier::classify(&outcome.log_text, job) {
                ErrorVerdict::Continue(settled) => return Ok(settled),
                ErrorVerdict::Retry(amended) => {
                    log::info!(
                        "Rerunning {} with {}",
                        amended.work_dir.to_string_lossy(),
                        amended.stage.job_steps()
                    );
                    job = amended;
                }
                ErrorVerdict::HardFailure(reason) => {
                    return Err(IntegrationError::HardFailure {
                        dir: invocation.work_dir,
                        reason,
                    })
                }
            }
        }
    }

    fn reconcile_symmetry(
        &self,
        job: JobContext,
        cancel: &CancelToken,
    ) -> Result<JobContext, IntegrationError> {
        let Some(declared) = self.declared_spacegroup.as_deref() else {
            return Ok(job);
        };
        let determined = xds_log::space_group_number(&read_log(&job.work_dir.join(XDS_LOG))?)?;
        let idxref = read_log(&job.work_dir.join(IDXREF_LP))?;
        let work_dir = job.work_dir.clone();
        match self
            .reconciler
            .reconcile(determined, Some(declared), job, &idxref)?
        {
            SymmetryOutcome::Consistent(job) => Ok(job),
            SymmetryOutcome::Forced(job) => {
                log::info!("Merging {} again in {declared}", work_dir.to_string_lossy());
                self.run_until_settled(job, cancel)
            }
        }
    }

    /// Find the cutoff in CORRECT.LP and, when it lowers the resolution in use,
    /// merge again with it. The superseded logs keep the given suffix.
    fn apply_cutoff(
        &self,
        mut job: JobContext,
        suffix: &str,
        cancel: &CancelToken,
    ) -> Result<(JobContext, CutoffResult), IntegrationError> {
        let correct = read_log(&job.work_dir.join(CORRECT_LP))?;
        let cutoff = resolution::find_cutoff(&correct, self.target_signal_to_noise);
        let CutoffResult::Cutoff(value) = cutoff else {
            log::info!("No resolution cutoff needed in {}", job.work_dir.to_string_lossy());
            return Ok((job, cutoff));
        };
        let warranted = match job.resolution_cutoff {
            Some(current) => value > current + CUTOFF_TOLERANCE,
            None => true,
        };
        if !warranted {
            return Ok((job, cutoff));
        }
        log::info!("Applying resolution cutoff {value:.2} A");
        supersede_logs(&job.work_dir, suffix)?;
        job.set_resolution_cutoff(value);
        job.set_stage(ProcessingStage::Merge);
        let job = self.run_until_settled(job, cancel)?;
        Ok((job, cutoff))
    }

    /// Integrate again from the refined geometry of the previous run
    fn polish(
        &self,
        mut job: JobContext,
        cancel: &CancelToken,
    ) -> Result<JobContext, IntegrationError> {
        let refined = job.work_dir.join(GXPARM);
        if !refined.exists() {
            log::warn!("No {GXPARM} to polish from in {}", job.work_dir.to_string_lossy());
            return Ok(job);
        }
        log::info!("Polishing {}", job.work_dir.to_string_lossy());
        std::fs::copy(&refined, job.work_dir.join(XPARM))?;
        supersede_logs(&job.work_dir, POLISHED_SUFFIX)?;
        job.set_stage(ProcessingStage::Integrate);
        self.run_until_settled(job, cancel)
    }
}

fn add_spot_ranges(job: &mut JobContext, ranges: &[(u32, u32)]) {
    for (first, last) in ranges {
        job.apply(&DirectivePatch::Append(format!(
            "{SPOT_RANGE_KEY}={first} {last}"
        )));
    }
}

/// Move CORRECT.LP and XDS.LOG aside so a rerun never overwrites them
fn supersede_logs(work_dir: &Path, suffix: &str) -> Result<(), std::io::Error> {
    for name in [CORRECT_LP, XDS_LOG] {
        let path = work_dir.join(name);
        if path.exists() {
            std::fs::rename(&path, work_dir.join(format!("{name}.{suffix}")))?;
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_file::{JOB_KEY, RESOLUTION_RANGE_KEY, SPACE_GROUP_KEY};
    use crate::constants::RESULTS_FILE;
    use crate::tool::testing::ScriptedInvoker;
    use crate::xds_log::fixtures::correct_lp;
    use std::sync::{Arc, Mutex};

    const IDXREF: &str = " *  21        tP          1.1      78.95  78.95  37.1  90.0  90.0  90.0\n";

    /// Fake XDS. `respond` gets the JOB of the control file and whether a
    /// resolution range is set, and returns the log text and CORRECT.LP rows.
    fn fake_xds<F>(respond: F) -> (Arc<ScriptedInvoker>, Arc<Mutex<Vec<String>>>)
    where
        F: Fn(&str, bool, usize) -> (String, Vec<(f64, f64)>) + Send + Sync + 'static,
    {
        let jobs = Arc::new(Mutex::new(Vec::new()));
        let seen = jobs.clone();
        let invoker = ScriptedInvoker::new(move |inv: &Invocation| {
            let input = std::fs::read_to_string(inv.work_dir.join("XDS.INP")).unwrap();
            let job = JobContext::new(&inv.work_dir, (1, 20), input.lines().map(crate::job_file::Directive::new).collect());
            let steps = job.value_of(JOB_KEY).unwrap_or_default().to_string();
            let cut = job.value_of(RESOLUTION_RANGE_KEY).is_some();
            let call = {
                let mut jobs = seen.lock().unwrap();
                jobs.push(steps.clone());
                jobs.len()
            };
            let (log, rows) = respond(&steps, cut, call);
            if steps.contains("CORRECT") {
                std::fs::write(inv.work_dir.join(CORRECT_LP), correct_lp(&rows)).unwrap();
                std::fs::write(inv.work_dir.join(GXPARM), "geometry").unwrap();
                std::fs::write(inv.work_dir.join(IDXREF_LP), IDXREF).unwrap();
            }
            log
        });
        (Arc::new(invoker), jobs)
    }

    fn integrator(config: &Config, xds: Arc<ScriptedInvoker>) -> Integrator {
        let run_spec = RunSpecification::from_config(config).unwrap();
        let tools = Tools {
            integrate: xds,
            local: fixtures::scaling_tools(),
        };
        Integrator::from_config(config, &run_spec, tools).unwrap()
    }

    const GOOD: [(f64, f64); 4] = [(4.0, 30.0), (3.0, 8.0), (2.5, 2.0), (2.2, 0.5)];
    const CUT: [(f64, f64); 4] = [(4.0, 30.0), (3.0, 8.0), (2.5, 2.0), (2.3, 1.2)];

    #[test]
    fn test_final_cutoff_and_polish() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixtures::config(dir.path());
        let (xds, jobs) = fake_xds(|_, cut, _| {
            let rows = if cut { CUT.to_vec() } else { GOOD.to_vec() };
            (String::from(" SPACE_GROUP_NUMBER=  96\n"), rows)
        });
        let work = dir.path().join("wedge_1_20");
        let outcome = integrator(&config, xds)
            .integrate(&work, (1, 20), AttemptKind::Final, &CancelToken::new())
            .unwrap();

        assert_eq!(
            *jobs.lock().unwrap(),
            vec![
                "XYCORR INIT COLSPOT",
                "IDXREF DEFPIX INTEGRATE CORRECT",
                "CORRECT",
                "INTEGRATE CORRECT"
            ]
        );
        assert_eq!(outcome.cutoff, CutoffResult::Cutoff(2.3));
        assert!(outcome.polished);
        assert!(work.join("CORRECT.LP.nocutoff").exists());
        assert!(work.join("XDS.LOG.nocutoff").exists());
        assert!(work.join("CORRECT.LP.old").exists());
        assert!(work.join(XPARM).exists());
        assert_eq!(outcome.record.status, ResultStatus::Working);
        let stored = ResultRecord::read(&work.join(RESULTS_FILE)).unwrap();
        assert_eq!(stored.status, ResultStatus::Working);
        assert_eq!(
            outcome.record.summary.get("resolution_cutoff"),
            Some(&SummaryValue::Number(2.3))
        );
    }

    #[test]
    fn test_wedge_is_not_polished() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixtures::config(dir.path());
        let (xds, jobs) = fake_xds(|_, _, _| (String::new(), CUT.to_vec()));
        let outcome = integrator(&config, xds)
            .integrate(&dir.path().join("wedge_1_10"), (1, 10), AttemptKind::Wedge, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.cutoff, CutoffResult::NoCutoff);
        assert!(!outcome.polished);
        assert_eq!(jobs.lock().unwrap().len(), 2);
        assert_eq!(outcome.record.status, ResultStatus::Success);
    }

    #[test]
    fn test_remediation_then_settle() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixtures::config(dir.path());
        let (xds, jobs) = fake_xds(|steps, _, _| {
            let log = if steps.starts_with("IDXREF") {
                String::from(" !!! ERROR !!! SOLUTION IS INACCURATE\n")
            } else {
                String::new()
            };
            (log, CUT.to_vec())
        });
        let work = dir.path().join("wedge_1_10");
        integrator(&config, xds)
            .integrate(&work, (1, 10), AttemptKind::Wedge, &CancelToken::new())
            .unwrap();
        assert_eq!(
            *jobs.lock().unwrap(),
            vec![
                "XYCORR INIT COLSPOT",
                "IDXREF DEFPIX INTEGRATE CORRECT",
                "DEFPIX INTEGRATE CORRECT"
            ]
        );
        assert!(work.join("XDS.LOG.retry2").exists());
    }

    #[test]
    fn test_unknown_error_is_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixtures::config(dir.path());
        let (xds, _) = fake_xds(|_, _, call| {
            let log = if call == 2 {
                String::from(" !!! ERROR !!! CANNOT READ IMAGE\n")
            } else {
                String::new()
            };
            (log, CUT.to_vec())
        });
        let result = integrator(&config, xds).integrate(
            &dir.path().join("wedge_1_10"),
            (1, 10),
            AttemptKind::Wedge,
            &CancelToken::new(),
        );
        let Err(IntegrationError::HardFailure { reason, .. }) = result else {
            panic!("expected a hard failure");
        };
        assert!(reason.contains("CANNOT READ IMAGE"));
    }

    #[test]
    fn test_declared_spacegroup_forced() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixtures::config(dir.path());
        config.preferences.spacegroup = Some(String::from("P41212"));
        let (xds, jobs) = fake_xds(|_, _, _| {
            (String::from(" SPACE_GROUP_NUMBER=  78\n"), CUT.to_vec())
        });
        let outcome = integrator(&config, xds)
            .integrate(&dir.path().join("wedge_1_10"), (1, 10), AttemptKind::Wedge, &CancelToken::new())
            .unwrap();
        assert_eq!(outcome.job.value_of(SPACE_GROUP_KEY), Some("92"));
        assert_eq!(jobs.lock().unwrap().last().map(|s| s.as_str()), Some("CORRECT"));
        assert_eq!(
            outcome.record.summary.get("forced_spacegroup"),
            Some(&SummaryValue::Number(92.0))
        );
    }

    #[test]
    fn test_poor_cutoff_is_checked_again() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixtures::config(dir.path());
        let (xds, jobs) = fake_xds(|_, cut, call| {
            let rows = match (cut, call) {
                (false, _) => vec![(8.0, 5.0), (6.0, 2.0), (5.0, 0.5)],
                (true, 3) => vec![(8.0, 5.0), (6.0, 2.0), (5.5, 0.8)],
                (true, _) => vec![(8.0, 5.0), (6.0, 2.0), (5.58, 1.0)],
            };
            (String::new(), rows)
        });
        let work = dir.path().join("wedge_1_20");
        let outcome = integrator(&config, xds)
            .integrate(&work, (1, 20), AttemptKind::Final, &CancelToken::new())
            .unwrap();
        assert!(!outcome.polished);
        assert_eq!(outcome.cutoff, CutoffResult::Cutoff(5.58));
        assert_eq!(jobs.lock().unwrap().len(), 4);
        assert!(work.join("CORRECT.LP.oldcutoff").exists());
        assert_eq!(outcome.job.resolution_cutoff, Some(5.58));
    }

    #[test]
    fn test_ram_staged_single_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixtures::config(dir.path());
        config.command = crate::config::CommandKind::RamDistributed;
        config.preferences.ram = Some(crate::config::RamStaging {
            nodes: vec![
                RamNode { name: String::from("n1"), first: 1, last: 10 },
                RamNode { name: String::from("n2"), first: 11, last: 20 },
            ],
            cleanup: false,
        });
        let (xds, jobs) = fake_xds(|_, _, _| (String::new(), CUT.to_vec()));
        let work = dir.path().join("wedge_1_20");
        let outcome = integrator(&config, xds)
            .integrate(&work, (1, 20), AttemptKind::Wedge, &CancelToken::new())
            .unwrap();
        assert_eq!(
            *jobs.lock().unwrap(),
            vec!["XYCORR INIT COLSPOT IDXREF DEFPIX INTEGRATE CORRECT"]
        );
        assert_eq!(outcome.job.spot_ranges(), vec![(1, 8), (11, 18)]);
        assert!(work.join("forkc").exists());
        assert!(work.join("forki").exists());
    }
}
