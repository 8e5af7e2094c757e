use std::path::PathBuf;

use super::constants::{
    DEFAULT_BEAM_DIVERGENCE, DEFAULT_REFLECTING_RANGE, SPOT_RANGE_DEGREES, XDS_LOG,
};
use super::job_file::{DirectivePatch, JobContext, ProcessingStage, SPOT_RANGE_KEY};
use super::xds_log;

/// Known XDS failures that have a remedy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSignature {
    TwoDimensionalLattice,
    InaccurateSolution,
    SpotSizeFailed,
}

impl ErrorSignature {
    /// Match an error line against the known signatures, in table order
    pub fn identify(line: &str) -> Option<Self> {
        if line.contains(xds_log::TWO_DIMENSIONAL_LATTICE) {
            Some(Self::TwoDimensionalLattice)
        } else if line.contains(xds_log::INACCURATE_SOLUTION)
            || line.contains(xds_log::INSUFFICIENT_INDEXED)
        {
            Some(Self::InaccurateSolution)
        } else if line.contains(xds_log::SPOT_SIZE_FAILED) {
            Some(Self::SpotSizeFailed)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub enum ErrorVerdict {
    /// No error marker: the job stands as it is
    Continue(JobContext),
    /// The job was amended and must be run again
    Retry(JobContext),
    HardFailure(String),
}

/// Inspect a fresh XDS.LOG and decide what happens to the job.
///
/// Only the first error line is considered. A signature is remedied at most once
/// per processing stage; seeing it again without the stage having moved on is a
/// hard failure.
pub fn classify(log_text: &str, mut job: JobContext) -> ErrorVerdict {
    let Some(line) = xds_log::error_lines(log_text).next() else {
        return ErrorVerdict::Continue(job);
    };
    let line = line.trim();

    let Some(signature) = ErrorSignature::identify(line) else {
        log::error!("Unrecognized XDS error: {line}");
        return ErrorVerdict::HardFailure(line.to_string());
    };

    if job.was_remediated(signature) {
        log::error!("{signature:?} persisted after remediation at {:?}", job.stage);
        return ErrorVerdict::HardFailure(format!(
            "{line} (persisted after remediation)"
        ));
    }

    let stage = job.stage;
    match signature {
        ErrorSignature::TwoDimensionalLattice => {
            let Some(widened) = widen_spot_range(&job) else {
                log::error!("Indexing failed with the full data range already in use");
                return ErrorVerdict::HardFailure(format!(
                    "{line} (spot range already covers the data range)"
                ));
            };
            log::info!("Indexing failed in 2D, widening spot range to {widened}");
            job.apply(&DirectivePatch::set(SPOT_RANGE_KEY, &widened));
        }
        ErrorSignature::InaccurateSolution => {
            if stage.is_past_indexing() {
                log::error!("Indexing solution inaccurate even without IDXREF");
                return ErrorVerdict::HardFailure(line.to_string());
            }
            log::info!("Inaccurate indexing solution, continuing from DEFPIX");
            job.set_stage(ProcessingStage::DefpixIntegrate);
        }
        ErrorSignature::SpotSizeFailed => {
            log::info!("Spot size determination failed, using default profile parameters");
            job.mutate(&[
                DirectivePatch::Append(String::new()),
                DirectivePatch::Append(DEFAULT_REFLECTING_RANGE.to_string()),
                DirectivePatch::Append(DEFAULT_BEAM_DIVERGENCE.to_string()),
            ]);
        }
    }
    job.record_remediation(signature, stage);
    ErrorVerdict::Retry(job)
}

/// The last spot range extended by five degrees of images, or None when it
/// already reaches the end of the data range
fn widen_spot_range(job: &JobContext) -> Option<String> {
    let (first, last) = *job.spot_ranges().last()?;
    let end = job.data_range.1;
    if last >= end {
        return None;
    }
    let osc = job
        .value_of("OSCILLATION_RANGE")
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| *v > 0.0);
    let step = match osc {
        Some(osc) => ((SPOT_RANGE_DEGREES / osc).ceil() as u32).max(1),
        None => 1,
    };
    Some(format!("{} {}", first, (last + step).min(end)))
}

/// Move XDS.LOG aside before a rerun so logs of different runs never mix
pub fn archive_log(job: &JobContext) -> Result<Option<PathBuf>, std::io::Error> {
    let log_path = job.work_dir.join(XDS_LOG);
    if !log_path.exists() {
        return Ok(None);
    }
    let archived = job
        .work_dir
        .join(format!("{}.retry{}", XDS_LOG, job.runs()));
    std::fs::rename(&log_path, &archived)?;
    Ok(Some(archived))
}
