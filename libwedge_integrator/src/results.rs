use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use super::aimless_log::{self, AimlessReport};
use super::constants::{
    AIMLESS_RERUN_MARGIN, CORRECT_LP, INTEGRATE_LP, RESULTS_FILE, XDSSTAT_LP,
};
use super::error::ResultsError;
use super::pointless_log;
use super::tool::{read_log, CancelToken, Invocation, ToolInvoker};
use super::xds_log;
use super::xdsstat_log;

pub const AIMLESS_MTZ: &str = "aimless_mtz";
pub const AIMLESS_LOG: &str = "aimless_log";
pub const AIMLESS_COM: &str = "aimless_com";
pub const POINTLESS_MTZ: &str = "pointless_mtz";
pub const POINTLESS_LOG: &str = "pointless_log";
pub const XDSSTAT_LOG: &str = "xdsstat_log";

/// A table cell: numeric where the log printed a number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn parse(token: &str) -> Self {
        match token.parse::<f64>() {
            Ok(v) => Self::Number(v),
            Err(_) => Self::Text(token.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataTable {
    pub name: String,
    pub rows: Vec<Vec<Cell>>,
}

/// A plot over one of the record's tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescriptor {
    pub title: String,
    pub x_label: String,
    pub y_labels: Vec<String>,
    pub x_column: usize,
    pub y_columns: Vec<usize>,
    /// Index into ResultRecord::tables
    pub table: usize,
}

/// A summary statistic: one number, or overall/inner/outer shell values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SummaryValue {
    Number(f64),
    Shells(Vec<f64>),
    Text(String),
}

impl SummaryValue {
    pub fn scalar(token: &str) -> Self {
        match token.parse::<f64>() {
            Ok(v) => Self::Number(v),
            Err(_) => Self::Text(token.to_string()),
        }
    }

    pub fn shells(tokens: &[&str]) -> Self {
        let values: Result<Vec<f64>, _> = tokens.iter().map(|t| t.parse::<f64>()).collect();
        match values {
            Ok(values) => Self::Shells(values),
            Err(_) => Self::Text(tokens.join(" ")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Working,
    Success,
    Failed,
}

/// A produced file and the name the reporting layer knows it by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub path: PathBuf,
}

/// Everything the reporting layer gets for one wedge or one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Image range as "first-last"
    pub wedge: String,
    pub graphs: Vec<GraphDescriptor>,
    pub tables: Vec<DataTable>,
    pub summary: BTreeMap<String, SummaryValue>,
    /// Free text of the scaling summary
    pub text: Vec<String>,
    pub headline: String,
    pub files: Vec<Artifact>,
    pub timestamp: String,
}

impl ResultRecord {
    pub fn working(data_range: (u32, u32)) -> Self {
        Self {
            status: ResultStatus::Working,
            reason: None,
            wedge: format!("{}-{}", data_range.0, data_range.1),
            graphs: Vec::new(),
            tables: Vec::new(),
            summary: BTreeMap::new(),
            text: Vec::new(),
            headline: String::new(),
            files: Vec::new(),
            timestamp: now(),
        }
    }

    pub fn failed(data_range: (u32, u32), reason: &str) -> Self {
        let mut record = Self::working(data_range);
        record.status = ResultStatus::Failed;
        record.reason = Some(reason.to_string());
        record
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    pub fn mark_success(&mut self) {
        self.status = ResultStatus::Success;
        self.timestamp = now();
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.status = ResultStatus::Failed;
        self.reason = Some(reason.to_string());
        self.timestamp = now();
    }

    pub fn add_file(&mut self, name: &str, path: &Path) {
        self.files.retain(|a| a.name != name);
        self.files.push(Artifact {
            name: name.to_string(),
            path: path.to_path_buf(),
        });
    }

    pub fn artifact(&self, name: &str) -> Option<&Path> {
        self.files
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.path.as_path())
    }

    /// Write the record as results.yml in the given directory
    pub fn write(&self, dir: &Path) -> Result<PathBuf, ResultsError> {
        let path = dir.join(RESULTS_FILE);
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&path, yaml)?;
        log::info!("Wrote {} record to {}", self.wedge, path.to_string_lossy());
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self, ResultsError> {
        let yaml = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&yaml)?)
    }
}

fn now() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

/// Runs the statistics and scaling programs over a finished XDS job and
/// collects their output into a ResultRecord.
#[derive(Clone)]
pub struct ResultsAssembler {
    invoker: Arc<dyn ToolInvoker>,
    /// File name prefix, "<image prefix>_<run>"
    name: String,
}

impl ResultsAssembler {
    pub fn new(invoker: Arc<dyn ToolInvoker>, name: &str) -> Self {
        Self {
            invoker,
            name: name.to_string(),
        }
    }

    /// Build the record for the reflections XDS wrote in work_dir.
    ///
    /// The record stays Working; only the caller knows when the attempt is
    /// complete. A pointless run without its sign-off gives a Failed record and
    /// nothing else is run.
    pub fn assemble(
        &self,
        reflection_file: &Path,
        work_dir: &Path,
        data_range: (u32, u32),
        cancel: &CancelToken,
    ) -> Result<ResultRecord, ResultsError> {
        match self.collect(reflection_file, work_dir, data_range, cancel) {
            Ok(record) => Ok(record),
            Err(ResultsError::MergeVerificationFailure(log_path)) => {
                log::error!(
                    "Pointless failed for {}-{}; see {}",
                    data_range.0,
                    data_range.1,
                    log_path.to_string_lossy()
                );
                let mut record = ResultRecord::failed(data_range, "pointless did not complete");
                record.add_file(POINTLESS_LOG, &log_path);
                record.write(work_dir)?;
                Ok(record)
            }
            Err(e) => Err(e),
        }
    }

    fn collect(
        &self,
        reflection_file: &Path,
        work_dir: &Path,
        data_range: (u32, u32),
        cancel: &CancelToken,
    ) -> Result<ResultRecord, ResultsError> {
        let mut record = ResultRecord::working(data_range);
        let image_count = (data_range.1 - data_range.0 + 1) as usize;

        let rd_table = self.run_xdsstat(work_dir, &mut record, cancel)?;
        let mergeable = self.run_pointless(reflection_file, work_dir, &mut record, cancel)?;

        let first = self.run_aimless(&mergeable, work_dir, None, &mut record, cancel)?;
        let mut report = aimless_log::parse(&first, image_count)?;
        let original_text = report.text.clone();
        if let Some(suggested) = report.suggested_cutoff {
            if suggested > report.high_resolution + AIMLESS_RERUN_MARGIN {
                log::info!(
                    "Aimless suggests {suggested:.2} A over {:.2} A, scaling again",
                    report.high_resolution
                );
                let rerun =
                    self.run_aimless(&mergeable, work_dir, Some(suggested), &mut record, cancel)?;
                report = aimless_log::parse(&rerun, image_count)?;
                report.text = original_text;
            }
        }
        self.fill_from_aimless(&mut record, report);

        if let Some(table) = rd_table {
            record.graphs.push(xdsstat_log::rd_graph(record.tables.len()));
            record.tables.push(table);
        }

        match xds_log::mosaicity(&read_log(&work_dir.join(INTEGRATE_LP))?) {
            Ok(value) => {
                record
                    .summary
                    .insert(String::from("mosaicity"), SummaryValue::Number(value));
            }
            Err(e) => log::warn!("No mosaicity for {}: {e}", record.wedge),
        }
        match xds_log::isa(&read_log(&work_dir.join(CORRECT_LP))?) {
            Ok(value) => {
                record
                    .summary
                    .insert(String::from("ISa"), SummaryValue::Number(value));
            }
            Err(e) => log::warn!("No ISa for {}: {e}", record.wedge),
        }

        record.write(work_dir)?;
        Ok(record)
    }

    fn run_xdsstat(
        &self,
        work_dir: &Path,
        record: &mut ResultRecord,
        cancel: &CancelToken,
    ) -> Result<Option<DataTable>, ResultsError> {
        let invocation = Invocation::new("xdsstat", work_dir, XDSSTAT_LP).stdin(xdsstat_log::INPUT);
        let outcome = self.invoker.run(&invocation, cancel)?;
        record.add_file(XDSSTAT_LOG, &outcome.log_path);
        let table = xdsstat_log::rd_table(&outcome.log_text);
        if table.is_none() {
            log::warn!("XDSSTAT produced no Rd table in {}", work_dir.to_string_lossy());
        }
        Ok(table)
    }

    fn run_pointless(
        &self,
        reflection_file: &Path,
        work_dir: &Path,
        record: &mut ResultRecord,
        cancel: &CancelToken,
    ) -> Result<PathBuf, ResultsError> {
        let mtz = format!("{}_pointless.mtz", self.name);
        let invocation = Invocation::new(
            "pointless",
            work_dir,
            &format!("{}_pointless.log", self.name),
        )
        .args(&["xdsin", &reflection_file.to_string_lossy(), "hklout", &mtz])
        .stdin(pointless_log::KEYWORDS);
        let outcome = self.invoker.run(&invocation, cancel)?;
        if !pointless_log::completed(&outcome.log_text) {
            return Err(ResultsError::MergeVerificationFailure(outcome.log_path));
        }
        let mtz_path = work_dir.join(&mtz);
        record.add_file(POINTLESS_LOG, &outcome.log_path);
        record.add_file(POINTLESS_MTZ, &mtz_path);
        Ok(mtz_path)
    }

    /// Scale without refinement; returns the log text
    fn run_aimless(
        &self,
        hklin: &Path,
        work_dir: &Path,
        resolution: Option<f64>,
        record: &mut ResultRecord,
        cancel: &CancelToken,
    ) -> Result<String, ResultsError> {
        let mtz = format!("{}_aimless.mtz", self.name);
        let keywords = aimless_log::keywords(resolution);
        let invocation = Invocation::new("aimless", work_dir, &format!("{}_aimless.log", self.name))
            .args(&["hklin", &hklin.to_string_lossy(), "hklout", &mtz])
            .stdin(&keywords);

        let com_path = work_dir.join(format!("{}_aimless.com", self.name));
        std::fs::write(
            &com_path,
            format!("{} << eof\n{keywords}eof\n", invocation.command_line()),
        )?;

        let outcome = self.invoker.run(&invocation, cancel)?;
        record.add_file(AIMLESS_LOG, &outcome.log_path);
        record.add_file(AIMLESS_COM, &com_path);
        record.add_file(AIMLESS_MTZ, &work_dir.join(&mtz));
        Ok(outcome.log_text)
    }

    fn fill_from_aimless(&self, record: &mut ResultRecord, report: AimlessReport) {
        record.tables = report.tables;
        record.graphs = report.graphs;
        record.summary.extend(report.summary);
        record.summary.insert(
            String::from("scaling_spacegroup"),
            SummaryValue::Text(report.space_group),
        );
        record.summary.insert(
            String::from("scaling_unit_cell"),
            SummaryValue::Text(report.unit_cell.join(" ")),
        );
        if let Some(suggested) = report.suggested_cutoff {
            record
                .summary
                .insert(String::from("suggested_cutoff"), SummaryValue::Number(suggested));
        }
        record.text = report.text;
        record.headline = report.headline;
    }
}
