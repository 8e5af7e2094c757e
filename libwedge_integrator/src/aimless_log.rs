//! Layout knowledge of the aimless log.
//!
//! Aimless prints its loggraph tables behind `$TABLE` markers and a fixed
//! summary block behind "Summary data for". The line offsets below locate the
//! data inside each block for the aimless 0.5 series; a release that changes
//! the layout only needs changes here.

use std::collections::BTreeMap;

use super::error::LogParseError;
use super::results::{Cell, DataTable, GraphDescriptor, SummaryValue};

const LOG: &str = "aimless log";
const TABLE_MARKER: &str = "$TABLE";
const SKIPPED_TABLE: &str = "Anisotropy";
const SUMMARY_MARKER: &str = "Summary data for";
const SUMMARY_END_MARKER: &str = "<!--SUMMARY_END-->";
const SPACE_GROUP_MARKER: &str = "Space group:";
const CELL_MARKER: &str = "Average unit cell:";
const SUGGESTION_MARKER: &str = "from half-dataset correlation";

/// Lines between a table marker and its first data row
const TABLE_OFFSETS: [usize; 9] = [5, 10, 6, 7, 4, 4, 5, 7, 5];

/// Number of rows in a table
#[derive(Debug, Clone, Copy)]
enum RowCount {
    /// One row per image of the integrated range
    Images,
    Fixed(usize),
    /// Read from the last row of the batch difference table
    BatchDifferences,
}

const TABLE_ROWS: [RowCount; 9] = [
    RowCount::Images,
    RowCount::Images,
    RowCount::Fixed(30),
    RowCount::Fixed(30),
    RowCount::Fixed(30),
    RowCount::Fixed(10),
    RowCount::Fixed(30),
    RowCount::Fixed(10),
    RowCount::BatchDifferences,
];

const TABLE_NAMES: [&str; 9] = [
    "Scales v rotation range",
    "Analysis against batch",
    "Correlations v resolution",
    "Analysis against resolution",
    "Rmerge, Rmeas, Rpim v resolution, within and overall",
    "Analysis against intensity",
    "Completeness and multiplicity v resolution",
    "SD analysis",
    "Radiation damage",
];

/// Summary rows relative to the start of the summary block, keyed by statistic
const SUMMARY_ROWS: [(&str, usize); 18] = [
    ("bins_low", 0),
    ("bins_high", 1),
    ("rmerge_anom", 3),
    ("rmerge_norm", 4),
    ("rmeas_anom", 5),
    ("rmeas_norm", 6),
    ("rpim_anom", 7),
    ("rpim_norm", 8),
    ("total_obs", 10),
    ("unique_obs", 11),
    ("isigi", 12),
    ("cc-half", 13),
    ("completeness", 14),
    ("multiplicity", 15),
    ("anom_completeness", 17),
    ("anom_multiplicity", 18),
    ("anom_correlation", 19),
    ("anom_slope", 20),
];
/// Statistics given only for the whole dataset
const OVERALL_ONLY: [&str; 1] = ["anom_slope"];
const RMERGE_TOP_ROW: usize = 9;
const SUMMARY_HEADER_LINES: usize = 3;
const SUMMARY_TEXT_ROW: usize = 22;
const SUMMARY_END_OFFSET: usize = 2;
const BATCH_DIFFERENCE_END_OFFSET: usize = 6;

type GraphSpec = (&'static str, &'static str, &'static [&'static str], usize, &'static [usize], usize);

/// Plots drawn from the aimless tables: title, x label, y labels, x column,
/// y columns, table index
const GRAPHS: [GraphSpec; 21] = [
    ("Mn(k) & 0k (theta=0) v. batch", "image_number", &["Mn(k)", "0k"], 0, &[5, 6], 0),
    ("Relative Bfactor v. batch", "image_number", &["Bfactor"], 0, &[4], 0),
    ("Rmerge v Batch for all runs", "image_number", &["Rmerge", "SmRmerge"], 0, &[5, 12], 1),
    ("Maximum resolution limit, I/sigma > 1.0", "image_number", &["MaxRes", "SmMaxRes"], 0, &[10, 13], 1),
    ("Cumulative multiplicity", "image_number", &["CMlplc"], 0, &[11], 1),
    ("Imean & RMS Scatter", "image_number", &["Mn(I)", "RMSdev"], 0, &[2, 3], 1),
    ("Imean/RMS scatter", "image_number", &["I/rms"], 0, &[4], 1),
    ("Number of rejects", "image_number", &["Nrej"], 0, &[7], 1),
    ("Anom & Imean CCs v resolution", "Dmin (A)", &["CCanom", "CC1/2"], 1, &[3, 6], 2),
    ("RMS correlation ratio", "Dmin (A)", &["RCRanom"], 1, &[5], 2),
    ("I/sigma, Mean Mn(I)/sd(Mn(I))", "Dmin (A)", &["I/RMS", "Mn(I/sd)"], 1, &[12, 13], 3),
    ("Rmerge, Rfull, Rmeas, Rpim v Resolution", "Dmin (A)", &["Rmerge", "Rfull", "Rmeas", "Rpim"], 1, &[3, 4, 6, 7], 3),
    ("Average I, RMSdeviation and Sd", "Dmin (A)", &["AvI", "RMSdev", "sd"], 1, &[9, 10, 11], 3),
    ("Fractional bias", "Dmin (A)", &["FrcBias"], 1, &[14], 3),
    (
        "Rmerge, Rmeas, Rpim v Resolution",
        "Dmin (A)",
        &["Rmerge", "RmergeOv", "Rmeas", "RmeasOv", "Rpim", "RpimOv"],
        1,
        &[3, 4, 7, 8, 9, 10],
        4,
    ),
    ("Rmerge v Intensity", "Imax", &["Rmerge", "Rmeas", "Rpim"], 0, &[1, 3, 4], 5),
    ("Completeness v Resolution", "Dmin (A)", &["%poss", "C%poss", "AnoCmp", "AnoFrc"], 1, &[6, 7, 9, 10], 6),
    ("Multiplicity v Resolution", "Dmin (A)", &["Mlpclct", "AnoMlt"], 1, &[8, 11], 6),
    ("Sigma(scatter/SD), within 5 sd", "<I>", &["SdFc"], 1, &[7], 7),
    ("Sigma(scatter/SD, within 5 SD, all and within", "<I>", &["SdF", "SdFc"], 1, &[4, 7], 7),
    ("Rcp v. batch", "relative frame difference", &["Rcp"], 1, &[11], 8),
];

/// Everything read from one aimless log
#[derive(Debug, Clone)]
pub struct AimlessReport {
    pub tables: Vec<DataTable>,
    pub graphs: Vec<GraphDescriptor>,
    pub summary: BTreeMap<String, SummaryValue>,
    pub space_group: String,
    pub unit_cell: Vec<String>,
    /// Free text of the summary, including the resolution suggestions
    pub text: Vec<String>,
    pub headline: String,
    /// Outer shell high resolution limit of the run
    pub high_resolution: f64,
    /// Aimless's own suggested cutoff from the CC(1/2) analysis
    pub suggested_cutoff: Option<f64>,
}

/// Keyword input for a statistics-only aimless run
pub fn keywords(resolution: Option<f64>) -> String {
    let mut text = String::from(
        "anomalous on\n\
         scales constant\n\
         sdcorrection norefine full 1 0 0 partial 1 0 0\n\
         cycles 0\n",
    );
    if let Some(limit) = resolution {
        text.push_str(&format!("resolution {limit:.2}\n"));
    }
    text
}

pub fn parse(log_text: &str, image_count: usize) -> Result<AimlessReport, LogParseError> {
    let lines: Vec<&str> = log_text.lines().collect();

    let mut table_starts = Vec::new();
    let mut summary_marker = None;
    let mut summary_end = None;
    let mut space_group_line = None;
    let mut cell_line = None;
    for (idx, line) in lines.iter().enumerate() {
        if line.contains(TABLE_MARKER) {
            if !line.contains(SKIPPED_TABLE) {
                table_starts.push(idx);
            }
        } else if line.contains(SUMMARY_MARKER) {
            summary_marker = Some(idx);
        } else if line.contains(SUMMARY_END_MARKER) {
            summary_end = Some(idx);
        } else if line.contains(SPACE_GROUP_MARKER) {
            space_group_line = Some(idx);
        } else if line.contains(CELL_MARKER) {
            cell_line = Some(idx);
        }
    }

    if table_starts.len() < TABLE_OFFSETS.len() {
        return Err(LogParseError::TableCount {
            log: LOG,
            found: table_starts.len(),
            expected: TABLE_OFFSETS.len(),
        });
    }
    let summary_marker = summary_marker.ok_or(LogParseError::MissingMarker {
        log: LOG,
        marker: SUMMARY_MARKER,
    })?;
    let space_group_line = space_group_line.ok_or(LogParseError::MissingMarker {
        log: LOG,
        marker: SPACE_GROUP_MARKER,
    })?;
    let cell_line = cell_line.ok_or(LogParseError::MissingMarker {
        log: LOG,
        marker: CELL_MARKER,
    })?;

    let batch_differences = {
        let idx = summary_marker
            .checked_sub(BATCH_DIFFERENCE_END_OFFSET)
            .ok_or(LogParseError::Truncated { log: LOG, line: 0 })?;
        let token = lines[idx].split_whitespace().next().unwrap_or_default();
        token.parse::<usize>().map_err(|_| LogParseError::BadValue {
            log: LOG,
            value: lines[idx].trim().to_string(),
        })?
    };

    let mut tables = Vec::with_capacity(TABLE_OFFSETS.len());
    for (i, start) in table_starts.iter().take(TABLE_OFFSETS.len()).enumerate() {
        let first = start + TABLE_OFFSETS[i];
        let count = match TABLE_ROWS[i] {
            RowCount::Images => image_count,
            RowCount::Fixed(n) => n,
            RowCount::BatchDifferences => batch_differences,
        };
        let mut rows = Vec::with_capacity(count);
        for line_idx in first..first + count {
            let line = lines
                .get(line_idx)
                .ok_or(LogParseError::Truncated { log: LOG, line: line_idx })?;
            rows.push(line.split_whitespace().map(Cell::parse).collect());
        }
        tables.push(DataTable {
            name: TABLE_NAMES[i].to_string(),
            rows,
        });
    }

    let summary_start = summary_marker + SUMMARY_HEADER_LINES;
    let row = |offset: usize| -> Result<Vec<&str>, LogParseError> {
        let idx = summary_start + offset;
        let line = lines
            .get(idx)
            .ok_or(LogParseError::Truncated { log: LOG, line: idx })?;
        Ok(line.split_whitespace().collect())
    };
    let mut summary = BTreeMap::new();
    for (key, offset) in SUMMARY_ROWS {
        let tokens = row(offset)?;
        if tokens.len() < 3 {
            return Err(LogParseError::Truncated {
                log: LOG,
                line: summary_start + offset,
            });
        }
        let value = if OVERALL_ONLY.contains(&key) {
            SummaryValue::scalar(tokens[tokens.len() - 3])
        } else {
            SummaryValue::shells(&tokens[tokens.len() - 3..])
        };
        summary.insert(key.to_string(), value);
    }
    let top = row(RMERGE_TOP_ROW)?;
    if top.len() >= 3 {
        summary.insert(
            String::from("rmerge_top"),
            SummaryValue::scalar(top[top.len() - 3]),
        );
    }

    let high_resolution = match summary.get("bins_high") {
        Some(SummaryValue::Shells(values)) => values.last().copied(),
        _ => None,
    }
    .ok_or(LogParseError::BadValue {
        log: LOG,
        value: String::from("high resolution limit"),
    })?;

    let space_group = lines[space_group_line]
        .trim()
        .rsplit(": ")
        .next()
        .unwrap_or_default()
        .trim()
        .to_string();
    let unit_cell = lines[cell_line]
        .split_whitespace()
        .skip(3)
        .map(|t| t.to_string())
        .collect();

    let text: Vec<String> = lines
        .get(summary_start + SUMMARY_TEXT_ROW..cell_line)
        .unwrap_or_default()
        .iter()
        .map(|l| l.to_string())
        .collect();
    let headline = summary_end
        .and_then(|idx| idx.checked_sub(SUMMARY_END_OFFSET))
        .and_then(|idx| lines.get(idx))
        .map(|l| l.trim().to_string())
        .unwrap_or_default();

    let suggested_cutoff = text
        .iter()
        .find(|l| l.contains(SUGGESTION_MARKER))
        .and_then(|l| suggested_limit(l));

    Ok(AimlessReport {
        tables,
        graphs: graph_catalogue(),
        summary,
        space_group,
        unit_cell,
        text,
        headline,
        high_resolution,
        suggested_cutoff,
    })
}

/// "from half-dataset correlation CC(1/2) >  0.30: limit =  1.86A" -> 1.86
fn suggested_limit(line: &str) -> Option<f64> {
    let value = line.split('=').nth(1)?.trim();
    let value = value.strip_suffix('A').unwrap_or(value).trim();
    value.parse().ok()
}

pub fn graph_catalogue() -> Vec<GraphDescriptor> {
    GRAPHS
        .iter()
        .map(|(title, x_label, y_labels, x_column, y_columns, table)| GraphDescriptor {
            title: title.to_string(),
            x_label: x_label.to_string(),
            y_labels: y_labels.iter().map(|l| l.to_string()).collect(),
            x_column: *x_column,
            y_columns: y_columns.to_vec(),
            table: *table,
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A synthetic aimless log with the real block layout and `images` batches
    pub fn aimless_log(images: usize, high: f64, suggestion: f64) -> String {
        let mut log = String::from(" ###############################################################\n AIMLESS\n\n");
        let padding = [5, 10, 6, 7, 4, 4, 5, 7, 5];
        let rows = [images, images, 30, 30, 30, 10, 30, 10, 4];
        let mut table_no = 0;
        for (i, pad) in padding.iter().enumerate() {
            log.push_str(&format!(" $TABLE: table {i}:\n"));
            for _ in 1..*pad {
                log.push_str(" $GRAPHS header\n");
            }
            for r in 0..rows[i] {
                log.push_str(&format!(
                    "  {}  {:.3}  0.5  0.6  0.7  0.8  0.9  1.0  1.1  1.2  1.3  1.4  1.5  1.6  1.7\n",
                    r + 1,
                    10.0 / (r as f64 + 1.0)
                ));
            }
            if i == 4 {
                // not counted
                log.push_str(" $TABLE: Anisotropy analysis of CC(1/2)\n");
            }
            log.push_str(" $$\n");
            table_no += 1;
        }
        assert_eq!(table_no, 9);
        // batch difference table end, six lines above the summary marker
        log.push_str("   4  0.02\n $$\n\n\n\n\n");
        log.push_str("<b>Summary data for        Project: p Crystal: c Dataset: d</b>\n\n");
        log.push_str("                                           Overall  InnerShell  OuterShell\n");
        log.push_str(&format!("Low resolution limit                       40.00     40.00      {:.2}\n", high + 0.1));
        log.push_str(&format!("High resolution limit                       {high:.2}      5.00      {high:.2}\n"));
        log.push_str("\n");
        log.push_str("Rmerge  (within I+/I-)                     0.058     0.030     0.400\n");
        log.push_str("Rmerge  (all I+ and I-)                    0.062     0.031     0.420\n");
        log.push_str("Rmeas (within I+/I-)                       0.070     0.040     0.500\n");
        log.push_str("Rmeas (all I+ & I-)                        0.072     0.041     0.510\n");
        log.push_str("Rpim (within I+/I-)                        0.040     0.020     0.300\n");
        log.push_str("Rpim (all I+ & I-)                         0.041     0.021     0.310\n");
        log.push_str("Rmerge in top intensity bin                0.030       -         - \n");
        log.push_str("Total number of observations              100000      5000      9000\n");
        log.push_str("Total number unique                        20000      1000      1800\n");
        log.push_str("Mean((I)/sd(I))                             12.1      40.2       1.9\n");
        log.push_str("Mn(I) half-set correlation CC(1/2)         0.998     0.999     0.612\n");
        log.push_str("Completeness                                99.1      98.0      97.5\n");
        log.push_str("Multiplicity                                 5.0       5.0       4.9\n");
        log.push_str("\n");
        log.push_str("Anomalous completeness                      95.0      97.0      90.0\n");
        log.push_str("Anomalous multiplicity                       2.6       2.7       2.5\n");
        log.push_str("DelAnom correlation between half-sets     -0.010     0.100    -0.020\n");
        log.push_str("Mid-Slope of Anom Normal Probability       1.002       -         - \n");
        log.push_str("\n");
        log.push_str(" Estimates of resolution limits: overall\n");
        log.push_str(&format!("    from half-dataset correlation CC(1/2) >  0.30: limit = {suggestion:5.2}A\n"));
        log.push_str("    from Mn(I/sd) >  2.00:                         limit =  1.95A\n");
        log.push_str("\n");
        log.push_str("Average unit cell:   78.90   78.90   37.10   90.00   90.00   90.00\n");
        log.push_str("Space group: P 43 21 2\n");
        log.push_str(" Overall InnerShell OuterShell headline\n\n");
        log.push_str("<!--SUMMARY_END--></FONT></B>\n");
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_layout() {
        let log = fixtures::aimless_log(12, 1.80, 1.72);
        let report = parse(&log, 12).unwrap();
        assert_eq!(report.tables.len(), 9);
        assert_eq!(report.tables[0].rows.len(), 12);
        assert_eq!(report.tables[2].rows.len(), 30);
        assert_eq!(report.tables[8].rows.len(), 4);
        assert_eq!(report.tables[0].rows[0][0], Cell::Number(1.0));
        assert_eq!(report.high_resolution, 1.80);
        assert_eq!(report.suggested_cutoff, Some(1.72));
        assert_eq!(report.space_group, "P 43 21 2");
        assert_eq!(report.unit_cell.len(), 6);
        assert_eq!(
            report.summary.get("completeness"),
            Some(&SummaryValue::Shells(vec![99.1, 98.0, 97.5]))
        );
        assert_eq!(
            report.summary.get("anom_slope"),
            Some(&SummaryValue::Number(1.002))
        );
        assert_eq!(report.headline, "Overall InnerShell OuterShell headline");
        assert_eq!(report.graphs.len(), 21);
    }

    #[test]
    fn test_too_few_tables() {
        let log = " $TABLE: one\n $TABLE: two\n";
        assert!(matches!(
            parse(log, 10),
            Err(LogParseError::TableCount { found: 2, .. })
        ));
    }

    #[test]
    fn test_keywords() {
        assert!(!keywords(None).contains("resolution"));
        assert!(keywords(Some(1.856)).ends_with("cycles 0\nresolution 1.86\n"));
    }

    #[test]
    fn test_suggested_limit() {
        assert_eq!(
            suggested_limit("  from half-dataset correlation CC(1/2) >  0.30: limit =  1.86A"),
            Some(1.86)
        );
        assert_eq!(suggested_limit("no limit here"), None);
    }
}
