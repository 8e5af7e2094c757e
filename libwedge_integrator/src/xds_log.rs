//! Layout knowledge of the XDS logs (XDS.LOG, IDXREF.LP, INTEGRATE.LP, CORRECT.LP).
//!
//! Every marker string and fixed offset used to read XDS output lives here, so a
//! new XDS release that moves things around only needs changes in this module.

use super::error::LogParseError;

pub const ERROR_MARKER: &str = "! ERROR !";
pub const TWO_DIMENSIONAL_LATTICE: &str = "CANNOT CONTINUE WITH A TWO DIMENSION";
pub const INACCURATE_SOLUTION: &str = "SOLUTION IS INACCURATE";
pub const INSUFFICIENT_INDEXED: &str = "INSUFFICIENT PERCENTAGE";
pub const SPOT_SIZE_FAILED: &str = "SPOT SIZE PARAMETERS HAS FAILED";

const SPACE_GROUP_MARKER: &str = "SPACE_GROUP_NUMBER=";
const MOSAICITY_MARKER: &str = "SUGGESTED VALUES FOR INPUT PARAMETERS";
const MOSAICITY_OFFSET: usize = 2;
const ISA_MARKER: &str = "ISa";
const TABLE_TOTAL: &str = "total";
const SIGNAL_TO_NOISE_COLUMN: usize = 8;

/// Lines of XDS.LOG carrying the error marker, in order
pub fn error_lines(log_text: &str) -> impl Iterator<Item = &str> {
    log_text.lines().filter(|l| l.contains(ERROR_MARKER))
}

/// Space group number XDS settled on; the last report in the log wins
pub fn space_group_number(log_text: &str) -> Result<u32, LogParseError> {
    let line = log_text
        .lines()
        .rev()
        .find(|l| l.contains(SPACE_GROUP_MARKER))
        .ok_or(LogParseError::MissingMarker {
            log: "XDS.LOG",
            marker: SPACE_GROUP_MARKER,
        })?;
    let value = line
        .rsplit('=')
        .next()
        .map(|v| v.trim())
        .unwrap_or_default();
    let token = value.split_whitespace().next().unwrap_or_default();
    token.parse::<u32>().map_err(|_| LogParseError::BadValue {
        log: "XDS.LOG",
        value: value.to_string(),
    })
}

/// Unit cell of the indexing solution chosen for a lattice class.
///
/// IDXREF.LP lists one row per lattice character; the rows XDS considers
/// acceptable are flagged with '*'. The cell is the six values after the
/// quality of fit column.
pub fn indexing_cell(idxref_text: &str, bravais: &str) -> Result<[f64; 6], LogParseError> {
    let line = idxref_text
        .lines()
        .find(|l| l.contains('*') && l.split_whitespace().any(|t| t == bravais))
        .ok_or(LogParseError::MissingMarker {
            log: "IDXREF.LP",
            marker: "lattice character",
        })?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 10 {
        return Err(LogParseError::BadValue {
            log: "IDXREF.LP",
            value: line.trim().to_string(),
        });
    }
    let mut cell = [0.0; 6];
    for (slot, token) in cell.iter_mut().zip(&tokens[4..10]) {
        *slot = token.parse().map_err(|_| LogParseError::BadValue {
            log: "IDXREF.LP",
            value: token.to_string(),
        })?;
    }
    Ok(cell)
}

/// Average mosaicity suggested by INTEGRATE
pub fn mosaicity(integrate_text: &str) -> Result<f64, LogParseError> {
    let lines: Vec<&str> = integrate_text.lines().collect();
    let idx = lines
        .iter()
        .rposition(|l| l.contains(MOSAICITY_MARKER))
        .ok_or(LogParseError::MissingMarker {
            log: "INTEGRATE.LP",
            marker: MOSAICITY_MARKER,
        })?;
    let line = lines
        .get(idx + MOSAICITY_OFFSET)
        .ok_or(LogParseError::Truncated {
            log: "INTEGRATE.LP",
            line: idx + MOSAICITY_OFFSET,
        })?;
    last_number(line, "INTEGRATE.LP")
}

/// Asymptotic I/sigma reported by CORRECT
pub fn isa(correct_text: &str) -> Result<f64, LogParseError> {
    let lines: Vec<&str> = correct_text.lines().collect();
    let idx = lines
        .iter()
        .position(|l| l.trim_end().ends_with(ISA_MARKER))
        .ok_or(LogParseError::MissingMarker {
            log: "CORRECT.LP",
            marker: ISA_MARKER,
        })?;
    let line = lines.get(idx + 1).ok_or(LogParseError::Truncated {
        log: "CORRECT.LP",
        line: idx + 1,
    })?;
    last_number(line, "CORRECT.LP")
}

fn last_number(line: &str, log: &'static str) -> Result<f64, LogParseError> {
    let token = line.split_whitespace().last().unwrap_or_default();
    token.parse().map_err(|_| LogParseError::BadValue {
        log,
        value: line.trim().to_string(),
    })
}

/// One resolution shell of CORRECT's completeness/quality table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShellRow {
    pub resolution: f64,
    /// None when the column could not be read
    pub signal_to_noise: Option<f64>,
}

/// Rows of the last resolution-shell table in CORRECT.LP, highest resolution
/// shell first.
///
/// CORRECT writes the table several times as refinement proceeds; only the last
/// copy, found by reading upward from the final "total" row, is authoritative.
/// Returns None when the log holds no such table.
pub fn final_shell_table(correct_text: &str) -> Option<Vec<ShellRow>> {
    let lines: Vec<&str> = correct_text.lines().collect();
    let total_idx = lines
        .iter()
        .rposition(|l| l.trim_start().starts_with(TABLE_TOTAL))?;
    let mut rows = Vec::new();
    for line in lines[..total_idx].iter().rev() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(first) = tokens.first() else {
            break;
        };
        if !first.starts_with(|c: char| c.is_ascii_digit()) {
            break;
        }
        let Ok(resolution) = first.parse::<f64>() else {
            break;
        };
        let signal_to_noise = tokens
            .get(SIGNAL_TO_NOISE_COLUMN)
            .and_then(|t| t.parse::<f64>().ok());
        rows.push(ShellRow {
            resolution,
            signal_to_noise,
        });
    }
    Some(rows)
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A CORRECT.LP fragment with an early table and a final one
    pub fn correct_lp(rows: &[(f64, f64)]) -> String {
        let mut text = String::from(
            " SUBSET OF INTENSITY DATA WITH SIGNAL/NOISE >= -3.0 AS FUNCTION OF RESOLUTION\n\
             \x20RESOLUTION     NUMBER OF REFLECTIONS    COMPLETENESS R-FACTOR  R-FACTOR COMPARED I/SIGMA   R-meas  CC(1/2)  Anomal  SigAno   Nano\n\
             \x20  LIMIT     OBSERVED  UNIQUE  POSSIBLE     OF DATA   observed  expected                                      Corr\n\
             \n\
             \x20    4.00        9916    1468      1475       99.5%       3.1%      3.4%     9916   99.00      3.4%    99.9*    -8    0.617     510\n\
             \x20   total        9916    1468      1475       99.5%       3.1%      3.4%     9916   99.00      3.4%    99.9*    -8    0.617     510\n\
             \n\
             \x20RESOLUTION     NUMBER OF REFLECTIONS    COMPLETENESS R-FACTOR  R-FACTOR COMPARED I/SIGMA   R-meas  CC(1/2)  Anomal  SigAno   Nano\n\
             \x20  LIMIT     OBSERVED  UNIQUE  POSSIBLE     OF DATA   observed  expected                                      Corr\n\
             \n",
        );
        for (res, isigi) in rows {
            text.push_str(&format!(
                "     {res:.2}        9916    1468      1475       99.5%       3.1%      3.4%     9916   {isigi:.2}      3.4%    99.9*    -8    0.617     510\n"
            ));
        }
        text.push_str(
            "    total       99160   14680     14750       99.5%       6.1%      6.4%    99160   12.00      6.6%    99.9*    -2    0.700    5100\n\n\
             \x20    a        b          ISa\n\
             \x201.075E+00  3.031E-04   29.10\n",
        );
        text
    }
}
