//! Layout knowledge of XDSSTAT.LP.

use super::results::{Cell, DataTable, GraphDescriptor};

const DIFFERENCE_MARKER: &str = "DIFFERENCE";
const DIFFERENCE_COLUMNS: [usize; 4] = [0, 2, 4, 6];

/// XDSSTAT reads the reflection file name from stdin
pub const INPUT: &str = "XDS_ASCII.HKL\n";

/// The Rd table (R-factor against frame difference), or None if XDSSTAT
/// printed no usable rows
pub fn rd_table(log_text: &str) -> Option<DataTable> {
    let mut rows = Vec::new();
    for line in log_text.lines().filter(|l| l.contains(DIFFERENCE_MARKER)) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        // header lines also mention the marker
        let numeric = tokens
            .first()
            .is_some_and(|t| t.parse::<f64>().is_ok());
        if !numeric || tokens.len() <= DIFFERENCE_COLUMNS[3] {
            continue;
        }
        rows.push(
            DIFFERENCE_COLUMNS
                .iter()
                .map(|c| Cell::parse(tokens[*c]))
                .collect(),
        );
    }
    if rows.is_empty() {
        return None;
    }
    Some(DataTable {
        name: String::from("Rd v frame difference"),
        rows,
    })
}

/// Graph over the Rd table placed at `table`
pub fn rd_graph(table: usize) -> GraphDescriptor {
    GraphDescriptor {
        title: String::from("Rd vs frame_difference"),
        x_label: String::from("Frame Difference"),
        y_labels: vec![
            String::from("Rd"),
            String::from("Rd_notfriedel"),
            String::from("Rd_friedel"),
        ],
        x_column: 0,
        y_columns: vec![1, 2, 3],
        table,
    }
}
