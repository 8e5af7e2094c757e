use fxhash::FxHashMap;

use super::error::SymmetryError;
use super::job_file::{JobContext, ProcessingStage};
use super::xds_log;

/// Chiral space groups by Hermann-Mauguin symbol
const SPACE_GROUPS: [(&str, u32); 65] = [
    ("P1", 1),
    ("P2", 3),
    ("P21", 4),
    ("C2", 5),
    ("P222", 16),
    ("P2221", 17),
    ("P21212", 18),
    ("P212121", 19),
    ("C2221", 20),
    ("C222", 21),
    ("F222", 22),
    ("I222", 23),
    ("I212121", 24),
    ("P4", 75),
    ("P41", 76),
    ("P42", 77),
    ("P43", 78),
    ("I4", 79),
    ("I41", 80),
    ("P422", 89),
    ("P4212", 90),
    ("P4122", 91),
    ("P41212", 92),
    ("P4222", 93),
    ("P42212", 94),
    ("P4322", 95),
    ("P43212", 96),
    ("I422", 97),
    ("I4122", 98),
    ("P3", 143),
    ("P31", 144),
    ("P32", 145),
    ("R3", 146),
    ("P312", 149),
    ("P321", 150),
    ("P3112", 151),
    ("P3121", 152),
    ("P3212", 153),
    ("P3221", 154),
    ("R32", 155),
    ("P6", 168),
    ("P61", 169),
    ("P65", 170),
    ("P62", 171),
    ("P64", 172),
    ("P63", 173),
    ("P622", 177),
    ("P6122", 178),
    ("P6522", 179),
    ("P6222", 180),
    ("P6422", 181),
    ("P6322", 182),
    ("P23", 195),
    ("F23", 196),
    ("I23", 197),
    ("P213", 198),
    ("I213", 199),
    ("P432", 207),
    ("P4232", 208),
    ("F432", 209),
    ("F4132", 210),
    ("I432", 211),
    ("P4332", 212),
    ("P4132", 213),
    ("I4132", 214),
];

/// Lattice class XDS reports in IDXREF.LP for a space group number
pub fn bravais_class(number: u32) -> Option<&'static str> {
    let class = match number {
        1 => "aP",
        3 | 4 => "mP",
        5 => "mC",
        16..=19 => "oP",
        20 | 21 => "oC",
        22 => "oF",
        23 | 24 => "oI",
        75..=78 | 89..=96 => "tP",
        79 | 80 | 97 | 98 => "tI",
        143..=145 | 149..=154 | 168..=182 => "hP",
        146 | 155 => "hR",
        195 | 198 | 207 | 208 | 212 | 213 => "cP",
        196 | 209 | 210 => "cF",
        197 | 199 | 211 | 214 => "cI",
        _ => return None,
    };
    Some(class)
}

/// Result of comparing the declared and determined symmetry
#[derive(Debug, Clone)]
pub enum SymmetryOutcome {
    Consistent(JobContext),
    /// The job now forces the declared group and must rerun from merging
    Forced(JobContext),
}

impl SymmetryOutcome {
    pub fn into_job(self) -> JobContext {
        match self {
            Self::Consistent(job) | Self::Forced(job) => job,
        }
    }
}

/// Forces a user declared space group on a job when XDS picked another one
#[derive(Debug, Clone)]
pub struct SymmetryReconciler {
    table: FxHashMap<&'static str, u32>,
}

impl Default for SymmetryReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl SymmetryReconciler {
    pub fn new() -> Self {
        let mut table = FxHashMap::default();
        for (symbol, number) in SPACE_GROUPS {
            table.insert(symbol, number);
        }
        Self { table }
    }

    /// Space group number of a symbol such as "P41212" or "p 41 21 2"
    pub fn number(&self, symbol: &str) -> Result<u32, SymmetryError> {
        let compact: String = symbol.chars().filter(|c| !c.is_whitespace()).collect();
        let mut chars = compact.chars();
        let normalized = match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => String::new(),
        };
        self.table
            .get(normalized.as_str())
            .copied()
            .ok_or_else(|| SymmetryError::UnknownSpacegroup(symbol.to_string()))
    }

    /// Compare XDS's choice with the declared group.
    ///
    /// No declared group leaves the job alone. On disagreement the cell of the
    /// matching lattice class is taken from IDXREF.LP and the job is rewritten to
    /// merge again in the declared group.
    pub fn reconcile(
        &self,
        determined: u32,
        declared: Option<&str>,
        mut job: JobContext,
        idxref_text: &str,
    ) -> Result<SymmetryOutcome, SymmetryError> {
        let Some(declared) = declared else {
            return Ok(SymmetryOutcome::Consistent(job));
        };
        let number = self.number(declared)?;
        if number == determined {
            log::info!("XDS agrees with the declared space group {declared}");
            return Ok(SymmetryOutcome::Consistent(job));
        }
        let bravais =
            bravais_class(number).ok_or_else(|| SymmetryError::UnknownSpacegroup(declared.to_string()))?;
        let cell = xds_log::indexing_cell(idxref_text, bravais)?;
        log::info!(
            "XDS chose space group {determined}; forcing declared {declared} ({number}, {bravais})"
        );
        job.force_symmetry(number, &cell);
        job.set_stage(ProcessingStage::Merge);
        Ok(SymmetryOutcome::Forced(job))
    }
}
