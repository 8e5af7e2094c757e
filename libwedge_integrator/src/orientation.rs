use ndarray::{arr2, Array2};
use std::path::{Path, PathBuf};

use super::constants::{GXPARM, XPARM};
use super::error::OrientationError;

const XPARM_HEADER: &str = "XPARM.XDS";
/// Determinants below this are treated as zero
const SINGULAR_LIMIT: f64 = 1.0e-12;

/// Refined geometry from GXPARM.XDS or XPARM.XDS
#[derive(Debug, Clone)]
pub struct Geometry {
    pub rotation_axis: [f64; 3],
    pub wavelength: f64,
    pub incident_beam: [f64; 3],
    pub space_group: u32,
    pub cell: [f64; 6],
    /// Real space a, b, c axes in the laboratory frame, one per row
    pub axes: Array2<f64>,
}

/// A Mosflm style orientation: A = UB scaled by the wavelength
#[derive(Debug, Clone)]
pub struct OrientationMatrix {
    pub a: Array2<f64>,
    pub u: Array2<f64>,
    pub cell: [f64; 6],
}

impl OrientationMatrix {
    /// Text of a Mosflm matrix file; missets are always zero
    pub fn render(&self) -> String {
        let mut text = String::new();
        for row in self.a.rows() {
            text.push_str(&format!("{:12.8}{:12.8}{:12.8}\n", row[0], row[1], row[2]));
        }
        text.push_str(&format!("{:12.3}{:12.3}{:12.3}\n", 0.0, 0.0, 0.0));
        for row in self.u.rows() {
            text.push_str(&format!("{:12.8}{:12.8}{:12.8}\n", row[0], row[1], row[2]));
        }
        for value in self.cell {
            text.push_str(&format!("{value:12.4}"));
        }
        text.push('\n');
        text.push_str(&format!("{:12.3}{:12.3}{:12.3}\n", 0.0, 0.0, 0.0));
        text
    }
}

/// Read the refined geometry, preferring GXPARM.XDS over XPARM.XDS
pub fn read_geometry(work_dir: &Path) -> Result<Geometry, OrientationError> {
    let path = [GXPARM, XPARM]
        .iter()
        .map(|name| work_dir.join(name))
        .find(|p| p.exists())
        .ok_or_else(|| {
            OrientationError::BadFormat(work_dir.join(XPARM), String::from("no geometry file"))
        })?;
    let text = std::fs::read_to_string(&path)?;
    parse_geometry(&text, &path)
}

/// Parse either layout XDS has used for XPARM files: the current one with a
/// header line, or the older header-less one.
pub fn parse_geometry(text: &str, path: &Path) -> Result<Geometry, OrientationError> {
    let lines: Vec<&str> = text.lines().collect();
    let bad = |what: &str| OrientationError::BadFormat(path.to_path_buf(), what.to_string());

    // rotation line, beam line, symmetry line, first axis line
    let (rotation, beam, symmetry, axes_start) = match lines.first() {
        Some(first) if first.contains(XPARM_HEADER) => (1, 2, 3, 4),
        Some(_) => (0, 1, 7, 8),
        None => return Err(bad("empty file")),
    };

    let numbers = |idx: usize, count: usize| -> Result<Vec<f64>, OrientationError> {
        let line = lines.get(idx).ok_or_else(|| bad("file is truncated"))?;
        let values: Result<Vec<f64>, _> = line.split_whitespace().map(|t| t.parse::<f64>()).collect();
        let values = values.map_err(|_| bad(line.trim()))?;
        if values.len() < count {
            return Err(bad(line.trim()));
        }
        Ok(values)
    };

    let rotation_line = numbers(rotation, 6)?;
    let beam_line = numbers(beam, 4)?;
    let symmetry_line = numbers(symmetry, 7)?;
    let mut axes = Vec::with_capacity(9);
    for idx in axes_start..axes_start + 3 {
        axes.extend_from_slice(&numbers(idx, 3)?[..3]);
    }
    let axes = Array2::from_shape_vec((3, 3), axes).map_err(|e| bad(&e.to_string()))?;

    let mut cell = [0.0; 6];
    cell.copy_from_slice(&symmetry_line[1..7]);
    Ok(Geometry {
        rotation_axis: [rotation_line[3], rotation_line[4], rotation_line[5]],
        wavelength: beam_line[0],
        incident_beam: [beam_line[1], beam_line[2], beam_line[3]],
        space_group: symmetry_line[0] as u32,
        cell,
        axes,
    })
}

/// Orientation matrix in the Mosflm frame: x along the beam, z along the
/// rotation axis.
pub fn reference_matrix(geometry: &Geometry) -> Result<OrientationMatrix, OrientationError> {
    // columns are a*, b*, c*
    let reciprocal = inverse(&geometry.axes)?;

    let z = normalize(geometry.rotation_axis)?;
    let beam = geometry.incident_beam;
    let along = dot(beam, z);
    let x = normalize([
        beam[0] - along * z[0],
        beam[1] - along * z[1],
        beam[2] - along * z[2],
    ])?;
    let y = cross(z, x);
    let frame = arr2(&[x, y, z]);

    let ub = frame.dot(&reciprocal);
    let u = ub.dot(&inverse(&busing_levy(&geometry.cell)?)?);
    Ok(OrientationMatrix {
        a: ub * geometry.wavelength,
        u,
        cell: geometry.cell,
    })
}

/// Read the refined geometry in work_dir and write the Mosflm matrix to dest
pub fn write_reference_matrix(work_dir: &Path, dest: &Path) -> Result<PathBuf, OrientationError> {
    let geometry = read_geometry(work_dir)?;
    let matrix = reference_matrix(&geometry)?;
    std::fs::write(dest, matrix.render())?;
    log::info!("Wrote reference matrix {}", dest.to_string_lossy());
    Ok(dest.to_path_buf())
}

/// B matrix of the cell, reciprocal lengths in 1/A
fn busing_levy(cell: &[f64; 6]) -> Result<Array2<f64>, OrientationError> {
    let [a, b, c, alpha, beta, gamma] = *cell;
    let (ca, cb, cg) = (alpha.to_radians().cos(), beta.to_radians().cos(), gamma.to_radians().cos());
    let (sa, sb, sg) = (alpha.to_radians().sin(), beta.to_radians().sin(), gamma.to_radians().sin());
    let volume_term = 1.0 - ca * ca - cb * cb - cg * cg + 2.0 * ca * cb * cg;
    if volume_term <= 0.0 || a <= 0.0 || b <= 0.0 || c <= 0.0 {
        return Err(OrientationError::Singular);
    }
    let volume = a * b * c * volume_term.sqrt();
    let a_star = b * c * sa / volume;
    let b_star = a * c * sb / volume;
    let c_star = a * b * sg / volume;
    let cos_beta_star = (ca * cg - cb) / (sa * sg);
    let cos_gamma_star = (ca * cb - cg) / (sa * sb);
    let sin_beta_star = (1.0 - cos_beta_star * cos_beta_star).sqrt();
    let sin_gamma_star = (1.0 - cos_gamma_star * cos_gamma_star).sqrt();
    Ok(arr2(&[
        [a_star, b_star * cos_gamma_star, c_star * cos_beta_star],
        [0.0, b_star * sin_gamma_star, -c_star * sin_beta_star * ca],
        [0.0, 0.0, 1.0 / c],
    ]))
}

fn inverse(m: &Array2<f64>) -> Result<Array2<f64>, OrientationError> {
    let cofactor = |r0: usize, r1: usize, c0: usize, c1: usize| {
        m[[r0, c0]] * m[[r1, c1]] - m[[r0, c1]] * m[[r1, c0]]
    };
    let det = m[[0, 0]] * cofactor(1, 2, 1, 2) - m[[0, 1]] * cofactor(1, 2, 0, 2)
        + m[[0, 2]] * cofactor(1, 2, 0, 1);
    if det.abs() < SINGULAR_LIMIT {
        return Err(OrientationError::Singular);
    }
    let adjugate = arr2(&[
        [cofactor(1, 2, 1, 2), -cofactor(0, 2, 1, 2), cofactor(0, 1, 1, 2)],
        [-cofactor(1, 2, 0, 2), cofactor(0, 2, 0, 2), -cofactor(0, 1, 0, 2)],
        [cofactor(1, 2, 0, 1), -cofactor(0, 2, 0, 1), cofactor(0, 1, 0, 1)],
    ]);
    Ok(adjugate / det)
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn normalize(v: [f64; 3]) -> Result<[f64; 3], OrientationError> {
    let norm = dot(v, v).sqrt();
    if norm < SINGULAR_LIMIT {
        return Err(OrientationError::Singular);
    }
    Ok([v[0] / norm, v[1] / norm, v[2] / norm])
}
