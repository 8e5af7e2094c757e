//! Layout knowledge of the pointless log and its keyword input.

/// Pointless signs off with the author's name; a crash never gets that far
const SIGNATURE: &str = "P.R.Evans";
const SIGNATURE_WINDOW: usize = 10;

/// Keep the XDS setting; only convert and check the reflections
pub const KEYWORDS: &str = "SETTING C2\n";

/// True when pointless ran to completion
pub fn completed(log_text: &str) -> bool {
    let lines: Vec<&str> = log_text.lines().collect();
    let start = lines.len().saturating_sub(SIGNATURE_WINDOW);
    lines[start..]
        .iter()
        .any(|l| l.trim_start().starts_with(SIGNATURE))
}
