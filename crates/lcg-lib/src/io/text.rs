use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

/// Parse newline-delimited floating point series, ignoring blank/comment lines.
pub fn parse_f64_series(text: &str) -> Result<Vec<f64>> {
    let mut out = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let val: f64 = trimmed
            .parse()
            .with_context(|| format!("line {} is not f64: {}", idx + 1, trimmed))?;
        out.push(val);
    }
    if out.is_empty() {
        anyhow::bail!("no numeric samples found");
    }
    Ok(out)
}

/// Read a newline-delimited floating point series from disk.
pub fn read_f64_series(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_f64_series(&text)
}

/// Write one value per line in scientific notation with ten decimals.
pub fn write_f64_series(path: &Path, values: &[f64]) -> Result<()> {
    let mut text = String::with_capacity(values.len() * 18);
    for value in values {
        writeln!(text, "{:.10e}", value)?;
    }
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

/// Read an electrode kernel saved in Ohm.
pub fn read_kernel(path: &Path) -> Result<Vec<f64>> {
    read_f64_series(path).with_context(|| format!("invalid kernel file {}", path.display()))
}

/// Save a kernel given in MOhm as Ohm, the unit the acquisition engine reads.
pub fn write_kernel(path: &Path, kernel_mohm: &[f64]) -> Result<()> {
    let ohm: Vec<f64> = kernel_mohm.iter().map(|k| k * 1e6).collect();
    write_f64_series(path, &ohm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn skips_comments_and_blank_lines() {
        let values = parse_f64_series("# kernel\n1.5\n\n-2e3\n").unwrap();
        assert_eq!(values, vec![1.5, -2000.0]);
        assert!(parse_f64_series("# nothing\n").is_err());
        assert!(parse_f64_series("abc\n").is_err());
    }

    #[test]
    fn kernels_are_stored_in_ohm() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cell_kernel.dat");
        write_kernel(&path, &[2.0, 0.5]).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next().unwrap(), "2.0000000000e6");
        let ohm = read_kernel(&path).unwrap();
        assert_eq!(ohm, vec![2e6, 5e5]);
    }
}
