//! Configuration templates and output file naming.

use crate::error::ConfigError;
use chrono::{Local, NaiveDateTime};
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable pointing to the directory holding configuration templates.
pub const CONFIGURATIONS_PATH: &str = "CONFIGURATIONS_PATH";

/// Copy `template` to `output`, replacing on every line each placeholder with its
/// value. Rules are applied in order, so a rule can act on the output of an
/// earlier one.
pub fn substitute_strings<K, V>(
    template: &Path,
    output: &Path,
    rules: &[(K, V)],
) -> Result<(), ConfigError>
where
    K: AsRef<str>,
    V: Display,
{
    let text = fs::read_to_string(template).map_err(|e| ConfigError::io(template, e))?;
    let rendered = substitute_text(&text, rules);
    fs::write(output, rendered).map_err(|e| ConfigError::io(output, e))?;
    log::debug!(
        "wrote {} from template {}",
        output.display(),
        template.display()
    );
    Ok(())
}

pub fn substitute_text<K, V>(text: &str, rules: &[(K, V)]) -> String
where
    K: AsRef<str>,
    V: Display,
{
    let rules: Vec<(&str, String)> = rules
        .iter()
        .map(|(k, v)| (k.as_ref(), v.to_string()))
        .collect();
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let mut line = line.to_string();
        for (placeholder, value) in &rules {
            if !placeholder.is_empty() {
                line = line.replace(placeholder, value);
            }
        }
        out.push_str(&line);
    }
    out
}

/// Directory searched for configuration templates: `$CONFIGURATIONS_PATH`, or
/// `configurations` in the home directory.
pub fn configurations_dir() -> Option<PathBuf> {
    match std::env::var_os(CONFIGURATIONS_PATH) {
        Some(dir) => Some(PathBuf::from(dir)),
        None => dirs_next::home_dir().map(|home| home.join("configurations")),
    }
}

pub fn find_configuration_file(name: &str) -> Option<PathBuf> {
    configurations_dir().and_then(|dir| find_configuration_file_in(&dir, name))
}

pub fn find_configuration_file_in(dir: &Path, name: &str) -> Option<PathBuf> {
    let path = dir.join(name);
    if path.exists() {
        Some(path)
    } else {
        log::debug!("{} not found in {}", name, dir.display());
        None
    }
}

/// `prefix_YYYYMMDD-HHMMSS.ext` in the current directory, with `_k` appended when
/// the name is already taken.
pub fn make_output_filename(prefix: &str, extension: &str) -> PathBuf {
    output_filename_at(Path::new("."), prefix, extension, Local::now().naive_local())
}

pub fn output_filename_at(
    dir: &Path,
    prefix: &str,
    extension: &str,
    now: NaiveDateTime,
) -> PathBuf {
    let mut stem = prefix.to_string();
    if !stem.is_empty() && !stem.ends_with('_') {
        stem.push('_');
    }
    stem.push_str(&now.format("%Y%m%d-%H%M%S").to_string());
    let extension = if extension.starts_with('.') || extension.is_empty() {
        extension.to_string()
    } else {
        format!(".{}", extension)
    };
    let mut candidate = dir.join(format!("{}{}", stem, extension));
    let mut k = 0;
    while candidate.exists() {
        k += 1;
        candidate = dir.join(format!("{}_{}{}", stem, k, extension));
    }
    if dir == Path::new(".") {
        candidate
            .strip_prefix(".")
            .map(Path::to_path_buf)
            .unwrap_or(candidate)
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    #[test]
    fn rules_apply_in_order() {
        let text = "<tend>TEND</tend>\n<a>AI</a>\n";
        let rules = [("TEND", "10".to_string()), ("AI", "3".to_string())];
        assert_eq!(substitute_text(text, &rules), "<tend>10</tend>\n<a>3</a>\n");

        let chained = [("X", "YY"), ("Y", "z")];
        assert_eq!(substitute_text("X", &chained), "zz");
    }

    #[test]
    fn substitutes_files() {
        let dir = tempdir().unwrap();
        let template = dir.path().join("in.xml");
        let output = dir.path().join("out.xml");
        fs::write(&template, "<rate>RATE</rate>").unwrap();
        substitute_strings(&template, &output, &[("RATE", 20000)]).unwrap();
        assert_eq!(fs::read_to_string(&output).unwrap(), "<rate>20000</rate>");
        let missing = substitute_strings(&dir.path().join("nope.xml"), &output, &[("A", 1)]);
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn output_names_do_not_collide() {
        let dir = tempdir().unwrap();
        let now = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_opt(9, 7, 1)
            .unwrap();
        let first = output_filename_at(dir.path(), "cell", "h5", now);
        assert_eq!(first, dir.path().join("cell_20240305-090701.h5"));
        fs::write(&first, b"").unwrap();
        let second = output_filename_at(dir.path(), "cell_", ".h5", now);
        assert_eq!(second, dir.path().join("cell_20240305-090701_1.h5"));
    }

    #[test]
    fn configuration_lookup() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("fclamp_template.xml"), "").unwrap();
        assert!(find_configuration_file_in(dir.path(), "fclamp_template.xml").is_some());
        assert!(find_configuration_file_in(dir.path(), "missing.xml").is_none());
    }
}
