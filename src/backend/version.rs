//! Version string extraction and ordering

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

/// `<base>-<version>` folder suffix, e.g. `koboldcpp-linux-x64-1.98.1`
static FOLDER_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)-v?(\d+(?:\.\d+)+[a-z0-9]*)$").expect("valid folder version regex"));

/// Trailing version token of a `--version` output line
static OUTPUT_VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|\s)v?(\d+\.\d+(?:\.\d+)*(?:[-+][0-9A-Za-z.]+)?)\s*$").expect("valid output version regex")
});

/// Version encoded in a backend folder name, if any
pub fn version_from_folder_name(folder_name: &str) -> Option<String> {
    FOLDER_VERSION_RE
        .captures(folder_name)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Version reported by `<launcher> --version`.
///
/// Only the last non-blank line counts; earlier lines are banner noise.
pub fn version_from_output(output: &str) -> Option<String> {
    let last = output.lines().rev().map(str::trim).find(|l| !l.is_empty())?;

    OUTPUT_VERSION_RE
        .captures(last)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Compare two version strings component-wise (numeric where possible)
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches(['v', 'V'])
            .split(|c: char| !c.is_ascii_digit())
            .filter(|s| !s.is_empty())
            .filter_map(|s| s.parse().ok())
            .collect()
    };

    let (pa, pb) = (parse(a), parse(b));
    let len = pa.len().max(pb.len());

    for i in 0..len {
        let x = pa.get(i).copied().unwrap_or(0);
        let y = pb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    a.cmp(b)
}
