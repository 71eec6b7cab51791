//! Natural ordering for uploaded filenames.
//!
//! Numbers are pulled from the start of the name, right before the extension,
//! or at the very end, in that order. Names carrying a number sort before
//! names without one; the rest fall back to plain string order.

use once_cell::sync::Lazy;
use regex::Regex;
use std::cmp::Ordering;
use std::path::Path;

static PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)(.*)$").expect("valid prefix regex"));
static EXTENSION_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.*?)(\d+)(\.[^.]+)$").expect("valid extension suffix regex"));
static SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(.*?)(\d+)$").expect("valid suffix regex"));

fn extract_number(name: &str) -> Option<(u64, String)> {
    // A digit run too long for u64 skips to the next pattern.
    if let Some(caps) = PREFIX.captures(name) {
        if let Ok(number) = caps[1].parse() {
            return Some((number, caps[2].to_string()));
        }
    }

    if let Some(caps) = EXTENSION_SUFFIX.captures(name) {
        if let Ok(number) = caps[2].parse() {
            return Some((number, format!("{}{}", &caps[1], &caps[3])));
        }
    }

    if let Some(caps) = SUFFIX.captures(name) {
        if let Ok(number) = caps[2].parse() {
            return Some((number, caps[1].to_string()));
        }
    }

    None
}

fn base_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

/// Compare two paths by their base names, `a2.pdf` before `a10.pdf`.
///
/// Total: names with the same number and remainder (`a1.pdf`, `a01.pdf`) fall
/// back to plain string order.
pub fn alphanumeric_cmp(a: &str, b: &str) -> Ordering {
    match (extract_number(base_name(a)), extract_number(base_name(b))) {
        (Some((num_a, rest_a)), Some((num_b, rest_b))) => num_a
            .cmp(&num_b)
            .then_with(|| rest_a.cmp(&rest_b))
            .then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted(mut names: Vec<&str>) -> Vec<&str> {
        names.sort_by(|a, b| alphanumeric_cmp(a, b));
        names
    }

    #[test]
    fn numbers_before_extension() {
        assert_eq!(
            sorted(vec!["a2.pdf", "a10.pdf", "a1.pdf"]),
            vec!["a1.pdf", "a2.pdf", "a10.pdf"]
        );
    }

    #[test]
    fn leading_numbers() {
        assert_eq!(
            sorted(vec!["10_intro.pdf", "2_body.pdf", "1_cover.pdf"]),
            vec!["1_cover.pdf", "2_body.pdf", "10_intro.pdf"]
        );
    }

    #[test]
    fn numbered_names_first() {
        assert_eq!(
            sorted(vec!["zeta.pdf", "alpha.pdf", "page3"]),
            vec!["page3", "alpha.pdf", "zeta.pdf"]
        );
    }

    #[test]
    fn compares_base_names_only() {
        assert_eq!(
            sorted(vec!["/tmp/x9/doc10.pdf", "/tmp/x10/doc9.pdf"]),
            vec!["/tmp/x10/doc9.pdf", "/tmp/x9/doc10.pdf"]
        );
    }

    #[test]
    fn equal_numbers_use_the_rest() {
        assert_eq!(
            sorted(vec!["b1.pdf", "a1.pdf"]),
            vec!["a1.pdf", "b1.pdf"]
        );
    }

    #[test]
    fn zero_padded_ties_use_the_full_name() {
        assert_eq!(
            sorted(vec!["a1.pdf", "a001.pdf", "a01.pdf"]),
            vec!["a001.pdf", "a01.pdf", "a1.pdf"]
        );
        assert_eq!(
            sorted(vec!["a01.pdf", "a1.pdf", "a001.pdf"]),
            vec!["a001.pdf", "a01.pdf", "a1.pdf"]
        );
    }

    #[test]
    fn oversized_prefix_falls_through_to_suffix() {
        let huge = "99999999999999999999999_part2.pdf";
        assert_eq!(
            extract_number(huge),
            Some((2, "99999999999999999999999_part.pdf".to_string()))
        );
        assert_eq!(sorted(vec!["other.pdf", huge]), vec![huge, "other.pdf"]);
    }
}
