//! Typed binding of multipart form values and files.
//!
//! A [`FormData`] borrows the values and files of one request context. Every
//! binding call returns its value directly and records problems in a shared
//! error list instead of stopping, so a single [`FormData::validate`] call can
//! report every invalid field at once.
//!
//! ```ignore
//! let mut form = ctx.form_data();
//! let landscape = form.bool("landscape", false);
//! let scale = form.float("scale", 1.0);
//! let inputs = form.mandatory_paths(&[".pdf"]);
//! form.validate()?;
//! ```

pub mod sort;

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::Duration;

use axum::http::StatusCode;

use crate::http::error::ApiError;
use sort::alphanumeric_cmp;

/// A scalar kind a form field can be bound to.
pub trait FormValue: Sized + Default {
    fn parse_form_value(raw: &str) -> Result<Self, String>;
}

impl FormValue for String {
    fn parse_form_value(raw: &str) -> Result<Self, String> {
        Ok(raw.to_string())
    }
}

impl FormValue for bool {
    fn parse_form_value(raw: &str) -> Result<Self, String> {
        parse_bool(raw)
    }
}

impl FormValue for i64 {
    fn parse_form_value(raw: &str) -> Result<Self, String> {
        raw.parse().map_err(|e: std::num::ParseIntError| e.to_string())
    }
}

impl FormValue for f64 {
    fn parse_form_value(raw: &str) -> Result<Self, String> {
        raw.parse().map_err(|e: std::num::ParseFloatError| e.to_string())
    }
}

impl FormValue for Duration {
    fn parse_form_value(raw: &str) -> Result<Self, String> {
        parse_duration(raw)
    }
}

/// Borrowed view over a request's form values and files.
#[derive(Debug)]
pub struct FormData<'a> {
    values: &'a HashMap<String, Vec<String>>,
    files: &'a HashMap<String, PathBuf>,
    errors: Vec<String>,
}

impl<'a> FormData<'a> {
    pub(crate) fn new(
        values: &'a HashMap<String, Vec<String>>,
        files: &'a HashMap<String, PathBuf>,
    ) -> Self {
        Self {
            values,
            files,
            errors: Vec::new(),
        }
    }

    /// Errors accumulated so far.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Turn accumulated errors into a single 400.
    pub fn validate(self) -> Result<(), ApiError> {
        if self.errors.is_empty() {
            return Ok(());
        }

        let joined = self.errors.join("; ");
        Err(ApiError::sentinel(
            format!("invalid form data: {joined}"),
            StatusCode::BAD_REQUEST,
            format!("Invalid form data: {joined}"),
        ))
    }

    fn raw(&self, key: &str) -> Option<&'a str> {
        let values: &'a HashMap<String, Vec<String>> = self.values;
        values
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    fn invalid(&mut self, key: &str, raw: &str, cause: impl Display) {
        self.errors.push(format!(
            "form field '{key}' is invalid (got '{raw}', resulting to {cause})"
        ));
    }

    fn required(&mut self, key: &str) {
        self.errors.push(format!("form field '{key}' is required"));
    }

    /// Bind an optional field, falling back to `default` when absent.
    pub fn value<T: FormValue>(&mut self, key: &str, default: T) -> T {
        self.custom(key, default, T::parse_form_value)
    }

    /// Bind a field that must be present.
    pub fn mandatory<T: FormValue>(&mut self, key: &str) -> T {
        self.mandatory_custom(key, T::parse_form_value)
    }

    /// Bind an optional field through a caller-supplied conversion.
    pub fn custom<T, E, F>(&mut self, key: &str, default: T, convert: F) -> T
    where
        E: Display,
        F: FnOnce(&str) -> Result<T, E>,
    {
        let Some(raw) = self.raw(key) else {
            return default;
        };

        match convert(raw) {
            Ok(value) => value,
            Err(cause) => {
                self.invalid(key, raw, cause);
                default
            }
        }
    }

    /// Bind a mandatory field through a caller-supplied conversion.
    pub fn mandatory_custom<T, E, F>(&mut self, key: &str, convert: F) -> T
    where
        T: Default,
        E: Display,
        F: FnOnce(&str) -> Result<T, E>,
    {
        let Some(raw) = self.raw(key) else {
            self.required(key);
            return T::default();
        };

        match convert(raw) {
            Ok(value) => value,
            Err(cause) => {
                self.invalid(key, raw, cause);
                T::default()
            }
        }
    }

    pub fn string(&mut self, key: &str, default: &str) -> String {
        self.value(key, default.to_string())
    }

    pub fn mandatory_string(&mut self, key: &str) -> String {
        self.mandatory(key)
    }

    pub fn bool(&mut self, key: &str, default: bool) -> bool {
        self.value(key, default)
    }

    pub fn mandatory_bool(&mut self, key: &str) -> bool {
        self.mandatory(key)
    }

    pub fn int(&mut self, key: &str, default: i64) -> i64 {
        self.value(key, default)
    }

    pub fn mandatory_int(&mut self, key: &str) -> i64 {
        self.mandatory(key)
    }

    pub fn float(&mut self, key: &str, default: f64) -> f64 {
        self.value(key, default)
    }

    pub fn mandatory_float(&mut self, key: &str) -> f64 {
        self.mandatory(key)
    }

    pub fn duration(&mut self, key: &str, default: Duration) -> Duration {
        self.value(key, default)
    }

    pub fn mandatory_duration(&mut self, key: &str) -> Duration {
        self.mandatory(key)
    }

    fn lookup(&self, filename: &str) -> Option<&'a PathBuf> {
        let files: &'a HashMap<String, PathBuf> = self.files;
        if let Some(path) = files.get(filename) {
            return Some(path);
        }

        files
            .iter()
            .find(|(name, _)| with_lowercase_extension(name) == filename)
            .map(|(_, path)| path)
    }

    /// Path of an uploaded file, matched by exact name or with a lower-cased extension.
    pub fn path(&mut self, filename: &str) -> Option<PathBuf> {
        self.lookup(filename).cloned()
    }

    pub fn mandatory_path(&mut self, filename: &str) -> Option<PathBuf> {
        let path = self.path(filename);
        if path.is_none() {
            self.errors.push(format!("form file '{filename}' is required"));
        }
        path
    }

    /// Content of an uploaded file, or `default` when it was not uploaded.
    pub fn content(&mut self, filename: &str, default: &str) -> String {
        match self.lookup(filename) {
            Some(path) => self.read(filename, path),
            None => default.to_string(),
        }
    }

    pub fn mandatory_content(&mut self, filename: &str) -> String {
        match self.lookup(filename) {
            Some(path) => self.read(filename, path),
            None => {
                self.errors.push(format!("form file '{filename}' is required"));
                String::new()
            }
        }
    }

    fn read(&mut self, filename: &str, path: &Path) -> String {
        match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                self.errors
                    .push(format!("form file '{filename}' is unreadable: {e}"));
                String::new()
            }
        }
    }

    /// Uploaded files whose extension is in `extensions`, in natural order.
    pub fn paths(&mut self, extensions: &[&str]) -> Vec<PathBuf> {
        let wanted: Vec<String> = extensions.iter().map(|ext| ext.to_lowercase()).collect();

        let mut matches: Vec<(&String, &PathBuf)> = self
            .files
            .iter()
            .filter(|(name, _)| {
                let ext = extension_of(name).to_lowercase();
                wanted.iter().any(|w| *w == ext)
            })
            .collect();

        matches.sort_by(|(a, _), (b, _)| alphanumeric_cmp(a, b));
        matches.into_iter().map(|(_, path)| path.clone()).collect()
    }

    pub fn mandatory_paths(&mut self, extensions: &[&str]) -> Vec<PathBuf> {
        let paths = self.paths(extensions);
        if paths.is_empty() {
            self.errors.push(format!(
                "no form file found for extensions: {extensions:?}"
            ));
        }
        paths
    }
}

fn extension_of(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) if idx > 0 => &name[idx..],
        _ => "",
    }
}

fn with_lowercase_extension(name: &str) -> String {
    let ext = extension_of(name);
    format!("{}{}", &name[..name.len() - ext.len()], ext.to_lowercase())
}

/// Accepts the same spellings as Go's `strconv.ParseBool`.
pub fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(format!("invalid boolean '{raw}'")),
    }
}

/// Parse durations such as `300ms`, `1.5s` or `1h30m`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let invalid = || format!("invalid duration '{raw}'");

    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    if raw.is_empty() || raw.starts_with('-') {
        return Err(invalid());
    }

    let mut rest = raw.strip_prefix('+').unwrap_or(raw);
    let mut total = 0f64;

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let number: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        total += number * nanos_per_unit;
    }

    Ok(Duration::from_nanos(total.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (HashMap<String, Vec<String>>, HashMap<String, PathBuf>) {
        let mut values = HashMap::new();
        values.insert("landscape".to_string(), vec!["true".to_string()]);
        values.insert("scale".to_string(), vec!["1.5".to_string(), "9".to_string()]);
        values.insert("pages".to_string(), vec!["abc".to_string()]);
        values.insert("empty".to_string(), vec![String::new()]);
        values.insert("wait".to_string(), vec!["1m30s".to_string()]);

        let mut files = HashMap::new();
        for name in ["a2.pdf", "a10.pdf", "a1.PDF", "index.html", "notes.txt"] {
            files.insert(name.to_string(), PathBuf::from(format!("/work/{name}")));
        }
        (values, files)
    }

    #[test]
    fn optional_fields_never_error() {
        let (values, files) = fixture();
        let mut form = FormData::new(&values, &files);

        assert!(form.bool("landscape", false));
        assert_eq!(form.float("scale", 1.0), 1.5);
        assert_eq!(form.int("missing", 7), 7);
        assert_eq!(form.string("empty", "fallback"), "fallback");
        assert_eq!(form.duration("wait", Duration::ZERO), Duration::from_secs(90));
        assert!(form.errors().is_empty());
        assert!(form.validate().is_ok());
    }

    #[test]
    fn mandatory_absent_field_yields_one_error() {
        let (values, files) = fixture();
        let mut form = FormData::new(&values, &files);

        assert_eq!(form.mandatory_string("missing"), "");
        assert_eq!(form.mandatory_int("empty"), 0);
        assert_eq!(
            form.errors(),
            &[
                "form field 'missing' is required".to_string(),
                "form field 'empty' is required".to_string(),
            ]
        );
    }

    #[test]
    fn conversion_failures_accumulate() {
        let (values, files) = fixture();
        let mut form = FormData::new(&values, &files);

        form.int("pages", 1);
        form.mandatory_bool("pages");
        form.custom("scale", Vec::<u8>::new(), |raw| {
            serde_json::from_str::<Vec<u8>>(raw).map_err(|_| "not a JSON array")
        });

        assert_eq!(form.errors().len(), 3);
        assert!(form.errors()[2].starts_with("form field 'scale' is invalid (got '1.5'"));

        let err = form.validate().unwrap_err();
        let (status, message) = err.status_and_message();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(message.starts_with("Invalid form data: form field 'pages' is invalid"));
    }

    #[test]
    fn paths_are_naturally_sorted() {
        let (values, files) = fixture();
        let mut form = FormData::new(&values, &files);

        let pdfs = form.paths(&[".pdf"]);
        assert_eq!(
            pdfs,
            vec![
                PathBuf::from("/work/a1.PDF"),
                PathBuf::from("/work/a2.pdf"),
                PathBuf::from("/work/a10.pdf"),
            ]
        );
        assert!(form.mandatory_paths(&[".docx", ".odt"]).is_empty());
        assert_eq!(
            form.errors(),
            &["no form file found for extensions: [\".docx\", \".odt\"]".to_string()]
        );
    }

    #[test]
    fn paths_order_does_not_depend_on_map_iteration() {
        let values = HashMap::new();
        let mut orderings = std::collections::HashSet::new();
        for _ in 0..32 {
            let files: HashMap<String, PathBuf> = ["a01.pdf", "a1.pdf", "a001.pdf"]
                .iter()
                .map(|name| (name.to_string(), PathBuf::from(format!("/work/{name}"))))
                .collect();
            let mut form = FormData::new(&values, &files);
            orderings.insert(form.paths(&[".pdf"]));
        }

        assert_eq!(orderings.len(), 1);
        assert_eq!(
            orderings.into_iter().next().unwrap(),
            vec![
                PathBuf::from("/work/a001.pdf"),
                PathBuf::from("/work/a01.pdf"),
                PathBuf::from("/work/a1.pdf"),
            ]
        );
    }

    #[test]
    fn path_lookup_accepts_lowercased_extension() {
        let (values, files) = fixture();
        let mut form = FormData::new(&values, &files);

        assert_eq!(form.path("a1.pdf"), Some(PathBuf::from("/work/a1.PDF")));
        assert_eq!(form.path("index.html"), Some(PathBuf::from("/work/index.html")));
        assert!(form.mandatory_path("header.html").is_none());
        assert_eq!(form.errors(), &["form file 'header.html' is required".to_string()]);
    }

    #[test]
    fn file_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("header.html");
        std::fs::write(&path, "<h1>hi</h1>").unwrap();

        let values = HashMap::new();
        let mut files = HashMap::new();
        files.insert("header.html".to_string(), path);

        let mut form = FormData::new(&values, &files);
        assert_eq!(form.content("header.html", ""), "<h1>hi</h1>");
        assert_eq!(form.content("footer.html", "none"), "none");
        assert_eq!(form.mandatory_content("footer.html"), "");
        assert_eq!(form.errors().len(), 1);
    }

    #[test]
    fn go_style_scalars() {
        assert_eq!(parse_bool("T"), Ok(true));
        assert_eq!(parse_bool("0"), Ok(false));
        assert!(parse_bool("yes").is_err());

        assert_eq!(parse_duration("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("5 days").is_err());
    }
}
