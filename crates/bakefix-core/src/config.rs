//! On-disk `name = value` settings.
//!
//! The file format is one setting per line, `name = value`, with
//! whitespace around both sides ignored. Lines without an equals sign are
//! skipped. Reads with a default write the default back when the setting
//! is absent or unusable, so a fresh file documents every knob after the
//! first run.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct KeyValueFile {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    edited: bool,
}

impl KeyValueFile {
    /// Load settings from `path`. A missing or unreadable file yields an
    /// empty set rather than an error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut entries = BTreeMap::new();
        match fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let Some((name, value)) = line.split_once('=') else {
                        continue;
                    };
                    let name = name.trim();
                    let value = value.trim();
                    if !is_valid_setting_name(name) {
                        debug!(
                            "Ignoring malformed setting name {name:?} in {}",
                            path.display()
                        );
                        continue;
                    }
                    entries.insert(name.to_string(), value.to_string());
                }
            }
            Err(_) => {
                debug!("No settings file at {}, starting empty", path.display());
            }
        }
        Self {
            path,
            entries,
            edited: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether any setting changed since load or the last save.
    pub fn is_edited(&self) -> bool {
        self.edited
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn set_str(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        if !is_valid_setting_name(name) {
            return Err(Error::InvalidSettingName(name.to_string()));
        }
        let value = value.into();
        if self.entries.get(name) != Some(&value) {
            self.entries.insert(name.to_string(), value);
            self.edited = true;
        }
        Ok(())
    }

    pub fn set_i32(&mut self, name: &str, value: i32) -> Result<()> {
        self.set_str(name, value.to_string())
    }

    /// Integer setting with a write-back default. Values accept decimal,
    /// `0x` hex, and leading-zero octal with an optional sign.
    pub fn get_i32_or(&mut self, name: &str, default: i32) -> i32 {
        match self
            .entries
            .get(name)
            .map(|raw| (raw.clone(), parse_int(raw)))
        {
            Some((_, Some(value))) => value,
            Some((raw, None)) => {
                warn!("Setting {name} has unusable value {raw:?}, resetting to {default}");
                self.write_back(name, default.to_string());
                default
            }
            None => {
                self.write_back(name, default.to_string());
                default
            }
        }
    }

    /// Boolean setting with a write-back default. Accepts true/false,
    /// on/off, or any integer (zero is false).
    pub fn get_bool_or(&mut self, name: &str, default: bool) -> bool {
        match self
            .entries
            .get(name)
            .map(|raw| (raw.clone(), parse_bool(raw)))
        {
            Some((_, Some(value))) => value,
            Some((raw, None)) => {
                warn!("Setting {name} has unusable value {raw:?}, resetting to {default}");
                self.write_back(name, default.to_string());
                default
            }
            None => {
                self.write_back(name, default.to_string());
                default
            }
        }
    }

    /// Write the file back if anything changed, one `name = value` per
    /// line in name order.
    pub fn save(&mut self) -> Result<()> {
        if !self.edited {
            return Ok(());
        }
        let mut contents = String::new();
        for (name, value) in &self.entries {
            contents.push_str(name);
            contents.push_str(" = ");
            contents.push_str(value);
            contents.push('\n');
        }
        fs::write(&self.path, contents)?;
        self.edited = false;
        debug!(
            "Saved {} settings to {}",
            self.entries.len(),
            self.path.display()
        );
        Ok(())
    }

    fn write_back(&mut self, name: &str, value: String) {
        self.entries.insert(name.to_string(), value);
        self.edited = true;
    }
}

/// Names start with an ASCII letter and continue with letters, digits,
/// underscores, or dashes.
fn is_valid_setting_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_int(text: &str) -> Option<i32> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (radix, digits) = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        (16, hex)
    } else if digits.len() > 1 && digits.starts_with('0') {
        (8, &digits[1..])
    } else {
        (10, digits)
    };
    let magnitude = i64::from_str_radix(digits, radix).ok()?;
    let value = if negative { -magnitude } else { magnitude };
    i32::try_from(value).ok()
}

fn parse_bool(text: &str) -> Option<bool> {
    if text.eq_ignore_ascii_case("true") || text.eq_ignore_ascii_case("on") {
        return Some(true);
    }
    if text.eq_ignore_ascii_case("false") || text.eq_ignore_ascii_case("off") {
        return Some(false);
    }
    parse_int(text).map(|value| value != 0)
}
