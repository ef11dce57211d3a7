// Copyright (c) 2024 <Wei Li>.
//
// This source code is licensed under the GNU license found in the
// LICENSE file in the root directory of this source tree.

//! `key = value` configuration files for analyzer sub-modules.
//!
//! Keys are dotted (`module.key`); lines starting with `#` are comments.
//! Unknown keys are preserved so downstream modules can pick up their own
//! sections without the parser enumerating them all.

use std::collections::HashMap;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{AnalysisError, AnalysisResult};

lazy_static! {
    static ref CONFIG_LINE: Regex =
        Regex::new(r"^\s*([A-Za-z_][\w.]*)\s*=\s*(\S(?:.*\S)?)\s*$").unwrap();
}

/// Recognized analyzer keys. Values stay untyped in the map; these constants
/// document the surface the verifier sub-modules read.
pub const ANALYZER_VARIANT: &str = "Analyzer.Variant";
pub const ANALYZER_INCREMENTAL: &str = "Analyzer.Incremental";
pub const ANALYZER_WIDENING_DELAY: &str = "Analyzer.WideningDelay";
pub const ANALYZER_WIDENING_FREQUENCY: &str = "Analyzer.WideningFrequency";
pub const FRAGMENT_STRATEGY: &str = "FragmentDecomposition.Strategy";
pub const MEMORY_MODEL_VARIANT: &str = "MemoryModel.Variant";
pub const MEMORY_MODEL_ADDRESS_BITS: &str = "MemoryModel.AddressBits";

#[derive(Clone, Debug, Default)]
pub struct AnalysisConfig {
    entries: HashMap<String, String>,
}

impl AnalysisConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> AnalysisResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AnalysisError::InputInvalid(format!("{}: {}", path.display(), e)))?;
        Self::from_str_contents(&text)
    }

    pub fn from_str_contents(text: &str) -> AnalysisResult<Self> {
        let mut entries = HashMap::new();
        for (lineno, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match CONFIG_LINE.captures(trimmed) {
                Some(caps) => {
                    entries.insert(caps[1].to_string(), caps[2].to_string());
                }
                None => {
                    return Err(AnalysisError::InputInvalid(format!(
                        "malformed config line {}: `{}`",
                        lineno + 1,
                        trimmed
                    )));
                }
            }
        }
        Ok(AnalysisConfig { entries })
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|s| s.as_str())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_str(key) {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_str(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys() {
        let text = "\
# analyzer settings
Analyzer.Variant = BilateralAnalyzer
Analyzer.Incremental = true
Analyzer.WideningDelay = 3
MemoryModel.AddressBits = 64
";
        let cfg = AnalysisConfig::from_str_contents(text).unwrap();
        assert_eq!(cfg.get_str(ANALYZER_VARIANT), Some("BilateralAnalyzer"));
        assert!(cfg.get_bool(ANALYZER_INCREMENTAL, false));
        assert_eq!(cfg.get_int(ANALYZER_WIDENING_DELAY, 0), 3);
        assert_eq!(cfg.get_int(MEMORY_MODEL_ADDRESS_BITS, 32), 64);
        assert_eq!(cfg.get_int(ANALYZER_WIDENING_FREQUENCY, 5), 5);
    }

    #[test]
    fn rejects_garbage_lines() {
        assert!(AnalysisConfig::from_str_contents("no equals sign here").is_err());
    }
}
