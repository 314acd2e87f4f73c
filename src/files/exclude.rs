//! Exclusion rules for declared data paths.

use glob::{MatchOptions, Pattern};

use super::StageError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled exclusion patterns for one declaration.
///
/// Each pattern is tried, in order, as a glob against the path relative to
/// the declaration root, then (unless soft) as a plain substring of that
/// path, then (unless disabled) as a glob against the basename of a file.
#[derive(Clone, Debug)]
pub struct ExcludeRules {
    patterns: Vec<(String, Pattern)>,
    substring_fallback: bool,
    basename_match: bool,
}

impl ExcludeRules {
    /// Compiles `patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`StageError::Pattern`] for an invalid glob.
    pub fn new<'a>(
        patterns: impl IntoIterator<Item = &'a String>,
        substring_fallback: bool,
        basename_match: bool,
    ) -> Result<Self, StageError> {
        let compiled = patterns
            .into_iter()
            .map(|raw| {
                Pattern::new(raw)
                    .map(|pattern| (raw.clone(), pattern))
                    .map_err(|err| StageError::Pattern {
                        pattern: raw.clone(),
                        message: err.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns: compiled,
            substring_fallback,
            basename_match,
        })
    }

    /// Returns `true` when `relative` should be skipped. A matching
    /// directory is pruned with everything beneath it.
    #[must_use]
    pub fn excludes(&self, relative: &str, is_dir: bool) -> bool {
        let basename = relative.rsplit('/').next().unwrap_or(relative);
        self.patterns.iter().any(|(raw, pattern)| {
            pattern.matches_with(relative, MATCH_OPTIONS)
                || (self.substring_fallback && relative.contains(raw.as_str()))
                || (self.basename_match
                    && !is_dir
                    && pattern.matches_with(basename, MATCH_OPTIONS))
        })
    }
}
