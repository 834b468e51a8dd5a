use regex::Regex;
use tracing::warn;

/// Glob-based policy that hides tools from `tools/list` responses and blocks
/// `tools/call` for matching names. A name is included iff it matches none
/// of the patterns; matching is case-insensitive and anchored at both ends.
#[derive(Debug, Default)]
pub struct ToolFilter {
    patterns: Vec<Regex>,
}

impl ToolFilter {
    pub fn new(globs: &[String]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|glob| match Regex::new(&glob_to_regex(glob)) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("ignoring unusable tool pattern {glob:?}: {e}");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn should_include(&self, name: &str) -> bool {
        !self.patterns.iter().any(|re| re.is_match(name))
    }
}

/// `create*` → `(?i)^create.*$`: split on `*`, escape each literal segment,
/// rejoin with `.*`.
fn glob_to_regex(glob: &str) -> String {
    let escaped: Vec<String> = glob.split('*').map(regex::escape).collect();
    format!("(?i)^{}$", escaped.join(".*"))
}
