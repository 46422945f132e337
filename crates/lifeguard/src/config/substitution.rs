//! `$(kind [argument])` expansion for descriptor fields
//!
//! Recognised forms:
//! - `$(env NAME)`: value of `NAME`, an error when unset
//! - `$(optenv NAME [fallback])`: value of `NAME`, else the fallback text
//! - `$(config_dir)`: directory the services file was loaded from
//!
//! Expanded values may contain further patterns. Expansion repeats until the
//! text stops changing.

use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::LazyLock;

static PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\((\w+)(?:\s+([^)]*))?\)").expect("substitution pattern is valid")
});

const MAX_PASSES: usize = 10;

/// One parsed `$(...)` occurrence
#[derive(Debug, PartialEq, Eq)]
enum Directive<'a> {
    Env(&'a str),
    OptEnv { name: &'a str, fallback: &'a str },
    ConfigDir,
}

impl<'a> Directive<'a> {
    fn parse(kind: &str, argument: &'a str, raw: &str) -> Result<Self, SubstitutionError> {
        let argument = argument.trim();
        match (kind, argument.is_empty()) {
            ("env", false) => Ok(Directive::Env(argument)),
            ("optenv", false) => {
                let (name, fallback) = argument
                    .split_once(char::is_whitespace)
                    .map(|(name, rest)| (name, rest.trim()))
                    .unwrap_or((argument, ""));
                Ok(Directive::OptEnv { name, fallback })
            }
            ("config_dir", true) => Ok(Directive::ConfigDir),
            ("env" | "optenv" | "config_dir", _) => {
                Err(SubstitutionError::InvalidPattern(raw.to_string()))
            }
            (other, _) => Err(SubstitutionError::UnknownType(other.to_string())),
        }
    }
}

/// Variables and paths available while expanding
#[derive(Debug, Clone, Default)]
pub struct SubstitutionContext {
    overrides: HashMap<String, String>,
    config_dir: Option<PathBuf>,
}

impl SubstitutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Variable consulted before the supervisor's own environment
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides.insert(name.into(), value.into());
        self
    }

    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Expand every pattern in `input`
    pub fn substitute(&self, input: &str) -> Result<String, SubstitutionError> {
        let mut text = input.to_string();
        for _ in 0..MAX_PASSES {
            let expanded = self.expand(&text)?;
            if expanded == text {
                return Ok(expanded);
            }
            text = expanded;
        }

        if PATTERN.is_match(&text) {
            Err(SubstitutionError::MaxIterationsExceeded(input.to_string()))
        } else {
            Ok(text)
        }
    }

    fn expand(&self, text: &str) -> Result<String, SubstitutionError> {
        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;

        for caps in PATTERN.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            let argument = caps.get(2).map_or("", |m| m.as_str());
            let directive = Directive::parse(&caps[1], argument, whole.as_str())?;

            out.push_str(&text[cursor..whole.start()]);
            out.push_str(&self.resolve(directive)?);
            cursor = whole.end();
        }

        out.push_str(&text[cursor..]);
        Ok(out)
    }

    fn resolve(&self, directive: Directive<'_>) -> Result<String, SubstitutionError> {
        match directive {
            Directive::Env(name) => self
                .lookup(name)
                .ok_or_else(|| SubstitutionError::UndefinedEnv(name.to_string())),
            Directive::OptEnv { name, fallback } => {
                Ok(self.lookup(name).unwrap_or_else(|| fallback.to_string()))
            }
            Directive::ConfigDir => self
                .config_dir
                .as_deref()
                .map(|dir| dir.display().to_string())
                .ok_or(SubstitutionError::NoConfigDir),
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        self.overrides
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubstitutionError {
    #[error("unknown substitution '$({0} ...)'")]
    UnknownType(String),

    #[error("environment variable '{0}' is not set")]
    UndefinedEnv(String),

    #[error("$(config_dir) used but the services file was not loaded from disk")]
    NoConfigDir,

    #[error("malformed substitution '{0}'")]
    InvalidPattern(String),

    #[error("substitution did not settle after {max} passes: {0}", max = MAX_PASSES)]
    MaxIterationsExceeded(String),
}
