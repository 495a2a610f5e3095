//! INI configuration. The framework reads a handful of well-known sections;
//! everything else is kept verbatim for the application.

use indexmap::IndexMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// One `[section]` worth of `key = value` pairs, in file order.
pub type Section = IndexMap<String, String>;

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    /// Line number and the offending content.
    Malformed(usize, String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config io error: {}", err),
            ConfigError::Malformed(line, text) => {
                write!(f, "malformed config line {}: {}", line, text)
            }
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

/// Parsed INI file. Sections and keys keep their file order so a reload
/// writes back predictable diffs in logs.
#[derive(Debug, Clone, Default)]
pub struct Ini {
    path: Option<PathBuf>,
    sections: IndexMap<String, Section>,
}

impl Ini {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Ini, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut ini = Ini::parse(&text)?;
        ini.path = Some(path.as_ref().to_path_buf());
        Ok(ini)
    }

    /// Re-reads the file this config was loaded from.
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        let path = match &self.path {
            Some(path) => path.clone(),
            None => return Ok(()),
        };

        *self = Ini::load(path)?;
        Ok(())
    }

    pub fn parse(text: &str) -> Result<Ini, ConfigError> {
        let mut sections: IndexMap<String, Section> = IndexMap::new();
        let mut current = String::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                if !line.ends_with(']') || line.len() < 3 {
                    return Err(ConfigError::Malformed(idx + 1, raw.to_string()));
                }

                current = line[1..line.len() - 1].trim().to_string();
                sections.entry(current.clone()).or_insert_with(Section::new);
                continue;
            }

            let eq = match line.find('=') {
                Some(pos) => pos,
                None => return Err(ConfigError::Malformed(idx + 1, raw.to_string())),
            };

            let key = line[..eq].trim();
            let value = line[eq + 1..].trim();

            if key.is_empty() {
                return Err(ConfigError::Malformed(idx + 1, raw.to_string()));
            }

            sections
                .entry(current.clone())
                .or_insert_with(Section::new)
                .insert(key.to_string(), value.to_string());
        }

        Ok(Ini {
            path: None,
            sections,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&str, &Section)> {
        self.sections.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|sec| sec.get(key))
            .map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.get(section, key).unwrap_or(default)
    }

    pub fn get_i64(&self, section: &str, key: &str, default: i64) -> i64 {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_usize(&self, section: &str, key: &str, default: usize) -> usize {
        self.get(section, key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get(section, key) {
            Some(v) => matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
            None => default,
        }
    }
}
