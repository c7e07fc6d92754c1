//! Typed configuration: a small nested `key = value` / `namespace { ... }`
//! grammar, parsed into dotted keys and then projected into the typed
//! [`Config`] the rest of the crate reads from.
//!
//! This is deliberately not TOML: scopes nest with braces rather than
//! `[section]` headers, which is the one syntactic feature TOML doesn't
//! give us for free, so the parser below is hand-rolled.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;

/// A single configuration value, classified lexically at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// `true` / `false`
    Bool(bool),
    /// digits only
    Int(i64),
    /// one `.`, digits on both sides
    Float(f64),
    /// anything else
    String(String),
}

impl Value {
    fn classify(raw: &str) -> Value {
        if raw == "true" {
            return Value::Bool(true);
        }
        if raw == "false" {
            return Value::Bool(false);
        }
        if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit() || c == '-') {
            if let Ok(i) = raw.parse::<i64>() {
                return Value::Int(i);
            }
        }
        if raw.matches('.').count() == 1
            && raw.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-')
        {
            if let Ok(f) = raw.parse::<f64>() {
                return Value::Float(f);
            }
        }
        Value::String(raw.to_string())
    }

    /// Project as a `bool`, if that's what was parsed.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Project as an `i64`, if that's what was parsed.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Project as an `f64`, if that's what was parsed.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Project as a `&str` regardless of the underlying variant.
    pub fn as_str(&self) -> &str {
        match self {
            Value::String(s) => s,
            _ => "",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s}"),
        }
    }
}

/// A parsed tree of dotted keys to values, e.g. `ns1.key2 = true`.
#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: HashMap<String, Value>,
}

impl Table {
    /// Look up a dotted key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, value: Value) {
        self.entries.insert(key, value);
    }
}

/// Parses the config grammar:
///
/// ```text
/// key1 = value
/// ns1 {
///   key2 = true
///   key3 = 1234
/// }
/// ```
///
/// Whitespace is stripped, blank lines ignored, and nested scopes
/// produce dotted keys (`ns1.key2`).
pub fn parse(source: &str) -> Result<Table> {
    let mut table = Table::default();
    let mut scope: Vec<String> = Vec::new();
    for (lineno, raw_line) in source.lines().enumerate() {
        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        if let Some(name) = line.strip_suffix('{') {
            let name = name.trim();
            if name.is_empty() {
                return Err(Error::parser(format!(
                    "line {}: expected a namespace name before '{{'",
                    lineno + 1
                )));
            }
            scope.push(name.to_string());
            continue;
        }
        if line == "}" {
            if scope.pop().is_none() {
                return Err(Error::parser(format!(
                    "line {}: unmatched closing brace",
                    lineno + 1
                )));
            }
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Error::parser(format!(
                "line {}: expected 'key = value', got {line:?}",
                lineno + 1
            )));
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(Error::parser(format!("line {}: empty key", lineno + 1)));
        }
        let dotted = if scope.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", scope.join("."), key)
        };
        table.insert(dotted, Value::classify(value));
    }
    if !scope.is_empty() {
        return Err(Error::parser(format!(
            "unclosed namespace(s): {}",
            scope.join(", ")
        )));
    }
    Ok(table)
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Tunables the reactor and transport read at init time.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Config {
    /// `multiplexer.port`, default 0 (ephemeral)
    pub port: u16,
    /// `multiplexer.local`, default true (bind loopback rather than any-address)
    pub bind_loopback: bool,
    /// `transport.max-consecutive-fetches`, default 10
    pub max_consecutive_fetches: usize,
    /// `transport.max-consecutive-reads`, default 20
    pub max_consecutive_reads: usize,
    /// `transport.max-consecutive-writes`, default 20
    pub max_consecutive_writes: usize,
    /// `log.terminal`, default true
    pub log_terminal: bool,
    /// `log.file`, default None
    pub log_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 0,
            bind_loopback: true,
            max_consecutive_fetches: 10,
            max_consecutive_reads: 20,
            max_consecutive_writes: 20,
            log_terminal: true,
            log_file: None,
        }
    }
}

impl Config {
    /// Parse `source` and project recognized keys onto [`Config::default`],
    /// leaving unrecognized keys ignored (forward-compatible).
    pub fn from_str(source: &str) -> Result<Self> {
        let table = parse(source)?;
        Ok(Self::from_table(&table))
    }

    /// Build a [`Config`] from an already-parsed [`Table`].
    pub fn from_table(table: &Table) -> Self {
        let mut cfg = Config::default();
        if let Some(v) = table.get("multiplexer.port").and_then(Value::as_int) {
            cfg.port = v as u16;
        }
        if let Some(v) = table.get("multiplexer.local").and_then(Value::as_bool) {
            cfg.bind_loopback = v;
        }
        if let Some(v) = table
            .get("transport.max-consecutive-fetches")
            .and_then(Value::as_int)
        {
            cfg.max_consecutive_fetches = v.max(1) as usize;
        }
        if let Some(v) = table
            .get("transport.max-consecutive-reads")
            .and_then(Value::as_int)
        {
            cfg.max_consecutive_reads = v.max(1) as usize;
        }
        if let Some(v) = table
            .get("transport.max-consecutive-writes")
            .and_then(Value::as_int)
        {
            cfg.max_consecutive_writes = v.max(1) as usize;
        }
        if let Some(v) = table.get("log.terminal").and_then(Value::as_bool) {
            cfg.log_terminal = v;
        }
        if let Some(v) = table.get("log.file") {
            cfg.log_file = Some(v.as_str().to_string());
        }
        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_scalar_kinds() {
        assert_eq!(Value::classify("true"), Value::Bool(true));
        assert_eq!(Value::classify("false"), Value::Bool(false));
        assert_eq!(Value::classify("1234"), Value::Int(1234));
        assert_eq!(Value::classify("-7"), Value::Int(-7));
        assert_eq!(Value::classify("12.5"), Value::Float(12.5));
        assert_eq!(Value::classify("string"), Value::String("string".into()));
    }

    #[test]
    fn nested_namespaces_produce_dotted_keys() {
        let src = "key1 = value\nns1 {\n  key2 = true\n  key3 = 1234\n  key4 = 12.5\n  key5 = string\n}\n";
        let table = parse(src).unwrap();
        assert_eq!(table.get("key1"), Some(&Value::String("value".into())));
        assert_eq!(table.get("ns1.key2"), Some(&Value::Bool(true)));
        assert_eq!(table.get("ns1.key3"), Some(&Value::Int(1234)));
        assert_eq!(table.get("ns1.key4"), Some(&Value::Float(12.5)));
        assert_eq!(table.get("ns1.key5"), Some(&Value::String("string".into())));
    }

    #[test]
    fn blank_lines_and_comments_are_ignored() {
        let src = "\n# a comment\nkey = 1\n\n";
        let table = parse(src).unwrap();
        assert_eq!(table.get("key"), Some(&Value::Int(1)));
    }

    #[test]
    fn unmatched_brace_is_a_parse_error() {
        assert!(parse("ns {\n").is_err());
        assert!(parse("}\n").is_err());
    }

    #[test]
    fn config_projects_recognized_keys_and_defaults_the_rest() {
        let cfg = Config::from_str("multiplexer.port = 9000\ntransport.max-consecutive-reads = 5\n")
            .unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.max_consecutive_reads, 5);
        assert_eq!(cfg.max_consecutive_writes, 20);
        assert!(cfg.bind_loopback);
    }
}
