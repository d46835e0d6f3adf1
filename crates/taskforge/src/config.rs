//! Configuration surface for the [`ThreadSupplier`](crate::supplier::ThreadSupplier).
//!
//! Spec §6 lists six configuration keys resolved through an external "config
//! resolver" collaborator that supports `${...}` placeholder substitution.
//! This module plays that role directly: [`resolve_value`] implements the
//! placeholder grammar, and [`SupplierConfig`] is the typed, already-resolved
//! result a [`ThreadSupplierBuilder`](crate::supplier::ThreadSupplierBuilder)
//! consumes.
//!
//! Grounded on the corpus' own config-loading pattern (TOML + `serde`, e.g.
//! `build-config`, `hadron-build`, `xtask` all parse a TOML document with
//! `serde::Deserialize` and layer it under CLI/env overrides).

use std::collections::HashMap;
use std::time::Duration;

use crate::error::ConfigError;

/// One resolved, typed snapshot of the `thread-supplier.*` configuration
/// keys from spec §6.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "config", derive(serde::Deserialize))]
#[cfg_attr(feature = "config", serde(rename_all = "kebab-case"))]
pub struct SupplierConfig {
    /// `thread-supplier.max-poolable-thread-count`. `None` means
    /// `"autodetect"` was requested and has not yet been resolved to a
    /// concrete count (call [`SupplierConfig::resolve_autodetect`]).
    #[cfg_attr(feature = "config", serde(default))]
    pub max_poolable_thread_count: RawCount,

    /// `thread-supplier.max-detached-thread-count`. Negative values mean
    /// "effectively unbounded" (spec §6), represented here as `None`.
    #[cfg_attr(feature = "config", serde(default))]
    pub max_detached_thread_count: Option<usize>,

    /// `thread-supplier.poolable-thread-request-timeout`, in milliseconds.
    #[cfg_attr(
        feature = "config",
        serde(
            rename = "poolable-thread-request-timeout",
            default = "default_request_timeout_ms"
        )
    )]
    pub poolable_thread_request_timeout_ms: u64,

    /// `thread-supplier.default-daemon-flag-value`.
    #[cfg_attr(feature = "config", serde(default))]
    pub default_daemon_flag_value: bool,

    /// `thread-supplier.max-detached-thread-count.increasing-step`,
    /// flattened to a sibling key since TOML cannot give a scalar table
    /// both a value and nested keys. `0` (or a feature-disabled absence)
    /// disables growth, matching spec §4.B step 5: "If the growth step is
    /// configured <= 0, the wait degenerates to a polling retry."
    #[cfg_attr(
        feature = "config",
        serde(rename = "increasing-step", default, deserialize_with = "deserialize_u32_or_string")
    )]
    pub increasing_step: u32,

    /// `thread-supplier.max-detached-thread-count.elapsed-time-threshold-
    /// from-last-increase-for-gradual-decreasing-to-initial-value`, in
    /// milliseconds, flattened for the same reason as `increasing_step`.
    #[cfg_attr(
        feature = "config",
        serde(
            rename = "elapsed-time-threshold-from-last-increase-for-gradual-decreasing-to-initial-value",
            default = "default_decay_threshold_ms"
        )
    )]
    pub decay_threshold_ms: u64,
}

/// Placeholder substitution happens on the raw TOML text before parsing, so
/// a `"${STEP}"` value resolves to a quoted string even when the key is
/// numeric. Accept either form here, mirroring `RawCount`'s deserializer.
#[cfg(feature = "config")]
fn deserialize_u32_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;

    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Num(u32),
        Str(String),
    }
    match Repr::deserialize(deserializer)? {
        Repr::Num(n) => Ok(n),
        Repr::Str(s) => s.parse().map_err(|_| serde::de::Error::custom(format!("expected an integer, got {s:?}"))),
    }
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_decay_threshold_ms() -> u64 {
    60_000
}

impl Default for SupplierConfig {
    fn default() -> Self {
        Self {
            max_poolable_thread_count: RawCount::Autodetect,
            max_detached_thread_count: Some(0),
            poolable_thread_request_timeout_ms: default_request_timeout_ms(),
            default_daemon_flag_value: true,
            increasing_step: 0,
            decay_threshold_ms: default_decay_threshold_ms(),
        }
    }
}

impl SupplierConfig {
    /// Resolves `"autodetect"` to `3 * available_parallelism()` (spec §6)
    /// and returns the concrete poolable thread cap.
    pub fn resolve_max_poolable(&self) -> usize {
        match self.max_poolable_thread_count {
            RawCount::Fixed(n) => n,
            RawCount::Autodetect => {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                cores.saturating_mul(3)
            }
        }
    }

    /// The request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.poolable_thread_request_timeout_ms)
    }

    /// The decay threshold as a [`Duration`].
    pub fn decay_threshold(&self) -> Duration {
        Duration::from_millis(self.decay_threshold_ms)
    }

    /// `None` represents spec §6's "negative ⇒ effectively unbounded".
    pub fn max_detached(&self) -> Option<usize> {
        self.max_detached_thread_count
    }

    /// Parses a TOML document under a `[thread-supplier]` table into a
    /// [`SupplierConfig`], applying placeholder substitution from `env`
    /// first.
    #[cfg(feature = "config")]
    pub fn from_toml_str(toml_text: &str, env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let resolved = resolve_document(toml_text, env)?;
        #[derive(serde::Deserialize)]
        struct Document {
            #[serde(rename = "thread-supplier", default)]
            thread_supplier: SupplierConfig,
        }
        let doc: Document =
            toml::from_str(&resolved).map_err(|e| ConfigError::Toml(crate::error::TomlErrorShim(e.to_string())))?;
        Ok(doc.thread_supplier)
    }

    /// Like [`SupplierConfig::from_toml_str`], but the placeholder source
    /// map is the process environment.
    #[cfg(feature = "config")]
    pub fn from_env_and_toml(toml_text: &str) -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_toml_str(toml_text, &env)
    }
}

/// `thread-supplier.max-poolable-thread-count`'s raw form before
/// autodetection is resolved: either a fixed count or the literal string
/// `"autodetect"` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RawCount {
    /// A fixed worker count.
    Fixed(usize),
    /// `"autodetect"` ⇒ 3×CPU, resolved lazily via [`SupplierConfig::resolve_max_poolable`].
    #[default]
    Autodetect,
}

#[cfg(feature = "config")]
impl<'de> serde::Deserialize<'de> for RawCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(serde::Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(usize),
            Str(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(RawCount::Fixed(n)),
            Repr::Str(s) if s.eq_ignore_ascii_case("autodetect") => Ok(RawCount::Autodetect),
            Repr::Str(s) => Err(serde::de::Error::custom(format!(
                "expected a thread count or \"autodetect\", got {s:?}"
            ))),
        }
    }
}

/// Resolves every `${KEY}` placeholder appearing in `text` against `source`,
/// recursively, with cycle detection.
///
/// This is the "Config resolver" collaborator's `resolveValue` contract from
/// spec §6, generalized to operate over an entire document rather than a
/// single value so [`SupplierConfig::from_toml_str`] can resolve placeholders
/// before handing the text to the TOML parser.
pub fn resolve_value(raw: &str, source: &HashMap<String, String>) -> Result<String, ConfigError> {
    resolve_with_stack(raw, source, &mut Vec::new())
}

fn resolve_with_stack(
    raw: &str,
    source: &HashMap<String, String>,
    stack: &mut Vec<String>,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated placeholder: emit literally, matching a permissive
            // resolver rather than hard-failing on malformed text.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let key = &after[..end];
        rest = &after[end + 1..];

        if stack.iter().any(|k| k == key) {
            return Err(ConfigError::CyclicPlaceholder(key.to_owned()));
        }
        let value = source
            .get(key)
            .ok_or_else(|| ConfigError::UnresolvedPlaceholder(key.to_owned()))?;

        stack.push(key.to_owned());
        let resolved = resolve_with_stack(value, source, stack)?;
        stack.pop();

        out.push_str(&resolved);
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(feature = "config")]
fn resolve_document(text: &str, env: &HashMap<String, String>) -> Result<String, ConfigError> {
    resolve_value(text, env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_value_substitutes_flat_placeholder() {
        let mut source = HashMap::new();
        source.insert("CORES".to_owned(), "8".to_owned());
        let resolved = resolve_value("max = ${CORES}", &source).unwrap();
        assert_eq!(resolved, "max = 8");
    }

    #[test]
    fn resolve_value_substitutes_recursively() {
        let mut source = HashMap::new();
        source.insert("A".to_owned(), "${B}".to_owned());
        source.insert("B".to_owned(), "final".to_owned());
        let resolved = resolve_value("${A}", &source).unwrap();
        assert_eq!(resolved, "final");
    }

    #[test]
    fn resolve_value_detects_cycles() {
        let mut source = HashMap::new();
        source.insert("A".to_owned(), "${B}".to_owned());
        source.insert("B".to_owned(), "${A}".to_owned());
        let err = resolve_value("${A}", &source).unwrap_err();
        assert!(matches!(err, ConfigError::CyclicPlaceholder(_)));
    }

    #[test]
    fn resolve_value_reports_missing_key() {
        let source = HashMap::new();
        let err = resolve_value("${MISSING}", &source).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedPlaceholder(k) if k == "MISSING"));
    }

    #[test]
    fn default_config_disables_growth() {
        let cfg = SupplierConfig::default();
        assert_eq!(cfg.increasing_step, 0);
        assert_eq!(cfg.max_detached(), Some(0));
    }

    #[cfg(feature = "config")]
    #[test]
    fn from_toml_str_resolves_placeholders_and_autodetect() {
        let toml_text = r#"
            [thread-supplier]
            max-poolable-thread-count = "autodetect"
            max-detached-thread-count = 4
            poolable-thread-request-timeout = 250
            increasing-step = "${STEP}"
        "#;
        let mut env = HashMap::new();
        env.insert("STEP".to_owned(), "2".to_owned());
        let cfg = SupplierConfig::from_toml_str(toml_text, &env).unwrap();
        assert_eq!(cfg.max_poolable_thread_count, RawCount::Autodetect);
        assert_eq!(cfg.max_detached_thread_count, Some(4));
        assert_eq!(cfg.increasing_step, 2);
    }
}
