//! Configuration validation engine.
//!
//! Validates TOML configuration files against the known schema, detects
//! unknown/misspelled fields, and reports settings that will misbehave at
//! runtime.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::Path,
};

use crate::schema::{FleetcronConfig, StoreBackend};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Category: "syntax", "unknown-field", "type-error", "schedule",
    /// "store", "workflow", "file-ref"
    pub category: &'static str,
    /// Dotted path, e.g. "cron.worker_interval_secs"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<std::path::PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

/// Represents the expected shape of the configuration schema.
enum KnownKeys {
    /// A struct with fixed field names.
    Struct(HashMap<&'static str, KnownKeys>),
    /// A map with dynamic keys whose values have a known shape.
    Map(Box<KnownKeys>),
    /// An array of typed items.
    Array(Box<KnownKeys>),
    /// Scalar value, or free-form data. Stop recursion.
    Leaf,
}

/// Build the full schema map mirroring every field in `schema.rs`.
fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Array, Leaf, Map, Struct};

    let cron = Struct(HashMap::from([
        ("active", Leaf),
        ("worker_interval_secs", Leaf),
        ("lease_duration_secs", Leaf),
        ("management_lease_attempts", Leaf),
        ("management_lease_retry_ms", Leaf),
        ("run_heartbeat_secs", Leaf),
        ("run_stale_after_secs", Leaf),
        ("disabled_system_jobs", Leaf),
    ]));

    let store = Struct(HashMap::from([("backend", Leaf), ("database_url", Leaf)]));

    let metrics = Struct(HashMap::from([
        ("enabled", Leaf),
        ("listen", Leaf),
        ("labels", Map(Box::new(Leaf))),
    ]));

    let system_job = Struct(HashMap::from([
        ("name", Leaf),
        ("workflow", Leaf),
        ("frequency_secs", Leaf),
        ("lifetime_secs", Leaf),
        ("allow_overruns", Leaf),
        ("enabled", Leaf),
        ("stateful", Leaf),
        ("description", Leaf),
        ("args", Leaf),
    ]));

    Struct(HashMap::from([
        ("cron", cron),
        ("store", store),
        ("metrics", metrics),
        ("workflows", Map(Box::new(Leaf))),
        ("system_jobs", Array(Box::new(system_job))),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

/// Compute the Levenshtein edit distance between two strings.
fn levenshtein(a: &str, b: &str) -> usize {
    let a_len = a.chars().count();
    let b_len = b.chars().count();
    if a_len == 0 {
        return b_len;
    }
    if b_len == 0 {
        return a_len;
    }

    let mut prev: Vec<usize> = (0..=b_len).collect();
    let mut curr = vec![0; b_len + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.chars().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_len]
}

/// Find the best match for `needle` among `candidates` using Levenshtein
/// distance. Returns `Some(best)` if the distance is <= `max_distance`.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    let mut best: Option<(&'a str, usize)> = None;
    for &candidate in candidates {
        let d = levenshtein(needle, candidate);
        if d > 0 && d <= max_distance && best.as_ref().is_none_or(|(_, bd)| d < *bd) {
            best = Some((candidate, d));
        }
    }
    best.map(|(s, _)| s)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at the given path, or discover the default config
/// file location if `path` is `None`.
///
/// Only TOML files get the unknown-field walk; other formats are type-checked
/// through the loader.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = if let Some(p) = path {
        Some(p.to_path_buf())
    } else {
        crate::loader::find_config_file()
    };

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");
    if !is_toml {
        let mut diagnostics = Vec::new();
        match crate::loader::load_config(actual_path) {
            Ok(config) => check_semantics(&config, &mut diagnostics),
            Err(e) => diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "type-error",
                path: String::new(),
                message: e.to_string(),
            }),
        }
        return ValidationResult {
            diagnostics,
            config_path: Some(actual_path.clone()),
        };
    }

    match std::fs::read_to_string(actual_path) {
        Ok(content) => {
            let content = crate::env_subst::substitute_env(&content);
            let mut result = validate_toml_str(&content);
            result.config_path = Some(actual_path.clone());
            result
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("failed to read config file: {e}"),
            }],
            config_path: Some(actual_path.clone()),
        },
    }
}

/// Validate a TOML string without file-system side effects.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    // 1. Syntax
    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("TOML syntax error: {e}"),
            });
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    // 2. Unknown fields
    let schema = build_schema_map();
    check_unknown_fields(&toml_value, &schema, "", &mut diagnostics);

    // 3. Type check, then semantics on the parsed config
    match toml::from_str::<FleetcronConfig>(toml_str) {
        Ok(config) => check_semantics(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        }),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn child_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

/// Walk the TOML value tree against the schema tree and flag unknown keys.
fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    match (value, schema) {
        (toml::Value::Table(table), KnownKeys::Struct(fields)) => {
            let known_keys: Vec<&str> = fields.keys().copied().collect();
            for (key, child_value) in table {
                let path = child_path(prefix, key);
                if let Some(child_schema) = fields.get(key.as_str()) {
                    check_unknown_fields(child_value, child_schema, &path, diagnostics);
                } else {
                    let level = if prefix.is_empty() {
                        "at top level "
                    } else {
                        ""
                    };
                    let msg = match suggest(key, &known_keys, 3) {
                        Some(s) => format!("unknown field {level}(did you mean \"{s}\"?)"),
                        None => format!("unknown field {level}"),
                    };
                    diagnostics.push(Diagnostic {
                        severity: Severity::Error,
                        category: "unknown-field",
                        path,
                        message: msg.trim().to_string(),
                    });
                }
            }
        },
        (toml::Value::Table(table), KnownKeys::Map(value_schema)) => {
            for (key, child_value) in table {
                check_unknown_fields(
                    child_value,
                    value_schema,
                    &child_path(prefix, key),
                    diagnostics,
                );
            }
        },
        (toml::Value::Array(arr), KnownKeys::Array(item_schema)) => {
            for (i, item) in arr.iter().enumerate() {
                let path = format!("{prefix}[{i}]");
                check_unknown_fields(item, item_schema, &path, diagnostics);
            }
        },
        // Leaf or type mismatch, stop recursion (type errors caught later)
        _ => {},
    }
}

fn push(
    diagnostics: &mut Vec<Diagnostic>,
    severity: Severity,
    category: &'static str,
    path: impl Into<String>,
    message: impl Into<String>,
) {
    diagnostics.push(Diagnostic {
        severity,
        category,
        path: path.into(),
        message: message.into(),
    });
}

/// Checks that need the parsed config.
fn check_semantics(config: &FleetcronConfig, diagnostics: &mut Vec<Diagnostic>) {
    use Severity::{Error, Info, Warning};

    let cron = &config.cron;
    if cron.worker_interval_secs == 0 {
        push(
            diagnostics,
            Error,
            "schedule",
            "cron.worker_interval_secs",
            "must be > 0",
        );
    }
    if cron.lease_duration_secs == 0 {
        push(
            diagnostics,
            Error,
            "schedule",
            "cron.lease_duration_secs",
            "must be > 0",
        );
    } else if cron.lease_duration_secs <= cron.worker_interval_secs {
        push(
            diagnostics,
            Warning,
            "schedule",
            "cron.lease_duration_secs",
            format!(
                "lease duration ({}s) should exceed the worker interval ({}s)",
                cron.lease_duration_secs, cron.worker_interval_secs
            ),
        );
    }
    if cron.management_lease_attempts == 0 {
        push(
            diagnostics,
            Error,
            "schedule",
            "cron.management_lease_attempts",
            "must be > 0",
        );
    }
    if cron.run_heartbeat_secs == 0 {
        push(
            diagnostics,
            Error,
            "schedule",
            "cron.run_heartbeat_secs",
            "must be > 0",
        );
    } else if cron.run_stale_after_secs <= cron.run_heartbeat_secs {
        push(
            diagnostics,
            Error,
            "schedule",
            "cron.run_stale_after_secs",
            format!(
                "must exceed run_heartbeat_secs ({}s), or live runs are marked failed",
                cron.run_heartbeat_secs
            ),
        );
    }
    if !cron.active {
        push(
            diagnostics,
            Info,
            "schedule",
            "cron.active",
            "scheduling is disabled; `fleetcron worker` exits at startup",
        );
    }

    match config.store.backend {
        StoreBackend::Memory => push(
            diagnostics,
            Warning,
            "store",
            "store.backend",
            "memory store is not shared between processes and is lost on exit",
        ),
        StoreBackend::Sqlite => {
            if let Some(ref url) = config.store.database_url
                && !url.starts_with("sqlite:")
            {
                push(
                    diagnostics,
                    Error,
                    "store",
                    "store.database_url",
                    format!("expected a sqlite: URL, got \"{url}\""),
                );
            }
        },
    }

    if let Some(ref listen) = config.metrics.listen
        && listen.parse::<SocketAddr>().is_err()
    {
        push(
            diagnostics,
            Error,
            "type-error",
            "metrics.listen",
            format!("not a socket address: \"{listen}\""),
        );
    }

    for (name, command) in &config.workflows {
        if command.trim().is_empty() {
            push(
                diagnostics,
                Error,
                "workflow",
                format!("workflows.{name}"),
                "command is empty",
            );
        }
    }

    let mut seen = HashSet::new();
    for (i, job) in config.system_jobs.iter().enumerate() {
        let path = format!("system_jobs[{i}]");
        if job.name.trim().is_empty() {
            push(diagnostics, Error, "schedule", &path, "name is empty");
            continue;
        }
        if !seen.insert(job.name.as_str()) {
            push(
                diagnostics,
                Error,
                "schedule",
                &path,
                format!("duplicate system job \"{}\"", job.name),
            );
        }
        if job.frequency_secs == Some(0) {
            push(
                diagnostics,
                Error,
                "schedule",
                format!("{path}.frequency_secs"),
                "must be > 0",
            );
        }
        let workflow = job.workflow.as_deref().unwrap_or(&job.name);
        if !config.workflows.contains_key(workflow) {
            push(
                diagnostics,
                Warning,
                "workflow",
                &path,
                format!("workflow \"{workflow}\" is not defined under [workflows]"),
            );
        }
    }

    let names: Vec<&str> = config.system_jobs.iter().map(|j| j.name.as_str()).collect();
    for disabled in &cron.disabled_system_jobs {
        if !names.contains(&disabled.as_str()) {
            let hint = suggest(disabled, &names, 3)
                .map(|s| format!(" (did you mean \"{s}\"?)"))
                .unwrap_or_default();
            push(
                diagnostics,
                Error,
                "schedule",
                "cron.disabled_system_jobs",
                format!("unknown system job \"{disabled}\"{hint}"),
            );
        }
    }
}
