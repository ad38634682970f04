//! Import and call policy for generated scripts.
//!
//! The deny/allow lists live here as data, in one versioned table, so they
//! can be audited and tested independently of the validator walk. The
//! validator asks [`ImportPolicy::decide`] for every imported symbol and
//! fails closed: anything not explicitly allowed is rejected.

use std::collections::BTreeSet;

use crate::config::PolicyConfig;

/// Bumped whenever the builtin tables change.
pub const POLICY_VERSION: u32 = 1;

/// Module symbols that generated scripts may import.
/// Data processing, HTTP clients, cloud storage, and a safe stdlib subset.
const ALLOWED_IMPORTS: &[&str] = &[
    // Data processing
    "pandas",
    "numpy",
    "pyarrow",
    // Cloud storage
    "boto3",
    "botocore",
    // HTTP
    "requests",
    "urllib",
    "urllib3",
    "http",
    // Standard library, safe subset
    "json",
    "csv",
    "datetime",
    "time",
    "re",
    "typing",
    "io",
    "pathlib",
    "collections",
    "itertools",
    "functools",
    "math",
    "statistics",
    "decimal",
    "fractions",
    "hashlib",
    "uuid",
    "base64",
    "logging",
    // Needed for os.environ (grant URLs are delivered via env vars).
    // os.system / os.popen are still rejected by the call gate and by
    // the deny prefix on "from os import system".
    "os",
];

/// Module symbols that are always rejected, matched exactly or as a
/// dotted prefix ("os.system" also rejects "os.system.x").
const DENIED_IMPORTS: &[&str] = &[
    // Process spawning
    "os.system",
    "subprocess",
    "pty",
    "tty",
    // Dynamic evaluation / import machinery
    "eval",
    "exec",
    "compile",
    "__import__",
    "importlib",
    "code",
    "codeop",
    // Raw network primitives (the HTTP client modules are the sanctioned path)
    "socket",
    "telnetlib",
    "ftplib",
    "smtplib",
    // Insecure deserialization
    "pickle",
    "shelve",
    "marshal",
    // Foreign function interfaces
    "ctypes",
    "cffi",
];

/// Calls that invalidate the script outright.
const DENIED_CALLS: &[&str] = &["eval", "exec", "compile", "__import__", "input"];

/// Calls surfaced as warnings but not by themselves invalidating.
/// File I/O is common in pipeline scripts and not inherently dangerous.
const WARNED_CALLS: &[&str] = &["open"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny,
    /// Not on either list. The validator treats this as denied.
    Unknown,
}

/// The loaded policy table. Built once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct ImportPolicy {
    pub version: u32,
    allowed: BTreeSet<String>,
    denied: BTreeSet<String>,
}

impl ImportPolicy {
    /// Builtin tables only.
    pub fn builtin() -> Self {
        Self {
            version: POLICY_VERSION,
            allowed: ALLOWED_IMPORTS.iter().map(|s| s.to_string()).collect(),
            denied: DENIED_IMPORTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Builtin tables extended by the `[policy]` config section.
    /// Deny entries win over allow entries on conflict.
    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut policy = Self::builtin();
        policy.allowed.extend(config.allow_extra.iter().cloned());
        policy.denied.extend(config.deny_extra.iter().cloned());
        policy
    }

    /// Classifies one imported symbol (a module name or dotted path).
    pub fn decide(&self, symbol: &str) -> PolicyDecision {
        if symbol.is_empty() {
            return PolicyDecision::Unknown;
        }
        // Deny on exact match or dotted prefix, checked before the allow
        // list so "os.system" stays denied even if "os" were ever allowed.
        for denied in &self.denied {
            if symbol == denied || symbol.starts_with(&format!("{denied}.")) {
                return PolicyDecision::Deny;
            }
        }
        // Allow on exact match of the symbol or of its base module,
        // or when a dotted allow entry prefixes the symbol ("os.path.join").
        if self.allowed.contains(symbol) {
            return PolicyDecision::Allow;
        }
        let base = symbol.split('.').next().unwrap_or(symbol);
        if self.allowed.contains(base) {
            return PolicyDecision::Allow;
        }
        for allowed in &self.allowed {
            if symbol.starts_with(&format!("{allowed}.")) {
                return PolicyDecision::Allow;
            }
        }
        PolicyDecision::Unknown
    }

    /// True for call targets that invalidate the script.
    /// Covers the fixed table plus system/popen-style names.
    pub fn is_denied_call(&self, func_name: &str) -> bool {
        if DENIED_CALLS.contains(&func_name) {
            return true;
        }
        let lower = func_name.to_lowercase();
        lower.contains("system") || lower.contains("popen")
    }

    /// True for call targets surfaced as warnings only.
    pub fn is_warned_call(&self, func_name: &str) -> bool {
        WARNED_CALLS.contains(&func_name)
    }
}
