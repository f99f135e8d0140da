//! Per-host fact gathering.
//!
//! Facts drive provider selection and `when` predicates. They are derived
//! from a single probe command run over the host's session (the same probe
//! works for the local shortcut) and cached per host for the lifetime of
//! the run.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::SessionError;
use crate::ssh::{ExecOptions, Session};

/// Fact keys the engine guarantees to populate.
pub const FACT_OS: &str = "os";
pub const FACT_OS_FAMILY: &str = "os_family";
pub const FACT_ARCH: &str = "arch";
pub const FACT_HOSTNAME: &str = "hostname";
pub const FACT_CPU_COUNT: &str = "cpu_count";
pub const FACT_MEMORY_MB: &str = "memory_mb";
pub const FACT_KERNEL_VERSION: &str = "kernel_version";
pub const FACT_USER: &str = "user";

/// Key/value observations about one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Facts {
    values: BTreeMap<String, String>,
}

impl Facts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn os(&self) -> &str {
        self.get(FACT_OS).unwrap_or("unknown")
    }

    pub fn os_family(&self) -> &str {
        self.get(FACT_OS_FAMILY).unwrap_or("unknown")
    }

    pub fn arch(&self) -> &str {
        self.get(FACT_ARCH).unwrap_or("unknown")
    }

    /// Whether the host runs a unix-like OS (file/directory provider gate).
    pub fn is_unix_like(&self) -> bool {
        matches!(
            self.os(),
            "linux" | "darwin" | "freebsd" | "openbsd" | "netbsd"
        ) || matches!(
            self.os_family(),
            "debian" | "rhel" | "arch" | "alpine" | "darwin" | "freebsd"
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    /// Facts as a JSON object for template rendering contexts.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.values
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect(),
        )
    }

    /// Convenience constructor used widely in tests.
    pub fn for_os(os: &str, family: &str) -> Self {
        let mut facts = Facts::new();
        facts.insert(FACT_OS, os);
        facts.insert(FACT_OS_FAMILY, family);
        facts.insert(FACT_ARCH, "x86_64");
        facts
    }
}

/// Single probe covering every fact; runs under plain `sh`.
const PROBE: &str = r#"echo "os=$(uname -s)"
echo "arch=$(uname -m)"
echo "kernel=$(uname -r)"
echo "hostname=$(hostname 2>/dev/null || uname -n)"
echo "user=$(id -un)"
echo "cpus=$(nproc 2>/dev/null || sysctl -n hw.ncpu 2>/dev/null || echo 0)"
echo "mem_kb=$(awk '/MemTotal/ {print $2}' /proc/meminfo 2>/dev/null || echo 0)"
echo "mem_bytes=$(sysctl -n hw.memsize 2>/dev/null || echo 0)"
echo "---"
cat /etc/os-release 2>/dev/null || true"#;

/// Gathers facts for the host behind `session`.
pub async fn gather(session: &dyn Session) -> Result<Facts, SessionError> {
    let output = session.exec(PROBE, &ExecOptions::default()).await?;
    if !output.success() {
        return Err(SessionError::Exec(format!(
            "fact probe exited {}: {}",
            output.exit_code,
            output.combined()
        )));
    }
    Ok(parse_probe_output(&output.stdout))
}

fn parse_probe_output(raw: &str) -> Facts {
    let mut facts = Facts::new();
    let (head, os_release) = match raw.split_once("---") {
        Some((head, tail)) => (head, tail),
        None => (raw, ""),
    };

    let mut os = "unknown".to_string();
    for line in head.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key {
            "os" => os = normalize_os(value).to_string(),
            "arch" => facts.insert(FACT_ARCH, normalize_arch(value)),
            "kernel" => facts.insert(FACT_KERNEL_VERSION, value),
            "hostname" => facts.insert(FACT_HOSTNAME, value),
            "user" => facts.insert(FACT_USER, value),
            "cpus" => facts.insert(FACT_CPU_COUNT, value.parse::<u32>().unwrap_or(0).to_string()),
            "mem_kb" => {
                let kb: u64 = value.parse().unwrap_or(0);
                if kb > 0 {
                    facts.insert(FACT_MEMORY_MB, (kb / 1024).to_string());
                }
            }
            "mem_bytes" => {
                let bytes: u64 = value.parse().unwrap_or(0);
                if bytes > 0 && facts.get(FACT_MEMORY_MB).is_none() {
                    facts.insert(FACT_MEMORY_MB, (bytes / 1024 / 1024).to_string());
                }
            }
            _ => {}
        }
    }
    if facts.get(FACT_MEMORY_MB).is_none() {
        facts.insert(FACT_MEMORY_MB, "0");
    }

    facts.insert(FACT_OS, os.clone());
    facts.insert(FACT_OS_FAMILY, derive_family(&os, os_release));
    facts
}

fn normalize_os(raw: &str) -> &'static str {
    match raw.trim() {
        "Linux" => "linux",
        "Darwin" => "darwin",
        "FreeBSD" => "freebsd",
        "OpenBSD" => "openbsd",
        "NetBSD" => "netbsd",
        s if s.starts_with("CYGWIN") || s.starts_with("MINGW") || s.starts_with("Windows") => {
            "windows"
        }
        _ => "unknown",
    }
}

fn normalize_arch(raw: &str) -> &'static str {
    match raw.trim() {
        "x86_64" | "amd64" => "x86_64",
        "aarch64" | "arm64" => "aarch64",
        s if s.starts_with("arm") => "arm",
        _ => "unknown",
    }
}

/// Maps os-release IDs onto the engine's family set.
fn derive_family(os: &str, os_release: &str) -> String {
    match os {
        "darwin" => return "darwin".to_string(),
        "freebsd" => return "freebsd".to_string(),
        "linux" => {}
        _ => return "unknown".to_string(),
    }

    let mut id = String::new();
    let mut id_like = String::new();
    for line in os_release.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = value.trim_matches('"').to_lowercase();
        } else if let Some(value) = line.strip_prefix("ID_LIKE=") {
            id_like = value.trim_matches('"').to_lowercase();
        }
    }

    let mentions = |needle: &str| id == needle || id_like.split_whitespace().any(|s| s == needle);

    if mentions("debian") || id == "ubuntu" {
        "debian".to_string()
    } else if mentions("rhel") || mentions("fedora") || id == "centos" {
        "rhel".to_string()
    } else if mentions("arch") {
        "arch".to_string()
    } else if id == "alpine" {
        "alpine".to_string()
    } else {
        "unknown".to_string()
    }
}

/// Per-host fact cache, alive for one run.
#[derive(Default)]
pub struct FactCache {
    inner: Mutex<HashMap<String, Arc<Facts>>>,
}

impl FactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns cached facts for `host_id`, probing through `session` on
    /// the first request.
    pub async fn get_or_gather(
        &self,
        host_id: &str,
        session: &dyn Session,
    ) -> Result<Arc<Facts>, SessionError> {
        {
            let cache = self.inner.lock().await;
            if let Some(facts) = cache.get(host_id) {
                return Ok(Arc::clone(facts));
            }
        }

        let facts = Arc::new(gather(session).await?);
        debug!(host = %host_id, os = %facts.os(), family = %facts.os_family(), "Gathered facts");
        self.inner
            .lock()
            .await
            .insert(host_id.to_string(), Arc::clone(&facts));
        Ok(facts)
    }

    /// Pre-seeds the cache; used by tests and check-mode planning.
    pub async fn seed(&self, host_id: &str, facts: Facts) {
        self.inner
            .lock()
            .await
            .insert(host_id.to_string(), Arc::new(facts));
    }
}
