//! Pure accessors for host identification: OS details, probe runtime id,
//! and the host program's argv. These feed wire-format headers only and
//! never fail; unknown values degrade to placeholders.

use std::path::Path;

/// OS name for the `probed-os` header.
pub fn os_name() -> String {
    read_os_release("PRETTY_NAME").unwrap_or_else(|| std::env::consts::OS.to_string())
}

/// Identifier of the probe runtime for `probed-runtime` and `Blackfire-Probe`.
pub fn runtime_id() -> String {
    match option_env!("RUSTC_VERSION") {
        Some(v) => v.to_string(),
        None => format!("rust-{}", env!("CARGO_PKG_VERSION")),
    }
}

/// Key/value pairs for the `os-version` agent header:
/// family, arch, id, version, plus codename and build when known.
pub fn os_version_pairs() -> Vec<(&'static str, String)> {
    let mut pairs = vec![
        ("family", std::env::consts::FAMILY.to_string()),
        ("arch", std::env::consts::ARCH.to_string()),
        ("id", std::env::consts::OS.to_string()),
        (
            "version",
            read_os_release("VERSION_ID").unwrap_or_else(|| "unknown".to_string()),
        ),
    ];

    if let Some(codename) = read_os_release("VERSION_CODENAME") {
        pairs.push(("codename", codename));
    }
    if let Some(build) = read_os_release("BUILD_ID") {
        pairs.push(("build", build));
    }

    pairs
}

/// The host program's argv, for the `Context` header.
pub fn host_args() -> Vec<String> {
    std::env::args().collect()
}

/// Basename of the host executable without extension, used as the prefix of
/// pprof dump files.
pub fn exe_basename() -> String {
    std::env::current_exe()
        .ok()
        .as_deref()
        .and_then(Path::file_stem)
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "rust-unknown".to_string())
}

/// Look up a key in /etc/os-release. Returns None off Linux or when absent.
fn read_os_release(key: &str) -> Option<String> {
    if !cfg!(target_os = "linux") {
        return None;
    }

    let data = std::fs::read_to_string("/etc/os-release").ok()?;
    for line in data.lines() {
        if let Some(value) = line.strip_prefix(key).and_then(|r| r.strip_prefix('=')) {
            return Some(value.trim_matches('"').to_string());
        }
    }
    None
}
