//! Remote Environment Detector
//!
//! Commands run over the file-ops transport after connecting, and the
//! parsers for their output: OS fingerprint, package manager and git
//! branches. Running them is the session manager's job; this module only
//! builds command lines and reads results.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Single exec, busybox-safe. Sections are delimited by markers so stray
/// login banners on stdout do not confuse the parser.
pub const OS_PROBE_CMD: &str = "echo '===UNAME==='; uname -s 2>/dev/null; echo '===RELEASE==='; cat /etc/*release 2>/dev/null; echo '===END==='";

pub const APT_PROBE_CMD: &str = "command -v apt-get";

pub const HOME_CMD: &str = "echo $HOME";

/// Detected remote operating system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteOs {
    /// "Linux", "macOS", "FreeBSD", "Windows_MinGW", "Unknown", ...
    pub os_type: String,

    /// Distribution name from the release files, e.g. "Ubuntu 22.04.3 LTS"
    pub pretty_name: Option<String>,
}

impl RemoteOs {
    pub fn unknown() -> Self {
        Self {
            os_type: "Unknown".to_string(),
            pretty_name: None,
        }
    }

    /// The string cached on the endpoint record
    pub fn fingerprint(&self) -> String {
        self.pretty_name
            .clone()
            .unwrap_or_else(|| self.os_type.clone())
    }
}

/// Parse the output of [`OS_PROBE_CMD`].
pub fn parse_os_probe(output: &str) -> RemoteOs {
    let Some(uname) = extract_section(output, "===UNAME===", "===RELEASE===") else {
        return RemoteOs::unknown();
    };
    let os_type = classify_unix_os(&uname);

    let release = extract_section(output, "===RELEASE===", "===END===").unwrap_or_default();
    let pretty_name = extract_os_release_field(&release, "PRETTY_NAME")
        .or_else(|| extract_os_release_field(&release, "DISTRIB_DESCRIPTION"))
        .or_else(|| extract_os_release_field(&release, "NAME"))
        .or_else(|| {
            // Old-style single line files such as /etc/redhat-release
            release
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty() && !l.contains('='))
                .map(str::to_string)
        });

    debug!("OS probe: os_type={}, pretty_name={:?}", os_type, pretty_name);
    RemoteOs {
        os_type,
        pretty_name,
    }
}

/// Classify a `uname -s` output, handling Windows-like environments.
pub fn classify_unix_os(uname_s: &str) -> String {
    let s = uname_s.trim();
    let upper = s.to_uppercase();

    if upper.starts_with("MINGW32") || upper.starts_with("MINGW64") {
        return "Windows_MinGW".to_string();
    }
    if upper.starts_with("MSYS") {
        return "Windows_MSYS".to_string();
    }
    if upper.starts_with("CYGWIN") {
        return "Windows_Cygwin".to_string();
    }

    match s {
        "Darwin" => "macOS".to_string(),
        "" | "unknown" => "Unknown".to_string(),
        // Linux, FreeBSD, OpenBSD, SunOS ... as reported
        other => other.to_string(),
    }
}

/// `command -v apt-get` prints the binary path only when apt exists
pub fn has_apt(output: &str) -> bool {
    !output.trim().is_empty()
}

/// One line of `git branch`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitBranch {
    pub name: String,
    /// Marked with `*`
    pub current: bool,
}

pub fn git_branches_cmd(repo: &str) -> String {
    format!("git -C {} branch", shell_quote(repo))
}

/// Parse `git branch` output
pub fn parse_git_branches(output: &str) -> Vec<GitBranch> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            let (current, name) = match line.strip_prefix('*') {
                Some(rest) => (true, rest.trim()),
                None => (false, line.trim()),
            };
            (!name.is_empty()).then(|| GitBranch {
                name: name.to_string(),
                current,
            })
        })
        .collect()
}

/// Quote for a POSIX shell: `it's` becomes `'it'\''s'`
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn extract_section(text: &str, start_marker: &str, end_marker: &str) -> Option<String> {
    let start = text.find(start_marker)?;
    let after_start = start + start_marker.len();
    let end = text[after_start..].find(end_marker)?;
    Some(text[after_start..after_start + end].to_string())
}

/// `KEY="value"` or `KEY=value`
fn extract_os_release_field(content: &str, field: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let value = line.trim().strip_prefix(field)?.strip_prefix('=')?;
        let cleaned = value.trim().trim_matches('"').trim();
        (!cleaned.is_empty()).then(|| cleaned.to_string())
    })
}
