use std::{fs, path::PathBuf};

use sysinfo::{ProcessesToUpdate, System};
use tracing::debug;

/// Credentials handed off by the client on startup. Owned exclusively by the
/// session layer; everything else sees an opaque request-capable handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub process_id: u32,
    pub port: u16,
    pub secret: String,
    pub scheme: String,
}

impl Credentials {
    pub fn base_url(&self) -> String {
        format!("{}://127.0.0.1:{}", self.scheme, self.port)
    }

    pub fn websocket_url(&self) -> String {
        format!("wss://127.0.0.1:{}", self.port)
    }
}

/// Parses the single-line handoff file `name:pid:port:secret:scheme`.
/// Short or malformed content is treated as not-found.
pub fn parse_lockfile(text: &str) -> Option<Credentials> {
    let line = text.trim();
    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() < 5 {
        return None;
    }
    let process_id = fields[1].parse::<u32>().ok()?;
    let port = fields[2].parse::<u16>().ok()?;
    let secret = fields[3].to_owned();
    let scheme = fields[4].trim().to_owned();
    if secret.is_empty() || scheme.is_empty() {
        return None;
    }
    Some(Credentials {
        process_id,
        port,
        secret,
        scheme,
    })
}

/// Supplies candidate client install directories. Process detection is
/// OS-specific, so each port provides its own locator without leaking
/// platform detail into the session layer.
pub trait InstallLocator: Send + Sync {
    fn candidate_dirs(&self) -> Vec<PathBuf>;
}

/// Default locator: scan the process table for the client and extract its
/// `--install-directory=` argument, falling back to well-known paths.
pub struct ProcessScanLocator {
    process_names: Vec<String>,
    fallback_dirs: Vec<PathBuf>,
}

const CLIENT_PROCESS_NAMES: &[&str] = &["LeagueClientUx.exe", "LeagueClientUx"];

#[cfg(target_os = "windows")]
fn default_install_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("C:\\Riot Games\\League of Legends"),
        PathBuf::from("D:\\Riot Games\\League of Legends"),
    ]
}

#[cfg(target_os = "macos")]
fn default_install_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from(
        "/Applications/League of Legends.app/Contents/LoL",
    )]
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn default_install_dirs() -> Vec<PathBuf> {
    Vec::new()
}

impl Default for ProcessScanLocator {
    fn default() -> Self {
        Self {
            process_names: CLIENT_PROCESS_NAMES
                .iter()
                .map(|name| name.to_ascii_lowercase())
                .collect(),
            fallback_dirs: default_install_dirs(),
        }
    }
}

impl ProcessScanLocator {
    pub fn with_extra_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.fallback_dirs.extend(dirs);
        self
    }
}

impl InstallLocator for ProcessScanLocator {
    fn candidate_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        for process in system.processes().values() {
            let name = process.name().to_string_lossy().to_ascii_lowercase();
            if !self.process_names.iter().any(|candidate| *candidate == name) {
                continue;
            }
            for arg in process.cmd() {
                if let Some(dir) = parse_install_dir_arg(&arg.to_string_lossy()) {
                    debug!(dir = %dir.display(), "found install dir from process args");
                    dirs.push(dir);
                }
            }
        }
        dirs.extend(self.fallback_dirs.iter().cloned());
        dirs
    }
}

pub fn parse_install_dir_arg(arg: &str) -> Option<PathBuf> {
    let value = arg.strip_prefix("--install-directory=")?;
    let value = value.trim().trim_matches('"');
    if value.is_empty() {
        return None;
    }
    Some(PathBuf::from(value))
}

/// Locates and parses a handoff file under any candidate install dir.
pub fn discover_credentials(locator: &dyn InstallLocator) -> Option<Credentials> {
    for dir in locator.candidate_dirs() {
        let path = dir.join("lockfile");
        let Ok(text) = fs::read_to_string(&path) else {
            continue;
        };
        if let Some(credentials) = parse_lockfile(&text) {
            return Some(credentials);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{parse_install_dir_arg, parse_lockfile};

    #[test]
    fn parses_well_formed_lockfile() {
        let creds = parse_lockfile("LeagueClient:23308:52034:abcDEF123:https\n")
            .expect("expected lockfile parse");
        assert_eq!(creds.process_id, 23308);
        assert_eq!(creds.port, 52034);
        assert_eq!(creds.secret, "abcDEF123");
        assert_eq!(creds.scheme, "https");
        assert_eq!(creds.base_url(), "https://127.0.0.1:52034");
    }

    #[test]
    fn parse_is_idempotent_over_same_bytes() {
        let text = "LeagueClient:1:2999:s3cret:https";
        assert_eq!(parse_lockfile(text), parse_lockfile(text));
    }

    #[test]
    fn rejects_short_or_malformed_content() {
        assert!(parse_lockfile("").is_none());
        assert!(parse_lockfile("LeagueClient:23308:52034:secret").is_none());
        assert!(parse_lockfile("LeagueClient:nan:52034:secret:https").is_none());
        assert!(parse_lockfile("LeagueClient:1:notaport:secret:https").is_none());
        assert!(parse_lockfile("LeagueClient:1:2999::https").is_none());
    }

    #[test]
    fn accepts_secrets_containing_extra_colons_in_trailing_fields() {
        // Five or more fields: the secret and scheme positions are fixed.
        let creds = parse_lockfile("LeagueClient:1:2999:abc:https:extra")
            .expect("expected parse with trailing field");
        assert_eq!(creds.secret, "abc");
        assert_eq!(creds.scheme, "https");
    }

    #[test]
    fn extracts_install_directory_argument() {
        let dir = parse_install_dir_arg("--install-directory=C:\\Riot Games\\League of Legends")
            .expect("expected install dir");
        assert!(dir.to_string_lossy().contains("League of Legends"));
        assert!(parse_install_dir_arg("--region=EUW").is_none());
        assert!(parse_install_dir_arg("--install-directory=").is_none());
    }
}
