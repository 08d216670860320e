use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoachConfig {
    pub region: String,
    pub routing: String,
    pub llm_model: String,
    pub soft_throttle_ceiling: usize,
    pub telemetry_channel_capacity: usize,
    #[serde(default)]
    pub extra_install_dirs: Vec<PathBuf>,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            region: "na1".to_owned(),
            routing: "americas".to_owned(),
            llm_model: "claude-sonnet-4-20250514".to_owned(),
            soft_throttle_ceiling: 100,
            telemetry_channel_capacity: 8,
            extra_install_dirs: Vec::new(),
        }
    }
}

impl CoachConfig {
    pub fn load_or_create() -> Result<(Self, PathBuf)> {
        let config_dir = dirs::config_dir()
            .context("unable to locate OS config directory")?
            .join("rift-coach");
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("failed creating config dir at {}", config_dir.display()))?;

        let config_path = config_dir.join("config.json");
        if !config_path.exists() {
            let default = Self::default();
            default.save(&config_path)?;
            return Ok((default, config_path));
        }

        let text = fs::read_to_string(&config_path)
            .with_context(|| format!("failed reading {}", config_path.display()))?;
        let config = serde_json::from_str::<Self>(&text)
            .with_context(|| format!("invalid json in {}", config_path.display()))?;
        Ok((config, config_path))
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let payload = serde_json::to_string_pretty(self).context("failed serializing config")?;
        fs::write(path, payload).with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }
}

pub fn env_or_dotenv(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key)
        .ok()
        .or_else(|| dotenv.get(key).cloned())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

pub fn load_dotenv_fallback() -> HashMap<String, String> {
    for path in dotenv_candidate_paths() {
        if !path.is_file() {
            continue;
        }
        match parse_dotenv_file(&path) {
            Ok(values) => {
                info!(path = %path.display(), entries = values.len(), "loaded .env fallback");
                return values;
            }
            Err(err) => {
                warn!(?err, path = %path.display(), "failed parsing .env fallback file");
            }
        }
    }
    HashMap::new()
}

fn dotenv_candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".env"));
        paths.push(cwd.join("..").join(".env"));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            paths.push(exe_dir.join(".env"));
            paths.push(exe_dir.join("..").join(".env"));
        }
    }
    paths
}

fn parse_dotenv_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    let text =
        fs::read_to_string(path).with_context(|| format!("failed reading {}", path.display()))?;
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"').trim_matches('\'').to_owned();
        out.insert(key.to_owned(), value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::{fs, path::PathBuf, time::SystemTime};

    use super::{parse_dotenv_file, CoachConfig};

    #[test]
    fn parses_partial_config_with_defaults() {
        let raw = r#"{
            "region": "euw1",
            "routing": "europe"
        }"#;
        let parsed: CoachConfig = serde_json::from_str(raw).expect("config should parse");
        assert_eq!(parsed.region, "euw1");
        assert_eq!(parsed.routing, "europe");
        assert_eq!(parsed.soft_throttle_ceiling, 100);
        assert_eq!(parsed.telemetry_channel_capacity, 8);
        assert!(parsed.extra_install_dirs.is_empty());
    }

    #[test]
    fn parse_dotenv_supports_comments_export_and_quotes() {
        let unique = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("clock should be valid")
            .as_nanos();
        let path: PathBuf = std::env::temp_dir().join(format!("rift_coach_env_{unique}.env"));
        let body = r#"
# comment
export RIOT_API_KEY=RGAPI-abc123
RIOT_REGION="euw1"
EMPTY=
"#;
        fs::write(&path, body).expect("should write temp env file");
        let parsed = parse_dotenv_file(&path).expect("should parse dotenv");
        fs::remove_file(&path).ok();

        assert_eq!(
            parsed.get("RIOT_API_KEY").map(String::as_str),
            Some("RGAPI-abc123")
        );
        assert_eq!(parsed.get("RIOT_REGION").map(String::as_str), Some("euw1"));
        assert_eq!(parsed.get("EMPTY").map(String::as_str), Some(""));
    }
}
