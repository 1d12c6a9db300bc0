//! Static service registry: maps URL hosts and aliases to adapters.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::service::adapters;
use crate::service::{ServiceAdapter, ServiceError, ServiceResult};

const EMBEDDED_REGISTRY: &str = include_str!("services.json");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    #[serde(default)]
    pub alias: Vec<String>,
    pub hosts: Vec<String>,
    #[serde(default)]
    pub api: Option<String>,
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub cookies: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    services: Vec<RegistryEntry>,
}

#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    entries: Vec<RegistryEntry>,
}

impl ServiceRegistry {
    /// Loads `utils/settings/services.json`, falling back to the registry
    /// compiled into the binary.
    pub fn load(path: &Path) -> ServiceResult<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => EMBEDDED_REGISTRY.to_string(),
        };
        let file: RegistryFile =
            serde_json::from_str(&raw).map_err(|err| ServiceError::Payload {
                service: "registry",
                detail: err.to_string(),
            })?;
        Ok(Self {
            entries: file.services,
        })
    }

    pub fn builtin() -> Self {
        let file: RegistryFile =
            serde_json::from_str(EMBEDDED_REGISTRY).expect("embedded registry is valid");
        Self {
            entries: file.services,
        }
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Resolves a catalog/episode URL to its registry entry by host.
    pub fn match_url(&self, url: &str) -> Option<&RegistryEntry> {
        let parsed = url::Url::parse(url).ok()?;
        let host = parsed.host_str()?;
        self.entries.iter().find(|entry| {
            entry.hosts.iter().any(|candidate| {
                host.eq_ignore_ascii_case(candidate)
                    || host
                        .to_ascii_lowercase()
                        .ends_with(&format!(".{}", candidate.to_ascii_lowercase()))
            })
        })
    }

    pub fn by_alias(&self, alias: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|entry| {
            entry.name.eq_ignore_ascii_case(alias)
                || entry
                    .alias
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(alias))
        })
    }
}

/// Filesystem layout for one service under the project root.
#[derive(Debug, Clone)]
pub struct ServicePaths {
    pub root: PathBuf,
}

impl ServicePaths {
    pub fn new(base_dir: &Path, service: &str) -> Self {
        Self {
            root: base_dir.join("services").join(service),
        }
    }

    pub fn config(&self) -> PathBuf {
        self.root.join("config.yaml")
    }

    pub fn profile(&self) -> PathBuf {
        self.root.join("profile.yaml")
    }

    pub fn cookies(&self) -> PathBuf {
        self.root.join("cookies.txt")
    }

    pub fn cache(&self) -> PathBuf {
        self.root.join("cache.json")
    }
}

/// Constructs the adapter for a registry entry.
pub fn build_adapter(
    entry: &RegistryEntry,
    base_dir: &Path,
) -> ServiceResult<Arc<dyn ServiceAdapter>> {
    let paths = ServicePaths::new(base_dir, &entry.name);
    let adapter: Arc<dyn ServiceAdapter> = match entry.name.as_str() {
        "ctv" => Arc::new(adapters::ctv::CtvAdapter::new()),
        "pluto" => Arc::new(adapters::pluto::PlutoAdapter::new()),
        "tubi" => Arc::new(adapters::tubi::TubiAdapter::new(paths.cookies())),
        "roku" => Arc::new(adapters::roku::RokuAdapter::new()),
        "crackle" => Arc::new(adapters::crackle::CrackleAdapter::new()),
        "uktvplay" => Arc::new(adapters::uktvplay::UktvPlayAdapter::new()),
        "stv" => Arc::new(adapters::stv::StvAdapter::new()),
        "gem" => Arc::new(adapters::gem::GemAdapter::new(paths.profile())),
        other => {
            return Err(ServiceError::BadUrl(format!(
                "no adapter registered for service {other}"
            )))
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_matches_hosts_and_aliases() {
        let registry = ServiceRegistry::builtin();
        assert_eq!(
            registry
                .match_url("https://www.ctv.ca/shows/the-name")
                .map(|e| e.name.as_str()),
            Some("ctv")
        );
        assert_eq!(
            registry
                .match_url("https://pluto.tv/en/on-demand/series/dr-who")
                .map(|e| e.name.as_str()),
            Some("pluto")
        );
        assert!(registry.match_url("https://example.com/video").is_none());
        assert!(registry.match_url("not a url").is_none());

        assert_eq!(
            registry.by_alias("TubiTV").map(|e| e.name.as_str()),
            Some("tubi")
        );
        assert!(registry.by_alias("netflix").is_none());
    }

    #[test]
    fn disk_registry_wins_over_embedded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        fs::write(
            &path,
            r#"{"services":[{"name":"ctv","hosts":["ctv.example"]}]}"#,
        )
        .unwrap();
        let registry = ServiceRegistry::load(&path).unwrap();
        assert_eq!(registry.entries().len(), 1);
        assert!(registry.match_url("https://ctv.example/shows/x").is_some());
    }

    #[test]
    fn adapters_build_for_every_registry_entry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ServiceRegistry::builtin();
        for entry in registry.entries() {
            let adapter = build_adapter(entry, dir.path()).unwrap();
            assert_eq!(adapter.name(), entry.name);
        }
    }
}
