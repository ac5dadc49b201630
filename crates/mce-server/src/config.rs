//! Boot configuration (C12): an INI file with four sections, parsed into a
//! typed, validated [`BootConfig`] at process start (§6, §4.11).

use anyhow::{bail, Context, Result};
use ini::Ini;

const DEFAULT_CHECK_INTERVAL: u64 = 600;
const DEFAULT_LISTEN: &str = "0.0.0.0:8085";

/// `[engine_url]` — connection parameters for the store. Only `database` is
/// interpreted today (the SQLite file path); the rest are retained so a
/// future non-SQLite backend can reuse this section unchanged.
#[derive(Clone, Debug)]
pub struct EngineUrl {
    pub driver: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub database: String,
}

#[derive(Clone, Debug, Default)]
pub struct BootConfig {
    pub engine_url: EngineUrl,
    /// `[engine_url_query]` — driver-specific query parameters, retained verbatim.
    pub engine_url_query: Vec<(String, String)>,
    /// `[engine_other_params]` — store-constructor parameters, retained verbatim
    /// (literal parsing, e.g. `pool_size = 8`, is left to the store backend).
    pub engine_other_params: Vec<(String, String)>,
    pub check_interval: u64,
    pub listen: String,
    /// `[other]` keys besides `check_interval`, retained but not interpreted.
    pub other_hints: Vec<(String, String)>,
}

impl Default for EngineUrl {
    fn default() -> Self {
        EngineUrl {
            driver: None,
            user: None,
            password: None,
            host: None,
            port: None,
            database: String::new(),
        }
    }
}

impl BootConfig {
    /// Loads and validates `path`. Fails with a descriptive error (never a
    /// panic) if the file is missing, malformed, or lacks the required
    /// `[engine_url]` `database` key.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let ini = Ini::load_from_file(path).with_context(|| format!("failed to read boot config at {}", path.display()))?;

        let engine_url_section = ini.section(Some("engine_url")).with_context(|| "boot config is missing the [engine_url] section")?;
        let database = engine_url_section
            .get("database")
            .with_context(|| "boot config [engine_url] is missing the required 'database' key")?
            .to_string();

        let engine_url = EngineUrl {
            driver: engine_url_section.get("driver").map(str::to_string),
            user: engine_url_section.get("user").map(str::to_string),
            password: engine_url_section.get("password").map(str::to_string),
            host: engine_url_section.get("host").map(str::to_string),
            port: engine_url_section.get("port").map(str::to_string),
            database,
        };

        let engine_url_query = section_pairs(&ini, "engine_url_query");
        let engine_other_params = section_pairs(&ini, "engine_other_params");
        let other = section_pairs(&ini, "other");

        let check_interval = other
            .iter()
            .find(|(k, _)| k == "check_interval")
            .map(|(_, v)| v.parse::<u64>())
            .transpose()
            .context("[other] check_interval must be a positive integer")?
            .unwrap_or(DEFAULT_CHECK_INTERVAL);

        let listen = other.iter().find(|(k, _)| k == "listen").map(|(_, v)| v.clone()).unwrap_or_else(|| DEFAULT_LISTEN.to_string());

        let other_hints = other.into_iter().filter(|(k, _)| k != "check_interval" && k != "listen").collect();

        Ok(BootConfig {
            engine_url,
            engine_url_query,
            engine_other_params,
            check_interval,
            listen,
            other_hints,
        })
    }

    pub fn with_listen_override(mut self, listen: Option<String>) -> Result<Self> {
        if let Some(listen) = listen {
            if listen.split(':').count() != 2 {
                bail!("listen address must be host:port, got {listen}");
            }
            self.listen = listen;
        }
        Ok(self)
    }
}

fn section_pairs(ini: &Ini, name: &str) -> Vec<(String, String)> {
    ini.section(Some(name))
        .map(|s| s.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_ini(contents: &str) -> tempfile_like::TempIni {
        tempfile_like::TempIni::new(contents)
    }

    // A tiny stand-in for `tempfile` to keep the dev-dependency surface
    // minimal; writes under the OS temp dir and cleans up on drop.
    mod tempfile_like {
        use std::fs::File;
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicU64, Ordering};

        static COUNTER: AtomicU64 = AtomicU64::new(0);

        pub struct TempIni {
            pub path: PathBuf,
        }

        impl TempIni {
            pub fn new(contents: &str) -> Self {
                let n = COUNTER.fetch_add(1, Ordering::Relaxed);
                let path = std::env::temp_dir().join(format!("mce-boot-test-{}-{n}.ini", std::process::id()));
                let mut f = File::create(&path).unwrap();
                use std::io::Write;
                f.write_all(contents.as_bytes()).unwrap();
                Self { path }
            }
        }

        impl Drop for TempIni {
            fn drop(&mut self) {
                let _ = std::fs::remove_file(&self.path);
            }
        }
    }

    #[test]
    fn loads_minimal_valid_config() {
        let ini = write_ini(
            "[engine_url]\ndatabase = /tmp/mce.sqlite\n",
        );
        let cfg = BootConfig::load(&ini.path).unwrap();
        assert_eq!(cfg.engine_url.database, "/tmp/mce.sqlite");
        assert_eq!(cfg.check_interval, DEFAULT_CHECK_INTERVAL);
        assert_eq!(cfg.listen, DEFAULT_LISTEN);
    }

    #[test]
    fn missing_database_key_fails() {
        let ini = write_ini("[engine_url]\ndriver = sqlite\n");
        let err = BootConfig::load(&ini.path).unwrap_err();
        assert!(err.to_string().contains("database"));
    }

    #[test]
    fn missing_engine_url_section_fails() {
        let ini = write_ini("[other]\ncheck_interval = 60\n");
        let err = BootConfig::load(&ini.path).unwrap_err();
        assert!(err.to_string().contains("engine_url"));
    }

    #[test]
    fn custom_check_interval_and_listen_are_honored() {
        let ini = write_ini("[engine_url]\ndatabase = x.db\n\n[other]\ncheck_interval = 30\nlisten = 127.0.0.1:9090\n");
        let cfg = BootConfig::load(&ini.path).unwrap();
        assert_eq!(cfg.check_interval, 30);
        assert_eq!(cfg.listen, "127.0.0.1:9090");
    }

    #[test]
    fn listen_override_replaces_config_value() {
        let ini = write_ini("[engine_url]\ndatabase = x.db\n");
        let cfg = BootConfig::load(&ini.path).unwrap().with_listen_override(Some("0.0.0.0:1234".to_string())).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:1234");
    }
}
