use super::*;
use serial_test::serial;
use tempfile::TempDir;

struct HomeGuard(Option<std::ffi::OsString>);

impl HomeGuard {
    fn set(value: &std::path::Path) -> Self {
        let previous = std::env::var_os(HOME_ENV_VAR);
        // SAFETY: tests touching the environment are serialised
        unsafe { std::env::set_var(HOME_ENV_VAR, value) };
        Self(previous)
    }
}

impl Drop for HomeGuard {
    fn drop(&mut self) {
        // SAFETY: tests touching the environment are serialised
        unsafe {
            match self.0.take() {
                Some(previous) => std::env::set_var(HOME_ENV_VAR, previous),
                None => std::env::remove_var(HOME_ENV_VAR),
            }
        }
    }
}

#[test]
#[serial]
fn home_env_var_overrides_config_dir() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    let _guard = HomeGuard::set(temp_dir.path());

    let dir = get_config_dir().expect("should resolve config dir");
    assert_eq!(dir, temp_dir.path());
}

#[test]
#[serial]
fn load_default_reads_from_env_dir() {
    let temp_dir = TempDir::new().expect("should create TempDir successfully");
    std::fs::write(
        temp_dir.path().join("config.toml"),
        "[ollama]\nmodel = \"mxbai-embed-large\"\n",
    )
    .expect("should write config");
    let _guard = HomeGuard::set(temp_dir.path());

    let config = Config::load_default().expect("should load config");
    assert_eq!(config.ollama.model, "mxbai-embed-large");
    assert_eq!(config.get_base_dir(), temp_dir.path());
}

#[test]
fn invalid_toml_handling() {
    let invalid_toml = r#"
        [ollama
        host = "localhost"
        port = "invalid_port"
    "#;

    let result: Result<Config, toml::de::Error> = toml::from_str(invalid_toml);
    assert!(result.is_err());
}
