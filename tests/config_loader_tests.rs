use integrations::config::{ConfigError, ConfigLoader};
use integrations::models::ProviderType;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
use tempfile::TempDir;

const VALID_KEY: &str = "YWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWFhYWE=";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    unsafe {
        env::remove_var("INTEGRATIONS_PROFILE");
        env::remove_var("INTEGRATIONS_LOG_LEVEL");
        env::remove_var("INTEGRATIONS_CRYPTO_KEY");
        env::remove_var("INTEGRATIONS_SYNC_MAX_ATTEMPTS");
        env::remove_var("INTEGRATIONS_SCHEDULER_JITTER_PCT_MIN");
        env::remove_var("INTEGRATIONS_SCHEDULER_JITTER_PCT_MAX");
        env::remove_var("INTEGRATIONS_OAUTH_GITHUB_CLIENT_ID");
        env::remove_var("INTEGRATIONS_OAUTH_GITHUB_CLIENT_SECRET");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

fn loader_for(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.log_format, "json");
    assert!(cfg.crypto_key.is_none());
    assert_eq!(cfg.sync.max_attempts, 3);
    assert_eq!(cfg.breaker.failure_threshold, 5);
    assert_eq!(cfg.breaker.reset_seconds, 600);
    assert!(cfg.oauth_clients.is_empty());
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INTEGRATIONS_LOG_LEVEL=warn\n");
    write_env_file(&temp_dir, ".env.test", "INTEGRATIONS_LOG_LEVEL=debug\n");
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "INTEGRATIONS_LOG_LEVEL=trace\nINTEGRATIONS_SYNC_MAX_ATTEMPTS=5\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        &format!(
            "INTEGRATIONS_PROFILE=test\nINTEGRATIONS_LOG_LEVEL=error\nINTEGRATIONS_CRYPTO_KEY={VALID_KEY}\n"
        ),
    );

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.log_level, "trace");
    assert_eq!(cfg.sync.max_attempts, 5);
    assert_eq!(cfg.crypto_key.as_deref().map(<[u8]>::len), Some(32));
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "INTEGRATIONS_LOG_LEVEL=warn\nINTEGRATIONS_SYNC_MAX_ATTEMPTS=2\n",
    );

    unsafe {
        env::set_var("INTEGRATIONS_LOG_LEVEL", "debug");
        env::set_var("INTEGRATIONS_CRYPTO_KEY", VALID_KEY);
    }

    let cfg = loader_for(&temp_dir)
        .load()
        .expect("config loads with env override");
    assert_eq!(cfg.log_level, "debug");
    assert_eq!(cfg.sync.max_attempts, 2);

    clear_env();
}

#[test]
fn unprefixed_keys_are_ignored() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "LOG_LEVEL=trace\nSYNC_MAX_ATTEMPTS=9\n");

    let cfg = loader_for(&temp_dir).load().expect("config loads");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.sync.max_attempts, 3);
    clear_env();
}

#[test]
fn missing_crypto_key_fails_outside_local_profiles() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("INTEGRATIONS_PROFILE", "prod");
    }

    let err = loader_for(&temp_dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::MissingCryptoKey { ref profile } if profile == "prod"));
    clear_env();
}

#[test]
fn invalid_crypto_key_base64_returns_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        env::set_var("INTEGRATIONS_CRYPTO_KEY", "not base64!!");
    }

    let err = loader_for(&temp_dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidCryptoKeyBase64 { .. }));
    clear_env();
}

#[test]
fn short_crypto_key_returns_length_error() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    unsafe {
        // "short" encodes five bytes.
        env::set_var("INTEGRATIONS_CRYPTO_KEY", "c2hvcnQ=");
    }

    let err = loader_for(&temp_dir).load().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidCryptoKeyLength { length: 5 }));
    clear_env();
}

#[test]
fn unparsable_number_names_the_key() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "INTEGRATIONS_SYNC_MAX_ATTEMPTS=lots\n");

    let err = loader_for(&temp_dir).load().unwrap_err();
    match err {
        ConfigError::InvalidValue { key, value } => {
            assert_eq!(key, "SYNC_MAX_ATTEMPTS");
            assert_eq!(value, "lots");
        }
        other => panic!("unexpected error: {other}"),
    }
    clear_env();
}

#[test]
fn inverted_scheduler_jitter_is_rejected() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "INTEGRATIONS_SCHEDULER_JITTER_PCT_MIN=0.3\nINTEGRATIONS_SCHEDULER_JITTER_PCT_MAX=0.1\n",
    );

    let err = loader_for(&temp_dir).load().unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidSchedulerJitterInverted { .. }
    ));
    clear_env();
}

#[test]
fn oauth_clients_are_read_per_provider() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "INTEGRATIONS_OAUTH_GITHUB_CLIENT_ID=gh-id\n\
         INTEGRATIONS_OAUTH_GITHUB_API_BASE=https://github.example.com/api/v3\n",
    );
    unsafe {
        env::set_var("INTEGRATIONS_OAUTH_GITHUB_CLIENT_SECRET", "gh-secret");
    }

    let cfg = loader_for(&temp_dir).load().expect("config loads");
    let github = cfg
        .oauth_client(ProviderType::Github)
        .expect("github client configured");
    assert_eq!(github.credentials(), Some(("gh-id", "gh-secret")));
    assert_eq!(
        github.api_base.as_deref(),
        Some("https://github.example.com/api/v3")
    );
    assert!(cfg.oauth_client(ProviderType::Gitlab).is_none());

    let redacted = cfg.redacted_json().expect("serializes");
    assert!(!redacted.contains("gh-secret"));
    clear_env();
}
