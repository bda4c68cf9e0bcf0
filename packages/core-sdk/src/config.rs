use std::path::PathBuf;

/**
 * \brief Runtime configuration, read from `CHATRELAY_*` environment variables.
 * \details Every field has a default so the relay starts with no environment set.
 */
#[derive(Debug, Clone)]
pub struct Config {
    /** \brief Listen address (default `127.0.0.1:3001`). */
    pub bind_address: String,
    /** \brief SQLite file (default `./data/app.db`). */
    pub database_path: PathBuf,
    /** \brief Where uploaded images land (default `./uploads`). */
    pub upload_dir: PathBuf,
    /** \brief Static web UI served as the fallback route (default `web`). */
    pub ui_dir: PathBuf,
    /** \brief Request body cap for uploads, in bytes (default 25 MiB). */
    pub upload_limit: usize,
    /** \brief `tracing` filter, e.g. `info` or `debug,tower_http=warn`. `RUST_LOG` wins. */
    pub log_level: String,
    pub log_json: bool,
    /** \brief When set, logs are also written to a daily-rotated file here. */
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("CHATRELAY_BIND", "127.0.0.1:3001"),
            database_path: PathBuf::from(env_or("CHATRELAY_DATABASE_PATH", "./data/app.db")),
            upload_dir: PathBuf::from(env_or("CHATRELAY_UPLOAD_DIR", "./uploads")),
            ui_dir: PathBuf::from(env_or("CHATRELAY_UI_DIR", "web")),
            upload_limit: parse_env("CHATRELAY_UPLOAD_LIMIT", 25 * 1024 * 1024),
            log_level: env_or("CHATRELAY_LOG", "info"),
            log_json: parse_flag("CHATRELAY_LOG_JSON"),
            log_dir: std::env::var("CHATRELAY_LOG_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    /**
     * \brief Configuration rooted in `dir`; used by tests and one-off CLI runs.
     */
    pub fn rooted_at(dir: &std::path::Path) -> Self {
        Self {
            database_path: dir.join("app.db"),
            upload_dir: dir.join("uploads"),
            ui_dir: dir.join("web"),
            log_dir: None,
            ..Self::from_env()
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
