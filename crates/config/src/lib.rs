use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

// ── Portal ───────────────────────────────────────────────────────────────────

/// Where the portal lives and how its URLs reveal the session state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub base_url: String,
    pub login_path: String,
    /// Protected page used both for the sales query and the session probe.
    pub sales_path: String,
    pub allowance_path: String,
    /// Substrings of a URL that only an authenticated session can be on.
    pub authenticated_markers: Vec<String>,
    /// Substring the URL must contain once a submitted login has succeeded.
    pub login_success_marker: String,
    /// Substring of the login page URL; protected pages redirect here.
    pub login_page_marker: String,
    /// Marker in the URL of the backend request the sales search fires.
    pub sales_response_marker: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://tw.atomy.com".to_string(),
            login_path: "/login".to_string(),
            sales_path: "/myoffice/mySales/lowerSales".to_string(),
            allowance_path: "/myoffice/myAllow/AllowSet".to_string(),
            authenticated_markers: vec!["/main".to_string(), "/myoffice".to_string()],
            login_success_marker: "/main".to_string(),
            login_page_marker: "/login".to_string(),
            sales_response_marker: "lowerSalesSum".to_string(),
        }
    }
}

impl PortalConfig {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn login_url(&self) -> String {
        self.url(&self.login_path)
    }

    pub fn sales_url(&self) -> String {
        self.url(&self.sales_path)
    }

    pub fn allowance_url(&self) -> String {
        self.url(&self.allowance_path)
    }

    pub fn is_authenticated_url(&self, url: &str) -> bool {
        self.authenticated_markers.iter().any(|m| url.contains(m.as_str()))
    }

    pub fn is_login_url(&self, url: &str) -> bool {
        url.contains(self.login_page_marker.as_str())
    }
}

// ── Browser ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    /// Chromium-family executable.  Overridden by `PVTRACK_BROWSER`.
    pub executable: String,
    /// Overridden by `PVTRACK_HEADLESS=0` for a visible window while debugging.
    pub headless: bool,
    pub debugging_port: u16,
    pub launch_timeout_secs: u64,
    pub user_data_dir: String,
    /// Pause inserted before every page action, like a human operator.
    pub slow_mo_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable: "chromium".to_string(),
            headless: true,
            debugging_port: 9222,
            launch_timeout_secs: 20,
            user_data_dir: ".pvtrack/chrome".to_string(),
            slow_mo_ms: 50,
        }
    }
}

// ── Retry / timeouts ─────────────────────────────────────────────────────────

/// Login retry budget.  Only the login step is ever retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub login_attempts: u32,
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            login_attempts: 3,
            delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub probe_ms: u64,
    pub login_field_ms: u64,
    pub login_redirect_ms: u64,
    pub page_ready_ms: u64,
    pub search_response_ms: u64,
    pub table_ms: u64,
    /// Settle delay after clicking a half-month preset.
    pub preset_settle_ms: u64,
    /// Settle delay between the search response and reading the result cells.
    pub render_settle_ms: u64,
    /// Hard ceiling for one query protocol; the session is reset past it.
    pub query_deadline_secs: u64,
    /// How long a caller waits for the shared session before giving up.
    pub lock_wait_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe_ms: 7000,
            login_field_ms: 15000,
            login_redirect_ms: 10000,
            page_ready_ms: 10000,
            search_response_ms: 15000,
            table_ms: 15000,
            preset_settle_ms: 200,
            render_settle_ms: 500,
            query_deadline_secs: 90,
            lock_wait_secs: 120,
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_millis(self.probe_ms)
    }
    pub fn login_field(&self) -> Duration {
        Duration::from_millis(self.login_field_ms)
    }
    pub fn login_redirect(&self) -> Duration {
        Duration::from_millis(self.login_redirect_ms)
    }
    pub fn page_ready(&self) -> Duration {
        Duration::from_millis(self.page_ready_ms)
    }
    pub fn search_response(&self) -> Duration {
        Duration::from_millis(self.search_response_ms)
    }
    pub fn table(&self) -> Duration {
        Duration::from_millis(self.table_ms)
    }
    pub fn preset_settle(&self) -> Duration {
        Duration::from_millis(self.preset_settle_ms)
    }
    pub fn render_settle(&self) -> Duration {
        Duration::from_millis(self.render_settle_ms)
    }
    pub fn query_deadline(&self) -> Duration {
        Duration::from_secs(self.query_deadline_secs)
    }
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}

// ── Schedule ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first), evaluated in `timezone`.
    pub cron: String,
    /// IANA timezone name.  Also defines what "today" means for follow-up
    /// ranges.  Falls back to UTC when the name is unrecognised.
    pub timezone: String,
    pub run_on_startup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cron: "0 0 8-22/2 * * *".to_string(),
            timezone: "Asia/Taipei".to_string(),
            run_on_startup: true,
        }
    }
}

impl ScheduleConfig {
    pub fn tz(&self) -> Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!(tz = %self.timezone, "unrecognised timezone, falling back to UTC");
            chrono_tz::UTC
        })
    }
}

// ── Misc sections ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: ".pvtrack/state.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct IntegrationsConfig {
    pub telegram_enabled: bool,
    /// Chat that receives scheduled reports and operator alerts.
    /// Overridden by `TELEGRAM_ADMIN_CHAT_ID`.
    pub telegram_admin_chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/pvtrack.sock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub portal: PortalConfig,
    pub browser: BrowserConfig,
    pub retry: RetryConfig,
    pub timeouts: TimeoutConfig,
    pub schedule: ScheduleConfig,
    pub state: StateConfig,
    pub telemetry: TelemetryConfig,
    pub integrations: IntegrationsConfig,
    pub daemon: DaemonConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(exe) = env::var("PVTRACK_BROWSER") {
            if !exe.is_empty() {
                config.browser.executable = exe;
            }
        }

        if let Ok(value) = env::var("PVTRACK_HEADLESS") {
            if value == "0" || value.eq_ignore_ascii_case("false") {
                config.browser.headless = false;
            }
        }

        if let Ok(chat) = env::var("TELEGRAM_ADMIN_CHAT_ID") {
            if !chat.is_empty() {
                config.integrations.telegram_admin_chat_id = chat;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Credentials ──────────────────────────────────────────────────────────────

/// Portal login pair.  Read once at startup and never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    id: String,
    password: String,
}

impl Credentials {
    pub fn new(id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            password: password.into(),
        }
    }

    /// Reads `PORTAL_ID` / `PORTAL_PASSWORD`.
    pub fn from_env() -> Result<Self> {
        let id = env::var("PORTAL_ID").unwrap_or_default();
        let password = env::var("PORTAL_PASSWORD").unwrap_or_default();
        if id.trim().is_empty() || password.is_empty() {
            bail!("PORTAL_ID and PORTAL_PASSWORD must both be set");
        }
        Ok(Self::new(id.trim(), password))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── Defaults ───────────────────────────────────────────────────────────

    #[test]
    fn retry_and_timeout_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.retry.login_attempts, 3);
        assert_eq!(cfg.retry.delay(), Duration::from_secs(5));
        assert_eq!(cfg.timeouts.search_response(), Duration::from_secs(15));
        assert_eq!(cfg.timeouts.preset_settle(), Duration::from_millis(200));
        assert_eq!(cfg.timeouts.render_settle(), Duration::from_millis(500));
        assert_eq!(cfg.timeouts.probe(), Duration::from_millis(7000));
    }

    #[test]
    fn schedule_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.schedule.cron, "0 0 8-22/2 * * *");
        assert_eq!(cfg.schedule.tz(), chrono_tz::Asia::Taipei);
        assert!(cfg.schedule.run_on_startup);
        assert_eq!(cfg.state.path, ".pvtrack/state.json");
        assert_eq!(cfg.daemon.socket_path, "/tmp/pvtrack.sock");
        assert!(!cfg.integrations.telegram_enabled);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let schedule = ScheduleConfig {
            timezone: "Mars/Olympus".to_string(),
            ..Default::default()
        };
        assert_eq!(schedule.tz(), chrono_tz::UTC);
    }

    // ── Portal URLs ────────────────────────────────────────────────────────

    #[test]
    fn portal_urls_join_base_and_path() {
        let mut portal = PortalConfig::default();
        portal.base_url = "https://portal.example/".to_string();
        assert_eq!(portal.login_url(), "https://portal.example/login");
        assert_eq!(portal.sales_url(), "https://portal.example/myoffice/mySales/lowerSales");
        assert_eq!(portal.allowance_url(), "https://portal.example/myoffice/myAllow/AllowSet");
    }

    #[test]
    fn portal_url_classification() {
        let portal = PortalConfig::default();
        assert!(portal.is_authenticated_url("https://tw.atomy.com/main"));
        assert!(portal.is_authenticated_url("https://tw.atomy.com/myoffice/mySales/lowerSales"));
        assert!(!portal.is_authenticated_url("https://tw.atomy.com/login?next=/main"));
        assert!(portal.is_login_url("https://tw.atomy.com/login?next=/main"));
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.retry.login_attempts, 3);
        assert_eq!(cfg.portal.sales_response_marker, "lowerSalesSum");
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[retry]
login_attempts = 5

[schedule]
timezone = "UTC"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.retry.login_attempts, 5);
        assert_eq!(cfg.retry.delay_ms, 5000);
        assert_eq!(cfg.schedule.tz(), chrono_tz::UTC);
        assert_eq!(cfg.schedule.cron, "0 0 8-22/2 * * *");
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped: AppConfig = toml::from_str(include_str!("../../../config/default.toml")).unwrap();
        let defaults = AppConfig::default();
        assert_eq!(
            toml::to_string(&shipped).unwrap(),
            toml::to_string(&defaults).unwrap()
        );
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.portal.base_url = "https://portal.example".to_string();
        cfg.timeouts.query_deadline_secs = 30;
        cfg.integrations.telegram_enabled = true;
        cfg.save_to(&path).unwrap();

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.portal.base_url, "https://portal.example");
        assert_eq!(loaded.timeouts.query_deadline(), Duration::from_secs(30));
        assert!(loaded.integrations.telegram_enabled);
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_browser_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("browser.toml");
        fs::write(
            &path,
            r#"
[browser]
executable = "from-file"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for these env vars.
        unsafe {
            env::set_var("PVTRACK_BROWSER", "/opt/chrome/chrome");
            env::set_var("PVTRACK_HEADLESS", "0");
        }
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.browser.executable, "/opt/chrome/chrome");
        assert!(!cfg.browser.headless);
        unsafe {
            env::remove_var("PVTRACK_BROWSER");
            env::remove_var("PVTRACK_HEADLESS");
        }
    }

    #[test]
    fn credentials_from_env() {
        // SAFETY: test is single-threaded for these env vars.
        unsafe {
            env::set_var("PORTAL_ID", " 12345678 ");
            env::set_var("PORTAL_PASSWORD", "hunter2");
        }
        let creds = Credentials::from_env().unwrap();
        assert_eq!(creds.id(), "12345678");
        assert_eq!(creds.password(), "hunter2");
        unsafe {
            env::remove_var("PORTAL_PASSWORD");
        }
        assert!(Credentials::from_env().is_err());
        unsafe {
            env::remove_var("PORTAL_ID");
        }
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials::new("member", "s3cret");
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("member"));
        assert!(!rendered.contains("s3cret"));
    }
}
