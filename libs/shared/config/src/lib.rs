use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub supabase_realtime_url: String,
    pub snapshot_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub resubscribe_initial_ms: u64,
    pub resubscribe_max_secs: u64,
    pub session_idle_ttl_secs: u64,
    pub session_sweep_interval_secs: u64,
    pub port: u16,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let supabase_url = env::var("SUPABASE_URL")
            .unwrap_or_else(|_| {
                warn!("SUPABASE_URL not set, using empty value");
                String::new()
            });

        let supabase_realtime_url = env::var("SUPABASE_REALTIME_URL")
            .unwrap_or_else(|_| realtime_url_from(&supabase_url));

        let config = Self {
            supabase_realtime_url,
            supabase_url,
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            snapshot_timeout_secs: parse_or("SYNC_SNAPSHOT_TIMEOUT_SECS", 10),
            heartbeat_interval_secs: parse_or("SYNC_HEARTBEAT_INTERVAL_SECS", 30),
            resubscribe_initial_ms: parse_or("SYNC_RESUBSCRIBE_INITIAL_MS", 250),
            resubscribe_max_secs: parse_or("SYNC_RESUBSCRIBE_MAX_SECS", 30),
            session_idle_ttl_secs: parse_or("SYNC_SESSION_IDLE_TTL_SECS", 900),
            session_sweep_interval_secs: parse_or("SYNC_SESSION_SWEEP_INTERVAL_SECS", 60),
            port: parse_or("PORT", 3000),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    /// Builds a config pointing at the given Supabase project with default sync settings.
    pub fn for_project(supabase_url: &str, anon_key: &str, jwt_secret: &str) -> Self {
        Self {
            supabase_url: supabase_url.to_string(),
            supabase_anon_key: anon_key.to_string(),
            supabase_jwt_secret: jwt_secret.to_string(),
            supabase_realtime_url: realtime_url_from(supabase_url),
            snapshot_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            resubscribe_initial_ms: 250,
            resubscribe_max_secs: 30,
            session_idle_ttl_secs: 900,
            session_sweep_interval_secs: 60,
            port: 3000,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn is_realtime_configured(&self) -> bool {
        !self.supabase_realtime_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.snapshot_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn resubscribe_initial_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_initial_ms)
    }

    pub fn resubscribe_max_delay(&self) -> Duration {
        Duration::from_secs(self.resubscribe_max_secs)
    }

    /// How long a session may go without a read before it is torn down.
    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.session_idle_ttl_secs)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_secs.max(1))
    }
}

/// Maps `https://project.supabase.co` to `wss://project.supabase.co/realtime/v1`.
pub fn realtime_url_from(supabase_url: &str) -> String {
    if supabase_url.is_empty() {
        return String::new();
    }

    let trimmed = supabase_url.trim_end_matches('/');
    let ws_url = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    };

    format!("{}/realtime/v1", ws_url)
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has an invalid value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url_from_https() {
        assert_eq!(
            realtime_url_from("https://abc.supabase.co/"),
            "wss://abc.supabase.co/realtime/v1"
        );
    }

    #[test]
    fn test_realtime_url_from_http() {
        assert_eq!(
            realtime_url_from("http://localhost:54321"),
            "ws://localhost:54321/realtime/v1"
        );
    }

    #[test]
    fn test_realtime_url_from_empty() {
        assert_eq!(realtime_url_from(""), "");
    }

    #[test]
    fn test_for_project_defaults() {
        let config = AppConfig::for_project("http://localhost:54321", "anon", "secret");

        assert!(config.is_configured());
        assert!(config.is_realtime_configured());
        assert_eq!(config.snapshot_timeout(), Duration::from_secs(10));
        assert_eq!(config.resubscribe_initial_delay(), Duration::from_millis(250));
        assert_eq!(config.session_idle_ttl(), Duration::from_secs(900));
        assert_eq!(config.session_sweep_interval(), Duration::from_secs(60));
        assert_eq!(config.port, 3000);
    }
}
