use once_cell::sync::OnceCell;

const ENV_LOG_FILTER: &str = "MEMAGENT_LOG";
const DEFAULT_LOG_FILTER: &str = "info";

/// How the agent was loaded by the host.
///
/// In `Embedded` mode the agent lives inside another runtime and must never
/// write to stdout; log records are forwarded to the host instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Normal,
    Embedded,
}

impl ServerMode {
    pub fn from_raw(mode: i32) -> Option<Self> {
        match mode {
            0 => Some(ServerMode::Normal),
            1 => Some(ServerMode::Embedded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub log_filter: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl AgentConfig {
    /// Read overrides from the environment. Missing or empty values fall
    /// back to defaults; this never fails.
    pub fn from_env() -> Self {
        let log_filter = std::env::var(ENV_LOG_FILTER)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        Self { log_filter }
    }
}

/// Process-wide state owned by the ABI layer. Set once by `native_init`;
/// later calls observe the first value.
#[derive(Debug)]
pub struct ServerState {
    mode: ServerMode,
}

static SERVER_STATE: OnceCell<ServerState> = OnceCell::new();

/// Record the mode chosen by the first `native_init` call. Returns the mode
/// that is actually in effect.
pub fn init_server_state(mode: ServerMode) -> ServerMode {
    SERVER_STATE.get_or_init(|| ServerState { mode }).mode
}

pub fn server_mode() -> ServerMode {
    SERVER_STATE
        .get()
        .map(|s| s.mode)
        .unwrap_or(ServerMode::Normal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_from_raw() {
        assert_eq!(ServerMode::from_raw(0), Some(ServerMode::Normal));
        assert_eq!(ServerMode::from_raw(1), Some(ServerMode::Embedded));
        assert_eq!(ServerMode::from_raw(7), None);
    }

    #[test]
    fn env_override() {
        std::env::set_var(ENV_LOG_FILTER, "debug");
        let cfg = AgentConfig::from_env();
        assert_eq!(cfg.log_filter, "debug");
        std::env::remove_var(ENV_LOG_FILTER);
        let cfg = AgentConfig::from_env();
        assert_eq!(cfg.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn first_init_wins() {
        let first = init_server_state(ServerMode::Normal);
        let second = init_server_state(ServerMode::Embedded);
        assert_eq!(first, second);
    }
}
