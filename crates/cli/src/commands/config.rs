use secrecy::ExposeSecret;
use threadline_core::config::{AppConfig, LoadOptions};

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];

    lines.push(render_line("database.url", &config.database.url, "THREADLINE_DATABASE_URL"));
    lines.push(render_line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        "THREADLINE_DATABASE_MAX_CONNECTIONS",
    ));
    lines.push(render_line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        "THREADLINE_DATABASE_TIMEOUT_SECS",
    ));

    lines.push(render_line(
        "provider.base_url",
        &config.provider.base_url,
        "THREADLINE_PROVIDER_BASE_URL",
    ));
    lines.push(render_line(
        "provider.api_token",
        &redact_token(config.provider.api_token.expose_secret()),
        "THREADLINE_PROVIDER_API_TOKEN",
    ));
    lines.push(render_line(
        "provider.timeout_secs",
        &config.provider.timeout_secs.to_string(),
        "THREADLINE_PROVIDER_TIMEOUT_SECS",
    ));

    lines.push(render_line(
        "sync.page_size",
        &config.sync.page_size.to_string(),
        "THREADLINE_SYNC_PAGE_SIZE",
    ));
    lines.push(render_line(
        "sync.error_budget",
        &config.sync.error_budget.to_string(),
        "THREADLINE_SYNC_ERROR_BUDGET",
    ));
    lines.push(render_line(
        "sync.page_delay_ms",
        &config.sync.page_delay_ms.to_string(),
        "THREADLINE_SYNC_PAGE_DELAY_MS",
    ));
    lines.push(render_line(
        "sync.duplicate_window_hours",
        &config.sync.duplicate_window_hours.to_string(),
        "THREADLINE_SYNC_DUPLICATE_WINDOW_HOURS",
    ));
    lines.push(render_line(
        "sync.max_history_days",
        &config.sync.max_history_days.to_string(),
        "THREADLINE_SYNC_MAX_HISTORY_DAYS",
    ));
    lines.push(render_line(
        "sync.incremental_lookback_hours",
        &config.sync.incremental_lookback_hours.to_string(),
        "THREADLINE_SYNC_INCREMENTAL_LOOKBACK_HOURS",
    ));
    lines.push(render_line(
        "sync.min_match_confidence",
        &config.sync.min_match_confidence.to_string(),
        "THREADLINE_SYNC_MIN_MATCH_CONFIDENCE",
    ));
    lines.push(render_line(
        "sync.default_platform",
        &config.sync.default_platform,
        "THREADLINE_SYNC_DEFAULT_PLATFORM",
    ));

    lines.push(render_line(
        "server.bind_address",
        &config.server.bind_address,
        "THREADLINE_SERVER_BIND_ADDRESS",
    ));
    lines.push(render_line("server.port", &config.server.port.to_string(), "THREADLINE_SERVER_PORT"));

    lines.push(render_line("logging.level", &config.logging.level, "THREADLINE_LOGGING_LEVEL"));
    lines.push(render_line(
        "logging.format",
        &format!("{:?}", config.logging.format).to_lowercase(),
        "THREADLINE_LOGGING_FORMAT",
    ));

    lines.join("\n")
}

fn render_line(key: &str, value: &str, env_var: &str) -> String {
    format!("  {key} = {value}  (env override: {env_var})")
}

fn redact_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        "<unset>".to_string()
    } else if trimmed.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &trimmed[..4])
    }
}

#[cfg(test)]
mod tests {
    use super::redact_token;

    #[test]
    fn tokens_are_redacted_to_a_short_prefix() {
        assert_eq!(redact_token(""), "<unset>");
        assert_eq!(redact_token("abc"), "****");
        assert_eq!(redact_token("sk-verysecretvalue"), "sk-v****");
    }
}
