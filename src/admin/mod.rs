use crate::gateway::GatewayStats;

pub fn stats_pairs(stats: &GatewayStats) -> Vec<(&'static str, u64)> {
    let pool = &stats.pool;
    let analytics = &stats.analytics;

    vec![
        ("pool_idle", pool.idle as u64),
        ("pool_in_use", pool.in_use as u64),
        ("pool_total", pool.total as u64),
        ("pool_max", pool.max as u64),
        ("sessions", stats.sessions as u64),
        ("tracked_clients", stats.tracked_clients as u64),
        ("requests", analytics.requests),
        ("failed_requests", analytics.failed),
        ("rate_limited", analytics.rate_limited),
        ("auth_failures", analytics.auth_failures),
        ("pool_exhausted", analytics.pool_exhausted),
        ("active_connections", analytics.active_connections()),
    ]
}

/// `key=value` pairs joined by `separator`: `"\n"` for the shutdown report,
/// `"|"` for a protocol reply.
pub fn format_stats(stats: &GatewayStats, separator: &str) -> String {
    stats_pairs(stats)
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(separator)
}
