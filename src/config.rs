//! Configuration types.

/// How `process_backlog` walks the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogStrategy {
    /// One item at a time, in receipt order. The reference behavior —
    /// keeps per-message error attribution simple and stays under
    /// third-party rate limits.
    Sequential,
    /// Up to `workers` items in flight at once. Result order is still
    /// receipt order.
    Bounded { workers: usize },
}

impl Default for BacklogStrategy {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Create bookings automatically when confidence clears the gate.
    pub auto_create: bool,
    /// Minimum confidence (0-100) for auto-creating a booking.
    pub min_confidence: u8,
    /// Backlog processing strategy.
    pub strategy: BacklogStrategy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            auto_create: true,
            min_confidence: 80,
            strategy: BacklogStrategy::default(),
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, falling back to defaults.
    ///
    /// - `INTAKE_AUTO_CREATE` — "true"/"false"
    /// - `INTAKE_MIN_CONFIDENCE` — 0-100
    /// - `INTAKE_BACKLOG_WORKERS` — >1 switches to bounded concurrency
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let auto_create = std::env::var("INTAKE_AUTO_CREATE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.auto_create);

        let min_confidence = std::env::var("INTAKE_MIN_CONFIDENCE")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(|c: u8| c.min(100))
            .unwrap_or(defaults.min_confidence);

        let strategy = match std::env::var("INTAKE_BACKLOG_WORKERS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            Some(workers) if workers > 1 => BacklogStrategy::Bounded { workers },
            _ => BacklogStrategy::Sequential,
        };

        Self {
            auto_create,
            min_confidence,
            strategy,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Bind address, e.g. "0.0.0.0:8080".
    pub bind_addr: String,
    /// Bearer token granting admin access. `None` denies all admin routes.
    pub admin_token: Option<String>,
    /// Bearer token granting manager access (parse + stats only).
    pub manager_token: Option<String>,
}

impl HttpConfig {
    /// Build config from environment variables.
    ///
    /// - `INTAKE_BIND_ADDR` (default "0.0.0.0:8080")
    /// - `INTAKE_ADMIN_TOKEN`
    /// - `INTAKE_MANAGER_TOKEN`
    pub fn from_env() -> Self {
        let bind_addr =
            std::env::var("INTAKE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let admin_token = std::env::var("INTAKE_ADMIN_TOKEN").ok().filter(|s| !s.is_empty());
        let manager_token = std::env::var("INTAKE_MANAGER_TOKEN")
            .ok()
            .filter(|s| !s.is_empty());

        Self {
            bind_addr,
            admin_token,
            manager_token,
        }
    }
}
