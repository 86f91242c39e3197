use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use switchyard_core::TypeConverterRegistry;

use crate::configurer::PropertyConfigurer;
use crate::error::ConfigError;

/// Engine-level configuration.
///
/// Controls load shedding, timeouts, fan-out parallelism, and shutdown.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name of this engine instance, used in logs.
    pub name: String,
    /// Maximum number of exchanges admitted through the inbound pipeline at
    /// once before load shedding.
    pub max_concurrent_exchanges: u32,
    /// Per-exchange timeout enforced by the inbound pipeline. `None` disables it.
    pub exchange_timeout: Option<Duration>,
    /// Maximum number of parallel fan-out branches executing at once,
    /// engine-wide.
    pub parallel_processing_limit: usize,
    /// How long `stop()` waits for in-flight exchanges before cancelling them.
    pub shutdown_timeout: Duration,
    /// Whether redelivery policies may retry without bound.
    pub allow_unbounded_redelivery: bool,
    /// Queue capacity for `seda:` endpoints that do not set `size`.
    pub seda_default_capacity: usize,
    /// Tick interval for background consumer workers.
    pub worker_tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "switchyard".to_string(),
            max_concurrent_exchanges: 1000,
            exchange_timeout: None,
            parallel_processing_limit: 16,
            shutdown_timeout: Duration::from_secs(10),
            allow_unbounded_redelivery: false,
            seda_default_capacity: 1000,
            worker_tick_interval: Duration::from_secs(30),
        }
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn positive(name: &str, v: i64) -> Result<u64, String> {
    u64::try_from(v)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| format!("{name} must be positive, got {v}"))
}

impl EngineConfig {
    /// Option table for configuring the engine from key/value pairs.
    /// Durations are given in milliseconds.
    #[must_use]
    pub fn configurer(converters: Arc<TypeConverterRegistry>) -> PropertyConfigurer<EngineConfig> {
        PropertyConfigurer::<EngineConfig>::new(converters)
            .option::<String>("name", |c, v| c.name = v, |c| c.name.clone())
            .checked_option::<i64>(
                "maxConcurrentExchanges",
                |c, v| {
                    let v = positive("maxConcurrentExchanges", v)?;
                    c.max_concurrent_exchanges = u32::try_from(v).map_err(|e| e.to_string())?;
                    Ok(())
                },
                |c| i64::from(c.max_concurrent_exchanges),
            )
            .checked_option::<i64>(
                "exchangeTimeoutMs",
                |c, v| {
                    c.exchange_timeout = match v {
                        0 => None,
                        v => Some(Duration::from_millis(positive("exchangeTimeoutMs", v)?)),
                    };
                    Ok(())
                },
                |c| c.exchange_timeout.map_or(0, millis),
            )
            .checked_option::<i64>(
                "parallelProcessingLimit",
                |c, v| {
                    let v = positive("parallelProcessingLimit", v)?;
                    c.parallel_processing_limit = usize::try_from(v).map_err(|e| e.to_string())?;
                    Ok(())
                },
                |c| i64::try_from(c.parallel_processing_limit).unwrap_or(i64::MAX),
            )
            .checked_option::<i64>(
                "shutdownTimeoutMs",
                |c, v| {
                    c.shutdown_timeout = Duration::from_millis(positive("shutdownTimeoutMs", v)?);
                    Ok(())
                },
                |c| millis(c.shutdown_timeout),
            )
            .option::<bool>(
                "allowUnboundedRedelivery",
                |c, v| c.allow_unbounded_redelivery = v,
                |c| c.allow_unbounded_redelivery,
            )
            .checked_option::<i64>(
                "sedaDefaultCapacity",
                |c, v| {
                    let v = positive("sedaDefaultCapacity", v)?;
                    c.seda_default_capacity = usize::try_from(v).map_err(|e| e.to_string())?;
                    Ok(())
                },
                |c| i64::try_from(c.seda_default_capacity).unwrap_or(i64::MAX),
            )
            .checked_option::<i64>(
                "workerTickIntervalMs",
                |c, v| {
                    c.worker_tick_interval =
                        Duration::from_millis(positive("workerTickIntervalMs", v)?);
                    Ok(())
                },
                |c| millis(c.worker_tick_interval),
            )
    }

    /// Builds a configuration from defaults overridden by `options`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for unknown option names or invalid values.
    pub fn from_options(
        options: &BTreeMap<String, String>,
        converters: Arc<TypeConverterRegistry>,
    ) -> Result<Self, ConfigError> {
        let mut config = EngineConfig::default();
        Self::configurer(converters).configure_all(&mut config, options, true)?;
        Ok(config)
    }
}
