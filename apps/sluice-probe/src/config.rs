use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use sluice_sim::LossScenario;
use sluice_transport::GidFormat;
use sluice_ud::UdIfaceConfig;

use crate::fields::{AllowList, Bandwidth, KeyValues, Ternary};

pub const ENV_PREFIX: &str = "SLUICE_UD";
/// Superseded by `SLUICE_UD_TX_MODERATION`; still honoured.
pub const DEPRECATED_TX_MOD: &str = "SLUICE_UD_TX_MOD";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ProbeConfig {
    pub tx_queue_len: usize,
    pub rx_queue_len: usize,
    #[serde(alias = "tx_bufs")]
    pub tx_skbs: usize,
    pub max_inline: usize,
    pub seg_size: usize,
    #[serde(alias = "rx_batch")]
    pub rx_max_batch: usize,
    pub async_max_poll: usize,
    pub tx_moderation: usize,
    pub max_window: u16,
    pub ack_req_thresh: u16,
    pub check_grh: Ternary,
    pub global_routing: bool,
    pub gid_format: GidFormat,
    #[serde(with = "humantime_serde")]
    pub resend_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,
    pub overhead: f64,
    pub bandwidth: Bandwidth,
    /// Counters printed after a run.
    pub report: AllowList,
    /// Loss injection: `rate=<percent>,seed=<n>,control=<bool>`.
    pub loss: KeyValues,
}

impl ProbeConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let defaults = UdIfaceConfig::default();
        let mut builder = Config::builder()
            .set_default("tx_queue_len", defaults.tx_queue_len as i64)?
            .set_default("rx_queue_len", defaults.rx_queue_len as i64)?
            .set_default("tx_skbs", defaults.tx_skbs as i64)?
            .set_default("max_inline", defaults.max_inline as i64)?
            .set_default("seg_size", defaults.seg_size as i64)?
            .set_default("rx_max_batch", defaults.rx_max_batch as i64)?
            .set_default("async_max_poll", defaults.async_max_poll as i64)?
            .set_default("tx_moderation", defaults.tx_moderation as i64)?
            .set_default("max_window", i64::from(defaults.max_window))?
            .set_default("ack_req_thresh", i64::from(defaults.ack_req_thresh))?
            .set_default("check_grh", "auto")?
            .set_default("global_routing", false)?
            .set_default("gid_format", "ipv6")?
            .set_default(
                "resend_timeout",
                format!("{}ms", defaults.resend_timeout.as_millis()),
            )?
            .set_default("peer_timeout", format!("{}s", defaults.peer_timeout.as_secs()))?
            .set_default("overhead", defaults.overhead)?
            .set_default("bandwidth", "auto")?
            .set_default("report", "")?
            .set_default("loss", "")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                match dotenvy::from_path(&path) {
                    Ok(()) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        if let Ok(legacy) = std::env::var(DEPRECATED_TX_MOD) {
            match legacy.trim().parse::<i64>() {
                Ok(value) => {
                    tracing::warn!(
                        "{DEPRECATED_TX_MOD} is deprecated, use {ENV_PREFIX}_TX_MODERATION"
                    );
                    builder = builder.set_default("tx_moderation", value)?;
                }
                Err(_) => tracing::warn!("ignoring malformed {DEPRECATED_TX_MOD}=`{legacy}`"),
            }
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.loss_scenario().map_err(ConfigError::Message)?;
        Ok(cfg)
    }

    pub fn iface_config(&self) -> UdIfaceConfig {
        let defaults = UdIfaceConfig::default();
        UdIfaceConfig {
            tx_queue_len: self.tx_queue_len,
            rx_queue_len: self.rx_queue_len,
            tx_skbs: self.tx_skbs,
            max_inline: self.max_inline,
            seg_size: self.seg_size,
            rx_max_batch: self.rx_max_batch,
            async_max_poll: self.async_max_poll,
            tx_moderation: self.tx_moderation,
            max_window: self.max_window,
            ack_req_thresh: self.ack_req_thresh,
            check_grh: self.check_grh.resolve(self.global_routing),
            resend_timeout: self.resend_timeout,
            peer_timeout: self.peer_timeout,
            overhead: self.overhead,
            bandwidth: self.bandwidth.resolve(defaults.bandwidth),
            ..defaults
        }
    }

    /// `None` when no loss is configured.
    pub fn loss_scenario(&self) -> Result<Option<LossScenario>, String> {
        let Some(rate) = self.loss.get_parsed::<u8>("rate")? else {
            return Ok(None);
        };
        if rate > 100 {
            return Err(format!("loss rate {rate} is above 100 percent"));
        }
        Ok(Some(LossScenario {
            loss_rate_percent: rate,
            drop_control: self.loss.get_parsed("control")?.unwrap_or(true),
            seed: self.loss.get_parsed("seed")?.unwrap_or(0x5EED_CAFE),
        }))
    }
}

/// Serializes tests that read or write the process environment.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
