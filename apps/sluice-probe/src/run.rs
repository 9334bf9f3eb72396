use std::time::{Duration, Instant};

use sluice_codec::Gid;
use sluice_sim::Harness;
use sluice_transport::{DatagramDevice, DeviceOptions, GidFormat, LoopbackFabric};
use sluice_ud::{IfaceAttr, IfaceError, Interface, PerfEstimate, SendError};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ProbeConfig;

/// Rounds a single exchange may take before the run is abandoned.
const MAX_ROUNDS: usize = 100_000;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("interface setup failed: {0}")]
    Iface(#[from] IfaceError),
    #[error("send failed: {0}")]
    Send(#[from] SendError),
    #[error("message {0} was not delivered")]
    Stalled(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub round_trips: u32,
    pub elapsed: Duration,
    /// Counters of the initiating side selected by the report list.
    pub counters: Vec<(&'static str, u64)>,
}

impl RunSummary {
    pub fn mean_round_trip(&self) -> Duration {
        if self.round_trips == 0 {
            return Duration::ZERO;
        }
        self.elapsed / self.round_trips
    }
}

fn device_options(cfg: &ProbeConfig, host: u8) -> DeviceOptions {
    let gids = if cfg.global_routing {
        match cfg.gid_format {
            GidFormat::Ipv4 => vec![Gid::from_ipv4([10, 0, 0, host])],
            GidFormat::Ipv6 => {
                let mut raw = [0u8; 16];
                raw[0] = 0xfe;
                raw[1] = 0x80;
                raw[15] = host;
                vec![Gid(raw)]
            }
        }
    } else {
        Vec::new()
    };
    DeviceOptions {
        gids,
        gid_format: cfg.gid_format,
        ..DeviceOptions::default()
    }
}

/// Ping-pong over two loopback interfaces. Each side waits for the
/// previous message before answering.
pub fn ping_pong(cfg: &ProbeConfig, count: u32, size: usize) -> Result<RunSummary, ProbeError> {
    let mut builder = Harness::builder()
        .config(cfg.iface_config())
        .options(device_options(cfg, 1))
        .b_options(device_options(cfg, 2));
    if let Some(scenario) = cfg.loss_scenario().map_err(ProbeError::Config)? {
        info!(
            loss = scenario.loss_rate_percent,
            seed = scenario.seed,
            "loss injection enabled"
        );
        builder = builder.loss(scenario);
    }
    let harness = builder.build()?;
    let mut payload = vec![0u8; size.max(4)];

    let start = Instant::now();
    for i in 0..count {
        payload[..4].copy_from_slice(&i.to_be_bytes());
        harness.send_short(&harness.a, harness.a.ep, u64::from(i), &payload)?;
        let want = i as usize + 1;
        if !harness.drive_until(MAX_ROUNDS, |h| h.b.received_count() >= want) {
            return Err(ProbeError::Stalled(i));
        }
        harness.send_short(&harness.b, harness.b.ep, u64::from(i), &payload)?;
        if !harness.drive_until(MAX_ROUNDS, |h| h.a.received_count() >= want) {
            return Err(ProbeError::Stalled(i));
        }
        debug!(seq = i, "round trip complete");
    }
    let elapsed = start.elapsed();
    harness.drain(MAX_ROUNDS);

    let counters = harness
        .a
        .iface
        .stats()
        .counters()
        .into_iter()
        .filter(|(name, _)| cfg.report.allows(name))
        .collect();
    Ok(RunSummary {
        round_trips: count,
        elapsed,
        counters,
    })
}

/// Opens one loopback interface and reports its limits.
pub fn query(cfg: &ProbeConfig) -> Result<(IfaceAttr, PerfEstimate), ProbeError> {
    let fabric = LoopbackFabric::new();
    let device = fabric.open_device(device_options(cfg, 1));
    let domain = Box::new(device.memory_domain());
    let qpn = device.qp_num();
    let iface = Interface::new(cfg.iface_config(), Box::new(device), domain, None)?;
    debug!(qpn = qpn.0, "queried loopback interface");
    Ok((iface.query(), iface.estimate_perf()))
}
