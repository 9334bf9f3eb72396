use std::fmt::Write;

use crate::config::{ProbeConfig, ENV_PREFIX};

/// Dumped fields in order, with their one-line documentation.
const FIELD_DOCS: &[(&str, &str)] = &[
    ("tx_queue_len", "Send credits: submissions outstanding before completions return"),
    ("rx_queue_len", "Receive buffers kept posted"),
    ("tx_skbs", "Send buffers in the pool (alias: TX_BUFS)"),
    ("max_inline", "Largest inline submission, clamped to the device limit"),
    ("seg_size", "Send and receive buffer size"),
    ("rx_max_batch", "Receive completions handled per poll (alias: RX_BATCH)"),
    ("async_max_poll", "Receive completions handled per device event"),
    ("tx_moderation", "Request a send completion every this many submissions"),
    ("max_window", "Unacknowledged packets allowed per endpoint"),
    ("ack_req_thresh", "Ask the peer for an ack every this many packets"),
    ("check_grh", "Match the routing header against local gids: on, off or auto"),
    ("global_routing", "Give loopback devices gids so packets carry a routing header"),
    ("gid_format", "Routing header form synthesized by the fabric: ipv6 or ipv4"),
    ("resend_timeout", "Resend an unacknowledged window after this long"),
    ("peer_timeout", "Fail an endpoint whose peer stays silent this long"),
    ("overhead", "Per-operation software overhead in seconds"),
    ("bandwidth", "Link bandwidth: auto, or a value like 12.5GBps or 100Gbps"),
    ("report", "Counters printed after a run; prefix with ^ to exclude"),
    ("loss", "Loss injection: rate=<percent>,seed=<n>,control=<bool>"),
];

fn render_value(value: &toml::Value) -> String {
    match value {
        toml::Value::String(s) => s.clone(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::Boolean(b) => b.to_string(),
        toml::Value::Datetime(d) => d.to_string(),
        toml::Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(","),
        toml::Value::Table(table) => table
            .iter()
            .map(|(k, v)| format!("{k}={}", render_value(v)))
            .collect::<Vec<_>>()
            .join(","),
    }
}

/// Renders `SLUICE_UD_NAME=value` lines, each optionally preceded by a
/// `#` doc line.
pub fn render_env(cfg: &ProbeConfig, with_docs: bool) -> Result<String, toml::ser::Error> {
    let toml::Value::Table(table) = toml::Value::try_from(cfg)? else {
        return Ok(String::new());
    };
    let mut out = String::new();
    for (name, doc) in FIELD_DOCS {
        let Some(value) = table.get(*name) else {
            continue;
        };
        if with_docs {
            let _ = writeln!(out, "# {doc}");
        }
        let _ = writeln!(
            out,
            "{ENV_PREFIX}_{}={}",
            name.to_ascii_uppercase(),
            render_value(value)
        );
        if with_docs {
            out.push('\n');
        }
    }
    Ok(out)
}

pub fn render_toml(cfg: &ProbeConfig) -> Result<String, toml::ser::Error> {
    toml::to_string(cfg)
}
