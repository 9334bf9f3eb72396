use std::sync::{Arc, Mutex};

use sluice_core::{AmId, EndpointId, QpNumber};
use sluice_transport::{DatagramDevice, DeviceOptions, LoopbackFabric};

use crate::config::UdIfaceConfig;
use crate::iface::Interface;
use crate::types::{AmDelivery, AmHandlerFlags, EventCallback};

pub(crate) fn am() -> AmId {
    AmId::new(1).expect("am id")
}

pub(crate) fn small_config() -> UdIfaceConfig {
    UdIfaceConfig {
        tx_queue_len: 64,
        rx_queue_len: 64,
        tx_skbs: 64,
        seg_size: 512,
        rx_max_batch: 8,
        tx_moderation: 8,
        max_window: 32,
        ack_req_thresh: 16,
        ..UdIfaceConfig::default()
    }
}

pub(crate) struct Side {
    pub(crate) iface: Interface,
    pub(crate) ep: EndpointId,
    pub(crate) qpn: QpNumber,
    pub(crate) received: Arc<Mutex<Vec<Vec<u8>>>>,
}

pub(crate) struct Pair {
    pub(crate) fabric: LoopbackFabric,
    pub(crate) a: Side,
    pub(crate) b: Side,
}

fn open(
    fabric: &LoopbackFabric,
    config: UdIfaceConfig,
    options: DeviceOptions,
    event_cb: Option<EventCallback>,
) -> (Interface, QpNumber, Arc<Mutex<Vec<Vec<u8>>>>) {
    let device = fabric.open_device(options);
    let qpn = device.qp_num();
    let domain = Box::new(device.memory_domain());
    let iface = Interface::new(config, Box::new(device), domain, event_cb).expect("interface");
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    iface.set_am_handler(
        am(),
        Some(Box::new(move |delivery: AmDelivery<'_>| {
            sink.lock().expect("sink").push(delivery.data.to_vec());
        })),
        AmHandlerFlags::default(),
    );
    (iface, qpn, received)
}

/// Two interfaces on one fabric with a connected endpoint each.
pub(crate) fn pair_full(
    config: UdIfaceConfig,
    a_options: DeviceOptions,
    b_options: DeviceOptions,
    b_event_cb: Option<EventCallback>,
) -> Pair {
    let fabric = LoopbackFabric::new();
    let (a, a_qpn, a_rx) = open(&fabric, config.clone(), a_options, None);
    let (b, b_qpn, b_rx) = open(&fabric, config, b_options, b_event_cb);
    let a_ep = a.ep_create().expect("a ep");
    let b_ep = b.ep_create().expect("b ep");
    let a_addr = a.ep_get_address(a_ep).expect("a addr");
    let b_addr = b.ep_get_address(b_ep).expect("b addr");
    a.ep_connect_to_ep(a_ep, &b.device_address(), &b_addr)
        .expect("connect a");
    b.ep_connect_to_ep(b_ep, &a.device_address(), &a_addr)
        .expect("connect b");
    Pair {
        fabric,
        a: Side {
            iface: a,
            ep: a_ep,
            qpn: a_qpn,
            received: a_rx,
        },
        b: Side {
            iface: b,
            ep: b_ep,
            qpn: b_qpn,
            received: b_rx,
        },
    }
}

pub(crate) fn pair_with(config: UdIfaceConfig, options: DeviceOptions) -> Pair {
    pair_full(config, options.clone(), options, None)
}

pub(crate) fn pair() -> Pair {
    pair_with(small_config(), DeviceOptions::default())
}

impl Pair {
    /// Progresses both sides until neither finds work.
    pub(crate) fn settle(&self) {
        for _ in 0..64 {
            let work = self.a.iface.progress() + self.b.iface.progress();
            if work == 0 {
                return;
            }
        }
    }
}

impl Side {
    pub(crate) fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().expect("received").clone()
    }
}
