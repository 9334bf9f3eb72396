use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use sluice_core::{AmId, EndpointId, QpNumber};
use sluice_transport::{DatagramDevice, DeviceOptions, LoopbackFabric};
use sluice_ud::{
    AmDelivery, AmHandlerFlags, EventCallback, IfaceError, Interface, SendError, UdIfaceConfig,
};
use tracing::debug;

use crate::scenarios::LossScenario;

/// Active message id every harness side listens on.
pub const HARNESS_AM: u8 = 1;

const RETRY_ROUNDS: usize = 10_000;

pub type Inbox = Arc<Mutex<Vec<(EndpointId, Vec<u8>)>>>;

/// One interface of the harness with its primary endpoint.
pub struct Side {
    pub iface: Interface,
    pub ep: EndpointId,
    pub qpn: QpNumber,
    inbox: Inbox,
}

impl Side {
    fn open(
        fabric: &LoopbackFabric,
        config: UdIfaceConfig,
        options: DeviceOptions,
        event_cb: Option<EventCallback>,
        am: AmId,
        flags: AmHandlerFlags,
    ) -> Result<Self, IfaceError> {
        let device = fabric.open_device(options);
        let qpn = device.qp_num();
        let domain = Box::new(device.memory_domain());
        let iface = Interface::new(config, Box::new(device), domain, event_cb)?;
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        iface.set_am_handler(
            am,
            Some(Box::new(move |delivery: AmDelivery<'_>| {
                if let Ok(mut inbox) = sink.lock() {
                    inbox.push((delivery.ep, delivery.data.to_vec()));
                }
            })),
            flags,
        );
        let ep = iface.ep_create()?;
        Ok(Self {
            iface,
            ep,
            qpn,
            inbox,
        })
    }

    /// Payloads received so far, in delivery order.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received_from_all()
            .into_iter()
            .map(|(_, data)| data)
            .collect()
    }

    pub fn received_from_all(&self) -> Vec<(EndpointId, Vec<u8>)> {
        self.inbox
            .lock()
            .map(|inbox| inbox.clone())
            .unwrap_or_default()
    }

    pub fn received_count(&self) -> usize {
        self.inbox.lock().map(|inbox| inbox.len()).unwrap_or(0)
    }
}

/// Two interfaces on one loopback fabric, connected endpoint to endpoint.
pub struct Harness {
    pub fabric: LoopbackFabric,
    pub am: AmId,
    pub a: Side,
    pub b: Side,
    resend_timeout: std::time::Duration,
    /// Timer clock; runs ahead of real time by one resend timeout per firing.
    clock: Mutex<Instant>,
}

#[derive(Default)]
pub struct HarnessBuilder {
    config: Option<UdIfaceConfig>,
    a_options: DeviceOptions,
    b_options: DeviceOptions,
    b_event_cb: Option<EventCallback>,
    b_handler_flags: AmHandlerFlags,
    loss: Option<LossScenario>,
}

impl HarnessBuilder {
    pub fn config(mut self, config: UdIfaceConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn options(mut self, options: DeviceOptions) -> Self {
        self.a_options = options.clone();
        self.b_options = options;
        self
    }

    pub fn b_options(mut self, options: DeviceOptions) -> Self {
        self.b_options = options;
        self
    }

    pub fn b_event_callback(mut self, cb: EventCallback) -> Self {
        self.b_event_cb = Some(cb);
        self
    }

    pub fn b_handler_flags(mut self, flags: AmHandlerFlags) -> Self {
        self.b_handler_flags = flags;
        self
    }

    pub fn loss(mut self, scenario: LossScenario) -> Self {
        self.loss = Some(scenario);
        self
    }

    pub fn build(self) -> Result<Harness, IfaceError> {
        let config = self.config.unwrap_or_else(Harness::small_config);
        let resend_timeout = config.resend_timeout;
        let am = AmId::new(HARNESS_AM)
            .map_err(|_| IfaceError::InvalidConfig("harness active message id"))?;
        let fabric = LoopbackFabric::new();
        let a = Side::open(
            &fabric,
            config.clone(),
            self.a_options,
            None,
            am,
            AmHandlerFlags::default(),
        )?;
        let b = Side::open(
            &fabric,
            config,
            self.b_options,
            self.b_event_cb,
            am,
            self.b_handler_flags,
        )?;
        let a_addr = a.iface.ep_get_address(a.ep)?;
        let b_addr = b.iface.ep_get_address(b.ep)?;
        a.iface
            .ep_connect_to_ep(a.ep, &b.iface.device_address(), &b_addr)?;
        b.iface
            .ep_connect_to_ep(b.ep, &a.iface.device_address(), &a_addr)?;
        if let Some(scenario) = self.loss {
            fabric.set_drop_filter(scenario.drop_filter());
        }
        Ok(Harness {
            fabric,
            am,
            a,
            b,
            resend_timeout,
            clock: Mutex::new(Instant::now()),
        })
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Small queues so credit and window limits are reached quickly.
    pub fn small_config() -> UdIfaceConfig {
        UdIfaceConfig {
            tx_queue_len: 64,
            rx_queue_len: 128,
            tx_skbs: 64,
            seg_size: 512,
            rx_max_batch: 8,
            tx_moderation: 8,
            max_window: 32,
            ack_req_thresh: 16,
            ..UdIfaceConfig::default()
        }
    }

    /// Connects one more endpoint pair and returns (a side, b side).
    pub fn connect_extra(&self) -> Result<(EndpointId, EndpointId), IfaceError> {
        let a_ep = self.a.iface.ep_create()?;
        let b_ep = self.b.iface.ep_create()?;
        let a_addr = self.a.iface.ep_get_address(a_ep)?;
        let b_addr = self.b.iface.ep_get_address(b_ep)?;
        self.a
            .iface
            .ep_connect_to_ep(a_ep, &self.b.iface.device_address(), &b_addr)?;
        self.b
            .iface
            .ep_connect_to_ep(b_ep, &self.a.iface.device_address(), &a_addr)?;
        Ok((a_ep, b_ep))
    }

    /// One round of polled progress on both sides.
    pub fn progress(&self) -> usize {
        self.a.iface.progress() + self.b.iface.progress()
    }

    /// Fires both retransmission timers as if the resend timeout elapsed
    /// since the previous firing.
    pub fn expire_timers(&self) -> usize {
        let now = {
            let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
            *clock = (*clock).max(Instant::now()) + self.resend_timeout;
            *clock
        };
        self.a.iface.timer_tick(now) + self.b.iface.timer_tick(now)
    }

    /// Progresses until `done` holds, firing timers whenever a round finds
    /// no work. Returns false if `max_rounds` ran out first.
    pub fn drive_until(&self, max_rounds: usize, mut done: impl FnMut(&Harness) -> bool) -> bool {
        for round in 0..max_rounds {
            if done(self) {
                return true;
            }
            if self.progress() == 0 {
                let resent = self.expire_timers();
                debug!(round, resent, "harness idle, timers fired");
            }
        }
        done(self)
    }

    /// Sends a short message from `side`, progressing the harness while the
    /// send reports `NoResource`.
    pub fn send_short(
        &self,
        side: &Side,
        ep: EndpointId,
        header: u64,
        payload: &[u8],
    ) -> Result<(), SendError> {
        for _ in 0..RETRY_ROUNDS {
            match side.iface.am_short(ep, self.am, header, payload) {
                Err(SendError::NoResource) => {
                    if self.progress() == 0 {
                        self.expire_timers();
                    }
                }
                other => return other,
            }
        }
        Err(SendError::NoResource)
    }

    /// Drives until both primary windows are empty.
    pub fn drain(&self, max_rounds: usize) -> bool {
        self.drive_until(max_rounds, |h| {
            h.a.iface.window_len(h.a.ep) == 0 && h.b.iface.window_len(h.b.ep) == 0
        })
    }
}
