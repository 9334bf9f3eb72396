use rand::{rngs::StdRng, Rng, SeedableRng};
use sluice_codec::PacketFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossScenario {
    pub loss_rate_percent: u8,
    /// Control packets (acks, ack requests) are subject to loss too.
    pub drop_control: bool,
    pub seed: u64,
}

pub const LOSSLESS: LossScenario = LossScenario {
    loss_rate_percent: 0,
    drop_control: false,
    seed: 0,
};

pub const PRACTICAL_BASELINE: LossScenario = LossScenario {
    loss_rate_percent: 10,
    drop_control: true,
    seed: 0x5EED_CAFE,
};

pub fn practical_baseline() -> LossScenario {
    PRACTICAL_BASELINE
}

impl LossScenario {
    /// Seeded drop filter for `LoopbackFabric::set_drop_filter`.
    pub fn drop_filter(self) -> impl FnMut(&[u8]) -> bool + Send + 'static {
        let mut rng = StdRng::seed_from_u64(self.seed);
        move |packet: &[u8]| {
            if self.loss_rate_percent == 0 {
                return false;
            }
            let data = packet
                .first()
                .is_some_and(|flags| flags & (PacketFlags::AM.bits() | PacketFlags::PUT.bits()) != 0);
            if !data && !self.drop_control {
                return false;
            }
            rng.gen_range(0..100u8) < self.loss_rate_percent
        }
    }
}
