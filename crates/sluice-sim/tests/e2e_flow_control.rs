use proptest::prelude::*;
use sluice_sim::{Harness, LossScenario};
use sluice_transport::DeviceOptions;
use sluice_ud::{EndpointTx, PendingError, PendingRequest, SendError, UdIfaceConfig};

fn payload_of(message: &[u8]) -> &[u8] {
    &message[8..]
}

fn queued_send(harness: &Harness, payload: &'static [u8]) -> PendingRequest {
    let am = harness.am;
    Box::new(move |tx: &mut EndpointTx<'_>| tx.am_short(am, 0, payload))
}

#[test]
fn pending_sends_replay_across_endpoints_in_arrival_order() {
    let config = UdIfaceConfig {
        tx_skbs: 4,
        ..Harness::small_config()
    };
    let harness = Harness::builder()
        .config(config)
        .build()
        .expect("harness should build");
    let (a_ep2, _b_ep2) = harness.connect_extra().expect("extra endpoints");

    for payload in [b"w0", b"w1", b"w2", b"w3"] {
        harness
            .a
            .iface
            .am_short(harness.a.ep, harness.am, 0, payload)
            .expect("send should succeed");
    }
    assert_eq!(harness.a.iface.free_skbs(), 0);
    assert_eq!(
        harness.a.iface.am_short(harness.a.ep, harness.am, 0, b"A"),
        Err(SendError::NoResource)
    );
    harness
        .a
        .iface
        .pending_add(harness.a.ep, queued_send(&harness, b"A"))
        .expect("queue A");
    assert_eq!(
        harness.a.iface.am_short(a_ep2, harness.am, 0, b"B"),
        Err(SendError::NoResource)
    );
    harness
        .a
        .iface
        .pending_add(a_ep2, queued_send(&harness, b"B"))
        .expect("queue B");

    assert!(harness.drive_until(10_000, |h| h.b.received_count() == 6));
    let order: Vec<Vec<u8>> = harness
        .b
        .received()
        .iter()
        .map(|m| payload_of(m).to_vec())
        .collect();
    assert_eq!(
        order,
        vec![
            b"w0".to_vec(),
            b"w1".to_vec(),
            b"w2".to_vec(),
            b"w3".to_vec(),
            b"A".to_vec(),
            b"B".to_vec()
        ]
    );
    assert_eq!(harness.a.iface.stats().pending_replays, 2);
    assert_eq!(harness.a.iface.pending_len(harness.a.ep), 0);
    assert_eq!(harness.a.iface.pending_len(a_ep2), 0);
}

#[test]
fn pending_add_is_refused_while_resources_remain() {
    let harness = Harness::builder().build().expect("harness should build");
    assert_eq!(
        harness
            .a
            .iface
            .pending_add(harness.a.ep, queued_send(&harness, b"now")),
        Err(PendingError::Busy)
    );
}

#[test]
fn window_limit_bounds_unacknowledged_sends() {
    let config = UdIfaceConfig {
        max_window: 8,
        ..Harness::small_config()
    };
    let harness = Harness::builder()
        .config(config)
        .build()
        .expect("harness should build");
    let mut accepted = 0;
    while harness
        .a
        .iface
        .am_short(harness.a.ep, harness.am, 0, b"fill")
        .is_ok()
    {
        accepted += 1;
        assert!(accepted <= 8, "window overran its limit");
    }
    assert_eq!(accepted, 8);
    assert_eq!(harness.a.iface.window_len(harness.a.ep), 8);
    assert!(harness.drain(1_000));
    harness
        .a
        .iface
        .am_short(harness.a.ep, harness.am, 0, b"again")
        .expect("window reopened");
}

#[derive(Debug, Clone)]
enum Op {
    Send(u8),
    ProgressSender,
    ProgressReceiver,
    Timers,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u8..40).prop_map(Op::Send),
        2 => Just(Op::ProgressSender),
        2 => Just(Op::ProgressReceiver),
        1 => Just(Op::Timers),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn credits_and_sequence_stay_consistent(
        ops in prop::collection::vec(op(), 1..200),
        loss in 0u8..20,
        seed in any::<u64>(),
        ordered in any::<bool>(),
    ) {
        let config = UdIfaceConfig {
            max_window: 16,
            ack_req_thresh: 4,
            ..Harness::small_config()
        };
        let moderation = config.tx_moderation as u64;
        let harness = Harness::builder()
            .config(config)
            .options(DeviceOptions {
                ordered_send_completions: ordered,
                ..DeviceOptions::default()
            })
            .loss(LossScenario { loss_rate_percent: loss, drop_control: true, seed })
            .build()
            .expect("harness should build");
        let initial = harness.a.iface.tx_available();
        let mut sent: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                Op::Send(tag) => {
                    let payload = [tag; 3];
                    match harness.a.iface.am_short(harness.a.ep, harness.am, 0, &payload) {
                        Ok(()) => sent.push(tag),
                        Err(SendError::NoResource) => {}
                        Err(err) => prop_assert!(false, "unexpected send error {err}"),
                    }
                }
                Op::ProgressSender => {
                    harness.a.iface.progress();
                }
                Op::ProgressReceiver => {
                    harness.b.iface.progress();
                }
                Op::Timers => {
                    harness.expire_timers();
                }
            }

            let stats = harness.a.iface.stats();
            let submitted = stats.am_short.count
                + stats.acks_sent
                + stats.ack_requests_sent
                + stats.resends;
            let available = harness.a.iface.tx_available() as u64;
            prop_assert_eq!(available + submitted, initial as u64 + stats.tx_credits_returned);
            if ordered {
                // A coalesced completion retires between one and a full
                // moderation batch of packets.
                prop_assert!(stats.tx_credits_returned >= stats.tx_completions);
                prop_assert!(stats.tx_credits_returned <= stats.tx_completions * moderation);
            } else {
                prop_assert_eq!(stats.tx_credits_returned, stats.tx_completions);
            }
            prop_assert!(harness.a.iface.window_len(harness.a.ep) <= 16);

            let received: Vec<u8> = harness.b.received().iter().map(|m| m[8]).collect();
            prop_assert!(received.len() <= sent.len());
            prop_assert_eq!(&received[..], &sent[..received.len()]);
        }
    }
}
