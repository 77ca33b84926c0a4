use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use signet::{
    ChallengeResponseAuth, DeliveryOutcome, IoState, LinearSections, NodeId, RdmaConfig,
    SegmentAdapter, SendStatus, ShmConfig, SignalHeader, SignalSink, TcpConfig,
    TransporterCallback, TransporterError, TransporterRegistry, wire,
};

type SeenSignal = (SignalHeader, u8, Vec<u32>, Vec<Vec<u32>>);

#[derive(Default)]
struct Recorder {
    signals: Mutex<Vec<SeenSignal>>,
    connects: Mutex<Vec<NodeId>>,
    disconnects: Mutex<Vec<(NodeId, i32)>>,
    errors: Mutex<Vec<(NodeId, TransporterError)>>,
    /// One-shot: request a stop once this many signals were seen.
    stop_after: AtomicUsize,
}

impl Recorder {
    fn seen(&self) -> usize {
        self.signals.lock().unwrap().len()
    }
}

impl SignalSink for Recorder {
    fn deliver_signal(
        &self,
        header: &SignalHeader,
        prio: u8,
        _err: Option<TransporterError>,
        data: &[u32],
        sections: &[&[u32]],
    ) -> DeliveryOutcome {
        let mut signals = self.signals.lock().unwrap();
        signals.push((
            header.clone(),
            prio,
            data.to_vec(),
            sections.iter().map(|s| s.to_vec()).collect(),
        ));
        let threshold = self.stop_after.load(Ordering::Relaxed);
        if threshold > 0 && signals.len() >= threshold {
            self.stop_after.store(0, Ordering::Relaxed);
            return DeliveryOutcome::Stop;
        }
        DeliveryOutcome::Continue
    }
}

impl TransporterCallback for Recorder {
    fn report_connect(&self, node: NodeId) {
        self.connects.lock().unwrap().push(node);
    }
    fn report_disconnect(&self, node: NodeId, errno: i32) {
        self.disconnects.lock().unwrap().push((node, errno));
    }
    fn report_error(&self, node: NodeId, kind: TransporterError) {
        self.errors.lock().unwrap().push((node, kind));
    }
}

fn drive(a: &mut TransporterRegistry, b: &mut TransporterRegistry) {
    a.update_connections();
    b.update_connections();
    a.external_io(Duration::ZERO);
    b.external_io(Duration::ZERO);
    std::thread::sleep(Duration::from_millis(1));
}

fn drive_until(
    a: &mut TransporterRegistry,
    b: &mut TransporterRegistry,
    what: &str,
    done: impl Fn(&TransporterRegistry, &TransporterRegistry) -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(20);
    while !done(a, b) {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        drive(a, b);
    }
}

/// Two registries wired together over loopback; a is node 1 (server side),
/// b is node 2.
fn connected_pair(
    make: impl FnOnce(&mut TransporterRegistry, &mut TransporterRegistry, std::net::SocketAddr),
) -> (TransporterRegistry, TransporterRegistry, Arc<Recorder>, Arc<Recorder>) {
    let rec_a = Arc::new(Recorder::default());
    let rec_b = Arc::new(Recorder::default());
    let mut a = TransporterRegistry::new(1, rec_a.clone()).unwrap();
    let mut b = TransporterRegistry::new(2, rec_b.clone()).unwrap();

    let addr = a.start_service("127.0.0.1:0".parse().unwrap()).unwrap();
    make(&mut a, &mut b, addr);

    a.do_connect(2);
    b.do_connect(1);
    b.start_clients();

    drive_until(&mut a, &mut b, "connect", |a, b| a.is_connected(2) && b.is_connected(1));

    assert!(rec_a.connects.lock().unwrap().contains(&2));
    assert!(rec_b.connects.lock().unwrap().contains(&1));
    (a, b, rec_a, rec_b)
}

fn send_simple(
    from: &TransporterRegistry,
    to: NodeId,
    gsn: u16,
    data: &[u32],
) -> SendStatus {
    let header = SignalHeader::new(gsn, 10, 20, data.len() as u32);
    from.prepare_send(&header, 1, data, to, &mut LinearSections::new(&[]))
}

#[test]
fn tcp_roundtrip() {
    let (mut a, mut b, rec_a, _rec_b) = connected_pair(|a, b, addr| {
        a.create_tcp_transporter(2, addr, TcpConfig::default()).unwrap();
        b.create_tcp_transporter(1, addr, TcpConfig::default()).unwrap();
    });

    assert_eq!(send_simple(&b, 1, 42, &[0xDEAD, 0xBEEF, 0xCAFE]), SendStatus::Ok);
    drive_until(&mut a, &mut b, "delivery", |_, _| rec_a.seen() == 1);

    let signals = rec_a.signals.lock().unwrap();
    let (header, prio, data, sections) = &signals[0];
    assert_eq!(header.gsn, 42);
    assert_eq!(header.receiver_block, 10);
    assert_eq!(wire::block_ref_block(header.sender_block_ref), 20);
    assert_eq!(wire::block_ref_node(header.sender_block_ref), 2);
    assert_eq!(*prio, 1);
    assert_eq!(data, &[0xDEAD, 0xBEEF, 0xCAFE]);
    assert!(sections.is_empty());
}

#[test]
fn tcp_sections_and_checksum_survive_the_wire() {
    let mut cfg = TcpConfig::default();
    cfg.framing.checksum_used = true;
    let (mut a, mut b, rec_a, _rec_b) = connected_pair(move |a, b, addr| {
        a.create_tcp_transporter(2, addr, cfg).unwrap();
        b.create_tcp_transporter(1, addr, cfg).unwrap();
    });

    let mut header = SignalHeader::new(77, 11, 22, 2);
    header.section_count = 2;
    let s0: Vec<u32> = (0..100).collect();
    let s1 = [9u32; 7];
    let status = b.prepare_send(
        &header,
        0,
        &[1, 2],
        1,
        &mut LinearSections::new(&[s0.as_slice(), &s1[..]]),
    );
    assert_eq!(status, SendStatus::Ok);

    drive_until(&mut a, &mut b, "delivery", |_, _| rec_a.seen() == 1);
    let signals = rec_a.signals.lock().unwrap();
    let (_, _, data, sections) = &signals[0];
    assert_eq!(data, &[1, 2]);
    assert_eq!(sections.len(), 2);
    assert_eq!(sections[0], s0);
    assert_eq!(sections[1], s1);
}

#[test]
fn tcp_many_signals_in_order() {
    let (mut a, mut b, rec_a, _rec_b) = connected_pair(|a, b, addr| {
        a.create_tcp_transporter(2, addr, TcpConfig::default()).unwrap();
        b.create_tcp_transporter(1, addr, TcpConfig::default()).unwrap();
    });

    for i in 0..200u32 {
        assert_eq!(send_simple(&b, 1, 7, &[i, i * 3]), SendStatus::Ok);
    }
    drive_until(&mut a, &mut b, "bulk delivery", |_, _| rec_a.seen() == 200);

    let signals = rec_a.signals.lock().unwrap();
    for (i, (_, _, data, _)) in signals.iter().enumerate() {
        assert_eq!(data, &[i as u32, i as u32 * 3]);
    }
}

#[test]
fn backpressure_stop_suspends_and_resumes() {
    let (mut a, mut b, rec_a, _rec_b) = connected_pair(|a, b, addr| {
        a.create_tcp_transporter(2, addr, TcpConfig::default()).unwrap();
        b.create_tcp_transporter(1, addr, TcpConfig::default()).unwrap();
    });
    rec_a.stop_after.store(3, Ordering::Relaxed);

    for i in 0..10u32 {
        assert_eq!(send_simple(&b, 1, 9, &[i]), SendStatus::Ok);
    }

    drive_until(&mut a, &mut b, "stop point", |_, _| rec_a.seen() >= 3);
    // the stop froze delivery at exactly the third signal
    assert_eq!(rec_a.seen(), 3);

    drive_until(&mut a, &mut b, "resume", |_, _| rec_a.seen() == 10);
    let signals = rec_a.signals.lock().unwrap();
    for (i, (_, _, data, _)) in signals.iter().enumerate() {
        assert_eq!(data, &[i as u32]);
    }
}

#[test]
fn authenticated_connect_and_roundtrip() {
    let rec_a = Arc::new(Recorder::default());
    let rec_b = Arc::new(Recorder::default());
    let mut a = TransporterRegistry::new(1, rec_a.clone()).unwrap();
    let mut b = TransporterRegistry::new(2, rec_b.clone()).unwrap();
    a.set_authenticator(Arc::new(ChallengeResponseAuth::new("cluster pass")));
    b.set_authenticator(Arc::new(ChallengeResponseAuth::new("cluster pass")));

    let addr = a.start_service("127.0.0.1:0".parse().unwrap()).unwrap();
    a.create_tcp_transporter(2, addr, TcpConfig::default()).unwrap();
    b.create_tcp_transporter(1, addr, TcpConfig::default()).unwrap();
    a.do_connect(2);
    b.do_connect(1);
    b.start_clients();

    drive_until(&mut a, &mut b, "authed connect", |a, b| a.is_connected(2) && b.is_connected(1));

    assert_eq!(send_simple(&b, 1, 13, &[4, 5]), SendStatus::Ok);
    drive_until(&mut a, &mut b, "authed delivery", |_, _| rec_a.seen() == 1);
}

#[test]
fn prepare_send_outcome_ladder() {
    let (a, mut b, _rec_a, _rec_b) = {
        let (a, b, ra, rb) = connected_pair(|a, b, addr| {
            a.create_tcp_transporter(2, addr, TcpConfig::default()).unwrap();
            b.create_tcp_transporter(1, addr, TcpConfig::default()).unwrap();
        });
        (a, b, ra, rb)
    };

    // unknown peer
    assert_eq!(send_simple(&b, 77, 1, &[1]), SendStatus::UnknownNode);

    // halted output blocks everything except the management block
    b.set_io_state(1, IoState::HaltOutput);
    assert_eq!(send_simple(&b, 1, 1, &[1]), SendStatus::Blocked);
    let to_qmgr = SignalHeader::new(1, wire::QMGR_BLOCK, 20, 0);
    assert_eq!(
        b.prepare_send(&to_qmgr, 1, &[], 1, &mut LinearSections::new(&[])),
        SendStatus::Ok
    );
    b.set_io_state(1, IoState::NoHalt);

    // a frame one word over the limit is rejected before packing
    let big: Vec<u32> = vec![0; 9000];
    let mut header = SignalHeader::new(1, 10, 20, 0);
    header.section_count = 1;
    assert_eq!(
        b.prepare_send(&header, 1, &[], 1, &mut LinearSections::new(&[big.as_slice()])),
        SendStatus::MessageTooBig
    );

    // a disconnected peer refuses immediately
    b.do_disconnect(1);
    drop(a);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        b.update_connections();
        if !b.is_connected(1) {
            break;
        }
        assert!(Instant::now() < deadline);
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(send_simple(&b, 1, 1, &[1]), SendStatus::Disconnected);
}

#[test]
fn shm_roundtrip_both_directions() {
    let key = 0x5197_1000 | (std::process::id() as i32 & 0xFFF);
    let cfg = ShmConfig { shm_key: key, ..ShmConfig::default() };
    let (mut a, mut b, rec_a, rec_b) = connected_pair(move |a, b, addr| {
        a.create_shm_transporter(2, addr, cfg).unwrap();
        b.create_shm_transporter(1, addr, cfg).unwrap();
    });

    for i in 0..50u32 {
        assert_eq!(send_simple(&b, 1, 5, &[i]), SendStatus::Ok);
        assert_eq!(send_simple(&a, 2, 6, &[i + 1000]), SendStatus::Ok);
    }
    drive_until(&mut a, &mut b, "shm delivery", |_, _| rec_a.seen() == 50 && rec_b.seen() == 50);

    let a_signals = rec_a.signals.lock().unwrap();
    let b_signals = rec_b.signals.lock().unwrap();
    for i in 0..50usize {
        assert_eq!(a_signals[i].2, vec![i as u32]);
        assert_eq!(a_signals[i].0.gsn, 5);
        assert_eq!(wire::block_ref_node(a_signals[i].0.sender_block_ref), 2);
        assert_eq!(b_signals[i].2, vec![i as u32 + 1000]);
        assert_eq!(b_signals[i].0.gsn, 6);
    }
}

#[test]
fn rdma_roundtrip_with_segment_adapters() {
    let base = format!("signet-e2e-{}", std::process::id());
    let to1 = format!("{base}-2to1");
    let to2 = format!("{base}-1to2");

    let adapters_for = |local: &str, remote: &str| {
        vec![
            Box::new(SegmentAdapter::new(local.to_string(), remote.to_string()))
                as Box<dyn signet::DmaAdapter>,
            Box::new(SegmentAdapter::new(local.to_string(), remote.to_string())),
        ]
    };

    let cfg = RdmaConfig { packet_size: 128, ..RdmaConfig::default() };
    let (mut a, mut b, rec_a, _rec_b) = {
        let cfg = cfg.clone();
        let (to1, to2) = (to1.clone(), to2.clone());
        connected_pair(move |a, b, addr| {
            a.create_rdma_transporter(2, addr, cfg.clone(), adapters_for(&to1, &to2)).unwrap();
            b.create_rdma_transporter(1, addr, cfg.clone(), adapters_for(&to2, &to1)).unwrap();
        })
    };

    for i in 0..20u32 {
        assert_eq!(send_simple(&b, 1, 3, &[i, i + 1, i + 2]), SendStatus::Ok);
    }
    drive_until(&mut a, &mut b, "rdma delivery", |_, _| rec_a.seen() == 20);

    let signals = rec_a.signals.lock().unwrap();
    for (i, (header, _, data, _)) in signals.iter().enumerate() {
        assert_eq!(header.gsn, 3);
        assert_eq!(data, &[i as u32, i as u32 + 1, i as u32 + 2]);
    }
}
