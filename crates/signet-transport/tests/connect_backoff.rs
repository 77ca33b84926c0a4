use std::{net::TcpListener, sync::Arc, thread, time::Duration};

use signet_transport::{
    ControlLine, Link, TcpConfig, TcpTransporter, TransporterCallback, read_control_line,
    write_control_line,
};
use signet_wire::{DeliveryOutcome, SignalHeader, SignalSink, TransporterError};

struct NullCb;

impl SignalSink for NullCb {
    fn deliver_signal(
        &self,
        _h: &SignalHeader,
        _p: u8,
        _e: Option<TransporterError>,
        _d: &[u32],
        _s: &[&[u32]],
    ) -> DeliveryOutcome {
        DeliveryOutcome::Continue
    }
}
impl TransporterCallback for NullCb {}

#[test]
fn refused_connects_trigger_backoff_and_success_clears_it() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // a server that slams the door three times, then completes the
    // handshake properly
    let server = thread::spawn(move || {
        for _ in 0..3 {
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        }
        let (mut stream, _) = listener.accept().unwrap();
        let greeting = read_control_line(&mut stream, Duration::from_secs(5)).unwrap();
        assert!(matches!(greeting, ControlLine::NodeGreeting { node_id: 2, .. }));
        write_control_line(&mut stream, &ControlLine::NodeGreeting { node_id: 1, kind: None })
            .unwrap();
        thread::sleep(Duration::from_millis(300));
    });

    let mut t = TcpTransporter::new(2, 1, addr, TcpConfig::default(), Arc::new(NullCb));
    t.init().unwrap();
    assert!(!t.core().is_server);

    for _ in 0..3 {
        assert!(!t.connect_client());
    }
    assert_eq!(t.core().refused_count(), 3);

    // the third refusal armed a block of at most one second
    assert!(t.core_mut().is_connect_blocked());
    // blocked attempts bail out before touching the socket
    assert!(!t.connect_client());

    thread::sleep(Duration::from_millis(1100));
    assert!(!t.core_mut().is_connect_blocked());

    assert!(t.connect_client());
    assert!(t.core().connected);
    assert_eq!(t.core().refused_count(), 0);

    server.join().unwrap();
}
