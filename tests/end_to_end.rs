//! Host and peer nodes talking over in-memory links on separate threads.
//!
//! Real clocks and real scheduling: timeouts are generous, and assertions
//! allow for a reply occasionally lost to a handshake race (the retry timer
//! covers it).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use conbus::protocol::{command, Command, ErrorCode};
use conbus::transport::{loopback, LoopbackLink, Polarity};
use conbus::{BusConfig, BusEvent, HostBus, PeerId, PeerNode};

const VOLUME: u8 = 0x71;
const REJECTED: u8 = 0x72;

fn config() -> BusConfig {
    let mut config = BusConfig::default()
        .with_reply_timeout(Duration::from_millis(100))
        .with_ack_timeout(Duration::from_millis(500));
    config.read_timeout_ms = 100;
    config.busy_wait_us = 5_000;
    config.ping_timeout_ms = 50;
    config
}

struct PeerThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<PeerNode<LoopbackLink>>,
}

impl PeerThread {
    fn join(self) -> PeerNode<LoopbackLink> {
        self.stop.store(true, Ordering::Release);
        self.handle.join().unwrap()
    }
}

fn spawn_peer(peer: PeerId, link: LoopbackLink, seen: Arc<Mutex<Vec<Vec<u8>>>>) -> PeerThread {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    let handle = thread::spawn(move || {
        let mut node = PeerNode::builder(peer)
            .config(config())
            .handle(VOLUME, move |payload, _ctx| {
                seen.lock().unwrap().push(payload.to_vec());
                Ok(())
            })
            .handle(REJECTED, |_, _| Err(ErrorCode::INVALID_PARAMS))
            .build(link)
            .unwrap();
        while !flag.load(Ordering::Acquire) {
            node.poll().unwrap();
            node.notify_frame_boundary().unwrap();
            thread::sleep(Duration::from_micros(200));
        }
        node
    });
    PeerThread { stop, handle }
}

struct Console {
    bus: HostBus<LoopbackLink>,
    peers: Vec<PeerThread>,
    seen: Arc<Mutex<Vec<Vec<u8>>>>,
    events: Vec<BusEvent>,
}

fn console() -> Console {
    let (host_g, peer_g) = loopback::pair(Polarity::ActiveLow);
    let (host_a, peer_a) = loopback::pair(Polarity::ActiveLow);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let peers = vec![
        spawn_peer(PeerId::Graphics, peer_g, seen.clone()),
        spawn_peer(PeerId::Audio, peer_a, Arc::new(Mutex::new(Vec::new()))),
    ];
    let bus = HostBus::builder()
        .config(config())
        .build(host_g, host_a)
        .unwrap();
    Console {
        bus,
        peers,
        seen,
        events: Vec::new(),
    }
}

impl Console {
    /// Service the bus until `done` holds for the collected events.
    fn run_until(&mut self, done: impl Fn(&[BusEvent]) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            self.bus.service_tick();
            self.events.extend(self.bus.take_events());
            if done(&self.events) {
                return true;
            }
            thread::sleep(Duration::from_micros(200));
        }
        false
    }

    fn shutdown(self) -> Vec<PeerNode<LoopbackLink>> {
        self.peers.into_iter().map(PeerThread::join).collect()
    }
}

#[test]
fn test_command_is_acknowledged() {
    let mut console = console();

    console
        .bus
        .handle()
        .send(PeerId::Graphics, VOLUME, vec![0, 1, 64, 200], true)
        .unwrap();

    assert!(console.run_until(|events| events.contains(&BusEvent::CommandAcked {
        peer: PeerId::Graphics,
        command_id: VOLUME,
    })));
    let seen = console.seen.lock().unwrap().clone();
    assert!(!seen.is_empty());
    assert!(seen.iter().all(|p| p == &[0, 1, 64, 200]));
    console.shutdown();
}

#[test]
fn test_handler_error_reaches_host() {
    let mut console = console();

    console
        .bus
        .handle()
        .send(PeerId::Audio, REJECTED, vec![], true)
        .unwrap();

    assert!(console.run_until(|events| events.contains(&BusEvent::CommandFailed {
        peer: PeerId::Audio,
        command_id: REJECTED,
    })));
    assert!(console.events.contains(&BusEvent::PeerError {
        peer: PeerId::Audio,
        command_id: REJECTED,
        code: ErrorCode::INVALID_PARAMS,
    }));
    assert!(!console.bus.handle().is_failed(PeerId::Audio));
    console.shutdown();
}

#[test]
fn test_peers_synchronize_to_host_clock() {
    let mut console = console();
    for _ in 0..5 {
        console.bus.on_frame();
    }

    let start = Instant::now();
    console.run_until(|_| start.elapsed() > Duration::from_millis(50));

    for node in console.shutdown() {
        let state = node.sync_state();
        assert!(state.synced, "{} never synchronized", node.peer());
        assert_eq!(state.frame_counter, 5);
    }
}

#[test]
fn test_health_ping_passes() {
    let mut console = console();
    console.run_until(|_| true);

    let config = console.bus.config().clone();
    for _ in 0..config.health_interval_frames {
        console.bus.on_frame();
    }
    console.events.extend(console.bus.take_events());

    for peer in PeerId::ALL {
        assert!(!console
            .events
            .contains(&BusEvent::HealthCheckFailed { peer }));
        assert_eq!(
            console.bus.recovery().peer_health(peer).recovery_attempts,
            0
        );
    }
    console.shutdown();
}

#[test]
fn test_frame_boundary_notification() {
    let mut console = console();

    console
        .bus
        .handle()
        .enqueue(
            PeerId::Graphics,
            Command::empty(command::SYNC_NOTIFY_REQUEST),
            false,
        )
        .unwrap();

    assert!(console.run_until(|events| events
        .iter()
        .any(|e| matches!(e, BusEvent::FrameBoundary { peer: PeerId::Graphics, .. }))));
    console.shutdown();
}
