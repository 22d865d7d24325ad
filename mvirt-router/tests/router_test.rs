//! End-to-end router tests
//!
//! Each test starts a full `Router` (workers, control thread, punting
//! channel) and drives it through its ports and control API:
//! 1. Self-ping through the local loopback path
//! 2. Echo to a remote host answered by a simulated peer
//! 3. Time-exceeded quoting the echo request
//! 4. Transit IPv4 forwarding between interfaces
//! 5. MPLS label swap through an API-installed label
//! 6. Label imposition on a labeled route
//! 7. Start from a configuration file
//! 8. Shutdown returns every buffer to the pool

use std::net::Ipv4Addr;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::{Duration, Instant};

use mvirt_router::control::api::{ApiPayload, ApiRequest};
use mvirt_router::dataplane::icmp::{
    ECHO_IDENT, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, ICMP_TIME_EXCEEDED,
};
use mvirt_router::dataplane::mpls::{MPLS_DEFAULT_TTL, MPLS_HEADER_LEN, MplsHeader};
use mvirt_router::dataplane::{ETHERTYPE_IPV4, ETHERTYPE_MPLS};
use mvirt_router::ping::{EchoClient, EchoOutcome};
use mvirt_router::test_util::{icmp_message, ipv4_icmp, ipv4_udp, mpls_stack};
use mvirt_router::{InterfaceConfig, Port, Router, RouterConfig};
use nix::errno::Errno;
use smoltcp::wire::{Icmpv4Packet, Ipv4Packet};

const WAIT: Duration = Duration::from_secs(2);

fn addr(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn config() -> RouterConfig {
    RouterConfig {
        workers: 2,
        pool_size: 256,
        interfaces: vec![
            InterfaceConfig {
                name: "eth0".to_string(),
                domain: 0,
                address: Some("10.0.0.1/24".parse().unwrap()),
            },
            InterfaceConfig {
                name: "eth1".to_string(),
                domain: 0,
                address: Some("10.0.1.1/24".parse().unwrap()),
            },
        ],
        ..Default::default()
    }
}

fn start() -> Router {
    let _ = tracing_subscriber::fmt::try_init();
    Router::start(config()).expect("router starts")
}

fn add_remote_route(router: &Router) {
    let resp = router.call(ApiRequest::RouteAdd {
        domain: 0,
        prefix: "192.168.0.0/16".parse().unwrap(),
        gateway: addr("10.0.0.2"),
        iface: 1,
        label: None,
        exist_ok: false,
    });
    assert!(resp.is_ok(), "route add failed: {resp:?}");
}

/// Packet count of one stage, summed over workers
fn stage_packets(router: &Router, name: &str) -> u64 {
    let resp = router.call(ApiRequest::GraphStats);
    let Some(ApiPayload::GraphStats(nodes)) = resp.payload else {
        panic!("expected graph stats");
    };
    nodes
        .iter()
        .find(|n| n.name == name)
        .map(|n| n.packets)
        .unwrap_or(0)
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Answer the next echo request seen on `port` with `answer(request_ip)`.
fn spawn_peer(
    port: Port,
    answer: impl FnOnce(&[u8]) -> Vec<u8> + Send + 'static,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let request = port.recv_timeout(WAIT).expect("echo request transmitted");
        let data = request.data().to_vec();
        drop(request);
        assert!(port.inject(ETHERTYPE_IPV4, &answer(&data)));
        data
    })
}

#[test]
fn test_self_ping() {
    let router = start();
    let client = EchoClient::new(router.client());

    let outcome = client.echo(0, addr("10.0.0.1"), 1, 64).unwrap();
    let EchoOutcome::Reply(reply) = outcome else {
        panic!("self-ping timed out");
    };
    assert_eq!(reply.icmp_type, ICMP_ECHO_REPLY);
    assert_eq!(reply.sequence, 1);
    assert_eq!(reply.ttl, 64);
    assert!(reply.rtt.is_some());

    // The reply was consumed by the echo
    let resp = router.call(ApiRequest::IcmpEchoReply);
    assert!(resp.is_ok());
    assert!(resp.payload.is_none());

    router.shutdown().unwrap();
}

#[test]
fn test_ping_loop_counts_replies() {
    let router = start();
    let client = EchoClient::new(router.client());
    let stop = AtomicBool::new(false);

    let outcomes = client
        .ping(0, addr("10.0.1.1"), 3, Duration::from_millis(1), &stop)
        .unwrap();
    assert_eq!(outcomes.len(), 3);
    for (seq, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.reply().unwrap().sequence, seq as u16);
    }

    router.shutdown().unwrap();
}

#[test]
fn test_echo_to_remote_peer() {
    let router = start();
    add_remote_route(&router);

    let peer = spawn_peer(router.port("eth0").unwrap().clone(), |request| {
        let ip = Ipv4Packet::new_checked(request).unwrap();
        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        let reply = icmp_message(
            ICMP_ECHO_REPLY,
            0,
            icmp.echo_ident(),
            icmp.echo_seq_no(),
            icmp.data(),
        );
        ipv4_icmp(ip.dst_addr(), ip.src_addr(), 50, &reply)
    });

    let client = EchoClient::new(router.client());
    let outcome = client.echo(0, addr("192.168.1.1"), 7, 64).unwrap();
    let request = peer.join().unwrap();

    let ip = Ipv4Packet::new_checked(&request[..]).unwrap();
    assert_eq!(ip.src_addr(), addr("10.0.0.1"));
    assert_eq!(ip.dst_addr(), addr("192.168.1.1"));
    assert_eq!(ip.hop_limit(), 64);
    let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
    assert!(icmp.verify_checksum());
    assert_eq!(u8::from(icmp.msg_type()), ICMP_ECHO_REQUEST);
    assert_eq!(icmp.echo_ident(), ECHO_IDENT);
    assert_eq!(icmp.echo_seq_no(), 7);

    let reply = outcome.reply().expect("reply collected");
    assert_eq!(reply.icmp_type, ICMP_ECHO_REPLY);
    assert_eq!(reply.sequence, 7);
    assert_eq!(reply.ttl, 50);
    assert!(reply.rtt.is_some());

    router.shutdown().unwrap();
}

#[test]
fn test_time_exceeded_reports_quoted_sequence() {
    let router = start();
    add_remote_route(&router);

    let peer = spawn_peer(router.port("eth0").unwrap().clone(), |request| {
        let ip = Ipv4Packet::new_checked(request).unwrap();
        let error = icmp_message(ICMP_TIME_EXCEEDED, 0, 0, 0, request);
        ipv4_icmp(addr("10.0.0.2"), ip.src_addr(), 63, &error)
    });

    let client = EchoClient::new(router.client());
    let outcome = client.echo(0, addr("192.168.1.1"), 1, 1).unwrap();
    let request = peer.join().unwrap();
    assert_eq!(Ipv4Packet::new_checked(&request[..]).unwrap().hop_limit(), 1);

    let reply = outcome.reply().expect("time exceeded collected");
    assert_eq!(reply.icmp_type, ICMP_TIME_EXCEEDED);
    assert_eq!(reply.sequence, 1);
    assert_eq!(reply.ttl, 63);
    assert!(reply.rtt.is_some());
    assert_eq!(&reply.data[..20], &request[..20]);

    router.shutdown().unwrap();
}

#[test]
fn test_unanswered_probe_times_out() {
    let router = start();
    add_remote_route(&router);

    let client =
        EchoClient::new(router.client()).with_polling(Duration::from_millis(1), 5);
    let outcome = client.echo(0, addr("192.168.1.1"), 1, 64).unwrap();
    assert_eq!(outcome, EchoOutcome::Timeout);
    assert!(router.port("eth0").unwrap().recv_timeout(WAIT).is_some());

    router.shutdown().unwrap();
}

#[test]
fn test_echo_without_route_rejected() {
    let router = start();
    let client = EchoClient::new(router.client());

    let err = client.echo(0, addr("172.16.0.1"), 1, 64).unwrap_err();
    assert_eq!(err, mvirt_router::ping::PingError::Rejected(Errno::EHOSTUNREACH));

    router.shutdown().unwrap();
}

#[test]
fn test_transit_forwarding() {
    let router = start();
    let eth0 = router.port("eth0").unwrap();
    let eth1 = router.port("eth1").unwrap();

    let packet = ipv4_udp(addr("10.0.0.5"), addr("10.0.1.7"), 64);
    assert!(eth0.inject(ETHERTYPE_IPV4, &packet));

    let out = eth1.recv_timeout(WAIT).expect("packet forwarded");
    assert_eq!(out.meta.ethertype, ETHERTYPE_IPV4);
    let ip = Ipv4Packet::new_checked(out.data()).unwrap();
    assert!(ip.verify_checksum());
    assert_eq!(ip.hop_limit(), 63);
    assert_eq!(ip.dst_addr(), addr("10.0.1.7"));
    assert_eq!(ip.payload(), &packet[20..]);
    drop(out);

    // No route: counted and dropped
    assert!(eth0.inject(ETHERTYPE_IPV4, &ipv4_udp(addr("10.0.0.5"), addr("172.16.0.1"), 64)));
    assert!(wait_for(|| stage_packets(&router, "ip_output_no_route") == 1));

    // TTL 1 in transit
    assert!(eth0.inject(ETHERTYPE_IPV4, &ipv4_udp(addr("10.0.0.5"), addr("10.0.1.7"), 1)));
    assert!(wait_for(|| stage_packets(&router, "ip_input_ttl_exceeded") == 1));

    router.shutdown().unwrap();
}

fn add_label(router: &Router, label: u32, iface: u16) {
    let resp = router.call(ApiRequest::NexthopAdd {
        domain: 0,
        label,
        iface,
        exist_ok: false,
    });
    assert!(resp.is_ok(), "label add failed: {resp:?}");
}

#[test]
fn test_mpls_label_swap() {
    let router = start();
    add_label(&router, 100, 1);
    add_label(&router, 200, 2);

    // Same label again without exist_ok
    let resp = router.call(ApiRequest::NexthopAdd {
        domain: 0,
        label: 200,
        iface: 2,
        exist_ok: false,
    });
    assert_eq!(resp.errno(), Some(Errno::EEXIST));

    // Outer 100 is popped, the packet follows inner 200 out of eth1
    let payload = ipv4_udp(addr("10.0.0.5"), addr("192.168.1.1"), 64);
    let eth0 = router.port("eth0").unwrap();
    assert!(eth0.inject(ETHERTYPE_MPLS, &mpls_stack(&[(100, 10), (200, 64)], &payload)));

    let out = router
        .port("eth1")
        .unwrap()
        .recv_timeout(WAIT)
        .expect("labelled packet forwarded");
    assert_eq!(out.meta.ethertype, ETHERTYPE_MPLS);
    let header = MplsHeader::parse(out.data()).unwrap();
    assert_eq!(header.label, 200);
    assert_eq!(header.ttl, 9);
    assert!(header.bos);
    drop(out);
    assert!(eth0.try_recv().is_none());

    // Unknown inner label
    assert!(eth0.inject(ETHERTYPE_MPLS, &mpls_stack(&[(100, 10), (300, 64)], &payload)));
    assert!(wait_for(|| stage_packets(&router, "mpls_forward_invalid") == 1));

    // Label removed: traffic now drops
    let resp = router.call(ApiRequest::NexthopDel {
        domain: 0,
        label: 200,
        missing_ok: false,
    });
    assert!(resp.is_ok());
    assert!(eth0.inject(ETHERTYPE_MPLS, &mpls_stack(&[(100, 10), (200, 64)], &payload)));
    assert!(wait_for(|| stage_packets(&router, "mpls_forward_invalid") == 2));

    router.shutdown().unwrap();
}

#[test]
fn test_labeled_route_imposes_label() {
    let router = start();
    add_label(&router, 500, 2);
    let resp = router.call(ApiRequest::RouteAdd {
        domain: 0,
        prefix: "172.20.0.0/16".parse().unwrap(),
        gateway: addr("10.0.1.2"),
        iface: 2,
        label: Some(500),
        exist_ok: false,
    });
    assert!(resp.is_ok(), "route add failed: {resp:?}");

    let packet = ipv4_udp(addr("10.0.0.5"), addr("172.20.3.4"), 64);
    assert!(router.port("eth0").unwrap().inject(ETHERTYPE_IPV4, &packet));

    let out = router
        .port("eth1")
        .unwrap()
        .recv_timeout(WAIT)
        .expect("labelled packet transmitted");
    assert_eq!(out.meta.ethertype, ETHERTYPE_MPLS);
    let header = MplsHeader::parse(out.data()).unwrap();
    assert_eq!(header.label, 500);
    assert_eq!(header.ttl, MPLS_DEFAULT_TTL);
    assert!(header.bos);

    let ip = Ipv4Packet::new_checked(&out.data()[MPLS_HEADER_LEN..]).unwrap();
    assert!(ip.verify_checksum());
    assert_eq!(ip.hop_limit(), 63);
    assert_eq!(ip.dst_addr(), addr("172.20.3.4"));
    drop(out);
    assert_eq!(stage_packets(&router, "mpls_push"), 1);

    // Echo requests to the prefix are labelled too
    let client = EchoClient::new(router.client()).with_polling(Duration::from_millis(1), 1);
    let _ = client.echo(0, addr("172.20.3.4"), 9, 64).unwrap();
    let out = router
        .port("eth1")
        .unwrap()
        .recv_timeout(WAIT)
        .expect("labelled echo request transmitted");
    assert_eq!(MplsHeader::parse(out.data()).unwrap().label, 500);
    let ip = Ipv4Packet::new_checked(&out.data()[MPLS_HEADER_LEN..]).unwrap();
    assert_eq!(ip.src_addr(), addr("10.0.1.1"));
    drop(out);

    router.shutdown().unwrap();
}

#[test]
fn test_start_from_config_file() {
    use std::io::Write;

    let _ = tracing_subscriber::fmt::try_init();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "workers": 1,
            "burst_size": 8,
            "wake_timeout_ms": 50,
            "interfaces": [
                {{"name": "red0", "domain": 3, "address": "172.16.0.1/24"}}
            ]
        }}"#
    )
    .unwrap();

    let config = RouterConfig::load(file.path()).unwrap();
    let router = Router::start(config).unwrap();
    assert_eq!(router.ports().len(), 1);

    let resp = router.call(ApiRequest::RouteGet {
        domain: 3,
        dst: addr("172.16.0.9"),
    });
    let Some(ApiPayload::Route(route)) = resp.payload else {
        panic!("expected connected route, got {resp:?}");
    };
    assert_eq!(route.iface, 1);
    assert_eq!(route.gateway, addr("172.16.0.1"));

    // The connected route lives in domain 3 only
    let resp = router.call(ApiRequest::RouteGet {
        domain: 0,
        dst: addr("172.16.0.9"),
    });
    assert_eq!(resp.errno(), Some(Errno::EHOSTUNREACH));

    let client = EchoClient::new(router.client());
    let outcome = client.echo(3, addr("172.16.0.1"), 5, 64).unwrap();
    assert_eq!(outcome.reply().map(|r| r.sequence), Some(5));

    router.shutdown().unwrap();
}

#[test]
fn test_shutdown_releases_buffers() {
    let router = start();
    add_remote_route(&router);
    let pool = router.pool().clone();

    // Leave a request queued on eth0 and an unread reply in the mailbox
    let client =
        EchoClient::new(router.client()).with_polling(Duration::from_millis(1), 1);
    let _ = client.echo(0, addr("192.168.1.1"), 1, 64).unwrap();
    assert!(wait_for(|| stage_packets(&router, "port_tx") >= 1));
    let resp = router.call(ApiRequest::IcmpEchoRequest(
        mvirt_router::control::icmp::EchoParams {
            domain: 0,
            dst: addr("10.0.0.1"),
            sequence: 2,
            ttl: 64,
        },
    ));
    assert!(resp.is_ok());
    assert!(wait_for(|| stage_packets(&router, "control_output") >= 1));
    assert!(pool.in_use() > 0);

    router.shutdown().unwrap();
    assert_eq!(pool.in_use(), 0);
}
