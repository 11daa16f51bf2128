//! Candidate gathering against in-process STUN/TURN responders, plus the
//! authentication gate on inbound checks.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use floe_ice::{IceAgent, IceConfig, IceEvent, IceMode, LocalAddress, Password, TurnServer};
use floe_stun::{methods, Class, Message};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

const MAPPED: &str = "198.51.100.5:41000";
const RELAYED: &str = "203.0.113.9:49152";

/// Minimal STUN Binding server answering every request with a fixed mapped
/// address.
async fn spawn_stun_server() -> SocketAddr {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let Ok((req, _)) = Message::decode(&buf[..n], None) else {
                continue;
            };
            if req.class() != Class::Request || req.method() != methods::BINDING {
                continue;
            }
            let mut resp = Message::with_id(
                Class::SuccessResponse,
                methods::BINDING,
                req.transaction_id(),
            );
            resp.add_xor_mapped_address(MAPPED.parse().unwrap());
            let _ = socket.send_to(&resp.encode(None, true), from).await;
        }
    });
    addr
}

/// Minimal TURN server: answers Allocate with a fixed relayed address and
/// acknowledges Refresh and CreatePermission. Responses carry
/// MESSAGE-INTEGRITY with the shared secret, as the transaction pool
/// demands on authenticated transactions.
async fn spawn_turn_server(key: &'static [u8]) -> SocketAddr {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let Ok((req, _)) = Message::decode(&buf[..n], Some(key)) else {
                continue;
            };
            if req.class() != Class::Request {
                continue;
            }
            let mut resp =
                Message::with_id(Class::SuccessResponse, req.method(), req.transaction_id());
            match req.method() {
                methods::ALLOCATE => {
                    resp.add_xor_relayed_address(RELAYED.parse().unwrap());
                    resp.add_xor_mapped_address(MAPPED.parse().unwrap());
                    resp.add_lifetime(600);
                }
                methods::REFRESH => {
                    resp.add_lifetime(req.lifetime().unwrap_or(600));
                }
                methods::CREATE_PERMISSION | methods::CHANNEL_BIND => {}
                _ => continue,
            }
            let _ = socket.send_to(&resp.encode(Some(key), true), from).await;
        }
    });
    addr
}

async fn wait_candidates(
    events: &mut UnboundedReceiver<IceEvent>,
) -> Vec<floe_ice::CandidateExchange> {
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await.expect("event channel closed") {
                IceEvent::LocalCandidatesReady(list) => return list,
                _ => {}
            }
        }
    })
    .await
    .expect("timed out waiting for candidates")
}

#[tokio::test]
async fn test_server_reflexive_discovery() {
    init_tracing();
    let stun = spawn_stun_server().await;

    let cfg = IceConfig {
        mode: IceMode::Responder,
        component_count: 1,
        local_addresses: vec![LocalAddress::new("127.0.0.1".parse().unwrap())],
        stun_bind_server: Some(stun),
        ..IceConfig::default()
    };
    let (agent, mut events) = IceAgent::new(cfg).unwrap();
    agent.start().unwrap();

    let candidates = wait_candidates(&mut events).await;
    let host = candidates.iter().find(|c| c.kind == "host").expect("host");
    let srflx = candidates
        .iter()
        .find(|c| c.kind == "srflx")
        .expect("srflx candidate");

    let mapped: SocketAddr = MAPPED.parse().unwrap();
    assert_eq!(srflx.ip, mapped.ip());
    assert_eq!(srflx.port, mapped.port());
    // base is the bound socket, carried as the related address
    assert_eq!(srflx.rel_addr, Some(host.ip));
    assert_eq!(srflx.rel_port, Some(host.port));
    // reflexive and host candidates never share a foundation
    assert_ne!(srflx.foundation, host.foundation);
    assert!(srflx.priority < host.priority);

    agent.stop();
}

#[tokio::test]
async fn test_relayed_discovery() {
    init_tracing();
    let key: &'static [u8] = b"relay-pass";
    let turn = spawn_turn_server(key).await;

    let cfg = IceConfig {
        mode: IceMode::Responder,
        component_count: 1,
        local_addresses: vec![LocalAddress::new("127.0.0.1".parse().unwrap())],
        turn_udp_server: Some(TurnServer {
            addr: turn,
            username: "relay-user".into(),
            password: Password::new("relay-pass"),
        }),
        ..IceConfig::default()
    };
    let (agent, mut events) = IceAgent::new(cfg).unwrap();
    agent.start().unwrap();

    let candidates = wait_candidates(&mut events).await;
    let relay = candidates
        .iter()
        .find(|c| c.kind == "relay")
        .expect("relayed candidate");

    let relayed: SocketAddr = RELAYED.parse().unwrap();
    let mapped: SocketAddr = MAPPED.parse().unwrap();
    assert_eq!(relay.ip, relayed.ip());
    assert_eq!(relay.port, relayed.port());
    // the allocation's reflexive address rides along as rel-addr
    assert_eq!(relay.rel_addr, Some(mapped.ip()));

    // re-parsing the signalled tuple keeps the relay address as the base
    // rather than the reflexive rel-addr
    let reparsed = floe_ice::CandidateInfo::try_from(relay).unwrap();
    assert_eq!(reparsed.base.socket_addr(), relayed);
    assert_eq!(reparsed.related.map(|r| r.socket_addr()), Some(mapped));

    // relayed candidates rank below everything else
    for other in candidates.iter().filter(|c| c.kind != "relay") {
        assert!(relay.priority < other.priority);
    }

    agent.stop();
}

#[tokio::test]
async fn test_gathering_waits_for_discovery() {
    init_tracing();
    // a binding server that never answers: candidates must not be
    // published until the discovery path concludes
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();

    let cfg = IceConfig {
        mode: IceMode::Responder,
        component_count: 1,
        local_addresses: vec![LocalAddress::new("127.0.0.1".parse().unwrap())],
        stun_bind_server: Some(silent_addr),
        ..IceConfig::default()
    };
    let (agent, mut events) = IceAgent::new(cfg).unwrap();
    agent.start().unwrap();

    // the retransmission ladder runs ~39.5 s by default, which would stall
    // this test; instead verify that candidates are not emitted early and
    // that the agent keeps running
    let early = timeout(Duration::from_millis(500), events.recv()).await;
    match early {
        Err(_) => {} // nothing yet, as expected
        Ok(Some(IceEvent::LocalCandidatesReady(_))) => {
            panic!("gathering completed before discovery concluded")
        }
        Ok(other) => panic!("unexpected event {other:?}"),
    }
    agent.stop();
    drop(silent);
}

#[tokio::test]
async fn test_inbound_checks_require_message_integrity() {
    init_tracing();
    let cfg = IceConfig {
        mode: IceMode::Responder,
        component_count: 1,
        local_addresses: vec![LocalAddress::new("127.0.0.1".parse().unwrap())],
        ..IceConfig::default()
    };
    let (agent, mut events) = IceAgent::new(cfg).unwrap();
    agent.set_remote_credentials("peer", "peer-password-22-chars!");
    agent.start().unwrap();

    let candidates = wait_candidates(&mut events).await;
    let host = &candidates[0];
    let target: SocketAddr = SocketAddr::new(host.ip, host.port);

    let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let username = format!("{}:peer", agent.local_ufrag());
    let key = agent.local_password().as_bytes().to_vec();
    let mut buf = vec![0u8; 1500];

    // 1. no MESSAGE-INTEGRITY at all: silently dropped
    let mut msg = Message::new(Class::Request, methods::BINDING);
    msg.add_username(&username);
    msg.add_priority(1);
    probe.send_to(&msg.encode(None, true), target).await.unwrap();
    assert!(
        timeout(Duration::from_millis(300), probe.recv_from(&mut buf))
            .await
            .is_err(),
        "unauthenticated request must not be answered"
    );

    // 2. wrong key: silently dropped
    let mut msg = Message::new(Class::Request, methods::BINDING);
    msg.add_username(&username);
    msg.add_priority(1);
    probe
        .send_to(&msg.encode(Some(b"wrong-key"), true), target)
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(300), probe.recv_from(&mut buf))
            .await
            .is_err(),
        "forged request must not be answered"
    );

    // 3. correct key: answered with our own reflexive address, signed
    let mut msg = Message::new(Class::Request, methods::BINDING);
    msg.add_username(&username);
    msg.add_priority(1);
    msg.add_ice_controlling(1);
    probe.send_to(&msg.encode(Some(&key), true), target).await.unwrap();
    let (n, _) = timeout(Duration::from_secs(2), probe.recv_from(&mut buf))
        .await
        .expect("authenticated request must be answered")
        .unwrap();
    let (resp, validation) = Message::decode(&buf[..n], Some(&key)).unwrap();
    assert_eq!(resp.class(), Class::SuccessResponse);
    assert!(validation.integrity);
    assert_eq!(
        resp.xor_mapped_address(),
        Some(probe.local_addr().unwrap())
    );

    agent.stop();
}
