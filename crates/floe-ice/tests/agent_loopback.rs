//! End-to-end negotiation between two real agents over loopback UDP.

use std::time::Duration;

use floe_ice::{
    CandidateExchange, Features, IceAgent, IceConfig, IceEvent, IceMode, LocalAddress,
};
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

fn loopback_config(mode: IceMode, features: Features) -> IceConfig {
    IceConfig {
        mode,
        component_count: 1,
        local_addresses: vec![LocalAddress::new("127.0.0.1".parse().unwrap())],
        local_features: features,
        pacing: Duration::from_millis(20),
        nomination_timeout: Duration::from_millis(500),
        pac_timeout: Duration::from_secs(10),
        ..IceConfig::default()
    }
}

/// Drain events until the predicate matches; panics on timeout.
async fn wait_for<F>(events: &mut UnboundedReceiver<IceEvent>, what: &str, mut pred: F) -> IceEvent
where
    F: FnMut(&IceEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
}

async fn wait_candidates(events: &mut UnboundedReceiver<IceEvent>) -> Vec<CandidateExchange> {
    match wait_for(events, "local candidates", |e| {
        matches!(e, IceEvent::LocalCandidatesReady(_))
    })
    .await
    {
        IceEvent::LocalCandidatesReady(list) => list,
        _ => unreachable!(),
    }
}

/// Wire two agents together through their signalling surface and run the
/// negotiation to `IceFinished` on both sides.
async fn negotiate(
    a_cfg: IceConfig,
    b_cfg: IceConfig,
) -> (
    IceAgent,
    UnboundedReceiver<IceEvent>,
    IceAgent,
    UnboundedReceiver<IceEvent>,
) {
    let a_features = a_cfg.local_features;
    let b_features = b_cfg.local_features;
    let (a, mut a_events) = IceAgent::new(a_cfg).unwrap();
    let (b, mut b_events) = IceAgent::new(b_cfg).unwrap();

    a.set_remote_credentials(b.local_ufrag(), b.local_password());
    b.set_remote_credentials(a.local_ufrag(), a.local_password());
    a.set_remote_features(b_features);
    b.set_remote_features(a_features);

    a.start().unwrap();
    b.start().unwrap();

    let a_candidates = wait_candidates(&mut a_events).await;
    let b_candidates = wait_candidates(&mut b_events).await;
    assert!(!a_candidates.is_empty());
    assert!(!b_candidates.is_empty());

    b.add_remote_candidates(a_candidates);
    a.add_remote_candidates(b_candidates);
    a.set_remote_gathering_complete();
    b.set_remote_gathering_complete();

    a.start_checks().unwrap();
    b.start_checks().unwrap();

    wait_for(&mut a_events, "IceFinished on A", |e| {
        matches!(e, IceEvent::IceFinished)
    })
    .await;
    wait_for(&mut b_events, "IceFinished on B", |e| {
        matches!(e, IceEvent::IceFinished)
    })
    .await;

    (a, a_events, b, b_events)
}

async fn exchange_datagrams(
    a: &IceAgent,
    a_events: &mut UnboundedReceiver<IceEvent>,
    b: &IceAgent,
    b_events: &mut UnboundedReceiver<IceEvent>,
) {
    a.write_datagram(0, b"ping from a").unwrap();
    wait_for(b_events, "datagram on B", |e| {
        matches!(e, IceEvent::ReadyRead(0))
    })
    .await;
    assert_eq!(b.read_datagram(0).unwrap(), b"ping from a");
    assert!(!b.has_pending_datagrams(0));

    b.write_datagram(0, b"pong from b").unwrap();
    wait_for(a_events, "datagram on A", |e| {
        matches!(e, IceEvent::ReadyRead(0))
    })
    .await;
    assert_eq!(a.read_datagram(0).unwrap(), b"pong from b");
}

/// Count `Stopped` events still in (or arriving on) the queue.
async fn drain_stopped(events: &mut UnboundedReceiver<IceEvent>) -> usize {
    let mut stopped = 0;
    loop {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Some(IceEvent::Stopped)) => stopped += 1,
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => return stopped,
        }
    }
}

#[tokio::test]
async fn test_host_only_lan_negotiation() {
    init_tracing();
    let (a, mut a_events, b, mut b_events) = negotiate(
        loopback_config(IceMode::Initiator, Features::empty()),
        loopback_config(IceMode::Responder, Features::empty()),
    )
    .await;

    exchange_datagrams(&a, &mut a_events, &b, &mut b_events).await;

    // stop is idempotent: two calls, exactly one Stopped event
    a.stop();
    a.stop();
    b.stop();
    assert_eq!(drain_stopped(&mut a_events).await, 1);
    assert_eq!(drain_stopped(&mut b_events).await, 1);
    assert!(a.is_stopped());
    assert!(b.is_stopped());
}

#[tokio::test]
async fn test_role_conflict_both_initiators() {
    init_tracing();
    // both sides believe they are the initiator; 487 + tie-breakers must
    // sort it out and exactly one side ends up nominating
    let (a, mut a_events, b, mut b_events) = negotiate(
        loopback_config(IceMode::Initiator, Features::empty()),
        loopback_config(IceMode::Initiator, Features::empty()),
    )
    .await;

    exchange_datagrams(&a, &mut a_events, &b, &mut b_events).await;
    a.stop();
    b.stop();
    assert_eq!(drain_stopped(&mut a_events).await, 1);
    assert_eq!(drain_stopped(&mut b_events).await, 1);
}

#[tokio::test]
async fn test_aggressive_nomination() {
    init_tracing();
    let features = Features::AGGRESSIVE_NOMINATION;
    let (a, mut a_events, b, mut b_events) = negotiate(
        loopback_config(IceMode::Initiator, features),
        loopback_config(IceMode::Responder, features),
    )
    .await;

    exchange_datagrams(&a, &mut a_events, &b, &mut b_events).await;
    a.stop();
    b.stop();
    assert_eq!(drain_stopped(&mut a_events).await, 1);
    assert_eq!(drain_stopped(&mut b_events).await, 1);
}

#[tokio::test]
async fn test_trickle_emits_candidates_then_gathering_complete() {
    init_tracing();
    let features = Features::TRICKLE | Features::GATHERING_COMPLETE;
    let a_cfg = loopback_config(IceMode::Initiator, features);
    let b_cfg = loopback_config(IceMode::Responder, features);
    let (a, mut a_events) = IceAgent::new(a_cfg).unwrap();
    let (b, mut b_events) = IceAgent::new(b_cfg).unwrap();

    a.set_remote_credentials(b.local_ufrag(), b.local_password());
    b.set_remote_credentials(a.local_ufrag(), a.local_password());
    a.set_remote_features(features);
    b.set_remote_features(features);
    a.start().unwrap();
    b.start().unwrap();

    // with trickle the host batch comes first, then the explicit
    // end-of-candidates marker
    let a_candidates = wait_candidates(&mut a_events).await;
    wait_for(&mut a_events, "gathering complete on A", |e| {
        matches!(e, IceEvent::LocalGatheringComplete)
    })
    .await;
    let b_candidates = wait_candidates(&mut b_events).await;

    b.add_remote_candidates(a_candidates);
    a.add_remote_candidates(b_candidates);
    a.set_remote_gathering_complete();
    b.set_remote_gathering_complete();
    a.start_checks().unwrap();
    b.start_checks().unwrap();

    wait_for(&mut a_events, "IceFinished on A", |e| {
        matches!(e, IceEvent::IceFinished)
    })
    .await;
    wait_for(&mut b_events, "IceFinished on B", |e| {
        matches!(e, IceEvent::IceFinished)
    })
    .await;

    exchange_datagrams(&a, &mut a_events, &b, &mut b_events).await;
    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_component_ready_precedes_finish() {
    init_tracing();
    let (a, a_events, b, _b_events) = negotiate(
        loopback_config(IceMode::Initiator, Features::empty()),
        loopback_config(IceMode::Responder, Features::empty()),
    )
    .await;
    // negotiate() consumed events up to IceFinished; ComponentReady and
    // ReadyToSendMedia must already have fired, so writes go through
    // immediately rather than being buffered
    a.write_datagram(0, b"immediate").unwrap();
    drop(a_events);
    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_write_before_ready_is_buffered_and_flushed() {
    init_tracing();
    let a_cfg = loopback_config(IceMode::Initiator, Features::empty());
    let b_cfg = loopback_config(IceMode::Responder, Features::empty());
    let (a, mut a_events) = IceAgent::new(a_cfg).unwrap();
    let (b, mut b_events) = IceAgent::new(b_cfg).unwrap();

    a.set_remote_credentials(b.local_ufrag(), b.local_password());
    b.set_remote_credentials(a.local_ufrag(), a.local_password());
    a.start().unwrap();
    b.start().unwrap();

    // queued long before any pair exists
    a.write_datagram(0, b"early bird").unwrap();

    let a_candidates = wait_candidates(&mut a_events).await;
    let b_candidates = wait_candidates(&mut b_events).await;
    b.add_remote_candidates(a_candidates);
    a.add_remote_candidates(b_candidates);
    a.set_remote_gathering_complete();
    b.set_remote_gathering_complete();
    a.start_checks().unwrap();
    b.start_checks().unwrap();

    wait_for(&mut b_events, "buffered datagram on B", |e| {
        matches!(e, IceEvent::ReadyRead(0))
    })
    .await;
    assert_eq!(b.read_datagram(0).unwrap(), b"early bird");

    a.stop();
    b.stop();
}

#[tokio::test]
async fn test_config_rejected_synchronously() {
    init_tracing();
    // zero components
    let bad = IceConfig {
        component_count: 0,
        local_addresses: vec![LocalAddress::new("127.0.0.1".parse().unwrap())],
        ..IceConfig::default()
    };
    assert!(IceAgent::new(bad).is_err());

    // no local addresses
    let bad = IceConfig {
        component_count: 1,
        ..IceConfig::default()
    };
    assert!(IceAgent::new(bad).is_err());
}

#[tokio::test]
async fn test_start_twice_fails_until_reset() {
    init_tracing();
    let cfg = loopback_config(IceMode::Initiator, Features::empty());
    let (agent, mut events) = IceAgent::new(cfg).unwrap();
    agent.start().unwrap();
    assert!(agent.start().is_err());

    agent.stop();
    wait_for(&mut events, "Stopped", |e| matches!(e, IceEvent::Stopped)).await;
    assert!(agent.start().is_err(), "stopped agent needs reset first");

    agent.reset().unwrap();
    agent.start().unwrap();
    agent.stop();
    wait_for(&mut events, "Stopped again", |e| matches!(e, IceEvent::Stopped)).await;
}
