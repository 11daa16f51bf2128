//! STUN transaction pool with RFC-conformant retransmission.
//!
//! A pool owns the set of in-flight requests for one transport. It does not
//! touch sockets: outgoing packets are pushed to an [`OutgoingPacket`]
//! channel that the owning transport drains (wrapping path-1 traffic in TURN
//! framing as needed), and received datagrams are injected back through
//! [`TransactionPool::deliver`], which matches responses by transaction id and
//! hands everything else back to the caller.
//!
//! Retransmission follows RFC 8489: the request is sent `Rc` times with an
//! exponentially doubling RTO starting at 500 ms, then a final wait of
//! `Rm * RTO` before the transaction times out (~39.5 s for the defaults).
//! With ICE pacing enabled the ladder is compressed so a full cycle fits the
//! check-pacing budget instead (RFC 8445 Section 14).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::message::{error_codes, Class, Message, TransactionId};

/// Transaction failure kinds.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// Every retransmission went unanswered
    #[error("transaction timed out")]
    Timeout,

    /// The server answered with an error response
    #[error("request rejected: {code} {reason}")]
    Rejected { code: u16, reason: String },

    /// Error code 487: the peer disputes our ICE role
    #[error("ICE role conflict")]
    Conflict,

    /// The response was malformed
    #[error("protocol violation in response")]
    Protocol,

    /// The pool was stopped while the transaction was in flight
    #[error("transaction cancelled")]
    Cancelled,
}

/// Pool timing knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Initial retransmission timeout (RFC 8489 default: 500 ms)
    pub initial_rto: Duration,
    /// Total number of transmissions, Rc (default: 7)
    pub retransmits: u32,
    /// Final wait is `Rm * initial_rto` (default Rm: 16)
    pub final_wait_multiplier: u32,
    /// ICE check pacing interval Ta, used by the compressed ladder
    pub pacing: Duration,
    /// Use the pacing-aware ladder (ICE `RTPOptimization` feature)
    pub ice_pacing: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(500),
            retransmits: 7,
            final_wait_multiplier: 16,
            pacing: Duration::from_millis(50),
            ice_pacing: false,
        }
    }
}

/// Per-request auth and routing options.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// USERNAME attribute (short-term: `remote-ufrag:local-ufrag`)
    pub username: Option<String>,
    /// Short-term credential key; signs the request and verifies the response
    pub key: Option<Vec<u8>>,
    /// Append FINGERPRINT (required by ICE)
    pub fingerprint: bool,
    /// Transport path hint carried through to the outgoing channel
    /// (0 = direct, 1 = relayed)
    pub path: u8,
}

/// A packet the owning transport must put on the wire.
#[derive(Debug)]
pub struct OutgoingPacket {
    pub data: Vec<u8>,
    pub dest: SocketAddr,
    pub path: u8,
}

/// What [`TransactionPool::deliver`] decided about an inbound datagram.
#[derive(Debug)]
pub enum Disposition {
    /// Consumed: it matched (or was dropped as an unmatchable response)
    Handled,
    /// An unmatched STUN request; the owner runs connectivity-check handling
    Request(Message),
    /// An unmatched STUN indication (keepalive, TURN Data, ...)
    Indication(Message),
    /// Not STUN at all: raw application data
    AppData,
}

type Completion = Result<(Message, SocketAddr), TransactionError>;

struct LiveTransaction {
    dest: SocketAddr,
    key: Option<Vec<u8>>,
    done: oneshot::Sender<Completion>,
    cancel: Arc<Notify>,
}

struct Inner {
    live: HashMap<TransactionId, LiveTransaction>,
    stopped: bool,
}

/// Pool of in-flight STUN transactions for one transport.
pub struct TransactionPool {
    cfg: PoolConfig,
    outgoing: mpsc::UnboundedSender<OutgoingPacket>,
    inner: Mutex<Inner>,
}

impl TransactionPool {
    /// Create a pool and the channel of packets it wants sent.
    pub fn new(cfg: PoolConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<OutgoingPacket>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                cfg,
                outgoing,
                inner: Mutex::new(Inner {
                    live: HashMap::new(),
                    stopped: false,
                }),
            }),
            rx,
        )
    }

    /// Number of transactions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Send a request and await its completion.
    ///
    /// The returned future resolves when a matching response arrives from
    /// `dest`, retransmissions are exhausted, or the pool is stopped.
    pub async fn send_request(
        self: &Arc<Self>,
        mut msg: Message,
        dest: SocketAddr,
        opts: RequestOptions,
    ) -> Completion {
        if let Some(username) = &opts.username {
            msg.add_username(username);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let cancel = Arc::new(Notify::new());
        let schedule;
        let packet;
        {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return Err(TransactionError::Cancelled);
            }
            // 96-bit ids from a CSPRNG; regenerate on the astronomically
            // unlikely collision
            let mut id = TransactionId::generate();
            while inner.live.contains_key(&id) {
                id = TransactionId::generate();
            }
            msg.set_transaction_id(id);
            packet = msg.encode(opts.key.as_deref(), opts.fingerprint);
            schedule = self.schedule(inner.live.len() + 1);
            inner.live.insert(
                id,
                LiveTransaction {
                    dest,
                    key: opts.key.clone(),
                    done: done_tx,
                    cancel: cancel.clone(),
                },
            );
        }

        let pool = Arc::clone(self);
        let id = msg.transaction_id();
        let path = opts.path;
        tokio::spawn(async move {
            for (attempt, delay) in schedule.iter().enumerate() {
                // the Notify wake can be lost if completion lands between
                // awaits; the table is authoritative
                if !pool.is_live(id) {
                    return;
                }
                if attempt > 0 {
                    trace!(?id, attempt, "retransmitting stun request");
                }
                if pool
                    .outgoing
                    .send(OutgoingPacket {
                        data: packet.clone(),
                        dest,
                        path,
                    })
                    .is_err()
                {
                    // transport gone; the completion channel will report
                    // cancellation when the pool is dropped or stopped
                    return;
                }
                tokio::select! {
                    _ = cancel.notified() => return,
                    _ = sleep(*delay) => {}
                }
            }
            pool.complete(id, Err(TransactionError::Timeout));
        });

        done_rx.await.unwrap_or(Err(TransactionError::Cancelled))
    }

    /// Fire-and-forget indication.
    pub fn send_indication(&self, msg: Message, dest: SocketAddr, path: u8, fingerprint: bool) {
        let packet = msg.encode(None, fingerprint);
        let _ = self.outgoing.send(OutgoingPacket {
            data: packet,
            dest,
            path,
        });
    }

    /// Inject a received datagram.
    ///
    /// Responses are matched against in-flight transactions (same id, same
    /// source as the request destination) and verified against the
    /// transaction's credential key before completing it. Unmatched requests
    /// and indications are handed back; packets that do not parse as STUN are
    /// reported as application data.
    pub fn deliver(&self, packet: &[u8], from: SocketAddr) -> Disposition {
        if !Message::is_probably_stun(packet) {
            return Disposition::AppData;
        }

        let class = Message::peek_class(packet);
        if !class.is_response() {
            return match Message::decode(packet, None) {
                Ok((msg, _)) if msg.class() == Class::Request => Disposition::Request(msg),
                Ok((msg, _)) => Disposition::Indication(msg),
                Err(err) => {
                    trace!(%from, %err, "datagram resembled stun but failed to parse");
                    Disposition::AppData
                }
            };
        }

        let id = Message::peek_transaction_id(packet);
        let key = {
            let inner = self.inner.lock();
            match inner.live.get(&id) {
                Some(live) if live.dest == from => live.key.clone(),
                Some(live) => {
                    // RFC 8445 7.2.5.2.1: responses must arrive from the
                    // address the request was sent to
                    debug!(%from, expected = %live.dest, "response from unexpected source, dropped");
                    return Disposition::Handled;
                }
                None => {
                    trace!(?id, "response matches no transaction, dropped");
                    return Disposition::Handled;
                }
            }
        };

        let msg = match Message::decode(packet, key.as_deref()) {
            Ok((msg, validation)) => {
                // an unauthenticated success on an authenticated transaction
                // is as good as a forgery
                if key.is_some() && msg.class() == Class::SuccessResponse && !validation.integrity {
                    warn!(%from, "unauthenticated response on authenticated transaction, dropped");
                    return Disposition::Handled;
                }
                msg
            }
            Err(err) => {
                debug!(%from, %err, "dropping invalid response");
                return Disposition::Handled;
            }
        };

        let completion = match msg.class() {
            Class::SuccessResponse => Ok((msg, from)),
            _ => match msg.error_code() {
                Some((error_codes::ROLE_CONFLICT, _)) => Err(TransactionError::Conflict),
                Some((code, reason)) => Err(TransactionError::Rejected { code, reason }),
                None => Err(TransactionError::Protocol),
            },
        };
        self.complete(id, completion);
        Disposition::Handled
    }

    /// Cancel every in-flight transaction. Futures awaiting completions
    /// resolve with [`TransactionError::Cancelled`]; no completions are
    /// delivered afterwards.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        for (_, live) in inner.live.drain() {
            live.cancel.notify_waiters();
            // dropping the sender resolves the receiver with Cancelled
        }
    }

    fn is_live(&self, id: TransactionId) -> bool {
        self.inner.lock().live.contains_key(&id)
    }

    fn complete(&self, id: TransactionId, completion: Completion) {
        let live = {
            let mut inner = self.inner.lock();
            inner.live.remove(&id)
        };
        if let Some(live) = live {
            live.cancel.notify_waiters();
            let _ = live.done.send(completion);
        }
    }

    /// Transmission schedule: each entry is the wait after one transmission;
    /// the final entry is the post-retransmit grace period.
    fn schedule(&self, in_flight: usize) -> Vec<Duration> {
        if self.cfg.ice_pacing {
            // compressed ladder: base the RTO on the pacing budget of the
            // transactions currently competing for the wire, so the whole
            // cycle fits Ta * (N - 1) + final wait
            let base = self.cfg.pacing * in_flight.max(1) as u32;
            let rto = base.max(Duration::from_millis(50));
            let mut out: Vec<Duration> = (0u32..4).map(|k| rto * (1u32 << k)).collect();
            out.push(rto * 4);
            out
        } else {
            let rto = self.cfg.initial_rto;
            let rc = self.cfg.retransmits.max(1);
            let mut out: Vec<Duration> = (0u32..rc - 1).map(|k| rto * (1u32 << k)).collect();
            out.push(rto * self.cfg.final_wait_multiplier);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::methods;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn fast_config() -> PoolConfig {
        PoolConfig {
            initial_rto: Duration::from_millis(10),
            retransmits: 3,
            final_wait_multiplier: 2,
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_standard_schedule_shape() {
        let (pool, _rx) = TransactionPool::new(PoolConfig::default());
        let schedule = pool.schedule(1);
        // 7 transmissions, doubling waits, 16*RTO grace: ~39.5 s total
        assert_eq!(schedule.len(), 7);
        assert_eq!(schedule[0], Duration::from_millis(500));
        assert_eq!(schedule[5], Duration::from_millis(16_000));
        assert_eq!(schedule[6], Duration::from_millis(8_000));
        let total: Duration = schedule.iter().sum();
        assert_eq!(total, Duration::from_millis(39_500));
    }

    #[test]
    fn test_ice_schedule_scales_with_load() {
        let (pool, _rx) = TransactionPool::new(PoolConfig {
            ice_pacing: true,
            ..PoolConfig::default()
        });
        let light = pool.schedule(1);
        let heavy = pool.schedule(10);
        assert!(light.iter().sum::<Duration>() < heavy.iter().sum::<Duration>());
        assert_eq!(heavy[0], Duration::from_millis(500)); // Ta * 10
    }

    #[tokio::test]
    async fn test_request_completes_on_response() {
        let (pool, mut rx) = TransactionPool::new(fast_config());
        let dest = addr(3478);

        let responder = Arc::clone(&pool);
        tokio::spawn(async move {
            let out = rx.recv().await.unwrap();
            let (req, _) = Message::decode(&out.data, None).unwrap();
            let mut resp = Message::with_id(
                Class::SuccessResponse,
                methods::BINDING,
                req.transaction_id(),
            );
            resp.add_xor_mapped_address(addr(9000));
            responder.deliver(&resp.encode(None, false), out.dest);
        });

        let msg = Message::new(Class::Request, methods::BINDING);
        let (resp, from) = pool
            .send_request(msg, dest, RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(from, dest);
        assert_eq!(resp.xor_mapped_address(), Some(addr(9000)));
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_retransmits_then_times_out() {
        let (pool, mut rx) = TransactionPool::new(fast_config());
        let msg = Message::new(Class::Request, methods::BINDING);
        let err = pool
            .send_request(msg, addr(3478), RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::Timeout);

        let mut transmissions = 0;
        while rx.try_recv().is_ok() {
            transmissions += 1;
        }
        assert_eq!(transmissions, 3);
    }

    #[tokio::test]
    async fn test_error_response_maps_to_rejected_and_conflict() {
        for (code, expected_conflict) in [(error_codes::BAD_REQUEST, false), (487, true)] {
            let (pool, mut rx) = TransactionPool::new(fast_config());
            let dest = addr(3478);
            let responder = Arc::clone(&pool);
            tokio::spawn(async move {
                let out = rx.recv().await.unwrap();
                let (req, _) = Message::decode(&out.data, None).unwrap();
                let mut resp = Message::with_id(
                    Class::ErrorResponse,
                    methods::BINDING,
                    req.transaction_id(),
                );
                resp.add_error_code(code, "nope");
                responder.deliver(&resp.encode(None, false), out.dest);
            });

            let msg = Message::new(Class::Request, methods::BINDING);
            let err = pool
                .send_request(msg, dest, RequestOptions::default())
                .await
                .unwrap_err();
            if expected_conflict {
                assert_eq!(err, TransactionError::Conflict);
            } else {
                assert!(matches!(err, TransactionError::Rejected { code: c, .. } if c == code));
            }
        }
    }

    #[tokio::test]
    async fn test_response_from_wrong_source_is_ignored() {
        let (pool, mut rx) = TransactionPool::new(fast_config());
        let dest = addr(3478);
        let responder = Arc::clone(&pool);
        tokio::spawn(async move {
            let out = rx.recv().await.unwrap();
            let (req, _) = Message::decode(&out.data, None).unwrap();
            let resp = Message::with_id(
                Class::SuccessResponse,
                methods::BINDING,
                req.transaction_id(),
            );
            // spoofed source
            responder.deliver(&resp.encode(None, false), addr(6666));
        });

        let msg = Message::new(Class::Request, methods::BINDING);
        let err = pool
            .send_request(msg, dest, RequestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::Timeout);
    }

    #[tokio::test]
    async fn test_authenticated_response_requires_integrity() {
        let (pool, mut rx) = TransactionPool::new(fast_config());
        let dest = addr(3478);
        let responder = Arc::clone(&pool);
        tokio::spawn(async move {
            let out = rx.recv().await.unwrap();
            let (req, _) = Message::decode(&out.data, None).unwrap();
            // answer without MESSAGE-INTEGRITY: must be discarded
            let resp = Message::with_id(
                Class::SuccessResponse,
                methods::BINDING,
                req.transaction_id(),
            );
            responder.deliver(&resp.encode(None, false), out.dest);
        });

        let msg = Message::new(Class::Request, methods::BINDING);
        let err = pool
            .send_request(
                msg,
                dest,
                RequestOptions {
                    username: Some("peer:local".into()),
                    key: Some(b"password".to_vec()),
                    fingerprint: true,
                    path: 0,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::Timeout);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight() {
        let (pool, _rx) = TransactionPool::new(PoolConfig::default());
        let fut = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                pool.send_request(
                    Message::new(Class::Request, methods::BINDING),
                    addr(3478),
                    RequestOptions::default(),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.stop();
        let err = fut.await.unwrap().unwrap_err();
        assert_eq!(err, TransactionError::Cancelled);

        // new requests after stop are refused immediately
        let err = pool
            .send_request(
                Message::new(Class::Request, methods::BINDING),
                addr(3478),
                RequestOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, TransactionError::Cancelled);
    }

    #[tokio::test]
    async fn test_deliver_demultiplexes() {
        let (pool, _rx) = TransactionPool::new(fast_config());
        let from = addr(4000);

        let req = Message::new(Class::Request, methods::BINDING).encode(None, true);
        assert!(matches!(pool.deliver(&req, from), Disposition::Request(_)));

        let ind = Message::new(Class::Indication, methods::BINDING).encode(None, false);
        assert!(matches!(
            pool.deliver(&ind, from),
            Disposition::Indication(_)
        ));

        assert!(matches!(
            pool.deliver(b"definitely not stun", from),
            Disposition::AppData
        ));

        // unmatched response: consumed silently
        let resp = Message::new(Class::SuccessResponse, methods::BINDING).encode(None, false);
        assert!(matches!(pool.deliver(&resp, from), Disposition::Handled));
    }
}
