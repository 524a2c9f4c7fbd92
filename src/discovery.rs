//! 디스커버리 서비스
//!
//! UDP 브로드캐스트로 자신을 알리고, 다른 피어의 알림을 받아 레지스트리를 갱신한다.
//! - announce: 주기적 알림 송신
//! - listen: 알림 수신 → 검증 → upsert
//! - sweep: 생존 타임아웃이 지난 피어 제거

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::identity::LocalIdentity;
use crate::message::{DiscoveryAnnouncement, Message};
use crate::peer::{Peer, PeerId, PeerRegistry};
use crate::{Config, Error, Result};

/// 수신 버퍼 크기 (알림은 작은 데이터그램)
const RECV_BUFFER_SIZE: usize = 2048;

/// 디스커버리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Stopped,
    Running,
    /// 송수신 오류로 재시도 중
    Degraded,
}

/// 디스커버리 이벤트
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    PeerAdded(Peer),
    PeersRemoved(Vec<PeerId>),
    StatusChanged(DiscoveryStatus),
}

/// 디스커버리 루프가 쓰는 데이터그램 소켓
trait DatagramSocket: Send + Sync + 'static {
    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a;

    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a;
}

impl DatagramSocket for UdpSocket {
    fn send_to<'a>(
        &'a self,
        buf: &'a [u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send + 'a {
        UdpSocket::send_to(self, buf, target)
    }

    fn recv_from<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send + 'a {
        UdpSocket::recv_from(self, buf)
    }
}

/// 지수 백오프 (루프마다 하나)
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            failures: 0,
            next_attempt: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// 실패 기록, 다음 대기 시간 반환 (1s, 2s, 4s, ... 최대값에서 고정)
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let shift = self.failures.min(16);
        let delay = self.initial.saturating_mul(1u32 << shift).min(self.max);
        self.failures = self.failures.saturating_add(1);
        self.next_attempt = Some(now + delay);
        delay
    }

    /// 성공 시 초기화. 실패 중이었으면 true.
    pub fn reset(&mut self) -> bool {
        let was_failing = self.failures > 0;
        self.failures = 0;
        self.next_attempt = None;
        was_failing
    }
}

/// 실행 중인 루프들
struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    listen_addr: SocketAddr,
}

/// 루프들이 공유하는 상태 보고기
#[derive(Clone)]
struct StatusReporter {
    status: Arc<Mutex<DiscoveryStatus>>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
}

impl StatusReporter {
    fn set(&self, next: DiscoveryStatus) {
        let mut status = self.status.lock();
        if *status == next {
            return;
        }
        *status = next;
        drop(status);

        info!("디스커버리 상태: {:?}", next);
        let _ = self.events.send(DiscoveryEvent::StatusChanged(next));
    }
}

/// 디스커버리 서비스
pub struct DiscoveryService {
    config: Config,
    identity: LocalIdentity,
    registry: Arc<PeerRegistry>,

    /// 알림에 실을 서비스 포트
    service_port: u16,

    events: mpsc::UnboundedSender<DiscoveryEvent>,
    status: Arc<Mutex<DiscoveryStatus>>,

    /// start/stop 직렬화
    running: tokio::sync::Mutex<Option<Running>>,
}

impl DiscoveryService {
    pub fn new(
        config: Config,
        identity: LocalIdentity,
        registry: Arc<PeerRegistry>,
        service_port: u16,
        events: mpsc::UnboundedSender<DiscoveryEvent>,
    ) -> Self {
        Self {
            config,
            identity,
            registry,
            service_port,
            events,
            status: Arc::new(Mutex::new(DiscoveryStatus::Stopped)),
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub fn status(&self) -> DiscoveryStatus {
        *self.status.lock()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// 수신 소켓 주소 (실행 중일 때만)
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.listen_addr)
    }

    fn reporter(&self) -> StatusReporter {
        StatusReporter {
            status: Arc::clone(&self.status),
            events: self.events.clone(),
        }
    }

    /// 디스커버리 시작
    ///
    /// 이미 실행 중이면 아무것도 하지 않는다. 바인드 실패 시 정지 상태 유지.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!("디스커버리 이미 실행 중");
            return Ok(());
        }

        let listen_addr = SocketAddr::from(([0, 0, 0, 0], self.config.discovery_port));
        let listen_socket = UdpSocket::bind(listen_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: listen_addr,
                source,
            })?;
        let listen_addr = listen_socket.local_addr()?;

        let send_addr = SocketAddr::from(([0, 0, 0, 0], 0));
        let send_socket = UdpSocket::bind(send_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: send_addr,
                source,
            })?;
        send_socket.set_broadcast(true)?;

        let announcement = DiscoveryAnnouncement {
            peer_id: self.identity.peer_id.to_string(),
            name: self.identity.name.clone(),
            port: self.service_port,
            capability_flags: self.identity.capabilities,
        };
        let datagram = Message::Announce(announcement).to_bytes()?;

        let cancel = CancellationToken::new();
        let reporter = self.reporter();

        let announce = AnnounceLoop {
            socket: send_socket,
            target: self.config.broadcast_addr,
            datagram: datagram.to_vec(),
            interval: self.config.announce_interval(),
            backoff: Backoff::new(self.config.backoff_initial(), self.config.backoff_max()),
            reporter: reporter.clone(),
        };

        let listen = ListenLoop {
            socket: listen_socket,
            self_id: self.identity.peer_id.clone(),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            backoff: Backoff::new(self.config.backoff_initial(), self.config.backoff_max()),
            reporter: reporter.clone(),
        };

        let sweep = SweepLoop {
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            interval: self.config.sweep_interval(),
        };

        let tasks = vec![
            tokio::spawn(announce.run(cancel.clone())),
            tokio::spawn(listen.run(cancel.clone())),
            tokio::spawn(sweep.run(cancel.clone())),
        ];

        info!(
            "디스커버리 시작: listen={}, broadcast={}, service_port={}",
            listen_addr, self.config.broadcast_addr, self.service_port
        );
        reporter.set(DiscoveryStatus::Running);

        *running = Some(Running {
            cancel,
            tasks,
            listen_addr,
        });
        Ok(())
    }

    /// 디스커버리 정지 (실행 중이 아니면 무시)
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.cancel.cancel();
        for task in running.tasks {
            let _ = task.await;
        }
        self.reporter().set(DiscoveryStatus::Stopped);
        info!("디스커버리 정지");
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        // stop() 없이 버려져도 소켓과 알림 루프를 남기지 않음
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
            for task in running.tasks {
                task.abort();
            }
        }
    }
}

struct AnnounceLoop<S = UdpSocket> {
    socket: S,
    target: SocketAddr,
    datagram: Vec<u8>,
    interval: Duration,
    backoff: Backoff,
    reporter: StatusReporter,
}

impl<S: DatagramSocket> AnnounceLoop<S> {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let delay = match self.socket.send_to(&self.datagram, self.target).await {
                Ok(_) => {
                    if self.backoff.reset() {
                        info!("알림 송신 복구");
                        self.reporter.set(DiscoveryStatus::Running);
                    }
                    self.interval
                }
                Err(e) => {
                    let delay = self.backoff.record_failure(Instant::now());
                    warn!(
                        "알림 송신 실패 ({}회), {:?} 후 재시도: {}",
                        self.backoff.failures(),
                        delay,
                        e
                    );
                    self.reporter.set(DiscoveryStatus::Degraded);
                    delay
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("announce loop 종료");
    }
}

struct ListenLoop<S = UdpSocket> {
    socket: S,
    self_id: PeerId,
    registry: Arc<PeerRegistry>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    backoff: Backoff,
    reporter: StatusReporter,
}

impl<S: DatagramSocket> ListenLoop<S> {
    async fn run(mut self, cancel: CancellationToken) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };

            match received {
                Ok((len, src)) => {
                    if self.backoff.reset() {
                        self.reporter.set(DiscoveryStatus::Running);
                    }
                    self.handle_datagram(&buf[..len], src);
                }
                Err(e) => {
                    let delay = self.backoff.record_failure(Instant::now());
                    warn!("알림 수신 실패, {:?} 후 재시도: {}", delay, e);
                    self.reporter.set(DiscoveryStatus::Degraded);

                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!("listen loop 종료");
    }

    fn handle_datagram(&self, data: &[u8], src: SocketAddr) {
        let announcement = match Message::from_bytes(data) {
            Ok(Message::Announce(ann)) => ann,
            Ok(other) => {
                debug!("알림이 아닌 데이터그램 무시 ({:?}) from {}", other.msg_type(), src);
                return;
            }
            Err(e) => {
                debug!("잘못된 데이터그램 무시 from {}: {}", src, e);
                return;
            }
        };

        if let Err(e) = announcement.validate() {
            debug!("잘못된 알림 무시 from {}: {}", src, e);
            return;
        }

        if announcement.peer_id == self.self_id.as_str() {
            return;
        }

        let is_new = self.registry.upsert(&announcement, src.ip(), Instant::now());
        if is_new {
            if let Some(peer) = self.registry.get(&PeerId::from(announcement.peer_id.clone())) {
                info!("새 피어 발견: {} ({}) at {}", peer.name, peer.id, peer.socket_addr());
                let _ = self.events.send(DiscoveryEvent::PeerAdded(peer));
            }
        }
    }
}

struct SweepLoop {
    registry: Arc<PeerRegistry>,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    interval: Duration,
}

impl SweepLoop {
    async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let removed = self.registry.expire(Instant::now());
            if !removed.is_empty() {
                info!("피어 만료: {:?}", removed);
                let _ = self.events.send(DiscoveryEvent::PeersRemoved(removed));
            }
        }
        debug!("sweep loop 종료");
    }
}
