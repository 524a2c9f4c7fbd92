//! 세션 코디네이터
//!
//! UI가 호출하는 파사드. 명령을 각 서비스로 라우팅하고,
//! 서비스 이벤트를 하나의 이벤트 루프에서 받아 상태를 갱신한 뒤 broadcast로 다시 내보낸다.
//! 상태를 쓰는 곳은 이벤트 루프 하나뿐이다.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureBackend;
use crate::discovery::{DiscoveryEvent, DiscoveryService, DiscoveryStatus};
use crate::identity::LocalIdentity;
use crate::message::{read_message, Message};
use crate::peer::{Peer, PeerHold, PeerId, PeerRegistry, PeerSnapshot};
use crate::screen_share::{self, ScreenShareStreamer, ShareEvent, ShareHandle, ShareState, ViewerFrame};
use crate::transfer::{ProgressReceiver, TransferEngine, TransferProgress};
use crate::{Config, Error, Result};

/// 시청 프레임 채널 크기
const VIEWER_FRAME_BUFFER: usize = 16;

/// accept 실패 후 대기 (fd 고갈 등)
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// UI로 내보내는 이벤트
#[derive(Debug, Clone)]
pub enum CoreEvent {
    PeerAdded(Peer),
    PeersRemoved(Vec<PeerId>),
    DiscoveryStatus(DiscoveryStatus),
    Transfer(TransferProgress),
    ShareState { session_id: u64, state: ShareState },
    ViewerAttached { session_id: u64, viewer_id: PeerId },
    ShareFailed { session_id: u64, reason: String },
    ScreenFrame(ViewerFrame),
    ViewerEnded { sharer_id: PeerId, error: Option<String> },
}

/// 코디네이터 상태 스냅샷
#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub service_addr: SocketAddr,
    pub discovery: DiscoveryStatus,
    pub peer_count: usize,
    /// 진행 중인 전송 (세션별 최신 진행률)
    pub transfers: Vec<TransferProgress>,
    pub share: ShareState,
    pub share_session: Option<u64>,
}

impl CoordinatorStatus {
    fn new(service_addr: SocketAddr) -> Self {
        Self {
            service_addr,
            discovery: DiscoveryStatus::Stopped,
            peer_count: 0,
            transfers: Vec::new(),
            share: ShareState::Idle,
            share_session: None,
        }
    }
}

/// 시청 세션 종료 알림
#[derive(Debug)]
struct ViewerEnded {
    sharer_id: PeerId,
    error: Option<String>,
}

/// 이벤트 루프 입력
struct EventInputs {
    discovery: mpsc::UnboundedReceiver<DiscoveryEvent>,
    transfers: mpsc::UnboundedReceiver<TransferProgress>,
    share: mpsc::UnboundedReceiver<ShareEvent>,
    frames: mpsc::Receiver<ViewerFrame>,
    viewers: mpsc::UnboundedReceiver<ViewerEnded>,
}

/// 세션 코디네이터
pub struct SessionCoordinator {
    config: Config,
    identity: LocalIdentity,
    registry: Arc<PeerRegistry>,
    discovery: DiscoveryService,
    transfers: Arc<TransferEngine>,
    share: Arc<ScreenShareStreamer>,
    service_addr: SocketAddr,

    events: broadcast::Sender<CoreEvent>,
    status: Arc<RwLock<CoordinatorStatus>>,

    transfer_tx: mpsc::UnboundedSender<TransferProgress>,
    frame_tx: mpsc::Sender<ViewerFrame>,
    viewer_tx: mpsc::UnboundedSender<ViewerEnded>,

    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionCoordinator {
    /// 서비스 포트를 바인드하고 수신 루프와 이벤트 루프를 시작
    ///
    /// 디스커버리는 `start_discovery`를 호출해야 시작된다.
    pub async fn bind(
        config: Config,
        identity: LocalIdentity,
        backend: Arc<dyn CaptureBackend>,
    ) -> Result<Self> {
        let bind_addr = SocketAddr::from(([0, 0, 0, 0], config.service_port));
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|source| Error::Bind {
                addr: bind_addr,
                source,
            })?;
        let service_addr = listener.local_addr()?;

        let registry = Arc::new(PeerRegistry::new(config.liveness_timeout()));

        let (discovery_tx, discovery_rx) = mpsc::unbounded_channel();
        let (transfer_tx, transfer_rx) = mpsc::unbounded_channel();
        let (share_tx, share_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::channel(VIEWER_FRAME_BUFFER);
        let (viewer_tx, viewer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        let discovery = DiscoveryService::new(
            config.clone(),
            identity.clone(),
            Arc::clone(&registry),
            service_addr.port(),
            discovery_tx,
        );
        let transfers = Arc::new(TransferEngine::new(config.clone(), identity.clone()));
        let share = Arc::new(ScreenShareStreamer::new(
            config.clone(),
            identity.clone(),
            backend,
            share_tx,
        ));

        let status = Arc::new(RwLock::new(CoordinatorStatus::new(service_addr)));
        let shutdown = CancellationToken::new();

        let event_loop = EventLoop {
            registry: Arc::clone(&registry),
            status: Arc::clone(&status),
            events: events.clone(),
            transfers: HashMap::new(),
        };
        let inputs = EventInputs {
            discovery: discovery_rx,
            transfers: transfer_rx,
            share: share_rx,
            frames: frame_rx,
            viewers: viewer_rx,
        };

        let acceptor = Acceptor {
            listener,
            config: config.clone(),
            transfers: Arc::clone(&transfers),
            share: Arc::clone(&share),
            transfer_tx: transfer_tx.clone(),
            frame_tx: frame_tx.clone(),
            viewer_tx: viewer_tx.clone(),
        };

        let tasks = vec![
            tokio::spawn(event_loop.run(inputs, shutdown.clone())),
            tokio::spawn(acceptor.run(shutdown.clone())),
        ];

        info!(
            "코디네이터 시작: {} ({}) service={}",
            identity.name, identity.peer_id, service_addr
        );

        Ok(Self {
            config,
            identity,
            registry,
            discovery,
            transfers,
            share,
            service_addr,
            events,
            status,
            transfer_tx,
            frame_tx,
            viewer_tx,
            shutdown,
            tasks,
        })
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    /// 전송 / 화면 공유 수신 주소
    pub fn service_addr(&self) -> SocketAddr {
        self.service_addr
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// 디스커버리 시작 (멱등)
    pub async fn start_discovery(&self) -> Result<()> {
        self.discovery.start().await
    }

    pub async fn stop_discovery(&self) {
        self.discovery.stop().await
    }

    /// 현재 피어 목록
    pub fn get_peers(&self) -> Vec<Peer> {
        self.registry.list()
    }

    /// 파일 전송 시작
    ///
    /// 레지스트리에 없는 피어면 에러. 진행률 이벤트는 반환된 수신기와 `subscribe` 양쪽으로 나간다.
    pub async fn send_file(&self, path: impl AsRef<Path>, peer_id: &PeerId) -> Result<ProgressReceiver> {
        let (peer, hold) = self.hold_peer(peer_id)?;
        let (handle, mut progress) = self.transfers.send(peer, hold, path.as_ref()).await?;
        debug!("전송 세션 시작: session={:016x} → {}", handle.session_id(), handle.peer_id());

        let (tx, rx) = mpsc::unbounded_channel();
        let status_tx = self.transfer_tx.clone();
        tokio::spawn(async move {
            while let Some(p) = progress.recv().await {
                let _ = status_tx.send(p.clone());
                let _ = tx.send(p);
            }
        });

        Ok(rx)
    }

    /// 진행 중인 송신 취소
    pub fn cancel_transfer(&self, peer_id: &PeerId) -> bool {
        self.transfers.cancel(peer_id)
    }

    /// 화면 공유 시작 (멱등)
    ///
    /// `target`이 None이면 시청자 하나가 붙을 때까지 기다린다.
    pub async fn start_screen_share(&self, target: Option<&PeerId>) -> Result<ShareHandle> {
        let target = match target {
            Some(id) => Some(self.hold_peer(id)?),
            None => None,
        };
        self.share.start(target).await
    }

    /// 화면 공유 정지 (항상 성공)
    pub async fn stop_screen_share(&self) {
        self.share.stop().await
    }

    /// 피어의 화면 시청
    ///
    /// 연결과 프레임 수신은 백그라운드에서 진행되고, 프레임은 `CoreEvent::ScreenFrame`으로 나간다.
    pub fn watch_screen(&self, peer_id: &PeerId) -> Result<()> {
        let (peer, hold) = self.hold_peer(peer_id)?;

        let config = self.config.clone();
        let identity = self.identity.clone();
        let frames = self.frame_tx.clone();
        let viewers = self.viewer_tx.clone();
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let _hold = hold;
            let result = screen_share::watch(&config, &identity, &peer, frames, cancel).await;
            let error = match result {
                Ok(received) => {
                    info!("화면 시청 종료: {} ({} frames)", peer.name, received);
                    None
                }
                Err(e) => {
                    warn!("화면 시청 실패 {}: {}", peer.name, e);
                    Some(e.to_string())
                }
            };
            let _ = viewers.send(ViewerEnded {
                sharer_id: peer.id,
                error,
            });
        });
        Ok(())
    }

    /// 이벤트 구독
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// 상태 스냅샷
    ///
    /// 이벤트 루프가 반영한 값이다. 명령 직후에는 이전 상태일 수 있으므로
    /// 변경을 기다리려면 `subscribe`의 해당 이벤트를 받은 뒤 읽는다.
    pub fn status(&self) -> CoordinatorStatus {
        self.status.read().clone()
    }

    /// 모든 서비스 정지
    pub async fn shutdown(&self) {
        self.share.stop().await;
        self.discovery.stop().await;
        self.transfers.shutdown();
        self.shutdown.cancel();
        info!("코디네이터 종료");
    }

    fn hold_peer(&self, peer_id: &PeerId) -> Result<(PeerSnapshot, PeerHold)> {
        let peer = self
            .registry
            .get(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        let hold = self
            .registry
            .hold(peer_id)
            .ok_or_else(|| Error::UnknownPeer(peer_id.to_string()))?;
        Ok((peer.snapshot(), hold))
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        // 디스커버리 루프는 DiscoveryService의 Drop이 정리
        self.share.close();
        self.transfers.shutdown();
        self.shutdown.cancel();
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// 서비스 포트 수신 루프
///
/// 첫 메시지로 연결 종류를 구분한다.
struct Acceptor {
    listener: TcpListener,
    config: Config,
    transfers: Arc<TransferEngine>,
    share: Arc<ScreenShareStreamer>,
    transfer_tx: mpsc::UnboundedSender<TransferProgress>,
    frame_tx: mpsc::Sender<ViewerFrame>,
    viewer_tx: mpsc::UnboundedSender<ViewerEnded>,
}

impl Acceptor {
    async fn run(self, shutdown: CancellationToken) {
        let this = Arc::new(self);
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                r = this.listener.accept() => r,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!("연결 수락: {}", addr);
                    let _ = stream.set_nodelay(true);
                    let this = Arc::clone(&this);
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = this.handle(stream, addr, cancel).await {
                            warn!("연결 처리 실패 {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("연결 수락 실패: {}", e);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        debug!("수신 루프 종료");
    }

    async fn handle(&self, mut stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let idle_timeout = self.config.idle_timeout();
        let first = tokio::time::timeout(idle_timeout, read_message(&mut stream))
            .await
            .map_err(|_| Error::IdleTimeout(idle_timeout))??;

        match first {
            Message::TransferHeader(header) => {
                self.transfers
                    .receive(stream, header, self.transfer_tx.clone())
                    .await
                    .map(|_| ())
            }
            Message::ViewRequest(request) => {
                info!("시청 요청: {} from {}", request.viewer_name, addr);
                self.share.attach_viewer(stream, request).await
            }
            Message::ShareStart(start) => {
                let sharer_id = PeerId::from(start.sharer_id.clone());
                let result =
                    screen_share::run_viewer(stream, start, self.frame_tx.clone(), cancel, idle_timeout).await;
                let _ = self.viewer_tx.send(ViewerEnded {
                    sharer_id,
                    error: result.as_ref().err().map(|e| e.to_string()),
                });
                result.map(|_| ())
            }
            other => Err(Error::MessageTypeMismatch {
                expected: "TransferHeader | ViewRequest | ShareStart".into(),
                got: format!("{:?}", other.msg_type()),
            }),
        }
    }
}

/// 상태의 유일한 작성자
struct EventLoop {
    registry: Arc<PeerRegistry>,
    status: Arc<RwLock<CoordinatorStatus>>,
    events: broadcast::Sender<CoreEvent>,
    /// 진행 중인 전송 (세션 ID → 최신 진행률)
    transfers: HashMap<u64, TransferProgress>,
}

impl EventLoop {
    async fn run(mut self, mut inputs: EventInputs, shutdown: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(e) = inputs.discovery.recv() => self.on_discovery(e),
                Some(p) = inputs.transfers.recv() => self.on_transfer(p),
                Some(e) = inputs.share.recv() => self.on_share(e),
                Some(f) = inputs.frames.recv() => CoreEvent::ScreenFrame(f),
                Some(v) = inputs.viewers.recv() => self.on_viewer_ended(v),
                else => break,
            };

            // 구독자가 없어도 계속
            let _ = self.events.send(event);
        }
        debug!("이벤트 루프 종료");
    }

    fn on_discovery(&mut self, event: DiscoveryEvent) -> CoreEvent {
        let mut status = self.status.write();
        status.peer_count = self.registry.len();
        match event {
            DiscoveryEvent::PeerAdded(peer) => CoreEvent::PeerAdded(peer),
            DiscoveryEvent::PeersRemoved(ids) => CoreEvent::PeersRemoved(ids),
            DiscoveryEvent::StatusChanged(s) => {
                status.discovery = s;
                CoreEvent::DiscoveryStatus(s)
            }
        }
    }

    fn on_transfer(&mut self, progress: TransferProgress) -> CoreEvent {
        if progress.state.is_terminal() {
            self.transfers.remove(&progress.session_id);
        } else {
            self.transfers.insert(progress.session_id, progress.clone());
        }

        let mut transfers: Vec<_> = self.transfers.values().cloned().collect();
        transfers.sort_by_key(|p| p.session_id);
        self.status.write().transfers = transfers;

        CoreEvent::Transfer(progress)
    }

    fn on_share(&mut self, event: ShareEvent) -> CoreEvent {
        let mut status = self.status.write();
        match event {
            ShareEvent::StateChanged { session_id, state } => {
                status.share = state;
                status.share_session = match state {
                    ShareState::Starting | ShareState::Streaming => Some(session_id),
                    ShareState::Idle | ShareState::Stopped => None,
                };
                CoreEvent::ShareState { session_id, state }
            }
            ShareEvent::ViewerAttached { session_id, viewer_id } => {
                CoreEvent::ViewerAttached { session_id, viewer_id }
            }
            ShareEvent::Failed { session_id, reason } => CoreEvent::ShareFailed { session_id, reason },
        }
    }

    fn on_viewer_ended(&mut self, ended: ViewerEnded) -> CoreEvent {
        CoreEvent::ViewerEnded {
            sharer_id: ended.sharer_id,
            error: ended.error,
        }
    }
}
