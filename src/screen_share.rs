//! 화면 공유 스트리머
//!
//! 캡처 스레드 → FrameQueue (가득 차면 가장 오래된 프레임 폐기) → 송신 태스크 → 시청자.
//! 모든 프레임은 독립 JPEG이며 frame_sequence는 세션 안에서 엄격히 증가한다.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{CaptureBackend, JpegEncoder};
use crate::identity::LocalIdentity;
use crate::message::{
    read_message, write_message, FrameFormat, Message, RejectFrame, ScreenFrame, ShareStart, ViewRequest,
};
use crate::peer::{PeerHold, PeerId, PeerSnapshot};
use crate::{Config, Error, Result};

/// Close 프레임 전송 대기 한도
const CLOSE_TIMEOUT: Duration = Duration::from_millis(200);

/// 캡처 스레드의 취소 확인 간격
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// 공유 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    Idle,
    Starting,
    Streaming,
    Stopped,
}

/// 스트리머 이벤트
#[derive(Debug, Clone)]
pub enum ShareEvent {
    StateChanged { session_id: u64, state: ShareState },
    ViewerAttached { session_id: u64, viewer_id: PeerId },
    Failed { session_id: u64, reason: String },
}

/// 시청자가 받은 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerFrame {
    pub session_id: u64,
    pub sharer_id: PeerId,
    pub frame_sequence: u64,
    pub format: FrameFormat,
    pub data: Bytes,
}

/// 캡처 → 송신 사이의 제한된 큐
///
/// 가득 차면 가장 오래된 미전송 프레임을 버린다.
#[derive(Debug)]
pub struct FrameQueue {
    frames: Mutex<VecDeque<Bytes>>,
    depth: usize,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl FrameQueue {
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(depth)),
            depth,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// 프레임 추가. 오래된 프레임을 버렸으면 true.
    pub fn push(&self, frame: Bytes) -> bool {
        let mut dropped = false;
        {
            let mut frames = self.frames.lock();
            if frames.len() >= self.depth {
                frames.pop_front();
                dropped = true;
            }
            frames.push_back(frame);
        }
        if dropped {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    pub fn pop(&self) -> Option<Bytes> {
        self.frames.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// 생산자 종료 표시
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn notified(&self) {
        self.notify.notified().await
    }
}

/// 공유 세션 핸들
#[derive(Debug, Clone)]
pub struct ShareHandle {
    session_id: u64,
    target: Option<PeerId>,
    queue: Arc<FrameQueue>,
    frames_sent: Arc<AtomicU64>,
}

impl ShareHandle {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// 지정 대상 (None이면 시청자 대기)
    pub fn target(&self) -> Option<&PeerId> {
        self.target.as_ref()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.queue.dropped()
    }
}

impl PartialEq for ShareHandle {
    fn eq(&self, other: &Self) -> bool {
        self.session_id == other.session_id
    }
}

/// 송신 태스크에 넘기는 연결
enum ShareStream {
    /// 지정 대상 (ShareStart 전송 완료)
    Target(TcpStream),
    /// ViewRequest로 붙은 시청자
    Viewer(TcpStream, ViewRequest),
}

/// 실행 중인 공유 세션
struct ActiveShare {
    handle: ShareHandle,
    cancel: CancellationToken,
    capture: JoinHandle<()>,
    sender: JoinHandle<()>,
    /// 시청자 대기 중이면 연결을 넘길 채널
    pending_viewer: Option<oneshot::Sender<ShareStream>>,
}

/// 상태 보고기 (송신 태스크와 공유)
#[derive(Clone)]
struct StateReporter {
    /// (현재 상태, 그 상태의 세션)
    state: Arc<Mutex<(ShareState, u64)>>,
    events: mpsc::UnboundedSender<ShareEvent>,
}

impl StateReporter {
    fn set(&self, session_id: u64, next: ShareState) {
        {
            let mut state = self.state.lock();
            if *state == (next, session_id) {
                return;
            }
            *state = (next, session_id);
        }
        self.emit(session_id, next);
    }

    /// 같은 세션이 `from` 중 하나일 때만 전이
    fn set_if(&self, session_id: u64, from: &[ShareState], next: ShareState) -> bool {
        {
            let mut state = self.state.lock();
            let (current, current_session) = *state;
            if current_session != session_id || !from.contains(&current) {
                return false;
            }
            *state = (next, session_id);
        }
        self.emit(session_id, next);
        true
    }

    fn emit(&self, session_id: u64, next: ShareState) {
        debug!("화면 공유 상태: {:?} (session={:016x})", next, session_id);
        let _ = self.events.send(ShareEvent::StateChanged {
            session_id,
            state: next,
        });
    }

    fn get(&self) -> ShareState {
        self.state.lock().0
    }
}

/// 화면 공유 스트리머 (프로세스당 송신 공유는 하나)
pub struct ScreenShareStreamer {
    config: Config,
    identity: LocalIdentity,
    backend: Arc<dyn CaptureBackend>,
    reporter: StateReporter,
    events: mpsc::UnboundedSender<ShareEvent>,

    /// 모든 세션 토큰의 부모
    shutdown: CancellationToken,

    /// 세션 등록 / 해제 직렬화. 연결 대기 중에는 잡지 않는다.
    active: tokio::sync::Mutex<Option<ActiveShare>>,
}

impl ScreenShareStreamer {
    pub fn new(
        config: Config,
        identity: LocalIdentity,
        backend: Arc<dyn CaptureBackend>,
        events: mpsc::UnboundedSender<ShareEvent>,
    ) -> Self {
        Self {
            config,
            identity,
            backend,
            reporter: StateReporter {
                state: Arc::new(Mutex::new((ShareState::Idle, 0))),
                events: events.clone(),
            },
            events,
            shutdown: CancellationToken::new(),
            active: tokio::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> ShareState {
        self.reporter.get()
    }

    /// 공유 시작
    ///
    /// 이미 Starting/Streaming이면 기존 세션 핸들을 그대로 반환한다.
    /// 대상이 없으면 시청자 하나가 ViewRequest로 붙을 때까지 Starting에 머문다.
    /// 대상 연결 중에도 `stop`은 바로 세션을 취소한다.
    pub async fn start(&self, target: Option<(PeerSnapshot, PeerHold)>) -> Result<ShareHandle> {
        let (peer, hold) = match target {
            Some((peer, hold)) => (Some(peer), Some(hold)),
            None => (None, None),
        };

        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            if matches!(self.state(), ShareState::Starting | ShareState::Streaming) {
                debug!("화면 공유 이미 진행 중: session={:016x}", existing.handle.session_id);
                return Ok(existing.handle.clone());
            }
        }
        if let Some(old) = active.take() {
            shutdown_share(old).await;
        }

        let session_id = rand::random::<u64>();
        let cancel = self.shutdown.child_token();
        let queue = Arc::new(FrameQueue::new(self.config.frame_queue_depth));
        let frames_sent = Arc::new(AtomicU64::new(0));

        self.reporter.set(session_id, ShareState::Starting);

        let (ready_rx, capture) = spawn_capture(
            Arc::clone(&self.backend),
            &self.config,
            Arc::clone(&queue),
            cancel.clone(),
        );

        let share_start = ShareStart {
            session_id,
            sharer_id: self.identity.peer_id.to_string(),
            sharer_name: self.identity.name.clone(),
            format: FrameFormat::Jpeg,
            frame_rate: self.config.frame_rate.clamp(1, 60),
        };

        let handle = ShareHandle {
            session_id,
            target: peer.as_ref().map(|p| p.id.clone()),
            queue: Arc::clone(&queue),
            frames_sent: Arc::clone(&frames_sent),
        };

        let sender = FrameSender {
            session_id,
            queue,
            frames_sent,
            cancel: cancel.clone(),
            reporter: self.reporter.clone(),
            events: self.events.clone(),
        };
        let (stream_tx, stream_rx) = oneshot::channel();
        let sender_task = tokio::spawn(sender.serve(stream_rx, share_start.clone(), hold));

        let (target_tx, pending_viewer) = match peer {
            Some(_) => (Some(stream_tx), None),
            None => (None, Some(stream_tx)),
        };
        *active = Some(ActiveShare {
            handle: handle.clone(),
            cancel: cancel.clone(),
            capture,
            sender: sender_task,
            pending_viewer,
        });
        drop(active);

        let opened = match ready_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::CaptureUnavailable("캡처 스레드 종료".into())),
        };
        if let Err(e) = opened {
            warn!("화면 캡처 시작 실패: {}", e);
            self.abandon(session_id).await;
            return Err(e);
        }

        let (Some(peer), Some(stream_tx)) = (peer, target_tx) else {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            info!("화면 공유 시작: 시청자 대기 중");
            return Ok(handle);
        };

        let stream = match self.connect_and_announce(&peer, &share_start, &cancel).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("화면 공유 연결 실패 {}: {}", peer.addr, e);
                self.abandon(session_id).await;
                return Err(e);
            }
        };
        if stream_tx.send(ShareStream::Target(stream)).is_err() {
            return Err(Error::Cancelled);
        }
        self.reporter
            .set_if(session_id, &[ShareState::Starting], ShareState::Streaming);
        info!("화면 공유 시작 → {} ({})", peer.name, peer.addr);

        Ok(handle)
    }

    /// 시작 실패: 아직 등록된 세션이면 해제하고 Idle로
    async fn abandon(&self, session_id: u64) {
        let share = {
            let mut active = self.active.lock().await;
            let current = active.as_ref().is_some_and(|a| a.handle.session_id == session_id);
            if current {
                active.take()
            } else {
                None
            }
        };
        if let Some(share) = share {
            shutdown_share(share).await;
            self.reporter.set(session_id, ShareState::Idle);
        }
    }

    /// 대기 중인 공유에 시청자 연결을 붙인다
    ///
    /// 대기 중인 공유가 없으면 Reject를 보내고 에러.
    pub async fn attach_viewer(&self, mut stream: TcpStream, request: ViewRequest) -> Result<()> {
        let pending = {
            let mut active = self.active.lock().await;
            active.as_mut().and_then(|a| a.pending_viewer.take())
        };

        let Some(tx) = pending else {
            let reason = "시청자를 기다리는 화면 공유 없음".to_string();
            let _ = write_message(&mut stream, &Message::Reject(RejectFrame { reason: reason.clone() })).await;
            let _ = stream.shutdown().await;
            return Err(Error::Rejected(reason));
        };

        tx.send(ShareStream::Viewer(stream, request))
            .map_err(|_| Error::Rejected("화면 공유가 이미 종료됨".into()))
    }

    /// 공유 정지. 항상 성공하며 캡처를 해제한다.
    pub async fn stop(&self) {
        let Some(share) = self.active.lock().await.take() else {
            return;
        };
        let session_id = share.handle.session_id;
        // 대상 연결 중인 start()도 이 취소로 깨어난다
        shutdown_share(share).await;
        self.reporter.set(session_id, ShareState::Stopped);
        info!("화면 공유 정지: session={:016x}", session_id);
    }

    /// 동기 정리: 진행 중인 세션을 모두 취소한다. 이후 start는 실패한다.
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn connect_and_announce(
        &self,
        peer: &PeerSnapshot,
        share_start: &ShareStart,
        cancel: &CancellationToken,
    ) -> Result<TcpStream> {
        let addr = peer.addr;
        let timeout = self.config.connect_timeout();

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            r = tokio::time::timeout(timeout, TcpStream::connect(addr)) => match r {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => return Err(Error::Connect { addr, source }),
                Err(_) => return Err(Error::ConnectTimeout { addr, timeout }),
            },
        };
        let _ = stream.set_nodelay(true);
        write_message(&mut stream, &Message::ShareStart(share_start.clone())).await?;
        Ok(stream)
    }
}

impl Drop for ScreenShareStreamer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn shutdown_share(share: ActiveShare) {
    share.cancel.cancel();
    let _ = share.capture.await;
    let _ = share.sender.await;
}

/// 캡처 스레드 시작
///
/// 첫 번째 반환값은 장치 열기 결과.
fn spawn_capture(
    backend: Arc<dyn CaptureBackend>,
    config: &Config,
    queue: Arc<FrameQueue>,
    cancel: CancellationToken,
) -> (oneshot::Receiver<Result<()>>, JoinHandle<()>) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let frame_rate = config.frame_rate.clamp(1, 60);
    let interval = config.frame_interval();
    let encoder = JpegEncoder::new(config.jpeg_quality);

    let join = tokio::task::spawn_blocking(move || {
        let mut source = match backend.open(frame_rate) {
            Ok(source) => {
                let _ = ready_tx.send(Ok(()));
                source
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                queue.close();
                return;
            }
        };
        debug!("캡처 시작: backend={}, {}fps", backend.name(), frame_rate);

        let mut next_tick = Instant::now();
        while !cancel.is_cancelled() {
            match source.next_frame().and_then(|frame| encoder.encode(&frame)) {
                Ok(jpeg) => {
                    if queue.push(jpeg) {
                        debug!("송신 지연으로 프레임 폐기 (누적 {})", queue.dropped());
                    }
                }
                Err(e) => {
                    warn!("프레임 캡처 실패: {}", e);
                    break;
                }
            }

            next_tick += interval;
            let now = Instant::now();
            if next_tick <= now {
                next_tick = now;
                continue;
            }
            sleep_until_or_cancel(next_tick, &cancel);
        }

        drop(source);
        queue.close();
        debug!("캡처 종료");
    });

    (ready_rx, join)
}

fn sleep_until_or_cancel(deadline: Instant, cancel: &CancellationToken) {
    loop {
        let now = Instant::now();
        if now >= deadline || cancel.is_cancelled() {
            return;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

/// 큐에서 프레임을 꺼내 시청자에게 보내는 송신기
struct FrameSender {
    session_id: u64,
    queue: Arc<FrameQueue>,
    frames_sent: Arc<AtomicU64>,
    cancel: CancellationToken,
    reporter: StateReporter,
    events: mpsc::UnboundedSender<ShareEvent>,
}

impl FrameSender {
    /// 연결이 넘어오면 스트리밍, 그 전에 취소되면 종료
    async fn serve(self, attached: oneshot::Receiver<ShareStream>, share_start: ShareStart, hold: Option<PeerHold>) {
        let _hold = hold;
        let attached = tokio::select! {
            _ = self.cancel.cancelled() => None,
            r = attached => r.ok(),
        };

        let stream = match attached {
            None => return,
            Some(ShareStream::Target(stream)) => stream,
            Some(ShareStream::Viewer(mut stream, request)) => {
                let start = Message::ShareStart(share_start);
                let announced = tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    r = write_message(&mut stream, &start) => r,
                };
                if let Err(e) = announced {
                    return self.fail(&e);
                }

                let viewer_id = PeerId::from(request.viewer_id);
                info!("시청자 연결: {} ({})", request.viewer_name, viewer_id);
                let _ = self.events.send(ShareEvent::ViewerAttached {
                    session_id: self.session_id,
                    viewer_id,
                });
                stream
            }
        };

        self.reporter
            .set_if(self.session_id, &[ShareState::Starting], ShareState::Streaming);
        self.run(stream).await;
    }

    async fn run<S>(self, mut stream: S)
    where
        S: AsyncWrite + Unpin,
    {
        let mut sequence = 0u64;
        // 프레임 쓰기 도중 취소되면 스트림 경계가 깨진 상태
        let mut interrupted = false;

        let result: Result<()> = loop {
            while let Some(payload) = self.queue.pop() {
                let frame = Message::ScreenFrame(ScreenFrame {
                    frame_sequence: sequence,
                    payload,
                });
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        interrupted = true;
                        break;
                    }
                    r = write_message(&mut stream, &frame) => {
                        if let Err(e) = r {
                            return self.fail(&e);
                        }
                    }
                }
                sequence += 1;
                self.frames_sent.fetch_add(1, Ordering::Relaxed);
            }

            if self.cancel.is_cancelled() {
                break Ok(());
            }
            if self.queue.is_closed() && self.queue.is_empty() {
                break Err(Error::CaptureUnavailable("캡처가 중단됨".into()));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = self.queue.notified() => {}
            }
        };

        match result {
            Ok(()) => {
                if !interrupted {
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, write_message(&mut stream, &Message::Close)).await;
                }
                let _ = stream.shutdown().await;
                debug!(
                    "프레임 송신 종료: sent={}, dropped={}",
                    self.frames_sent.load(Ordering::Relaxed),
                    self.queue.dropped()
                );
            }
            Err(e) => self.fail(&e),
        }
    }

    fn fail(&self, err: &Error) {
        warn!("화면 공유 실패 (session={:016x}): {}", self.session_id, err);
        self.cancel.cancel();
        let _ = self.events.send(ShareEvent::Failed {
            session_id: self.session_id,
            reason: err.to_string(),
        });
        self.reporter.set_if(
            self.session_id,
            &[ShareState::Starting, ShareState::Streaming],
            ShareState::Stopped,
        );
    }
}

/// 시청자 세션: ShareStart 이후의 프레임을 받아 채널로 전달
///
/// 채널이 가득 차면 프레임을 버린다. 시퀀스가 증가하지 않으면 에러.
/// 받은 프레임 수 반환.
pub async fn run_viewer<S>(
    mut stream: S,
    start: ShareStart,
    frames: mpsc::Sender<ViewerFrame>,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> Result<u64>
where
    S: AsyncRead + Unpin,
{
    let sharer_id = PeerId::from(start.sharer_id.clone());
    let mut last_sequence: Option<u64> = None;
    let mut received = 0u64;

    info!("화면 시청 시작: {} ({:?}, {}fps)", start.sharer_name, start.format, start.frame_rate);

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(received),
            r = tokio::time::timeout(idle_timeout, read_message(&mut stream)) => match r {
                Ok(Ok(msg)) => msg,
                Ok(Err(Error::ConnectionClosed)) => return Ok(received),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::IdleTimeout(idle_timeout)),
            },
        };

        match msg {
            Message::ScreenFrame(ScreenFrame { frame_sequence, payload }) => {
                if let Some(last) = last_sequence {
                    if frame_sequence <= last {
                        return Err(Error::MalformedFrame(format!(
                            "프레임 시퀀스 역행: {} 이후 {}",
                            last, frame_sequence
                        )));
                    }
                }
                last_sequence = Some(frame_sequence);
                received += 1;

                let frame = ViewerFrame {
                    session_id: start.session_id,
                    sharer_id: sharer_id.clone(),
                    frame_sequence,
                    format: start.format,
                    data: payload,
                };
                match frames.try_send(frame) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("시청 채널 가득 참, 프레임 {} 폐기", frame_sequence);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return Ok(received),
                }
            }
            Message::Close => return Ok(received),
            other => {
                return Err(Error::MessageTypeMismatch {
                    expected: "ScreenFrame".into(),
                    got: format!("{:?}", other.msg_type()),
                })
            }
        }
    }
}

/// 피어에게 ViewRequest를 보내고 시청
pub async fn watch(
    config: &Config,
    identity: &LocalIdentity,
    peer: &PeerSnapshot,
    frames: mpsc::Sender<ViewerFrame>,
    cancel: CancellationToken,
) -> Result<u64> {
    let addr = peer.addr;
    let timeout = config.connect_timeout();
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = tokio::time::timeout(timeout, TcpStream::connect(addr)) => match r {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(Error::Connect { addr, source }),
            Err(_) => return Err(Error::ConnectTimeout { addr, timeout }),
        },
    };

    let request = ViewRequest {
        viewer_id: identity.peer_id.to_string(),
        viewer_name: identity.name.clone(),
    };
    write_message(&mut stream, &Message::ViewRequest(request)).await?;

    let idle_timeout = config.idle_timeout();
    let first = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = tokio::time::timeout(idle_timeout, read_message(&mut stream)) => {
            r.map_err(|_| Error::IdleTimeout(idle_timeout))??
        }
    };

    match first {
        Message::ShareStart(start) => run_viewer(stream, start, frames, cancel, config.idle_timeout()).await,
        Message::Reject(RejectFrame { reason }) => Err(Error::Rejected(reason)),
        other => Err(Error::MessageTypeMismatch {
            expected: "ShareStart".into(),
            got: format!("{:?}", other.msg_type()),
        }),
    }
}
