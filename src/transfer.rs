//! 전송 엔진
//!
//! - 송신: 헤더 → 청크(인덱스 순) → 누적 ACK 대기
//! - 수신: 헤더 검증 → 임시 파일에 순서대로 기록 → 완료 시 rename 후 최종 ACK
//! - 상태: Pending → Connecting → Transferring → {Completed | Cancelled | Failed}

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk::{validate_header, ChunkAssembler, FileChunker};
use crate::identity::LocalIdentity;
use crate::message::{read_message, write_message, AckFrame, Message, RejectFrame, TransferHeader};
use crate::peer::{PeerHold, PeerId, PeerSnapshot};
use crate::stats::{percent, TransferStats};
use crate::{Config, Error, Result};

/// 중단 시 Cancel 프레임 전송 대기 한도
const CANCEL_TIMEOUT: Duration = Duration::from_millis(200);

/// 전송 세션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Connecting,
    Transferring,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Cancelled | TransferState::Failed
        )
    }
}

/// 전송 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

/// 진행률 이벤트
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub session_id: u64,
    pub peer_id: PeerId,
    pub direction: TransferDirection,
    pub file_name: String,
    pub file_size: u64,
    pub bytes_acked: u64,
    /// 0 ~ 100, 단조 증가
    pub percent: f64,
    pub state: TransferState,
    /// 실패 사유 (Failed일 때만)
    pub error: Option<String>,
    /// 수신 완료된 파일 경로 (Inbound + Completed일 때만)
    pub saved_path: Option<PathBuf>,
}

/// 진행률 이벤트 수신기
pub type ProgressReceiver = mpsc::UnboundedReceiver<TransferProgress>;

/// 진행률 이벤트 송신 (세션마다 하나, 이벤트 순서 유지)
struct ProgressEmitter {
    tx: mpsc::UnboundedSender<TransferProgress>,
    current: TransferProgress,
}

impl ProgressEmitter {
    fn new(
        tx: mpsc::UnboundedSender<TransferProgress>,
        session_id: u64,
        peer_id: PeerId,
        direction: TransferDirection,
        file_name: String,
        file_size: u64,
    ) -> Self {
        Self {
            tx,
            current: TransferProgress {
                session_id,
                peer_id,
                direction,
                file_name,
                file_size,
                bytes_acked: 0,
                percent: 0.0,
                state: TransferState::Pending,
                error: None,
                saved_path: None,
            },
        }
    }

    fn state(&mut self, state: TransferState) {
        self.current.state = state;
        self.send();
    }

    /// ACK 진행. 값이 늘어났을 때만 이벤트를 낸다.
    fn advance(&mut self, bytes_acked: u64) {
        if bytes_acked <= self.current.bytes_acked {
            return;
        }
        self.current.bytes_acked = bytes_acked;
        self.current.percent = percent(bytes_acked, self.current.file_size);
        self.send();
    }

    fn completed(&mut self, saved_path: Option<PathBuf>) {
        self.current.bytes_acked = self.current.file_size;
        self.current.percent = 100.0;
        self.current.saved_path = saved_path;
        self.state(TransferState::Completed);
    }

    fn terminated(&mut self, err: &Error) {
        if matches!(err, Error::Cancelled) {
            self.state(TransferState::Cancelled);
        } else {
            self.current.error = Some(err.to_string());
            self.state(TransferState::Failed);
        }
    }

    fn send(&self) {
        // 수신측이 닫혀도 전송은 계속
        let _ = self.tx.send(self.current.clone());
    }
}

/// 드롭 시 태스크 중단
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// 진행 중인 송신 세션 항목
struct ActiveTransfer {
    session_id: u64,
    cancel: CancellationToken,
}

/// 세션 종료 시 활성 목록에서 제거
struct ActiveGuard {
    map: Arc<DashMap<PeerId, ActiveTransfer>>,
    peer_id: PeerId,
    session_id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.map
            .remove_if(&self.peer_id, |_, active| active.session_id == self.session_id);
    }
}

/// 송신 세션 핸들
pub struct TransferHandle {
    session_id: u64,
    peer_id: PeerId,
    cancel: CancellationToken,
    join: JoinHandle<Result<TransferStats>>,
}

impl TransferHandle {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// 취소 요청 (Connecting / Transferring에서만 의미 있음)
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// 세션 종료까지 대기
    pub async fn wait(self) -> Result<TransferStats> {
        self.join.await.map_err(|_| Error::ChannelError)?
    }
}

/// 전송 엔진
pub struct TransferEngine {
    config: Config,
    identity: LocalIdentity,

    /// 피어별 진행 중인 송신
    outbound: Arc<DashMap<PeerId, ActiveTransfer>>,

    /// 피어별 진행 중인 수신
    inbound: Arc<DashMap<PeerId, ActiveTransfer>>,

    /// 엔진 종료 토큰 (모든 세션의 부모)
    shutdown: CancellationToken,
}

impl TransferEngine {
    pub fn new(config: Config, identity: LocalIdentity) -> Self {
        Self {
            config,
            identity,
            outbound: Arc::new(DashMap::new()),
            inbound: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 해당 피어로 송신 중인지
    pub fn is_sending_to(&self, peer_id: &PeerId) -> bool {
        self.outbound.contains_key(peer_id)
    }

    /// 해당 피어의 송신 취소
    pub fn cancel(&self, peer_id: &PeerId) -> bool {
        match self.outbound.get(peer_id) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// 모든 세션 중단
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// 파일 송신 시작
    ///
    /// 같은 피어로의 이전 송신이 끝나지 않았으면 에러.
    /// 피어 홀드는 세션이 끝날 때 풀린다.
    pub async fn send(
        &self,
        peer: PeerSnapshot,
        hold: PeerHold,
        path: &Path,
    ) -> Result<(TransferHandle, ProgressReceiver)> {
        let chunker = FileChunker::open(path, self.config.chunk_size).await?;

        let session_id = rand::random::<u64>();
        let cancel = self.shutdown.child_token();

        match self.outbound.entry(peer.id.clone()) {
            Entry::Occupied(_) => return Err(Error::TransferInProgress(peer.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(ActiveTransfer {
                    session_id,
                    cancel: cancel.clone(),
                });
            }
        }

        let guard = ActiveGuard {
            map: Arc::clone(&self.outbound),
            peer_id: peer.id.clone(),
            session_id,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let mut emitter = ProgressEmitter::new(
            tx,
            session_id,
            peer.id.clone(),
            TransferDirection::Outbound,
            chunker.file_name().to_string(),
            chunker.file_size(),
        );
        emitter.state(TransferState::Pending);

        let session = OutboundSession {
            config: self.config.clone(),
            header: TransferHeader {
                session_id,
                sender_id: self.identity.peer_id.to_string(),
                sender_name: self.identity.name.clone(),
                file_name: chunker.file_name().to_string(),
                file_size: chunker.file_size(),
                chunk_size: chunker.chunk_size(),
                total_chunks: chunker.total_chunks(),
            },
            peer,
            chunker,
            cancel: cancel.clone(),
        };

        let peer_id = session.peer.id.clone();
        let join = tokio::spawn(async move {
            let result = session.run(&mut emitter).await;

            // 종료 이벤트 전에 활성 목록과 홀드를 정리
            drop(guard);
            drop(hold);

            match &result {
                Ok(stats) => {
                    info!("전송 완료: {}", stats.summary());
                    emitter.completed(None);
                }
                Err(e) => {
                    warn!("전송 종료 (session={:016x}): {}", emitter.current.session_id, e);
                    emitter.terminated(e);
                }
            }
            result
        });

        Ok((
            TransferHandle {
                session_id,
                peer_id,
                cancel,
                join,
            },
            rx,
        ))
    }

    /// 수신 세션 처리
    ///
    /// 서비스 리스너가 헤더를 읽은 뒤 호출한다. 세션 종료까지 대기.
    pub async fn receive(
        &self,
        mut stream: TcpStream,
        header: TransferHeader,
        events: mpsc::UnboundedSender<TransferProgress>,
    ) -> Result<PathBuf> {
        let peer_id = PeerId::from(header.sender_id.clone());

        if let Err(e) = validate_header(&header) {
            reject(&mut stream, &e.to_string()).await;
            return Err(e);
        }

        let session_id = header.session_id;
        let cancel = self.shutdown.child_token();
        match self.inbound.entry(peer_id.clone()) {
            Entry::Occupied(_) => {
                let err = Error::TransferInProgress(peer_id.to_string());
                reject(&mut stream, &err.to_string()).await;
                return Err(err);
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveTransfer {
                    session_id,
                    cancel: cancel.clone(),
                });
            }
        }
        let guard = ActiveGuard {
            map: Arc::clone(&self.inbound),
            peer_id: peer_id.clone(),
            session_id,
        };

        let mut emitter = ProgressEmitter::new(
            events,
            session_id,
            peer_id,
            TransferDirection::Inbound,
            header.file_name.clone(),
            header.file_size,
        );

        info!(
            "수신 시작: {} ({} bytes, {} chunks) from {}",
            header.file_name, header.file_size, header.total_chunks, header.sender_name
        );

        let session = InboundSession {
            config: &self.config,
            header: &header,
            cancel,
        };

        let result = session.run(&mut stream, &mut emitter).await;
        drop(guard);

        match result {
            Ok(path) => {
                info!("수신 완료: {:?}", path);
                emitter.completed(Some(path.clone()));
                Ok(path)
            }
            Err(e) => {
                warn!("수신 실패 (session={:016x}): {}", session_id, e);
                emitter.terminated(&e);
                Err(e)
            }
        }
    }
}

async fn reject(stream: &mut TcpStream, reason: &str) {
    let msg = Message::Reject(RejectFrame {
        reason: reason.to_string(),
    });
    if let Err(e) = write_message(stream, &msg).await {
        debug!("거절 메시지 전송 실패: {}", e);
    }
    let _ = stream.shutdown().await;
}

/// 송신 세션 (단일 태스크 소유)
struct OutboundSession {
    config: Config,
    header: TransferHeader,
    peer: PeerSnapshot,
    chunker: FileChunker,
    cancel: CancellationToken,
}

impl OutboundSession {
    async fn run(mut self, emitter: &mut ProgressEmitter) -> Result<TransferStats> {
        let mut stats = TransferStats::new(self.header.file_size);

        emitter.state(TransferState::Connecting);
        let stream = self.connect().await?;
        let _ = stream.set_nodelay(true);
        let (reader, mut writer) = stream.into_split();

        write_message(&mut writer, &Message::TransferHeader(self.header.clone())).await?;
        emitter.state(TransferState::Transferring);
        debug!(
            "헤더 전송: {} ({} bytes, {} chunks) → {}",
            self.header.file_name, self.header.file_size, self.header.total_chunks, self.peer.addr
        );

        // 읽기는 별도 태스크에서: mpsc recv는 select 취소에 안전
        let (msg_tx, mut msg_rx) = mpsc::channel(16);
        let _reader = AbortOnDrop(tokio::spawn(read_loop(reader, msg_tx)));

        let mut chunks_sent = 0u64;
        let mut sending_done = false;

        let result = {
            let send_chunks = send_all_chunks(&mut writer, &mut self.chunker, &self.cancel);
            tokio::pin!(send_chunks);

            let idle_timeout = self.config.idle_timeout();
            let mut last_ack = Instant::now();

            loop {
                let idle_deadline = tokio::time::Instant::from_std(last_ack + idle_timeout);

                tokio::select! {
                    res = &mut send_chunks, if !sending_done => {
                        match res {
                            Ok(sent) => chunks_sent = sent,
                            Err(e) => break Err(e),
                        }
                        sending_done = true;
                        debug!("모든 청크 전송: {}", chunks_sent);
                    }

                    // 청크 송신 중에는 send_all_chunks가 취소를 처리.
                    // 최종 ACK 전의 취소는 수신자가 rename 전에 받는다.
                    _ = self.cancel.cancelled(), if sending_done => {
                        break Err(Error::Cancelled);
                    }

                    _ = tokio::time::sleep_until(idle_deadline) => {
                        break Err(Error::IdleTimeout(idle_timeout));
                    }

                    msg = msg_rx.recv() => {
                        let msg = match msg {
                            Some(Ok(msg)) => msg,
                            Some(Err(e)) => break Err(e),
                            None => break Err(Error::ConnectionClosed),
                        };

                        match msg {
                            Message::Ack(AckFrame { bytes_acked }) => {
                                if bytes_acked > self.header.file_size || bytes_acked < stats.bytes_acked {
                                    break Err(Error::MalformedFrame(format!(
                                        "잘못된 ACK: {} (이전 {}, 파일 {})",
                                        bytes_acked, stats.bytes_acked, self.header.file_size
                                    )));
                                }

                                last_ack = Instant::now();
                                stats.record_ack(bytes_acked);
                                emitter.advance(bytes_acked);

                                if bytes_acked == self.header.file_size {
                                    break Ok(());
                                }
                            }
                            Message::Reject(RejectFrame { reason }) => break Err(Error::Rejected(reason)),
                            Message::Cancel => break Err(Error::Rejected("수신자가 취소함".into())),
                            other => {
                                break Err(Error::MessageTypeMismatch {
                                    expected: "Ack".into(),
                                    got: format!("{:?}", other.msg_type()),
                                });
                            }
                        }
                    }
                }
            }
        };

        match result {
            Ok(()) => {
                stats.record_sent(chunks_sent, self.header.file_size);
                // 쓰기 종료(FIN)가 수신자의 rename 신호
                let _ = writer.shutdown().await;
                Ok(stats)
            }
            Err(e) => {
                // 청크 전송 도중이면 send_all_chunks가 이미 정리함.
                // 그 뒤라면 수신자가 EOF를 완료로 받지 않도록 Cancel을 먼저 보낸다.
                if sending_done {
                    let _ = tokio::time::timeout(CANCEL_TIMEOUT, write_message(&mut writer, &Message::Cancel)).await;
                }
                let _ = writer.shutdown().await;
                Err(e)
            }
        }
    }

    /// 연결 (타임아웃, 취소 경합)
    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.peer.addr;
        let timeout = self.config.connect_timeout();

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(timeout, TcpStream::connect(addr)) => match res {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(source)) => Err(Error::Connect { addr, source }),
                Err(_) => Err(Error::ConnectTimeout { addr, timeout }),
            },
        }
    }
}

/// 청크를 순서대로 전송
///
/// 청크 경계에서 취소가 보이면 Cancel 프레임을 보내고 종료한다.
/// 쓰기 도중 취소되면 프레임이 잘린 채 연결이 닫힌다. 보낸 청크 수 반환.
async fn send_all_chunks<W>(
    writer: &mut W,
    chunker: &mut FileChunker,
    cancel: &CancellationToken,
) -> Result<u64>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut sent = 0u64;
    while let Some(chunk) = chunker.next_chunk().await? {
        if cancel.is_cancelled() {
            let _ = write_message(writer, &Message::Cancel).await;
            return Err(Error::Cancelled);
        }

        let msg = Message::Chunk(chunk);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = write_message(writer, &msg) => res?,
        }
        sent += 1;
    }
    Ok(sent)
}

async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<Result<Message>>) {
    loop {
        let msg = read_message(&mut reader).await;
        let stop = msg.is_err();
        if tx.send(msg).await.is_err() || stop {
            break;
        }
    }
}

/// 수신 세션
struct InboundSession<'a> {
    config: &'a Config,
    header: &'a TransferHeader,
    cancel: CancellationToken,
}

impl InboundSession<'_> {
    async fn run(&self, stream: &mut TcpStream, emitter: &mut ProgressEmitter) -> Result<PathBuf> {
        let mut assembler = ChunkAssembler::create(&self.config.download_dir, self.header).await?;
        emitter.state(TransferState::Transferring);

        let ack_every = self.config.ack_every_chunks.max(1);
        let ack_interval = self.config.ack_interval();
        let idle_timeout = self.config.idle_timeout();

        let mut since_ack = 0u32;
        let mut last_ack = Instant::now();

        // 빈 파일은 청크 없이 바로 완료
        while !assembler.is_complete() {
            let msg = tokio::select! {
                _ = self.cancel.cancelled() => {
                    assembler.abort().await;
                    return Err(Error::Cancelled);
                }
                res = tokio::time::timeout(idle_timeout, read_message(stream)) => match res {
                    Ok(Ok(msg)) => msg,
                    Ok(Err(e)) => {
                        assembler.abort().await;
                        return Err(e);
                    }
                    Err(_) => {
                        assembler.abort().await;
                        return Err(Error::IdleTimeout(idle_timeout));
                    }
                },
            };

            match msg {
                Message::Chunk(chunk) => {
                    let written = match assembler.write_chunk(&chunk).await {
                        Ok(written) => written,
                        Err(e) => {
                            reject(stream, &e.to_string()).await;
                            assembler.abort().await;
                            return Err(e);
                        }
                    };
                    since_ack += 1;

                    if !assembler.is_complete()
                        && (since_ack >= ack_every || last_ack.elapsed() >= ack_interval)
                    {
                        write_message(stream, &Message::Ack(AckFrame { bytes_acked: written })).await?;
                        emitter.advance(written);
                        since_ack = 0;
                        last_ack = Instant::now();
                    }
                }
                Message::Cancel => {
                    debug!("송신자가 취소함: session={:016x}", self.header.session_id);
                    assembler.abort().await;
                    return Err(Error::Cancelled);
                }
                other => {
                    assembler.abort().await;
                    return Err(Error::MessageTypeMismatch {
                        expected: "Chunk".into(),
                        got: format!("{:?}", other.msg_type()),
                    });
                }
            }
        }

        // 디스크 동기화 후 최종 ACK, 송신자가 연결을 닫으면 rename
        if let Err(e) = assembler.sync().await {
            reject(stream, &e.to_string()).await;
            assembler.abort().await;
            return Err(e);
        }
        let final_ack = Message::Ack(AckFrame {
            bytes_acked: self.header.file_size,
        });
        if let Err(e) = write_message(stream, &final_ack).await {
            assembler.abort().await;
            return Err(e);
        }

        if let Err(e) = self.await_commit(stream, idle_timeout).await {
            assembler.abort().await;
            return Err(e);
        }

        let path = assembler.finish().await?;
        let _ = stream.shutdown().await;

        Ok(path)
    }

    /// 최종 ACK 이후 송신자의 마무리 대기
    ///
    /// 정상 종료(EOF)면 Ok, 뒤늦은 Cancel이면 Cancelled.
    async fn await_commit(&self, stream: &mut TcpStream, idle_timeout: Duration) -> Result<()> {
        let msg = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            res = tokio::time::timeout(idle_timeout, read_message(stream)) => match res {
                Ok(Err(Error::ConnectionClosed)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(msg)) => msg,
                Err(_) => return Err(Error::IdleTimeout(idle_timeout)),
            },
        };

        match msg {
            Message::Cancel => {
                debug!("최종 ACK 후 송신자가 취소함: session={:016x}", self.header.session_id);
                Err(Error::Cancelled)
            }
            other => Err(Error::MessageTypeMismatch {
                expected: "EOF".into(),
                got: format!("{:?}", other.msg_type()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DiscoveryAnnouncement;
    use crate::peer::PeerRegistry;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;

    fn test_config(download_dir: &Path) -> Config {
        Config {
            download_dir: download_dir.to_path_buf(),
            ..Config::for_testing()
        }
    }

    /// 레지스트리에 피어를 넣고 홀드 + 스냅샷 반환
    fn hold_peer(registry: &Arc<PeerRegistry>, addr: SocketAddr) -> (PeerSnapshot, PeerHold) {
        let ann = DiscoveryAnnouncement {
            peer_id: "receiver".into(),
            name: "Receiver".into(),
            port: addr.port(),
            capability_flags: 0,
        };
        registry.upsert(&ann, addr.ip(), Instant::now());
        let peer = registry.get(&PeerId::from("receiver")).unwrap();
        let hold = registry.hold(&peer.id).unwrap();
        (peer.snapshot(), hold)
    }

    /// 한 번의 수신을 처리하는 테스트 리스너
    async fn spawn_receiver(
        engine: Arc<TransferEngine>,
    ) -> (SocketAddr, JoinHandle<Result<PathBuf>>, ProgressReceiver) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let join = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await?;
            match read_message(&mut stream).await? {
                Message::TransferHeader(header) => engine.receive(stream, header, tx).await,
                other => Err(Error::MessageTypeMismatch {
                    expected: "TransferHeader".into(),
                    got: format!("{:?}", other.msg_type()),
                }),
            }
        });

        (addr, join, rx)
    }

    fn drain(rx: &mut ProgressReceiver) -> Vec<TransferProgress> {
        let mut events = Vec::new();
        while let Ok(p) = rx.try_recv() {
            events.push(p);
        }
        events
    }

    #[tokio::test]
    async fn test_send_file_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &data).unwrap();

        let recv_dir = dir.path().join("recv");
        let receiver = Arc::new(TransferEngine::new(test_config(&recv_dir), LocalIdentity::with_name("B")));
        let (addr, recv_join, mut inbound_rx) = spawn_receiver(receiver).await;

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let (peer, hold) = hold_peer(&registry, addr);
        let sender = TransferEngine::new(test_config(dir.path()), LocalIdentity::with_name("A"));

        let (handle, mut progress) = sender.send(peer.clone(), hold, &src).await.unwrap();
        assert!(registry.is_held(&peer.id));

        let stats = handle.wait().await.unwrap();
        assert_eq!(stats.bytes_acked, data.len() as u64);
        assert_eq!(stats.chunks, crate::chunk::total_chunks(data.len() as u64, 16 * 1024).unwrap() as u64);

        let saved = recv_join.await.unwrap().unwrap();
        assert_eq!(std::fs::read(&saved).unwrap(), data);

        // 홀드 해제, 활성 목록 정리
        assert!(!registry.is_held(&peer.id));
        assert!(!sender.is_sending_to(&peer.id));

        let events = drain(&mut progress);
        let states: Vec<_> = events.iter().map(|e| e.state).collect();
        assert_eq!(states.first(), Some(&TransferState::Pending));
        assert!(states.contains(&TransferState::Connecting));
        assert_eq!(states.last(), Some(&TransferState::Completed));
        assert!(events.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(events.last().unwrap().percent, 100.0);
        assert_eq!(states.iter().filter(|s| s.is_terminal()).count(), 1);

        let inbound = drain(&mut inbound_rx);
        assert_eq!(inbound.last().unwrap().state, TransferState::Completed);
        assert_eq!(inbound.last().unwrap().saved_path.as_deref(), Some(saved.as_path()));
    }

    #[tokio::test]
    async fn test_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("empty.txt");
        std::fs::write(&src, b"").unwrap();

        let recv_dir = dir.path().join("recv");
        let receiver = Arc::new(TransferEngine::new(test_config(&recv_dir), LocalIdentity::with_name("B")));
        let (addr, recv_join, _inbound) = spawn_receiver(receiver).await;

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let (peer, hold) = hold_peer(&registry, addr);
        let sender = TransferEngine::new(test_config(dir.path()), LocalIdentity::with_name("A"));

        let (handle, mut progress) = sender.send(peer, hold, &src).await.unwrap();
        let stats = handle.wait().await.unwrap();
        assert_eq!(stats.bytes_acked, 0);
        assert_eq!(stats.chunks, 0);

        let saved = recv_join.await.unwrap().unwrap();
        assert_eq!(std::fs::read(saved).unwrap().len(), 0);
        assert_eq!(drain(&mut progress).last().unwrap().percent, 100.0);
    }

    #[tokio::test]
    async fn test_second_send_to_same_peer_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, vec![1u8; 1024]).unwrap();

        // 연결을 받기만 하고 아무것도 하지 않는 피어
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let (peer, hold) = hold_peer(&registry, addr);
        let hold2 = registry.hold(&peer.id).unwrap();
        let sender = TransferEngine::new(test_config(dir.path()), LocalIdentity::with_name("A"));

        let (handle, _progress) = sender.send(peer.clone(), hold, &src).await.unwrap();
        let err = sender.send(peer.clone(), hold2, &src).await.err().unwrap();
        assert!(matches!(err, Error::TransferInProgress(_)));

        assert!(sender.cancel(&peer.id));
        assert!(matches!(handle.wait().await, Err(Error::Cancelled)));
        drop(listener);
    }

    #[tokio::test]
    async fn test_idle_timeout_without_acks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, vec![7u8; 64 * 1024]).unwrap();

        // 데이터를 읽기만 하고 ACK를 보내지 않는 피어
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _sink = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            while let Ok(n) = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let (peer, hold) = hold_peer(&registry, addr);
        let mut config = test_config(dir.path());
        config.idle_timeout_ms = 300;
        let sender = TransferEngine::new(config, LocalIdentity::with_name("A"));

        let (handle, mut progress) = sender.send(peer, hold, &src).await.unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, Error::IdleTimeout(_)));

        let last = drain(&mut progress).pop().unwrap();
        assert_eq!(last.state, TransferState::Failed);
        assert!(last.error.is_some());
    }

    #[tokio::test]
    async fn test_connect_refused_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.bin");
        std::fs::write(&src, b"abc").unwrap();

        // 바인드 후 바로 닫아서 빈 포트 확보
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let (peer, hold) = hold_peer(&registry, addr);
        let sender = TransferEngine::new(test_config(dir.path()), LocalIdentity::with_name("A"));

        let (handle, _progress) = sender.send(peer, hold, &src).await.unwrap();
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            crate::ErrorKind::Network | crate::ErrorKind::Timeout
        ));
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("big.bin");
        std::fs::write(&src, vec![3u8; 8 * 1024 * 1024]).unwrap();

        // 헤더만 읽고 멈추는 피어 (소켓 버퍼가 차면 송신이 막힘)
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stall = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let (peer, hold) = hold_peer(&registry, addr);
        let sender = TransferEngine::new(test_config(dir.path()), LocalIdentity::with_name("A"));

        let (handle, mut progress) = sender.send(peer.clone(), hold, &src).await.unwrap();
        while let Some(p) = progress.recv().await {
            if p.state == TransferState::Transferring {
                break;
            }
        }
        handle.cancel();
        assert!(matches!(handle.wait().await, Err(Error::Cancelled)));

        let last = drain(&mut progress).pop().unwrap();
        assert_eq!(last.state, TransferState::Cancelled);
        assert!(!registry.is_held(&peer.id));
        stall.abort();
    }

    #[tokio::test]
    async fn test_sender_cancel_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let recv_dir = dir.path().join("recv");
        let receiver = Arc::new(TransferEngine::new(test_config(&recv_dir), LocalIdentity::with_name("B")));
        let (addr, recv_join, mut inbound) = spawn_receiver(receiver).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let header = TransferHeader {
            session_id: 7,
            sender_id: "sender".into(),
            sender_name: "Sender".into(),
            file_name: "partial.bin".into(),
            file_size: 300,
            chunk_size: 100,
            total_chunks: 3,
        };
        write_message(&mut stream, &Message::TransferHeader(header)).await.unwrap();
        let chunk = crate::message::ChunkFrame {
            index: 0,
            payload: bytes::Bytes::from(vec![1u8; 100]),
        };
        write_message(&mut stream, &Message::Chunk(chunk)).await.unwrap();
        write_message(&mut stream, &Message::Cancel).await.unwrap();

        let err = recv_join.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));

        let leftovers: Vec<_> = std::fs::read_dir(&recv_dir).unwrap().collect();
        assert!(leftovers.is_empty(), "남은 파일: {:?}", leftovers);
        assert_eq!(drain(&mut inbound).last().unwrap().state, TransferState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_final_ack_discards_file() {
        let dir = tempfile::tempdir().unwrap();
        let recv_dir = dir.path().join("recv");
        let receiver = Arc::new(TransferEngine::new(test_config(&recv_dir), LocalIdentity::with_name("B")));
        let (addr, recv_join, mut inbound) = spawn_receiver(receiver).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let header = TransferHeader {
            session_id: 11,
            sender_id: "sender".into(),
            sender_name: "Sender".into(),
            file_name: "late.bin".into(),
            file_size: 100,
            chunk_size: 100,
            total_chunks: 1,
        };
        write_message(&mut stream, &Message::TransferHeader(header)).await.unwrap();
        let chunk = crate::message::ChunkFrame {
            index: 0,
            payload: bytes::Bytes::from(vec![4u8; 100]),
        };
        write_message(&mut stream, &Message::Chunk(chunk)).await.unwrap();

        // 디스크 동기화 뒤의 최종 ACK, 아직 rename 전
        match read_message(&mut stream).await.unwrap() {
            Message::Ack(AckFrame { bytes_acked }) => assert_eq!(bytes_acked, 100),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!recv_dir.join("late.bin").exists());

        write_message(&mut stream, &Message::Cancel).await.unwrap();

        let err = recv_join.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        let leftovers: Vec<_> = std::fs::read_dir(&recv_dir).unwrap().collect();
        assert!(leftovers.is_empty(), "남은 파일: {:?}", leftovers);
        assert_eq!(drain(&mut inbound).last().unwrap().state, TransferState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_after_last_chunk_sends_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("one.bin");
        std::fs::write(&src, vec![2u8; 1000]).unwrap();

        // 청크를 다 받고도 최종 ACK를 보내지 않는 피어
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (got_chunks_tx, got_chunks_rx) = tokio::sync::oneshot::channel();
        let peer_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let total = match read_message(&mut stream).await.unwrap() {
                Message::TransferHeader(h) => h.total_chunks,
                other => panic!("unexpected: {:?}", other),
            };
            for _ in 0..total {
                assert!(matches!(read_message(&mut stream).await.unwrap(), Message::Chunk(_)));
            }
            let _ = got_chunks_tx.send(());
            read_message(&mut stream).await.unwrap()
        });

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let (peer, hold) = hold_peer(&registry, addr);
        let sender = TransferEngine::new(test_config(dir.path()), LocalIdentity::with_name("A"));

        let (handle, mut progress) = sender.send(peer, hold, &src).await.unwrap();
        got_chunks_rx.await.unwrap();
        handle.cancel();

        assert!(matches!(handle.wait().await, Err(Error::Cancelled)));
        assert!(matches!(peer_task.await.unwrap(), Message::Cancel));
        assert_eq!(drain(&mut progress).pop().unwrap().state, TransferState::Cancelled);
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_fails_receiver() {
        let dir = tempfile::tempdir().unwrap();
        let recv_dir = dir.path().join("recv");
        let receiver = Arc::new(TransferEngine::new(test_config(&recv_dir), LocalIdentity::with_name("B")));
        let (addr, recv_join, _inbound) = spawn_receiver(receiver).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let header = TransferHeader {
            session_id: 9,
            sender_id: "rogue".into(),
            sender_name: "Rogue".into(),
            file_name: "x.bin".into(),
            file_size: 300,
            chunk_size: 100,
            total_chunks: 3,
        };
        write_message(&mut stream, &Message::TransferHeader(header)).await.unwrap();

        for index in [0u32, 2] {
            let chunk = crate::message::ChunkFrame {
                index,
                payload: bytes::Bytes::from(vec![index as u8; 100]),
            };
            write_message(&mut stream, &Message::Chunk(chunk)).await.unwrap();
        }

        let err = recv_join.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::UnexpectedChunk { expected: 1, got: 2 }));
        assert!(!recv_dir.join("x.bin").exists());

        // 중간 ACK 뒤에 거절 사유가 옴
        loop {
            match read_message(&mut stream).await.unwrap() {
                Message::Ack(_) => continue,
                Message::Reject(_) => break,
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_ten_mib_file_chunk_count() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("ten.bin");
        let size = 10 * 1024 * 1024;
        std::fs::write(&src, vec![0x5Au8; size]).unwrap();

        let recv_dir = dir.path().join("recv");
        let mut config = test_config(&recv_dir);
        config.chunk_size = 64 * 1024;
        config.ack_every_chunks = 16;
        let receiver = Arc::new(TransferEngine::new(config.clone(), LocalIdentity::with_name("B")));
        let (addr, recv_join, _inbound) = spawn_receiver(receiver).await;

        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let (peer, hold) = hold_peer(&registry, addr);
        config.download_dir = dir.path().to_path_buf();
        let sender = TransferEngine::new(config, LocalIdentity::with_name("A"));

        let (handle, _progress) = sender.send(peer, hold, &src).await.unwrap();
        let stats = handle.wait().await.unwrap();

        assert_eq!(stats.chunks, 160);
        assert_eq!(stats.bytes_acked, 10 * 1024 * 1024);
        // ACK는 청크마다가 아님
        assert!(stats.acks < 160);
        recv_join.await.unwrap().unwrap();
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TransferState::Pending.is_terminal());
        assert!(!TransferState::Transferring.is_terminal());
        assert!(TransferState::Completed.is_terminal());
        assert!(TransferState::Cancelled.is_terminal());
        assert!(TransferState::Failed.is_terminal());
    }
}
