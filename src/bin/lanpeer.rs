//! LanPeer CLI
//!
//! 사용법:
//!   lanpeer run                        # 디스커버리 + 파일/화면 수신
//!   lanpeer peers --wait 6             # 주변 피어 목록
//!   lanpeer send --peer Alice data.bin # 파일 전송
//!   lanpeer share [--peer Alice]       # 화면 공유 (대상 없으면 시청자 대기)
//!   lanpeer watch --peer Alice         # 화면 시청

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use lanpeer::capture::{default_backend, TestPatternBackend};
use lanpeer::{
    CaptureBackend, Config, CoreEvent, LocalIdentity, Peer, PeerId, SessionCoordinator, TransferState,
};

#[derive(Parser)]
#[command(name = "lanpeer", version, about = "LAN peer discovery, file transfer and screen sharing")]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalOpts {
    /// 표시 이름 (기본: 호스트 이름)
    #[arg(long, global = true)]
    name: Option<String>,

    /// 디스커버리 UDP 포트
    #[arg(long, global = true)]
    discovery_port: Option<u16>,

    /// 서비스 TCP 포트 (0이면 자동)
    #[arg(long, global = true)]
    service_port: Option<u16>,

    /// 수신 파일 저장 디렉토리
    #[arg(long, global = true)]
    download_dir: Option<PathBuf>,

    /// 유선 LAN 프리셋
    #[arg(long, global = true)]
    lan: bool,
}

#[derive(Subcommand)]
enum Command {
    /// 디스커버리를 켜고 수신 대기
    Run,
    /// 피어 목록 출력
    Peers {
        /// 대기 시간 (초)
        #[arg(long, default_value_t = 6)]
        wait: u64,
    },
    /// 파일 전송
    Send {
        /// 피어 ID 또는 이름
        #[arg(long)]
        peer: String,
        file: PathBuf,
        /// 피어 탐색 대기 시간 (초)
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
    /// 화면 공유
    Share {
        /// 피어 ID 또는 이름 (없으면 시청자 대기)
        #[arg(long)]
        peer: Option<String>,
        #[arg(long)]
        fps: Option<u32>,
        /// 합성 테스트 화면 사용
        #[arg(long)]
        test_pattern: bool,
    },
    /// 화면 시청
    Watch {
        #[arg(long)]
        peer: String,
        #[arg(long, default_value_t = 10)]
        wait: u64,
    },
}

impl GlobalOpts {
    fn config(&self) -> Config {
        let mut config = if self.lan { Config::lan() } else { Config::default() };
        if let Some(port) = self.discovery_port {
            config.discovery_port = port;
            config.broadcast_addr.set_port(port);
        }
        if let Some(port) = self.service_port {
            config.service_port = port;
        }
        if let Some(dir) = &self.download_dir {
            config.download_dir = dir.clone();
        }
        config
    }

    fn identity(&self) -> LocalIdentity {
        match &self.name {
            Some(name) => LocalIdentity::with_name(name.clone()),
            None => LocalIdentity::generate(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("lanpeer=info")))
        .init();

    let cli = Cli::parse();
    let mut config = cli.opts.config();
    let identity = cli.opts.identity();

    let backend: Arc<dyn CaptureBackend> = match &cli.command {
        Command::Share { test_pattern: true, .. } => Arc::new(TestPatternBackend::new(640, 360)),
        _ => default_backend(),
    };
    if let Command::Share { fps: Some(fps), .. } = &cli.command {
        config.frame_rate = *fps;
    }

    let coordinator = SessionCoordinator::bind(config, identity, backend).await?;
    info!(
        "LanPeer: {} ({}) service={}",
        coordinator.identity().name,
        coordinator.identity().peer_id,
        coordinator.service_addr()
    );
    coordinator.start_discovery().await?;

    match cli.command {
        Command::Run => {
            let events = tokio::spawn(print_events(coordinator.subscribe()));
            tokio::signal::ctrl_c().await?;
            events.abort();
        }
        Command::Peers { wait } => {
            tokio::time::sleep(Duration::from_secs(wait)).await;
            let peers = coordinator.get_peers();
            if peers.is_empty() {
                println!("피어 없음");
            }
            for peer in peers {
                println!("{}  {:<20} {}", peer.id, peer.name, peer.socket_addr());
            }
        }
        Command::Send { peer, file, wait } => {
            let peer = wait_for_peer(&coordinator, &peer, Duration::from_secs(wait)).await?;
            let mut progress = coordinator.send_file(&file, &peer.id).await?;

            let mut last_percent = -1.0;
            while let Some(p) = progress.recv().await {
                if p.percent - last_percent >= 5.0 || p.state.is_terminal() {
                    info!("{} {:?} {:.1}% ({}/{})", p.file_name, p.state, p.percent, p.bytes_acked, p.file_size);
                    last_percent = p.percent;
                }
                if p.state.is_terminal() {
                    if p.state != TransferState::Completed {
                        return Err(p.error.unwrap_or_else(|| format!("{:?}", p.state)).into());
                    }
                    break;
                }
            }
        }
        Command::Share { peer, .. } => {
            let target = match peer {
                Some(query) => Some(wait_for_peer(&coordinator, &query, Duration::from_secs(10)).await?.id),
                None => None,
            };
            let handle = coordinator.start_screen_share(target.as_ref()).await?;
            info!("화면 공유 중 (session={:016x}), Ctrl+C로 종료", handle.session_id());

            let events = tokio::spawn(print_events(coordinator.subscribe()));
            tokio::signal::ctrl_c().await?;
            coordinator.stop_screen_share().await;
            events.abort();
            info!("전송 {} frames, 폐기 {} frames", handle.frames_sent(), handle.frames_dropped());
        }
        Command::Watch { peer, wait } => {
            let peer = wait_for_peer(&coordinator, &peer, Duration::from_secs(wait)).await?;
            let mut events = coordinator.subscribe();
            coordinator.watch_screen(&peer.id)?;

            let mut frames = 0u64;
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(CoreEvent::ScreenFrame(frame)) => {
                            frames += 1;
                            if frames % 30 == 0 {
                                info!("프레임 #{} ({} bytes)", frame.frame_sequence, frame.data.len());
                            }
                        }
                        Ok(CoreEvent::ViewerEnded { error, .. }) => {
                            if let Some(e) = error {
                                warn!("시청 종료: {}", e);
                            }
                            break;
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => {}
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("수신 {} frames", frames);
        }
    }

    coordinator.shutdown().await;
    Ok(())
}

/// ID 또는 이름으로 피어 검색 (나타날 때까지 대기)
async fn wait_for_peer(
    coordinator: &SessionCoordinator,
    query: &str,
    timeout: Duration,
) -> Result<Peer, Box<dyn std::error::Error>> {
    let id = PeerId::from(query);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(peer) = coordinator
            .get_peers()
            .into_iter()
            .find(|p| p.id == id || p.name == query)
        {
            return Ok(peer);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(format!("피어를 찾을 수 없음: {}", query).into());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<CoreEvent>) {
    loop {
        match events.recv().await {
            Ok(CoreEvent::PeerAdded(peer)) => info!("+ {} ({}) {}", peer.name, peer.id, peer.socket_addr()),
            Ok(CoreEvent::PeersRemoved(ids)) => {
                for id in ids {
                    info!("- {}", id);
                }
            }
            Ok(CoreEvent::DiscoveryStatus(status)) => info!("디스커버리: {:?}", status),
            Ok(CoreEvent::Transfer(p)) if p.state.is_terminal() => match &p.saved_path {
                Some(path) => info!("{:?}: {} → {:?}", p.state, p.file_name, path),
                None => info!("{:?}: {} {}", p.state, p.file_name, p.error.as_deref().unwrap_or("")),
            },
            Ok(CoreEvent::ShareState { state, .. }) => info!("화면 공유: {:?}", state),
            Ok(CoreEvent::ViewerAttached { viewer_id, .. }) => info!("시청자 연결: {}", viewer_id),
            Ok(CoreEvent::ShareFailed { reason, .. }) => warn!("화면 공유 실패: {}", reason),
            Ok(_) => {}
            Err(RecvError::Lagged(n)) => warn!("이벤트 {}개 누락", n),
            Err(RecvError::Closed) => break,
        }
    }
}
