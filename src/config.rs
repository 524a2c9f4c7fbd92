//! 코어 설정

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_DISCOVERY_PORT, DEFAULT_SERVICE_PORT};

/// LanPeer 코어 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 디스커버리 수신 포트 (UDP)
    pub discovery_port: u16,

    /// 알림을 보낼 주소 (기본: 브로드캐스트)
    pub broadcast_addr: SocketAddr,

    /// 전송 / 화면 공유 수신 포트 (TCP, 0이면 자동 할당)
    pub service_port: u16,

    /// 알림 주기 (밀리초)
    pub announce_interval_ms: u64,

    /// 피어 생존 타임아웃 (밀리초)
    pub liveness_timeout_ms: u64,

    /// 만료 스윕 주기 (밀리초)
    pub sweep_interval_ms: u64,

    /// 재시도 백오프 시작값 (밀리초)
    pub backoff_initial_ms: u64,

    /// 재시도 백오프 상한 (밀리초)
    pub backoff_max_ms: u64,

    /// 청크 크기 (바이트)
    pub chunk_size: u32,

    /// N개 청크마다 누적 ACK
    pub ack_every_chunks: u32,

    /// 마지막 ACK 이후 이 시간이 지나면 ACK (밀리초)
    pub ack_interval_ms: u64,

    /// 연결 타임아웃 (밀리초)
    pub connect_timeout_ms: u64,

    /// 전송 유휴 타임아웃 (밀리초)
    pub idle_timeout_ms: u64,

    /// 수신 파일 저장 디렉토리
    pub download_dir: PathBuf,

    /// 화면 캡처 주기 (frames/sec)
    pub frame_rate: u32,

    /// JPEG 품질 (1 ~ 100)
    pub jpeg_quality: u8,

    /// 송신 대기 프레임 최대 수 (초과 시 가장 오래된 프레임 폐기)
    pub frame_queue_depth: usize,

    /// 코디네이터 이벤트 채널 크기
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::BROADCAST,
                DEFAULT_DISCOVERY_PORT,
            )),
            service_port: DEFAULT_SERVICE_PORT,
            announce_interval_ms: 5_000,  // 5초
            liveness_timeout_ms: 15_000,  // 15초
            sweep_interval_ms: 1_000,     // 1초
            backoff_initial_ms: 1_000,
            backoff_max_ms: 10_000,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_every_chunks: 16,         // 64KB x 16 = 1MB
            ack_interval_ms: 250,
            connect_timeout_ms: 10_000,   // 10초
            idle_timeout_ms: 30_000,      // 30초
            download_dir: std::env::temp_dir().join("lanpeer"),
            frame_rate: 15,
            jpeg_quality: 70,
            frame_queue_depth: 2,
            event_buffer: 256,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 유선 LAN용 설정 (캡처 30fps, 큐 3프레임)
    pub fn lan() -> Self {
        Self {
            frame_rate: 30,
            frame_queue_depth: 3,
            ..Self::default()
        }
    }

    /// 루프백 테스트용 설정
    ///
    /// 임의 포트를 쓰고 모든 타이머를 짧게 잡는다.
    /// `broadcast_addr`는 상대 인스턴스의 디스커버리 포트로 직접 지정해야 한다.
    pub fn for_testing() -> Self {
        Self {
            discovery_port: 0,
            broadcast_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            service_port: 0,
            announce_interval_ms: 100,
            liveness_timeout_ms: 500,
            sweep_interval_ms: 50,
            backoff_initial_ms: 50,
            backoff_max_ms: 200,
            chunk_size: 16 * 1024,
            ack_every_chunks: 4,
            ack_interval_ms: 50,
            connect_timeout_ms: 1_000,
            idle_timeout_ms: 1_000,
            download_dir: std::env::temp_dir().join("lanpeer-test"),
            frame_rate: 30,
            jpeg_quality: 50,
            frame_queue_depth: 2,
            event_buffer: 1024,
        }
    }

    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    /// 캡처 주기 (1 ~ 60fps로 제한)
    pub fn frame_interval(&self) -> Duration {
        let fps = self.frame_rate.clamp(1, 60);
        Duration::from_micros(1_000_000 / fps as u64)
    }
}
