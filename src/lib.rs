//! # LanPeer
//!
//! LAN 피어 통신 코어
//!
//! ## 구성
//! - **피어 레지스트리**: 현재 보이는 피어와 생존 시각, 세션 홀드
//! - **디스커버리**: UDP 브로드캐스트 알림 / 수신 / 만료 스윕
//! - **전송 엔진**: 청크 단위 파일 전송, 누적 ACK, 진행률 보고
//! - **화면 공유**: 캡처 → JPEG 키프레임 → 길이 접두 프레임 스트림
//! - **세션 코디네이터**: UI가 호출하는 파사드, 이벤트 다중화

pub mod capture;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod message;
pub mod peer;
pub mod screen_share;
pub mod stats;
pub mod transfer;

pub use capture::{CaptureBackend, FrameSource, RawFrame, TestPatternBackend};
pub use config::Config;
pub use coordinator::{CoordinatorStatus, CoreEvent, SessionCoordinator};
pub use discovery::{DiscoveryService, DiscoveryStatus};
pub use error::{Error, ErrorKind, Result};
pub use identity::LocalIdentity;
pub use message::{DiscoveryAnnouncement, Message};
pub use peer::{Peer, PeerHold, PeerId, PeerRegistry, PeerSnapshot};
pub use screen_share::{ScreenShareStreamer, ShareHandle, ShareState};
pub use stats::TransferStats;
pub use transfer::{TransferEngine, TransferHandle, TransferProgress, TransferState};

/// 프로토콜 버전
pub const PROTOCOL_VERSION: u8 = 1;

/// 기본 청크 크기 (바이트)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024; // 64KB

/// 기본 디스커버리 포트 (UDP)
pub const DEFAULT_DISCOVERY_PORT: u16 = 47_800;

/// 기본 서비스 포트 (TCP)
pub const DEFAULT_SERVICE_PORT: u16 = 47_801;

/// 매직 넘버 (패킷 식별용)
pub const MAGIC_NUMBER: u32 = 0x4C50_434D; // "LPCM"

/// 프레임 페이로드 최대 크기
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;
