//! 에러 타입 정의

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// 에러 분류
///
/// 호출자는 이 분류로 재시도 여부와 보고 방식을 결정한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// bind / connect / send / recv 실패
    Network,
    /// 잘못된 프레임, 순서가 어긋난 청크, 알 수 없는 피어
    Protocol,
    /// 연결 / 유휴 타임아웃
    Timeout,
    /// 캡처 장치 없음, 디스크 가득 참 등
    Resource,
}

/// LanPeer 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("직렬화 에러: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("바인드 실패: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("연결 실패: {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("유효하지 않은 매직 넘버: expected {expected:08X}, got {got:08X}")]
    InvalidMagicNumber { expected: u32, got: u32 },

    #[error("유효하지 않은 프로토콜 버전: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("알 수 없는 메시지 타입: {0}")]
    UnknownMessageType(u8),

    #[error("프레임 크기 초과: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("잘못된 프레임: {0}")]
    MalformedFrame(String),

    #[error("메시지 타입 불일치: expected {expected}, got {got}")]
    MessageTypeMismatch { expected: String, got: String },

    #[error("예상하지 못한 청크: expected index {expected}, got {got}")]
    UnexpectedChunk { expected: u32, got: u32 },

    #[error("알 수 없는 피어: {0}")]
    UnknownPeer(String),

    #[error("이미 진행 중인 전송이 있음: peer={0}")]
    TransferInProgress(String),

    #[error("상대가 요청을 거절함: {0}")]
    Rejected(String),

    #[error("연결 타임아웃: {addr} ({timeout:?})")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    #[error("유휴 타임아웃: {0:?} 동안 수신 없음")]
    IdleTimeout(Duration),

    #[error("저장소 에러: {0}")]
    Storage(#[source] std::io::Error),

    #[error("화면 캡처 사용 불가: {0}")]
    CaptureUnavailable(String),

    #[error("프레임 인코딩 실패: {0}")]
    Encode(String),

    #[error("채널 에러")]
    ChannelError,

    #[error("취소됨")]
    Cancelled,
}

impl Error {
    /// 에러 분류 반환
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_)
            | Error::Bind { .. }
            | Error::Connect { .. }
            | Error::ConnectionClosed
            | Error::ChannelError
            | Error::Cancelled => ErrorKind::Network,

            Error::Serialization(_)
            | Error::InvalidMagicNumber { .. }
            | Error::InvalidVersion { .. }
            | Error::UnknownMessageType(_)
            | Error::FrameTooLarge { .. }
            | Error::MalformedFrame(_)
            | Error::MessageTypeMismatch { .. }
            | Error::UnexpectedChunk { .. }
            | Error::UnknownPeer(_)
            | Error::TransferInProgress(_)
            | Error::Rejected(_) => ErrorKind::Protocol,

            Error::ConnectTimeout { .. } | Error::IdleTimeout(_) => ErrorKind::Timeout,

            Error::Storage(_) | Error::CaptureUnavailable(_) | Error::Encode(_) => {
                ErrorKind::Resource
            }
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(Error::ConnectionClosed.kind(), ErrorKind::Network);
        assert_eq!(
            Error::UnexpectedChunk { expected: 1, got: 3 }.kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            Error::IdleTimeout(Duration::from_secs(30)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            Error::CaptureUnavailable("no display".into()).kind(),
            ErrorKind::Resource
        );
    }
}
