//! 로컬 피어 식별자
//!
//! 프로세스 시작 시 한 번 만들어 디스커버리와 세션에 명시적으로 넘긴다.

use crate::message::{CAP_FILE_TRANSFER, CAP_SCREEN_SHARE, CAP_SCREEN_VIEW};
use crate::peer::PeerId;

/// 로컬 인스턴스 식별 정보
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    /// 안정적인 피어 ID
    pub peer_id: PeerId,

    /// 표시 이름
    pub name: String,

    /// 지원 기능 플래그
    pub capabilities: u8,
}

impl LocalIdentity {
    /// 주어진 ID와 이름으로 생성
    pub fn new(peer_id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            capabilities: CAP_FILE_TRANSFER | CAP_SCREEN_SHARE | CAP_SCREEN_VIEW,
        }
    }

    /// 무작위 ID + 호스트 이름으로 생성
    pub fn generate() -> Self {
        let name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "Unknown Device".to_string());
        Self::with_name(name)
    }

    /// 무작위 ID + 지정 이름으로 생성
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), name)
    }

    pub fn with_capabilities(mut self, capabilities: u8) -> Self {
        self.capabilities = capabilities;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = LocalIdentity::with_name("a");
        let b = LocalIdentity::with_name("a");
        assert_ne!(a.peer_id, b.peer_id);
        assert!(!a.peer_id.as_str().is_empty());
        assert_eq!(a.capabilities & CAP_FILE_TRANSFER, CAP_FILE_TRANSFER);
    }
}
