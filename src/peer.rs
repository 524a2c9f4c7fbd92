//! 피어 레지스트리
//!
//! - 알림 수신 시 생성 / 갱신 (last-write-wins, 부분 병합 없음)
//! - 생존 타임아웃이 지나면 스윕에서 제거
//! - 활성 세션이 잡고 있는 피어는 세션이 끝날 때까지 유지

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::message::DiscoveryAnnouncement;

/// 피어 식별자
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 레지스트리에 등록된 피어
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub address: IpAddr,
    pub port: u16,
    pub capabilities: u8,
    pub last_seen: Instant,
}

impl Peer {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    /// 세션 시작 시점의 불변 스냅샷
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            addr: self.socket_addr(),
        }
    }
}

/// 세션이 들고 다니는 피어 주소 사본
///
/// 레지스트리를 역참조하지 않는다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub name: String,
    pub addr: SocketAddr,
}

#[derive(Debug, Default)]
struct RegistryInner {
    /// 삽입 순서 유지
    peers: Vec<Peer>,

    /// 피어별 세션 홀드 카운트
    holds: HashMap<PeerId, usize>,
}

/// 피어 레지스트리
///
/// 리스너 태스크의 upsert, 스윕 타이머의 expire, UI의 list가 동시에 호출된다.
/// 모든 변경은 하나의 RwLock 아래에서 레코드 단위로 교체된다.
#[derive(Debug)]
pub struct PeerRegistry {
    inner: RwLock<RegistryInner>,
    liveness_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            liveness_timeout,
        }
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    /// 알림 반영
    ///
    /// 새로 추가된 피어면 true. 기존 레코드보다 오래된 알림은 무시한다.
    pub fn upsert(&self, announcement: &DiscoveryAnnouncement, address: IpAddr, seen_at: Instant) -> bool {
        let peer = Peer {
            id: PeerId::from(announcement.peer_id.clone()),
            name: announcement.name.clone(),
            address,
            port: announcement.port,
            capabilities: announcement.capability_flags,
            last_seen: seen_at,
        };

        let mut inner = self.inner.write();
        match inner.peers.iter_mut().find(|p| p.id == peer.id) {
            Some(existing) => {
                if existing.last_seen <= seen_at {
                    *existing = peer;
                }
                false
            }
            None => {
                inner.peers.push(peer);
                true
            }
        }
    }

    /// 현재 피어 스냅샷 (삽입 순서)
    pub fn list(&self) -> Vec<Peer> {
        self.inner.read().peers.clone()
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.inner.read().peers.iter().find(|p| &p.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 생존 타임아웃이 지난 피어 제거
    ///
    /// 세션이 홀드 중인 피어는 남긴다. 제거된 ID 반환.
    pub fn expire(&self, now: Instant) -> Vec<PeerId> {
        let timeout = self.liveness_timeout;
        let mut inner = self.inner.write();
        let RegistryInner { peers, holds } = &mut *inner;

        let mut removed = Vec::new();
        peers.retain(|peer| {
            let stale = now.saturating_duration_since(peer.last_seen) > timeout;
            let held = holds.get(&peer.id).copied().unwrap_or(0) > 0;
            if stale && !held {
                removed.push(peer.id.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// 세션용 홀드 획득
    ///
    /// 피어가 없으면 None. 반환된 가드가 drop되면 홀드가 풀린다.
    pub fn hold(self: &Arc<Self>, id: &PeerId) -> Option<PeerHold> {
        let mut inner = self.inner.write();
        if !inner.peers.iter().any(|p| &p.id == id) {
            return None;
        }
        *inner.holds.entry(id.clone()).or_insert(0) += 1;

        Some(PeerHold {
            registry: Arc::clone(self),
            id: id.clone(),
        })
    }

    pub fn is_held(&self, id: &PeerId) -> bool {
        self.inner.read().holds.get(id).copied().unwrap_or(0) > 0
    }

    fn release(&self, id: &PeerId) {
        let mut inner = self.inner.write();
        if let Some(count) = inner.holds.get_mut(id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.holds.remove(id);
            }
        }
    }
}

/// 세션 동안 피어를 레지스트리에 붙잡아 두는 가드
#[derive(Debug)]
pub struct PeerHold {
    registry: Arc<PeerRegistry>,
    id: PeerId,
}

impl PeerHold {
    pub fn peer_id(&self) -> &PeerId {
        &self.id
    }
}

impl Drop for PeerHold {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn announcement(id: &str, name: &str, port: u16) -> DiscoveryAnnouncement {
        DiscoveryAnnouncement {
            peer_id: id.to_string(),
            name: name.to_string(),
            port,
            capability_flags: 0,
        }
    }

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn test_last_write_wins() {
        let registry = PeerRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();

        assert!(registry.upsert(&announcement("p1", "Alice", 9001), localhost(), t0));
        assert!(!registry.upsert(
            &announcement("p1", "Alice-laptop", 9002),
            localhost(),
            t0 + Duration::from_secs(1)
        ));

        let peers = registry.list();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "Alice-laptop");
        assert_eq!(peers[0].port, 9002);
    }

    #[test]
    fn test_older_announcement_ignored() {
        let registry = PeerRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);

        registry.upsert(&announcement("p1", "new", 1), localhost(), t1);
        registry.upsert(&announcement("p1", "old", 2), localhost(), t0);

        let peer = registry.get(&PeerId::from("p1")).unwrap();
        assert_eq!(peer.name, "new");
        assert_eq!(peer.last_seen, t1);
    }

    #[test]
    fn test_list_keeps_insertion_order() {
        let registry = PeerRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            registry.upsert(&announcement(id, id, 1000), localhost(), t0);
            // 재알림은 위치를 바꾸지 않음
            registry.upsert(&announcement("c", "c", 1000), localhost(), t0 + Duration::from_millis(i as u64));
        }

        let ids: Vec<String> = registry.list().into_iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_expire_removes_stale_peers() {
        let registry = PeerRegistry::new(Duration::from_secs(15));
        let t0 = Instant::now();
        registry.upsert(&announcement("p1", "Alice", 9001), localhost(), t0);
        registry.upsert(&announcement("p2", "Bob", 9002), localhost(), t0 + Duration::from_secs(10));

        assert!(registry.expire(t0 + Duration::from_secs(15)).is_empty());

        let removed = registry.expire(t0 + Duration::from_secs(16));
        assert_eq!(removed, vec![PeerId::from("p1")]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_default_timeouts_announce_then_silence() {
        let config = crate::Config::default();
        let registry = PeerRegistry::new(config.liveness_timeout());
        let t0 = Instant::now();
        let ann = announcement("p1", "Alice", 9001);

        // 5초마다 알림, 6초 시점 조회
        registry.upsert(&ann, localhost(), t0);
        registry.upsert(&ann, localhost(), t0 + config.announce_interval());
        registry.expire(t0 + Duration::from_secs(6));
        let peers = registry.list();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "Alice");

        // 마지막 알림 후 20초 침묵: 1초 간격 스윕이 그 전에 제거
        let last = t0 + config.announce_interval();
        let mut now = last;
        while now < last + Duration::from_secs(20) {
            now += config.sweep_interval();
            registry.expire(now);
        }
        assert!(registry.list().is_empty());
    }

    #[test]
    fn test_hold_keeps_peer_until_released() {
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let t0 = Instant::now();
        registry.upsert(&announcement("p1", "Alice", 9001), localhost(), t0);

        let hold = registry.hold(&PeerId::from("p1")).unwrap();
        assert!(registry.is_held(hold.peer_id()));

        let later = t0 + Duration::from_secs(60);
        assert!(registry.expire(later).is_empty());
        assert_eq!(registry.len(), 1);

        drop(hold);
        assert!(!registry.is_held(&PeerId::from("p1")));
        assert_eq!(registry.expire(later), vec![PeerId::from("p1")]);
    }

    #[test]
    fn test_hold_unknown_peer() {
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        assert!(registry.hold(&PeerId::from("ghost")).is_none());
    }

    #[test]
    fn test_concurrent_upsert_never_duplicates() {
        let registry = Arc::new(PeerRegistry::new(Duration::from_secs(15)));
        let base = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..200u64 {
                        let id = format!("p{}", i % 5);
                        let seen = base + Duration::from_millis(i * 8 + t);
                        registry.upsert(&announcement(&id, &format!("n{}", t), 9000), localhost(), seen);
                        let _ = registry.list();
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let peers = registry.list();
        assert_eq!(peers.len(), 5);
        let mut ids: Vec<_> = peers.iter().map(|p| p.id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }
}
