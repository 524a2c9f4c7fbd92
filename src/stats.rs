//! 전송 통계

use std::time::{Duration, Instant};

/// 세션 단위 전송 통계
#[derive(Debug, Clone)]
pub struct TransferStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 파일 크기
    pub file_size: u64,

    /// 보낸 (또는 받은) 청크 수
    pub chunks: u64,

    /// 보낸 (또는 받은) 페이로드 바이트
    pub bytes: u64,

    /// ACK 수
    pub acks: u64,

    /// 마지막 누적 ACK 값
    pub bytes_acked: u64,

    /// 마지막 ACK 시간
    pub last_ack_time: Option<Instant>,
}

impl TransferStats {
    pub fn new(file_size: u64) -> Self {
        Self {
            start_time: Instant::now(),
            file_size,
            chunks: 0,
            bytes: 0,
            acks: 0,
            bytes_acked: 0,
            last_ack_time: None,
        }
    }

    /// 송신 완료한 청크 / 바이트 기록
    pub fn record_sent(&mut self, chunks: u64, bytes: u64) {
        self.chunks += chunks;
        self.bytes += bytes;
    }

    /// ACK 기록
    pub fn record_ack(&mut self, bytes_acked: u64) {
        self.acks += 1;
        self.bytes_acked = bytes_acked;
        self.last_ack_time = Some(Instant::now());
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 확인된 처리율 (bytes/sec)
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_acked as f64 / elapsed
    }

    /// 진행률 (0 ~ 100)
    pub fn percent(&self) -> f64 {
        percent(self.bytes_acked, self.file_size)
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Chunks: {} | Acked: {}/{} ({:.1}%) | ACKs: {} | Throughput: {:.2} MB/s",
            self.elapsed().as_secs_f64(),
            self.chunks,
            self.bytes_acked,
            self.file_size,
            self.percent(),
            self.acks,
            self.throughput() / 1_000_000.0,
        )
    }
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new(0)
    }
}

/// 진행률 계산
///
/// 빈 파일은 ACK를 받은 시점에 100%로 본다.
pub fn percent(bytes_acked: u64, file_size: u64) -> f64 {
    if file_size == 0 {
        return 100.0;
    }
    (bytes_acked.min(file_size) as f64 / file_size as f64) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 100), 0.0);
        assert_eq!(percent(50, 100), 50.0);
        assert_eq!(percent(100, 100), 100.0);
        assert_eq!(percent(0, 0), 100.0);
    }

    #[test]
    fn test_record() {
        let mut stats = TransferStats::new(200);
        stats.record_sent(2, 200);
        stats.record_ack(200);
        assert_eq!(stats.chunks, 2);
        assert_eq!(stats.bytes, 200);
        assert_eq!(stats.acks, 1);
        assert_eq!(stats.percent(), 100.0);
        assert!(stats.summary().contains("Chunks: 2"));
    }
}
