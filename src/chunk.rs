//! 청크 분할과 조립
//!
//! - FileChunker: 송신측, 파일을 고정 크기 청크로 순서대로 읽음
//! - ChunkAssembler: 수신측, 임시 파일에 순서대로 기록 후 완료 시 rename

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::message::{ChunkFrame, TransferHeader};
use crate::{Error, Result, MAX_PAYLOAD_LEN};

/// 청크 인덱스
pub type ChunkIndex = u32;

/// 총 청크 수 (올림)
///
/// `u32` 인덱스로 셀 수 없을 만큼 크면 None.
pub fn total_chunks(file_size: u64, chunk_size: u32) -> Option<u32> {
    if chunk_size == 0 {
        return Some(0);
    }
    u32::try_from(file_size.div_ceil(chunk_size as u64)).ok()
}

/// index번째 청크의 길이
pub fn chunk_len(index: ChunkIndex, file_size: u64, chunk_size: u32) -> usize {
    let offset = index as u64 * chunk_size as u64;
    file_size.saturating_sub(offset).min(chunk_size as u64) as usize
}

/// 전송 헤더 검증
pub fn validate_header(header: &TransferHeader) -> Result<()> {
    if header.chunk_size == 0 || header.chunk_size as usize > MAX_PAYLOAD_LEN - 4 {
        return Err(Error::MalformedFrame(format!(
            "유효하지 않은 청크 크기: {}",
            header.chunk_size
        )));
    }

    let expected = total_chunks(header.file_size, header.chunk_size).ok_or_else(|| {
        Error::MalformedFrame(format!("파일이 너무 큼: {} bytes", header.file_size))
    })?;
    if header.total_chunks != expected {
        return Err(Error::MalformedFrame(format!(
            "청크 수 불일치: expected {}, got {}",
            expected, header.total_chunks
        )));
    }

    sanitize_file_name(&header.file_name).map(|_| ())
}

/// 경로 구성요소를 제거한 파일 이름
pub fn sanitize_file_name(name: &str) -> Result<String> {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if base.is_empty() || base == "." || base == ".." {
        return Err(Error::MalformedFrame(format!("유효하지 않은 파일 이름: {:?}", name)));
    }
    Ok(base)
}

/// 파일을 청크로 읽는 송신측 리더
#[derive(Debug)]
pub struct FileChunker {
    file: File,
    file_name: String,
    file_size: u64,
    chunk_size: u32,
    total_chunks: u32,
    next_index: ChunkIndex,
}

impl FileChunker {
    /// 파일 열기
    pub async fn open(path: &Path, chunk_size: u32) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::MalformedFrame("청크 크기 0".into()));
        }

        let file = File::open(path).await?;
        let file_size = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::MalformedFrame(format!("파일 이름 없음: {:?}", path)))?;

        let total_chunks = total_chunks(file_size, chunk_size).ok_or_else(|| {
            Error::MalformedFrame(format!("파일이 너무 큼: {} bytes / {} bytes 청크", file_size, chunk_size))
        })?;

        Ok(Self {
            file,
            file_name,
            file_size,
            chunk_size,
            total_chunks,
            next_index: 0,
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// 다음 청크 (끝이면 None)
    pub async fn next_chunk(&mut self) -> Result<Option<ChunkFrame>> {
        if self.next_index >= self.total_chunks {
            return Ok(None);
        }

        let index = self.next_index;
        let len = chunk_len(index, self.file_size, self.chunk_size);
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        self.next_index += 1;

        Ok(Some(ChunkFrame {
            index,
            payload: Bytes::from(buf),
        }))
    }
}

/// 수신측 청크 조립기
///
/// 청크는 인덱스 순서로만 받는다. 완료 전에 drop되면 임시 파일을 지운다.
#[derive(Debug)]
pub struct ChunkAssembler {
    file: Option<File>,
    temp_path: PathBuf,
    dir: PathBuf,
    file_name: String,
    file_size: u64,
    chunk_size: u32,
    total_chunks: u32,
    next_index: ChunkIndex,
    bytes_written: u64,
    finished: bool,
}

impl ChunkAssembler {
    /// 다운로드 디렉토리에 임시 파일 생성
    pub async fn create(dir: &Path, header: &TransferHeader) -> Result<Self> {
        validate_header(header)?;
        let file_name = sanitize_file_name(&header.file_name)?;

        tokio::fs::create_dir_all(dir).await.map_err(Error::Storage)?;
        let temp_path = dir.join(format!(".{}.{:016x}.part", file_name, header.session_id));
        let file = File::create(&temp_path).await.map_err(Error::Storage)?;

        debug!("임시 파일 생성: {:?}", temp_path);

        Ok(Self {
            file: Some(file),
            temp_path,
            dir: dir.to_path_buf(),
            file_name,
            file_size: header.file_size,
            chunk_size: header.chunk_size,
            total_chunks: header.total_chunks,
            next_index: 0,
            bytes_written: 0,
            finished: false,
        })
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn next_index(&self) -> ChunkIndex {
        self.next_index
    }

    pub fn is_complete(&self) -> bool {
        self.next_index >= self.total_chunks
    }

    /// 청크 기록
    ///
    /// 인덱스가 기대값과 다르거나 길이가 맞지 않으면 에러. 누적 기록 바이트 반환.
    pub async fn write_chunk(&mut self, chunk: &ChunkFrame) -> Result<u64> {
        if chunk.index != self.next_index || self.is_complete() {
            return Err(Error::UnexpectedChunk {
                expected: self.next_index,
                got: chunk.index,
            });
        }

        let expected_len = chunk_len(chunk.index, self.file_size, self.chunk_size);
        if chunk.payload.len() != expected_len {
            return Err(Error::MalformedFrame(format!(
                "청크 {} 길이 불일치: expected {}, got {}",
                chunk.index,
                expected_len,
                chunk.payload.len()
            )));
        }

        let file = self.file.as_mut().ok_or(Error::ConnectionClosed)?;
        file.write_all(&chunk.payload).await.map_err(Error::Storage)?;

        self.next_index += 1;
        self.bytes_written += chunk.payload.len() as u64;
        Ok(self.bytes_written)
    }

    /// 모든 청크를 디스크에 동기화하고 파일을 닫음
    ///
    /// 임시 이름은 그대로 둔다. 여러 번 호출해도 된다.
    pub async fn sync(&mut self) -> Result<()> {
        if !self.is_complete() {
            return Err(Error::UnexpectedChunk {
                expected: self.next_index,
                got: self.total_chunks,
            });
        }

        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(Error::Storage)?;
            file.sync_all().await.map_err(Error::Storage)?;
        }
        Ok(())
    }

    /// 디스크 동기화 후 최종 이름으로 rename
    ///
    /// 같은 이름의 파일이 있으면 `name (n).ext`로 저장한다.
    pub async fn finish(mut self) -> Result<PathBuf> {
        self.sync().await?;

        let final_path = unique_path(&self.dir, &self.file_name).await;
        tokio::fs::rename(&self.temp_path, &final_path)
            .await
            .map_err(Error::Storage)?;
        self.finished = true;

        Ok(final_path)
    }

    /// 중단: 임시 파일 삭제
    pub async fn abort(mut self) {
        self.file.take();
        if let Err(e) = tokio::fs::remove_file(&self.temp_path).await {
            warn!("임시 파일 삭제 실패 {:?}: {}", self.temp_path, e);
        }
        self.finished = true;
    }
}

impl Drop for ChunkAssembler {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}

async fn unique_path(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| file_name.to_string());
    let ext = path.extension().map(|e| e.to_string_lossy().to_string());

    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{} ({}).{}", stem, n, ext),
            None => format!("{} ({})", stem, n),
        };
        let candidate = dir.join(name);
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}
