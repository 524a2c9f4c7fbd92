//! 프로토콜 메시지 정의
//!
//! 모든 메시지는 고정 10바이트 헤더 뒤에 페이로드가 붙는다.
//!
//! ```text
//! magic(u32 BE) | version(u8) | msg_type(u8) | payload_len(u32 BE) | payload
//! ```
//!
//! 제어 메시지 페이로드는 bincode, 대용량 메시지(청크, 화면 프레임)는
//! 고정 폭 필드 + 원본 바이트로 구성된다.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result, MAGIC_NUMBER, MAX_PAYLOAD_LEN, PROTOCOL_VERSION};

/// 헤더 크기 (바이트)
pub const HEADER_LEN: usize = 10;

/// 기능 플래그: 파일 수신 가능
pub const CAP_FILE_TRANSFER: u8 = 0b0000_0001;

/// 기능 플래그: 화면 공유 송신 가능
pub const CAP_SCREEN_SHARE: u8 = 0b0000_0010;

/// 기능 플래그: 화면 공유 시청 가능
pub const CAP_SCREEN_VIEW: u8 = 0b0000_0100;

/// 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// 디스커버리 알림 (UDP)
    Announce = 1,

    /// 전송 헤더
    TransferHeader = 2,

    /// 파일 청크
    Chunk = 3,

    /// 누적 ACK
    Ack = 4,

    /// 전송 취소
    Cancel = 5,

    /// 요청 거절
    Reject = 6,

    /// 화면 공유 시작 알림 (공유자 → 시청자)
    ShareStart = 7,

    /// 화면 프레임
    ScreenFrame = 8,

    /// 시청 요청 (시청자 → 공유자)
    ViewRequest = 9,

    /// 세션 정상 종료
    Close = 10,
}

impl TryFrom<u8> for MessageType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => MessageType::Announce,
            2 => MessageType::TransferHeader,
            3 => MessageType::Chunk,
            4 => MessageType::Ack,
            5 => MessageType::Cancel,
            6 => MessageType::Reject,
            7 => MessageType::ShareStart,
            8 => MessageType::ScreenFrame,
            9 => MessageType::ViewRequest,
            10 => MessageType::Close,
            other => return Err(Error::UnknownMessageType(other)),
        })
    }
}

/// 메시지 헤더
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    /// 매직 넘버
    pub magic: u32,

    /// 프로토콜 버전
    pub version: u8,

    /// 메시지 타입
    pub msg_type: MessageType,

    /// 메시지 길이 (헤더 제외)
    pub payload_len: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, payload_len: u32) -> Self {
        Self {
            magic: MAGIC_NUMBER,
            version: PROTOCOL_VERSION,
            msg_type,
            payload_len,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.msg_type as u8);
        buf.put_u32(self.payload_len);
    }

    /// 헤더 파싱 + 검증
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MalformedFrame(format!(
                "헤더 길이 부족: {} bytes",
                bytes.len()
            )));
        }

        let magic = bytes.get_u32();
        if magic != MAGIC_NUMBER {
            return Err(Error::InvalidMagicNumber {
                expected: MAGIC_NUMBER,
                got: magic,
            });
        }

        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(Error::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }

        let msg_type = MessageType::try_from(bytes.get_u8())?;
        let payload_len = bytes.get_u32();
        if payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(Error::FrameTooLarge {
                len: payload_len as usize,
                max: MAX_PAYLOAD_LEN,
            });
        }

        Ok(Self {
            magic,
            version,
            msg_type,
            payload_len,
        })
    }
}

/// 디스커버리 알림
///
/// 모든 인스턴스가 주기적으로 브로드캐스트한다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryAnnouncement {
    pub peer_id: String,
    pub name: String,
    pub port: u16,
    pub capability_flags: u8,
}

impl DiscoveryAnnouncement {
    /// 최소 형태 검증
    pub fn validate(&self) -> Result<()> {
        if self.peer_id.is_empty() {
            return Err(Error::MalformedFrame("빈 peer_id".into()));
        }
        if self.port == 0 {
            return Err(Error::MalformedFrame("port 0".into()));
        }
        Ok(())
    }
}

/// 전송 헤더 (송신자 → 수신자, 세션 첫 메시지)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub session_id: u64,
    pub sender_id: String,
    pub sender_name: String,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u32,
    pub total_chunks: u32,
}

/// 파일 청크
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub index: u32,
    pub payload: Bytes,
}

/// 누적 ACK (수신자 → 송신자)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFrame {
    pub bytes_acked: u64,
}

/// 거절 사유
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectFrame {
    pub reason: String,
}

/// 화면 프레임 포맷
///
/// 코어는 하나의 포맷만 협상한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameFormat {
    /// 프레임별 독립 JPEG (키프레임 전용)
    Jpeg,
}

/// 화면 공유 시작 (공유자 → 시청자)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareStart {
    pub session_id: u64,
    pub sharer_id: String,
    pub sharer_name: String,
    pub format: FrameFormat,
    pub frame_rate: u32,
}

/// 시청 요청 (시청자 → 공유자)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRequest {
    pub viewer_id: String,
    pub viewer_name: String,
}

/// 화면 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScreenFrame {
    pub frame_sequence: u64,
    pub payload: Bytes,
}

/// 통합 메시지 enum
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Announce(DiscoveryAnnouncement),
    TransferHeader(TransferHeader),
    Chunk(ChunkFrame),
    Ack(AckFrame),
    Cancel,
    Reject(RejectFrame),
    ShareStart(ShareStart),
    ScreenFrame(ScreenFrame),
    ViewRequest(ViewRequest),
    Close,
}

impl Message {
    /// 메시지 타입 반환
    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Announce(_) => MessageType::Announce,
            Message::TransferHeader(_) => MessageType::TransferHeader,
            Message::Chunk(_) => MessageType::Chunk,
            Message::Ack(_) => MessageType::Ack,
            Message::Cancel => MessageType::Cancel,
            Message::Reject(_) => MessageType::Reject,
            Message::ShareStart(_) => MessageType::ShareStart,
            Message::ScreenFrame(_) => MessageType::ScreenFrame,
            Message::ViewRequest(_) => MessageType::ViewRequest,
            Message::Close => MessageType::Close,
        }
    }

    fn encode_payload(&self) -> Result<Bytes> {
        let payload = match self {
            Message::Announce(m) => Bytes::from(bincode::serialize(m)?),
            Message::TransferHeader(m) => Bytes::from(bincode::serialize(m)?),
            Message::Ack(m) => Bytes::from(bincode::serialize(m)?),
            Message::Reject(m) => Bytes::from(bincode::serialize(m)?),
            Message::ShareStart(m) => Bytes::from(bincode::serialize(m)?),
            Message::ViewRequest(m) => Bytes::from(bincode::serialize(m)?),
            Message::Chunk(chunk) => {
                let mut buf = BytesMut::with_capacity(4 + chunk.payload.len());
                buf.put_u32(chunk.index);
                buf.extend_from_slice(&chunk.payload);
                buf.freeze()
            }
            Message::ScreenFrame(frame) => {
                let mut buf = BytesMut::with_capacity(8 + frame.payload.len());
                buf.put_u64(frame.frame_sequence);
                buf.extend_from_slice(&frame.payload);
                buf.freeze()
            }
            Message::Cancel | Message::Close => Bytes::new(),
        };

        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::FrameTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(payload)
    }

    /// 페이로드 역직렬화
    pub fn decode_payload(msg_type: MessageType, mut payload: Bytes) -> Result<Self> {
        Ok(match msg_type {
            MessageType::Announce => Message::Announce(bincode::deserialize(&payload)?),
            MessageType::TransferHeader => Message::TransferHeader(bincode::deserialize(&payload)?),
            MessageType::Ack => Message::Ack(bincode::deserialize(&payload)?),
            MessageType::Reject => Message::Reject(bincode::deserialize(&payload)?),
            MessageType::ShareStart => Message::ShareStart(bincode::deserialize(&payload)?),
            MessageType::ViewRequest => Message::ViewRequest(bincode::deserialize(&payload)?),
            MessageType::Chunk => {
                if payload.len() < 4 {
                    return Err(Error::MalformedFrame("청크 인덱스 누락".into()));
                }
                let index = payload.get_u32();
                Message::Chunk(ChunkFrame { index, payload })
            }
            MessageType::ScreenFrame => {
                if payload.len() < 8 {
                    return Err(Error::MalformedFrame("프레임 시퀀스 누락".into()));
                }
                let frame_sequence = payload.get_u64();
                Message::ScreenFrame(ScreenFrame {
                    frame_sequence,
                    payload,
                })
            }
            MessageType::Cancel => Message::Cancel,
            MessageType::Close => Message::Close,
        })
    }

    /// 헤더 + 페이로드로 직렬화
    pub fn to_bytes(&self) -> Result<Bytes> {
        let payload = self.encode_payload()?;
        let header = MessageHeader::new(self.msg_type(), payload.len() as u32);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }

    /// 데이터그램 하나를 메시지로 파싱
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = MessageHeader::decode(bytes)?;
        let end = HEADER_LEN + header.payload_len as usize;
        if bytes.len() < end {
            return Err(Error::MalformedFrame(format!(
                "페이로드 길이 부족: expected {}, got {}",
                header.payload_len,
                bytes.len() - HEADER_LEN
            )));
        }

        let payload = Bytes::copy_from_slice(&bytes[HEADER_LEN..end]);
        Self::decode_payload(header.msg_type, payload)
    }
}

/// 스트림에서 메시지 하나 읽기
///
/// 헤더 경계에서 상대가 연결을 닫으면 `ConnectionClosed`.
pub async fn read_message<R>(reader: &mut R) -> Result<Message>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut header_buf)
        .await
        .map_err(map_eof)?;
    let header = MessageHeader::decode(&header_buf)?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await.map_err(map_eof)?;

    Message::decode_payload(header.msg_type, Bytes::from(payload))
}

/// 스트림에 메시지 하나 쓰기
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.to_bytes()?;
    writer.write_all(&bytes).await?;
    Ok(())
}

fn map_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_datagram() {
        let ann = DiscoveryAnnouncement {
            peer_id: "p1".into(),
            name: "Alice".into(),
            port: 9001,
            capability_flags: CAP_FILE_TRANSFER | CAP_SCREEN_SHARE,
        };

        let bytes = Message::Announce(ann.clone()).to_bytes().unwrap();
        assert_eq!(&bytes[..4], &MAGIC_NUMBER.to_be_bytes());

        match Message::from_bytes(&bytes).unwrap() {
            Message::Announce(parsed) => assert_eq!(parsed, ann),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_chunk_frame_layout() {
        let msg = Message::Chunk(ChunkFrame {
            index: 7,
            payload: Bytes::from_static(b"hello"),
        });
        let bytes = msg.to_bytes().unwrap();

        // 헤더 10 + 인덱스 4 + 데이터 5
        assert_eq!(bytes.len(), HEADER_LEN + 4 + 5);
        assert_eq!(bytes[5], MessageType::Chunk as u8);
        assert_eq!(&bytes[6..10], &9u32.to_be_bytes());
        assert_eq!(&bytes[10..14], &7u32.to_be_bytes());
        assert_eq!(Message::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_rejects_bad_magic_and_version() {
        let mut bytes = Message::Cancel.to_bytes().unwrap().to_vec();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::InvalidMagicNumber { .. })
        ));

        let mut bytes = Message::Cancel.to_bytes().unwrap().to_vec();
        bytes[4] = PROTOCOL_VERSION + 1;
        assert!(matches!(
            Message::from_bytes(&bytes),
            Err(Error::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_rejects_truncated_and_garbage() {
        assert!(Message::from_bytes(&[1, 2, 3]).is_err());

        let bytes = Message::Ack(AckFrame { bytes_acked: 42 }).to_bytes().unwrap();
        assert!(Message::from_bytes(&bytes[..bytes.len() - 1]).is_err());

        let mut unknown = Message::Close.to_bytes().unwrap().to_vec();
        unknown[5] = 0xEE;
        assert!(matches!(
            Message::from_bytes(&unknown),
            Err(Error::UnknownMessageType(0xEE))
        ));
    }

    #[test]
    fn test_announcement_validation() {
        let mut ann = DiscoveryAnnouncement {
            peer_id: String::new(),
            name: "x".into(),
            port: 1,
            capability_flags: 0,
        };
        assert!(ann.validate().is_err());
        ann.peer_id = "p".into();
        assert!(ann.validate().is_ok());
        ann.port = 0;
        assert!(ann.validate().is_err());
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let frame = Message::ScreenFrame(ScreenFrame {
            frame_sequence: u64::MAX - 1,
            payload: Bytes::from_static(&[0xFF; 100]),
        });
        write_message(&mut a, &frame).await.unwrap();
        write_message(&mut a, &Message::Close).await.unwrap();
        drop(a);

        assert_eq!(read_message(&mut b).await.unwrap(), frame);
        assert_eq!(read_message(&mut b).await.unwrap(), Message::Close);
        assert!(matches!(
            read_message(&mut b).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
