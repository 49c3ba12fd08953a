use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{LinesCodec, LinesCodecError};

use crate::backhaul::telemetry::StatsSummary;

/// First line a client sends on the control channel. The server treats it as free-form.
pub const CLIENT_HELLO: &str = "BACKHAUL_CLIENT v1";

pub const MAX_CONTROL_LINE_BYTES: usize = 4096;
pub const MAX_REGISTRATION_BYTES: usize = 1024;

pub const FEATURES: [&str; 4] = ["statistics", "rate_limiting", "heartbeat", "tunnel_request"];

const PING: &str = "PING";
const PONG: &str = "PONG";
const STATS_REQUEST: &str = "STATS_REQUEST";
const TUNNEL_REQUEST: &str = "TUNNEL_REQUEST";
const SERVER_SHUTDOWN: &str = "SERVER_SHUTDOWN";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    Empty,
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("stream ended mid-line")]
    UnexpectedEof,
    #[error("invalid utf-8")]
    InvalidUtf8,
    #[error("missing client_id")]
    MissingClientId,
    #[error("unexpected message: {0}")]
    Unexpected(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<LinesCodecError> for ProtocolError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => {
                ProtocolError::LineTooLong(MAX_CONTROL_LINE_BYTES)
            }
            LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                ProtocolError::InvalidUtf8
            }
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}

/// Codec for both directions of the control channel.
pub fn control_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_CONTROL_LINE_BYTES)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub client_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub server_version: String,
    #[serde(default)]
    pub features: Vec<String>,
}

impl Ack {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            message: "Control connection established".into(),
            server_version: env!("CARGO_PKG_VERSION").into(),
            features: FEATURES.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// JSON-shaped control messages, discriminated by their `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
enum Envelope {
    #[serde(rename = "ACK")]
    Ack(Ack),
    #[serde(rename = "STATS")]
    Stats { data: StatsSummary },
}

/// Server -> client control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ack(Ack),
    Ping,
    TunnelRequest,
    Shutdown,
    Stats(StatsSummary),
    Other(String),
}

impl ServerMessage {
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim();
        match line {
            "" => Err(ProtocolError::Empty),
            PING => Ok(ServerMessage::Ping),
            TUNNEL_REQUEST => Ok(ServerMessage::TunnelRequest),
            SERVER_SHUTDOWN => Ok(ServerMessage::Shutdown),
            s if s.starts_with('{') => match serde_json::from_str::<Envelope>(s)? {
                Envelope::Ack(ack) => Ok(ServerMessage::Ack(ack)),
                Envelope::Stats { data } => Ok(ServerMessage::Stats(data)),
            },
            other => Ok(ServerMessage::Other(other.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        let s = match self {
            ServerMessage::Ack(ack) => serde_json::to_string(&Envelope::Ack(ack.clone()))?,
            ServerMessage::Stats(data) => {
                serde_json::to_string(&Envelope::Stats { data: data.clone() })?
            }
            ServerMessage::Ping => PING.into(),
            ServerMessage::TunnelRequest => TUNNEL_REQUEST.into(),
            ServerMessage::Shutdown => SERVER_SHUTDOWN.into(),
            ServerMessage::Other(s) => s.clone(),
        };
        Ok(s)
    }
}

/// Client -> server control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Pong,
    StatsRequest,
    Other(String),
}

impl ClientMessage {
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        match line.trim() {
            "" => Err(ProtocolError::Empty),
            PONG => Ok(ClientMessage::Pong),
            STATS_REQUEST => Ok(ClientMessage::StatsRequest),
            other => Ok(ClientMessage::Other(other.to_string())),
        }
    }

    pub fn encode(&self) -> &str {
        match self {
            ClientMessage::Pong => PONG,
            ClientMessage::StatsRequest => STATS_REQUEST,
            ClientMessage::Other(s) => s,
        }
    }
}

/// First (and only) message on a tunnel connection before it turns into raw bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRegistration {
    pub client_id: String,
    /// Unix milliseconds at which the client opened the tunnel.
    #[serde(default)]
    pub timestamp: u64,
}

pub async fn write_line<W: AsyncWrite + Unpin>(w: &mut W, line: &str) -> Result<(), ProtocolError> {
    let mut buf = Vec::with_capacity(line.len() + 1);
    buf.extend_from_slice(line.as_bytes());
    buf.push(b'\n');
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

pub async fn write_server_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &ServerMessage,
) -> Result<(), ProtocolError> {
    write_line(w, &msg.encode()?).await
}

pub async fn write_client_message<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: &ClientMessage,
) -> Result<(), ProtocolError> {
    write_line(w, msg.encode()).await
}

pub async fn write_tunnel_registration<W: AsyncWrite + Unpin>(
    w: &mut W,
    reg: &TunnelRegistration,
) -> Result<(), ProtocolError> {
    write_line(w, &serde_json::to_string(reg)?).await
}

/// Reads the registration line without buffering past the newline, so whatever the client
/// sends next stays in the stream for the forwarder.
pub async fn read_tunnel_registration<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<TunnelRegistration, ProtocolError> {
    let line = read_line_unbuffered(r, MAX_REGISTRATION_BYTES).await?;
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let mut reg: TunnelRegistration = serde_json::from_str(line)?;
    reg.client_id = reg.client_id.trim().to_string();
    if reg.client_id.is_empty() {
        return Err(ProtocolError::MissingClientId);
    }
    Ok(reg)
}

async fn read_line_unbuffered<R: AsyncRead + Unpin>(
    r: &mut R,
    max: usize,
) -> Result<String, ProtocolError> {
    let mut buf = Vec::with_capacity(128);
    loop {
        let b = match r.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(if buf.is_empty() {
                    ProtocolError::Empty
                } else {
                    ProtocolError::UnexpectedEof
                });
            }
            Err(e) => return Err(e.into()),
        };
        if b == b'\n' {
            break;
        }
        if buf.len() >= max {
            return Err(ProtocolError::LineTooLong(max));
        }
        buf.push(b);
    }
    String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use tokio_util::codec::FramedRead;

    #[test]
    fn server_vocabulary_decodes() {
        assert_eq!(ServerMessage::decode("PING\r").unwrap(), ServerMessage::Ping);
        assert_eq!(
            ServerMessage::decode(" TUNNEL_REQUEST ").unwrap(),
            ServerMessage::TunnelRequest
        );
        assert_eq!(
            ServerMessage::decode("SERVER_SHUTDOWN").unwrap(),
            ServerMessage::Shutdown
        );
        assert_eq!(
            ServerMessage::decode("hello").unwrap(),
            ServerMessage::Other("hello".into())
        );
        assert!(matches!(ServerMessage::decode("  "), Err(ProtocolError::Empty)));
        assert!(matches!(
            ServerMessage::decode("{\"type\":\"NOPE\"}"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn client_vocabulary_decodes() {
        assert_eq!(ClientMessage::decode("PONG").unwrap(), ClientMessage::Pong);
        assert_eq!(
            ClientMessage::decode("STATS_REQUEST\r").unwrap(),
            ClientMessage::StatsRequest
        );
        assert_eq!(
            ClientMessage::decode("what").unwrap(),
            ClientMessage::Other("what".into())
        );
    }

    #[test]
    fn ack_is_tagged_json() {
        let line = ServerMessage::Ack(Ack::new("client-7")).encode().unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "ACK");
        assert_eq!(v["client_id"], "client-7");
        assert_eq!(v["server_version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(v["features"].as_array().map(|a| a.len()), Some(FEATURES.len()));

        match ServerMessage::decode(&line).unwrap() {
            ServerMessage::Ack(ack) => assert_eq!(ack.client_id, "client-7"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ack_tolerates_missing_optional_fields() {
        let msg = ServerMessage::decode(r#"{"type":"ACK","client_id":"c"}"#).unwrap();
        match msg {
            ServerMessage::Ack(ack) => {
                assert_eq!(ack.client_id, "c");
                assert!(ack.features.is_empty());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn stats_reply_carries_summary() {
        let summary = crate::backhaul::telemetry::Statistics::new().summary();
        let line = ServerMessage::Stats(summary.clone()).encode().unwrap();
        assert!(line.contains("\"type\":\"STATS\""));
        assert_eq!(
            ServerMessage::decode(&line).unwrap(),
            ServerMessage::Stats(summary)
        );
    }

    #[tokio::test]
    async fn registration_read_leaves_payload_in_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let reg = TunnelRegistration {
            client_id: "client-1".into(),
            timestamp: 42,
        };
        write_tunnel_registration(&mut a, &reg).await.unwrap();
        a.write_all(b"payload").await.unwrap();
        drop(a);

        let got = read_tunnel_registration(&mut b).await.unwrap();
        assert_eq!(got, reg);

        let mut rest = String::new();
        b.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "payload");
    }

    #[tokio::test]
    async fn registration_rejects_oversized_line() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let junk = vec![b'x'; MAX_REGISTRATION_BYTES + 10];
            let _ = a.write_all(&junk).await;
        });
        let err = read_tunnel_registration(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::LineTooLong(MAX_REGISTRATION_BYTES)));
    }

    #[tokio::test]
    async fn registration_requires_client_id() {
        let (mut a, mut b) = tokio::io::duplex(256);
        write_line(&mut a, r#"{"client_id":"  ","timestamp":1}"#)
            .await
            .unwrap();
        let err = read_tunnel_registration(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::MissingClientId));
    }

    #[tokio::test]
    async fn registration_reports_truncated_line() {
        let (mut a, mut b) = tokio::io::duplex(256);
        a.write_all(br#"{"client_id":"#).await.unwrap();
        drop(a);
        let err = read_tunnel_registration(&mut b).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedEof));
    }

    #[tokio::test]
    async fn control_codec_caps_line_length() {
        let (mut a, b) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let junk = vec![b'y'; MAX_CONTROL_LINE_BYTES + 1];
            let _ = a.write_all(&junk).await;
            let _ = a.write_all(b"\n").await;
        });

        let mut lines = FramedRead::new(b, control_codec());
        let first = lines.next().await.unwrap();
        assert!(matches!(
            first.map_err(ProtocolError::from),
            Err(ProtocolError::LineTooLong(_))
        ));
    }

    #[tokio::test]
    async fn control_codec_splits_lines() {
        let (mut a, b) = tokio::io::duplex(256);
        write_client_message(&mut a, &ClientMessage::Pong).await.unwrap();
        write_client_message(&mut a, &ClientMessage::StatsRequest)
            .await
            .unwrap();
        drop(a);

        let mut lines = FramedRead::new(b, control_codec());
        let mut got = Vec::new();
        while let Some(line) = lines.next().await {
            got.push(ClientMessage::decode(&line.unwrap()).unwrap());
        }
        assert_eq!(got, vec![ClientMessage::Pong, ClientMessage::StatsRequest]);
    }
}
