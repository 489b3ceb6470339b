//! Wire framing for the tunnel protocol.
//!
//! A frame is whatever the transport delivered as one message: `pack`/`unpack`
//! never buffer partial state, they only pack and parse the bytes they're
//! given. Byte order is big-endian throughout.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = 0x01;
pub const CONN_ID_LEN: usize = 20;

pub type ConnId = [u8; CONN_ID_LEN];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame too short: need at least {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },
    #[error("unsupported protocol version {0:#04x}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl Network {
    fn to_tag(self) -> u8 {
        match self {
            Network::Tcp => 1,
            Network::Udp => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self, ProtocolError> {
        match tag {
            1 => Ok(Network::Tcp),
            2 => Ok(Network::Udp),
            _ => Err(ProtocolError::Malformed("unknown network tag")),
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Connect = 0x01,
    ConnectResponse = 0x02,
    Data = 0x03,
    Close = 0x04,
    Ping = 0x05,
    PortForwardRequest = 0x06,
    PortForwardResponse = 0x07,
    Error = 0x08,
}

impl MessageType {
    fn from_u8(b: u8) -> Result<Self, ProtocolError> {
        Ok(match b {
            0x01 => MessageType::Connect,
            0x02 => MessageType::ConnectResponse,
            0x03 => MessageType::Data,
            0x04 => MessageType::Close,
            0x05 => MessageType::Ping,
            0x06 => MessageType::PortForwardRequest,
            0x07 => MessageType::PortForwardResponse,
            0x08 => MessageType::Error,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardEntry {
    pub remote_port: u16,
    pub local_port: u16,
    pub host: String,
    pub proto: Network,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub remote_port: u16,
    pub proto: Network,
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect {
        conn_id: ConnId,
        network: Network,
        address: String,
    },
    ConnectResponse {
        conn_id: ConnId,
        ok: bool,
        error: String,
    },
    Data {
        conn_id: ConnId,
        payload: Bytes,
    },
    Close {
        conn_id: ConnId,
    },
    Ping,
    PortForwardRequest {
        client_id: String,
        entries: Vec<PortForwardEntry>,
    },
    PortForwardResponse {
        ok: bool,
        error: String,
        statuses: Vec<PortStatus>,
    },
    Error {
        message: String,
    },
}

impl Frame {
    pub fn message_type(&self) -> MessageType {
        match self {
            Frame::Connect { .. } => MessageType::Connect,
            Frame::ConnectResponse { .. } => MessageType::ConnectResponse,
            Frame::Data { .. } => MessageType::Data,
            Frame::Close { .. } => MessageType::Close,
            Frame::Ping => MessageType::Ping,
            Frame::PortForwardRequest { .. } => MessageType::PortForwardRequest,
            Frame::PortForwardResponse { .. } => MessageType::PortForwardResponse,
            Frame::Error { .. } => MessageType::Error,
        }
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        match self {
            Frame::Connect { conn_id, .. }
            | Frame::ConnectResponse { conn_id, .. }
            | Frame::Data { conn_id, .. }
            | Frame::Close { conn_id } => Some(*conn_id),
            _ => None,
        }
    }

    /// Encode this frame as `version ∥ type ∥ payload`.
    pub fn encode(&self) -> Bytes {
        let mut payload = BytesMut::new();
        match self {
            Frame::Connect {
                conn_id,
                network,
                address,
            } => {
                payload.put_slice(conn_id);
                payload.put_u8(network.to_tag());
                put_len_prefixed(&mut payload, address.as_bytes());
            }
            Frame::ConnectResponse {
                conn_id,
                ok,
                error,
            } => {
                payload.put_slice(conn_id);
                payload.put_u8(if *ok { 0x01 } else { 0x00 });
                put_len_prefixed(&mut payload, error.as_bytes());
            }
            Frame::Data { conn_id, payload: p } => {
                payload.put_slice(conn_id);
                payload.put_slice(p);
            }
            Frame::Close { conn_id } => {
                payload.put_slice(conn_id);
            }
            Frame::Ping => {}
            Frame::PortForwardRequest { client_id, entries } => {
                put_len_prefixed(&mut payload, client_id.as_bytes());
                for e in entries {
                    payload.put_u16(e.remote_port);
                    payload.put_u16(e.local_port);
                    put_len_prefixed(&mut payload, e.host.as_bytes());
                    payload.put_u8(e.proto.to_tag());
                }
            }
            Frame::PortForwardResponse {
                ok,
                error,
                statuses,
            } => {
                payload.put_u8(if *ok { 0x01 } else { 0x00 });
                put_len_prefixed(&mut payload, error.as_bytes());
                payload.put_u16(statuses.len() as u16);
                for s in statuses {
                    payload.put_u16(s.remote_port);
                    payload.put_u8(s.proto.to_tag());
                    payload.put_u8(if s.ok { 0x01 } else { 0x00 });
                    put_len_prefixed(&mut payload, s.error.as_bytes());
                }
            }
            Frame::Error { message } => {
                put_len_prefixed(&mut payload, message.as_bytes());
            }
        }

        let mut out = BytesMut::with_capacity(2 + payload.len());
        out.put_u8(PROTOCOL_VERSION);
        out.put_u8(self.message_type() as u8);
        out.put_slice(&payload);
        out.freeze()
    }

    /// Decode a full frame (as delivered by the transport as one message).
    pub fn decode(mut buf: &[u8]) -> Result<Frame, ProtocolError> {
        if buf.len() < 2 {
            return Err(ProtocolError::TooShort {
                need: 2,
                got: buf.len(),
            });
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let msg_type = MessageType::from_u8(buf.get_u8())?;

        match msg_type {
            MessageType::Connect => {
                let conn_id = get_conn_id(&mut buf)?;
                let network = Network::from_tag(get_u8(&mut buf)?)?;
                let address = get_len_prefixed_string(&mut buf)?;
                Ok(Frame::Connect {
                    conn_id,
                    network,
                    address,
                })
            }
            MessageType::ConnectResponse => {
                let conn_id = get_conn_id(&mut buf)?;
                let ok = get_u8(&mut buf)? == 0x01;
                let error = get_len_prefixed_string(&mut buf)?;
                Ok(Frame::ConnectResponse {
                    conn_id,
                    ok,
                    error,
                })
            }
            MessageType::Data => {
                let conn_id = get_conn_id(&mut buf)?;
                Ok(Frame::Data {
                    conn_id,
                    payload: Bytes::copy_from_slice(buf),
                })
            }
            MessageType::Close => {
                let conn_id = get_conn_id(&mut buf)?;
                Ok(Frame::Close { conn_id })
            }
            MessageType::Ping => Ok(Frame::Ping),
            MessageType::PortForwardRequest => {
                let client_id = get_len_prefixed_string(&mut buf)?;
                let mut entries = Vec::new();
                while !buf.is_empty() {
                    if buf.len() < 6 {
                        return Err(ProtocolError::Malformed("truncated port forward entry"));
                    }
                    let remote_port = get_u16(&mut buf)?;
                    let local_port = get_u16(&mut buf)?;
                    let host = get_len_prefixed_string(&mut buf)?;
                    let proto = Network::from_tag(get_u8(&mut buf)?)?;
                    entries.push(PortForwardEntry {
                        remote_port,
                        local_port,
                        host,
                        proto,
                    });
                }
                Ok(Frame::PortForwardRequest { client_id, entries })
            }
            MessageType::PortForwardResponse => {
                let ok = get_u8(&mut buf)? == 0x01;
                let error = get_len_prefixed_string(&mut buf)?;
                let count = get_u16(&mut buf)?;
                let mut statuses = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let remote_port = get_u16(&mut buf)?;
                    let proto = Network::from_tag(get_u8(&mut buf)?)?;
                    let ok = get_u8(&mut buf)? == 0x01;
                    let error = get_len_prefixed_string(&mut buf)?;
                    statuses.push(PortStatus {
                        remote_port,
                        proto,
                        ok,
                        error,
                    });
                }
                Ok(Frame::PortForwardResponse {
                    ok,
                    error,
                    statuses,
                })
            }
            MessageType::Error => {
                let message = get_len_prefixed_string(&mut buf)?;
                Ok(Frame::Error { message })
            }
        }
    }
}

fn put_len_prefixed(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u16(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::Malformed("expected one more byte"));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, ProtocolError> {
    if buf.len() < 2 {
        return Err(ProtocolError::Malformed("expected a u16"));
    }
    Ok(buf.get_u16())
}

fn get_conn_id(buf: &mut &[u8]) -> Result<ConnId, ProtocolError> {
    if buf.len() < CONN_ID_LEN {
        return Err(ProtocolError::Malformed("expected a conn_id"));
    }
    let mut id = [0u8; CONN_ID_LEN];
    id.copy_from_slice(&buf[..CONN_ID_LEN]);
    buf.advance(CONN_ID_LEN);
    Ok(id)
}

fn get_len_prefixed_string(buf: &mut &[u8]) -> Result<String, ProtocolError> {
    let len = get_u16(buf)? as usize;
    if buf.len() < len {
        return Err(ProtocolError::Malformed("truncated length-prefixed field"));
    }
    let s = String::from_utf8(buf[..len].to_vec())
        .map_err(|_| ProtocolError::Malformed("field is not valid utf-8"))?;
    buf.advance(len);
    Ok(s)
}

/// `connId` is truncated to 20 bytes on the wire, matching the legacy
/// behaviour this protocol is compatible with; callers that pass a longer
/// seed (e.g. `client_id + random suffix`) rely on this truncation.
pub fn truncate_conn_id(seed: &[u8]) -> ConnId {
    let mut id = [0u8; CONN_ID_LEN];
    let n = seed.len().min(CONN_ID_LEN);
    id[..n].copy_from_slice(&seed[..n]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_conn_id(b: u8) -> ConnId {
        [b; CONN_ID_LEN]
    }

    #[test]
    fn connect_round_trips() {
        let frame = Frame::Connect {
            conn_id: sample_conn_id(1),
            network: Network::Tcp,
            address: "example.com:80".into(),
        };
        let encoded = frame.encode();
        let decoded = Frame::decode(&encoded).unwrap();
        assert_eq!(frame, decoded);
    }

    #[test]
    fn data_round_trips_with_arbitrary_payload() {
        let frame = Frame::Data {
            conn_id: sample_conn_id(2),
            payload: Bytes::from_static(b"GET / HTTP/1.0\r\n\r\n"),
        };
        let encoded = frame.encode();
        assert_eq!(Frame::decode(&encoded).unwrap(), frame);
    }

    #[test]
    fn close_round_trips() {
        let frame = Frame::Close {
            conn_id: sample_conn_id(3),
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn ping_round_trips_to_empty_payload() {
        let encoded = Frame::Ping.encode();
        assert_eq!(encoded.as_ref(), &[PROTOCOL_VERSION, MessageType::Ping as u8]);
        assert_eq!(Frame::decode(&encoded).unwrap(), Frame::Ping);
    }

    #[test]
    fn port_forward_request_round_trips_with_multiple_entries() {
        let frame = Frame::PortForwardRequest {
            client_id: "agent-1".into(),
            entries: vec![
                PortForwardEntry {
                    remote_port: 18100,
                    local_port: 18100,
                    host: "127.0.0.1".into(),
                    proto: Network::Tcp,
                },
                PortForwardEntry {
                    remote_port: 18100,
                    local_port: 18100,
                    host: "127.0.0.1".into(),
                    proto: Network::Udp,
                },
            ],
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn port_forward_response_round_trips() {
        let frame = Frame::PortForwardResponse {
            ok: false,
            error: "".into(),
            statuses: vec![PortStatus {
                remote_port: 18100,
                proto: Network::Tcp,
                ok: false,
                error: "port conflict".into(),
            }],
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn error_round_trips() {
        let frame = Frame::Error {
            message: "credential mismatch".into(),
        };
        assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
    }

    #[test]
    fn decode_rejects_short_frame() {
        assert_eq!(
            Frame::decode(&[PROTOCOL_VERSION]),
            Err(ProtocolError::TooShort { need: 2, got: 1 })
        );
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        assert_eq!(
            Frame::decode(&[0xff, MessageType::Ping as u8]),
            Err(ProtocolError::UnsupportedVersion(0xff))
        );
    }

    #[test]
    fn decode_rejects_unknown_message_type() {
        assert_eq!(
            Frame::decode(&[PROTOCOL_VERSION, 0xee]),
            Err(ProtocolError::UnknownMessageType(0xee))
        );
    }

    #[test]
    fn truncate_conn_id_truncates_long_seeds() {
        let seed = b"client-123-r0-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let id = truncate_conn_id(seed);
        assert_eq!(id.len(), CONN_ID_LEN);
        assert_eq!(&id[..], &seed[..CONN_ID_LEN]);
    }
}
