use std::{net::SocketAddr, time::Duration};

use eyre::{bail, eyre};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::Instant,
};

/// Upper bound on a status payload; anything bigger is a server messing
/// with us, not a ping response.
const MAX_STATUS_BYTES: usize = 1024 * 1024;

pub struct StatusPing {
    pub status: serde_json::Value,
    pub latency_ms: u64,
}

/// One full Server List Ping exchange: connect, handshake into the status
/// state, request, read the JSON status response. The whole exchange shares
/// a single deadline.
pub async fn ping(
    addr: SocketAddr,
    protocol_version: i32,
    timeout: Duration,
) -> eyre::Result<StatusPing> {
    tokio::time::timeout(timeout, async {
        let mut stream = TcpStream::connect(addr).await?;
        let request = build_status_request(&addr.ip().to_string(), addr.port(), protocol_version);

        let started = Instant::now();
        stream.write_all(&request).await?;
        let raw = read_status_response(&mut stream).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = serde_json::from_str(&raw)?;
        Ok(StatusPing { status, latency_ms })
    })
    .await
    .map_err(|_| eyre!("timed out pinging {addr}"))?
}

/// https://github.com/kiwiyou/craftping/blob/master/src/lib.rs#L73
pub fn build_status_request(hostname: &str, port: u16, protocol_version: i32) -> Vec<u8> {
    // buffer for the 1st packet's data part
    let mut buffer = vec![
        // 0 for handshake packet
        0x00,
    ];

    write_varint(&mut buffer, protocol_version); // protocol version

    // Some server implementations require hostname and port to be properly set
    write_varint(&mut buffer, hostname.len() as i32); // length of hostname as VarInt
    buffer.extend_from_slice(hostname.as_bytes());
    buffer.extend_from_slice(&[
        (port >> 8) as u8,
        (port & 0b1111_1111) as u8, // server port as unsigned short
        0x01,                       // next state: 1 (status) as VarInt
    ]);
    // buffer for the 1st and 2nd packet
    let mut full_buffer = vec![];
    write_varint(&mut full_buffer, buffer.len() as i32); // length of 1st packet id + data as VarInt
    full_buffer.append(&mut buffer);
    full_buffer.extend_from_slice(&[
        1,    // length of 2nd packet id + data as VarInt
        0x00, // 2nd packet id: 0 for request as VarInt
    ]);

    full_buffer
}

/// Read the status response frame and return its JSON payload. Validates
/// packet id 0x00 and that the payload looks like JSON.
pub async fn read_status_response<R: AsyncRead + Unpin>(reader: &mut R) -> eyre::Result<String> {
    // ignore the packet length; the payload length is what matters
    read_varint(reader).await?;
    let packet_id = read_varint(reader).await?;
    let response_length = read_varint(reader).await?;
    if packet_id != 0x00 || response_length < 0 {
        bail!("invalid status packet (id {packet_id}, length {response_length})");
    }
    if response_length as usize > MAX_STATUS_BYTES {
        bail!("status response too large ({response_length} bytes)");
    }

    let mut payload = vec![0u8; response_length as usize];
    reader.read_exact(&mut payload).await?;

    let status = String::from_utf8_lossy(&payload).to_string();
    if !status.starts_with('{') {
        bail!("status response is not json");
    }
    Ok(status)
}

pub fn write_varint(writer: &mut Vec<u8>, mut value: i32) {
    if value == 0 {
        writer.push(0);
    }
    while value != 0 {
        let mut byte = (value & 0b0111_1111) as u8;
        value = (value >> 7) & (i32::MAX >> 6);
        if value != 0 {
            byte |= 0b1000_0000;
        }
        writer.push(byte);
    }
}

pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> eyre::Result<i32> {
    let mut value = 0;
    for i in 0..5 {
        let byte = reader.read_u8().await?;
        value |= ((byte & 0b0111_1111) as i32) << (7 * i);
        if byte & 0b1000_0000 == 0 {
            return Ok(value);
        }
    }
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;

    async fn roundtrip(value: i32) -> i32 {
        let mut buffer = Vec::new();
        write_varint(&mut buffer, value);
        read_varint(&mut buffer.as_slice()).await.unwrap()
    }

    #[tokio::test]
    async fn test_varint_roundtrip() {
        for value in [0, 1, 2, 127, 128, 255, 25565, 2097151, i32::MAX] {
            assert_eq!(roundtrip(value).await, value);
        }
    }

    #[test]
    fn test_varint_single_byte_encoding() {
        let mut buffer = Vec::new();
        write_varint(&mut buffer, 0);
        assert_eq!(buffer, vec![0]);

        let mut buffer = Vec::new();
        write_varint(&mut buffer, 127);
        assert_eq!(buffer, vec![127]);

        let mut buffer = Vec::new();
        write_varint(&mut buffer, 128);
        assert_eq!(buffer, vec![0b1000_0000, 1]);
    }

    #[test]
    fn test_status_request_shape() {
        let request = build_status_request("192.0.2.1", 25565, 767);

        // trailing status-request packet: length 1, packet id 0
        assert_eq!(&request[request.len() - 2..], &[1, 0x00]);
        // hostname travels verbatim
        let hostname = b"192.0.2.1";
        assert!(
            request
                .windows(hostname.len())
                .any(|window| window == hostname)
        );
        // port as big-endian unsigned short just before the next-state byte
        let port_bytes = [(25565u16 >> 8) as u8, (25565u16 & 0xff) as u8];
        assert_eq!(&request[request.len() - 5..request.len() - 3], &port_bytes);
    }

    fn frame(packet_id: i32, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        write_varint(&mut body, packet_id);
        write_varint(&mut body, payload.len() as i32);
        body.extend_from_slice(payload);

        let mut framed = Vec::new();
        write_varint(&mut framed, body.len() as i32);
        framed.extend_from_slice(&body);
        framed
    }

    #[tokio::test]
    async fn test_read_status_response() {
        let payload = br#"{"version":{"name":"1.21","protocol":767}}"#;
        let framed = frame(0x00, payload);

        let status = read_status_response(&mut framed.as_slice()).await.unwrap();
        assert_eq!(status.as_bytes(), payload);
    }

    #[tokio::test]
    async fn test_read_status_response_rejects_wrong_packet_id() {
        let framed = frame(0x01, br#"{"a":1}"#);
        assert!(read_status_response(&mut framed.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn test_read_status_response_rejects_non_json() {
        let framed = frame(0x00, b"nope");
        assert!(read_status_response(&mut framed.as_slice()).await.is_err());
    }

    #[tokio::test]
    async fn test_read_status_response_rejects_truncated_payload() {
        let mut framed = frame(0x00, br#"{"a":1}"#);
        framed.truncate(framed.len() - 3);
        assert!(read_status_response(&mut framed.as_slice()).await.is_err());
    }
}
