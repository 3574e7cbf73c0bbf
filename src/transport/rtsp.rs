//! RTSP publisher (ANNOUNCE / SETUP / RECORD) with interleaved RTP over TCP

use crate::assets::{
    RTP_CLOCK_RATE, RTP_MAX_PAYLOAD, RTP_PAYLOAD_TYPE, RTSP_DEFAULT_PORT, RTSP_USER_AGENT,
};
use crate::pipeline::types::{MediaPacket, TimeBase};
use crate::transport::rtp::{RtpPacketizer, interleave};
use crate::transport::{StreamDescriptor, StreamTransport, TransportError};
use bytes::BytesMut;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::str::FromStr;
use std::thread::JoinHandle;
use webrtc::sdp::description::common::{Address, ConnectionInformation};
use webrtc::sdp::description::media::{MediaDescription, MediaName, RangedPort};
use webrtc::sdp::description::session::SessionDescription;

const RTP_CHANNEL: u8 = 0;
const TRACK_CONTROL: &str = "trackID=0";
const MAX_RESPONSE_BODY: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtspUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RtspUrl {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn track_url(&self) -> String {
        format!("{}/{}", self, TRACK_CONTROL)
    }
}

impl FromStr for RtspUrl {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidUrl(s.to_string());
        let rest = s.strip_prefix("rtsp://").ok_or_else(invalid)?;
        let (authority, path) = rest.split_once('/').ok_or_else(invalid)?;
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            return Err(invalid());
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
            None => (authority, RTSP_DEFAULT_PORT),
        };
        if host.is_empty() || port == 0 {
            return Err(invalid());
        }
        Ok(RtspUrl {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }
}

impl std::fmt::Display for RtspUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rtsp://{}:{}/{}", self.host, self.port, self.path)
    }
}

#[derive(Debug)]
pub struct RtspResponse {
    pub code: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RtspResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Session id without the `;timeout=` suffix.
    pub fn session(&self) -> Option<&str> {
        self.header("Session")
            .and_then(|value| value.split(';').next())
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

pub fn read_response<R: BufRead>(reader: &mut R) -> Result<RtspResponse, TransportError> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(TransportError::Malformed("connection closed".into()));
    }
    let mut parts = line.trim_end().splitn(3, ' ');
    let (Some(version), Some(code)) = (parts.next(), parts.next()) else {
        return Err(TransportError::Malformed(line.trim_end().to_string()));
    };
    if !version.starts_with("RTSP/") {
        return Err(TransportError::Malformed(line.trim_end().to_string()));
    }
    let code = code
        .parse::<u16>()
        .map_err(|_| TransportError::Malformed(line.trim_end().to_string()))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(TransportError::Malformed("truncated headers".into()));
        }
        let header = line.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((k, v)) = header.split_once(':') {
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }
    }

    let mut response = RtspResponse {
        code,
        reason,
        headers,
        body: Vec::new(),
    };
    let length = response
        .header("Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    if length > MAX_RESPONSE_BODY {
        return Err(TransportError::Malformed(format!(
            "{} byte body exceeds {}",
            length, MAX_RESPONSE_BODY
        )));
    }
    if length > 0 {
        response.body.resize(length, 0);
        reader.read_exact(&mut response.body)?;
    }
    Ok(response)
}

fn request(
    method: &str,
    url: &str,
    cseq: u32,
    session: Option<&str>,
    headers: &[(&str, &str)],
    body: &[u8],
) -> Vec<u8> {
    let mut out = format!(
        "{} {} RTSP/1.0\r\nCSeq: {}\r\nUser-Agent: {}\r\n",
        method, url, cseq, RTSP_USER_AGENT
    );
    if let Some(session) = session {
        out.push_str(&format!("Session: {}\r\n", session));
    }
    for (k, v) in headers {
        out.push_str(&format!("{}: {}\r\n", k, v));
    }
    if !body.is_empty() {
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    }
    out.push_str("\r\n");
    let mut out = out.into_bytes();
    out.extend_from_slice(body);
    out
}

/// Session description for one H.264 video track.
pub fn sdp(url: &RtspUrl) -> String {
    let mut description = SessionDescription::new_jsep_session_description(false);
    description.session_name = url.path.clone();

    let media = MediaDescription {
        media_name: MediaName {
            media: "video".to_string(),
            port: RangedPort {
                value: 0,
                range: None,
            },
            protos: vec!["RTP".to_string(), "AVP".to_string()],
            formats: Vec::new(),
        },
        connection_information: Some(ConnectionInformation {
            network_type: "IN".to_string(),
            address_type: "IP4".to_string(),
            address: Some(Address {
                address: "0.0.0.0".to_string(),
                ttl: None,
                range: None,
            }),
        }),
        ..Default::default()
    }
    .with_codec(
        RTP_PAYLOAD_TYPE,
        "H264".to_string(),
        RTP_CLOCK_RATE as u32,
        0,
        "packetization-mode=1".to_string(),
    )
    .with_value_attribute("control".to_string(), TRACK_CONTROL.to_string());

    description.with_media(media).marshal()
}

struct Connection {
    writer: TcpStream,
    reader: Option<BufReader<TcpStream>>,
    drain: Option<JoinHandle<u64>>,
}

/// Pushes one H.264 stream to an RTSP server in record mode.
pub struct RtspPublisher {
    url: RtspUrl,
    conn: Option<Connection>,
    cseq: u32,
    session: Option<String>,
    packetizer: RtpPacketizer,
    rtp_offset: u32,
    last_dts: Option<i64>,
    recording: bool,
    buffer: BytesMut,
}

impl RtspPublisher {
    /// Allocates a publisher for `url`. Nothing is connected yet.
    pub fn new(url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            url: url.parse()?,
            conn: None,
            cseq: 0,
            session: None,
            packetizer: RtpPacketizer::random(RTP_PAYLOAD_TYPE, RTP_MAX_PAYLOAD),
            rtp_offset: rand::random(),
            last_dts: None,
            recording: false,
            buffer: BytesMut::with_capacity(64 * 1024),
        })
    }

    fn exchange(
        &mut self,
        method: &'static str,
        url: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) -> Result<RtspResponse, TransportError> {
        self.cseq += 1;
        let message = request(method, url, self.cseq, self.session.as_deref(), headers, body);
        let conn = self.conn.as_mut().ok_or(TransportError::NotRecording)?;
        conn.writer.write_all(&message)?;
        let reader = conn.reader.as_mut().ok_or(TransportError::NotRecording)?;
        let response = read_response(reader)?;
        log::debug!("Stream: {} -> {} {}", method, response.code, response.reason);
        if !response.is_success() {
            return Err(TransportError::Status {
                method,
                code: response.code,
                reason: response.reason,
            });
        }
        Ok(response)
    }

    /// Discards whatever the server sends once recording, RTCP receiver
    /// reports mostly.
    fn spawn_drain(reader: BufReader<TcpStream>) -> std::io::Result<JoinHandle<u64>> {
        std::thread::Builder::new()
            .name("rtsp-drain".into())
            .spawn(move || {
                let mut reader = reader;
                let mut scratch = [0u8; 4096];
                let mut total = 0u64;
                loop {
                    match reader.read(&mut scratch) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => total += n as u64,
                    }
                }
                log::debug!("Stream: drain thread done, {} bytes discarded", total);
                total
            })
    }
}

impl StreamTransport for RtspPublisher {
    fn descriptor(&self) -> StreamDescriptor {
        StreamDescriptor {
            index: 0,
            time_base: TimeBase::new(1, RTP_CLOCK_RATE),
        }
    }

    fn open_io(&mut self) -> Result<(), TransportError> {
        let addr = self.url.authority();
        let writer = TcpStream::connect((self.url.host.as_str(), self.url.port))
            .map_err(|source| TransportError::Connect {
                addr: addr.clone(),
                source,
            })?;
        writer.set_nodelay(true)?;
        let reader = BufReader::new(writer.try_clone()?);
        log::info!("Stream: connected to {}", addr);
        self.conn = Some(Connection {
            writer,
            reader: Some(reader),
            drain: None,
        });
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), TransportError> {
        let url = self.url.to_string();
        let description = sdp(&self.url);
        self.exchange(
            "ANNOUNCE",
            &url,
            &[("Content-Type", "application/sdp")],
            description.as_bytes(),
        )?;

        let track = self.url.track_url();
        let response = self.exchange(
            "SETUP",
            &track,
            &[(
                "Transport",
                "RTP/AVP/TCP;unicast;interleaved=0-1;mode=record",
            )],
            &[],
        )?;
        let session = response
            .session()
            .ok_or_else(|| TransportError::Malformed("SETUP without Session".into()))?
            .to_string();
        self.session = Some(session);

        self.exchange("RECORD", &url, &[("Range", "npt=0.000-")], &[])?;

        if let Some(conn) = self.conn.as_mut()
            && let Some(reader) = conn.reader.take()
        {
            conn.drain = Some(Self::spawn_drain(reader)?);
        }
        self.recording = true;
        log::info!("Stream: recording to {}", url);
        Ok(())
    }

    fn write_packet(&mut self, packet: &MediaPacket) -> Result<(), TransportError> {
        if !self.recording {
            return Err(TransportError::NotRecording);
        }
        if let Some(last) = self.last_dts
            && packet.dts < last
        {
            return Err(TransportError::NonMonotonic {
                stream: packet.stream_index,
                last,
                dts: packet.dts,
            });
        }
        self.last_dts = Some(packet.dts);

        let timestamp = (packet.pts as u32).wrapping_add(self.rtp_offset);
        self.buffer.clear();
        for rtp in self.packetizer.packetize(&packet.data, timestamp)? {
            interleave(RTP_CHANNEL, &rtp, &mut self.buffer);
        }
        let conn = self.conn.as_mut().ok_or(TransportError::NotRecording)?;
        conn.writer.write_all(&self.buffer)?;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), TransportError> {
        if !self.recording {
            return Ok(());
        }
        self.recording = false;
        self.cseq += 1;
        let message = request(
            "TEARDOWN",
            &self.url.to_string(),
            self.cseq,
            self.session.as_deref(),
            &[],
            &[],
        );
        let conn = self.conn.as_mut().ok_or(TransportError::NotRecording)?;
        conn.writer.write_all(&message)?;
        conn.writer.flush()?;
        log::info!("Stream: teardown sent");
        Ok(())
    }

    fn close(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        self.recording = false;
        let _ = conn.writer.shutdown(Shutdown::Both);
        if let Some(drain) = conn.drain.take() {
            let _ = drain.join();
        }
        log::info!("Stream: closed {}", self.url.authority());
    }
}

impl Drop for RtspPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::io::Cursor;
    use std::net::TcpListener;
    use std::sync::mpsc;

    #[test]
    fn test_url_parsing() {
        let url: RtspUrl = "rtsp://localhost:8554/camera1".parse().unwrap();
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 8554);
        assert_eq!(url.path, "camera1");
        assert_eq!(url.track_url(), "rtsp://localhost:8554/camera1/trackID=0");

        let url: RtspUrl = "rtsp://relay.lan/cams/porch".parse().unwrap();
        assert_eq!(url.port, RTSP_DEFAULT_PORT);
        assert_eq!(url.path, "cams/porch");

        for bad in ["http://host/x", "rtsp://host", "rtsp://host:99999/x", "rtsp://:8554/x", "rtsp://h/"] {
            assert!(bad.parse::<RtspUrl>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_read_response() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 2\r\nsession: 4bF3a9;timeout=60\r\nContent-Length: 4\r\n\r\nbodyRTSP/1.0";
        let mut reader = Cursor::new(raw.as_bytes());
        let response = read_response(&mut reader).unwrap();
        assert!(response.is_success());
        assert_eq!(response.header("cseq"), Some("2"));
        assert_eq!(response.session(), Some("4bF3a9"));
        assert_eq!(response.body, b"body");
    }

    #[test]
    fn test_read_response_rejects_garbage() {
        let mut reader = Cursor::new(&b"HTTP/1.1 200 OK\r\n\r\n"[..]);
        assert!(matches!(read_response(&mut reader), Err(TransportError::Malformed(_))));

        let mut reader = Cursor::new(&b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n"[..]);
        assert!(matches!(read_response(&mut reader), Err(TransportError::Malformed(_))));
    }

    #[test]
    fn test_read_response_bounds_body() {
        let raw = "RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 1048576\r\n\r\nx";
        let mut reader = Cursor::new(raw.as_bytes());
        assert!(matches!(read_response(&mut reader), Err(TransportError::Malformed(_))));

        let raw = format!("RTSP/1.0 200 OK\r\nContent-Length: 65536\r\n\r\n{}", "a".repeat(65536));
        let mut reader = Cursor::new(raw.as_bytes());
        assert_eq!(read_response(&mut reader).unwrap().body.len(), 65536);
    }

    #[test]
    fn test_sdp_describes_h264_track() {
        let url: RtspUrl = "rtsp://localhost:8554/camera1".parse().unwrap();
        let sdp = sdp(&url);
        assert!(sdp.starts_with("v=0\r\n"));
        assert!(sdp.contains("s=camera1\r\n"));
        assert!(sdp.contains("m=video 0 RTP/AVP 96\r\n"));
        assert!(sdp.contains("c=IN IP4 0.0.0.0\r\n"));
        assert!(sdp.contains("a=rtpmap:96 H264/90000\r\n"));
        assert!(sdp.contains("a=fmtp:96 packetization-mode=1\r\n"));
        assert!(sdp.contains("a=control:trackID=0\r\n"));

        let parsed = SessionDescription::unmarshal(&mut Cursor::new(sdp.as_bytes())).unwrap();
        assert_eq!(parsed.media_descriptions.len(), 1);
        assert_eq!(parsed.media_descriptions[0].media_name.formats, ["96"]);
    }

    #[test]
    fn test_request_format() {
        let message = request("SETUP", "rtsp://h:1/p", 3, Some("abc"), &[("Transport", "x")], &[]);
        let text = String::from_utf8(message).unwrap();
        assert!(text.starts_with("SETUP rtsp://h:1/p RTSP/1.0\r\nCSeq: 3\r\n"));
        assert!(text.contains("Session: abc\r\n"));
        assert!(text.ends_with("Transport: x\r\n\r\n"));
    }

    #[test]
    fn test_connection_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut publisher = RtspPublisher::new(&format!("rtsp://127.0.0.1:{port}/cam")).unwrap();
        assert!(matches!(publisher.open_io(), Err(TransportError::Connect { .. })));
    }

    /// Reads one request, returning its method and CSeq.
    fn read_request(reader: &mut BufReader<TcpStream>) -> (String, String) {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let method = line.split(' ').next().unwrap().to_string();
        let mut cseq = String::new();
        let mut length = 0;
        loop {
            line.clear();
            reader.read_line(&mut line).unwrap();
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            let (k, v) = header.split_once(':').unwrap();
            match k {
                "CSeq" => cseq = v.trim().to_string(),
                "Content-Length" => length = v.trim().parse().unwrap(),
                _ => {}
            }
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).unwrap();
        (method, cseq)
    }

    #[test]
    fn test_publish_to_relay() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::channel();

        let relay = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            let mut reader = BufReader::new(stream);
            for expected in ["ANNOUNCE", "SETUP", "RECORD"] {
                let (method, cseq) = read_request(&mut reader);
                tx.send(method.clone()).unwrap();
                assert_eq!(method, expected);
                let session = if method == "SETUP" { "Session: 77;timeout=60\r\n" } else { "" };
                write!(writer, "RTSP/1.0 200 OK\r\nCSeq: {cseq}\r\n{session}\r\n").unwrap();
            }
            let mut header = [0u8; 4];
            reader.read_exact(&mut header).unwrap();
            let mut rtp = vec![0u8; u16::from_be_bytes([header[2], header[3]]) as usize];
            reader.read_exact(&mut rtp).unwrap();
            tx.send(format!("{}{}:{}", header[0] as char, header[1], rtp.len())).unwrap();

            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest);
            String::from_utf8_lossy(&rest).contains("TEARDOWN")
        });

        let mut publisher = RtspPublisher::new(&format!("rtsp://127.0.0.1:{port}/cam")).unwrap();
        publisher.open_io().unwrap();
        publisher.write_header().unwrap();

        let packet = MediaPacket {
            data: Bytes::from_static(&[0, 0, 0, 1, 0x65, 1, 2, 3]),
            pts: 3000,
            dts: 3000,
            time_base: TimeBase::new(1, 90_000),
            stream_index: 0,
            is_keyframe: true,
        };
        publisher.write_packet(&packet).unwrap();

        let backwards = MediaPacket { dts: 0, ..packet };
        assert!(matches!(
            publisher.write_packet(&backwards),
            Err(TransportError::NonMonotonic { last: 3000, dts: 0, .. })
        ));

        publisher.write_trailer().unwrap();
        publisher.close();

        let seen: Vec<String> = rx.iter().collect();
        assert_eq!(seen, ["ANNOUNCE", "SETUP", "RECORD", "$0:16"]);
        assert!(relay.join().unwrap());
    }
}
