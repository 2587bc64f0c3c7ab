use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::TcpStream,
    time::Duration,
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_slice, decode_from_std_read, encode_into_std_write, encode_to_vec,
};
use log::trace;
use thiserror::Error;

use super::{Request, Response};

/// Shortest wait of [`PacketReader::poll`].
const READY_CHECK: Duration = Duration::from_millis(1);
/// Largest single chunk written in chunked framing.
const MAX_CHUNK_SIZE: usize = 1 << 20;
/// Largest packet accepted in either framing, and the decoding limit of block payloads.
pub const MAX_PACKET_SIZE: usize = 1 << 30;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode packet: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode packet: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown chunked framing capability '{0}'")]
    UnknownFraming(String),
    #[error("incompatible chunked framing: server requires '{server}', client requires '{client}'")]
    FramingMismatch { server: String, client: String },
    #[error("packet of {0} bytes exceeds the framing limit")]
    PacketTooLarge(usize),
}

impl TransportError {
    fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io(e) => Some(e.kind()),
            TransportError::Deserialize(bincode::error::DecodeError::Io { inner, .. }) => {
                Some(inner.kind())
            }
            TransportError::Serialize(bincode::error::EncodeError::Io { inner, .. }) => {
                Some(inner.kind())
            }
            _ => None,
        }
    }

    /// The peer went away.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            )
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.io_kind(),
            Some(io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
        )
    }

    /// The bytes on the wire could not be interpreted as a packet, so the stream can no
    /// longer be trusted to be aligned on a packet boundary.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            TransportError::Deserialize(e) if !matches!(e, bincode::error::DecodeError::Io { .. })
        ) || matches!(self, TransportError::PacketTooLarge(_))
    }
}

/// Bincode configuration shared by packets and block payloads.
pub fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// [`wire_config`] for decoding untrusted input: no length claimed by the input may
/// make the decoder read or allocate more than [`MAX_PACKET_SIZE`] bytes.
pub fn limited_wire_config() -> Configuration<BigEndian, Fixint, Limit<MAX_PACKET_SIZE>> {
    wire_config().with_limit::<MAX_PACKET_SIZE>()
}

/// Framing of packets in one direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    #[default]
    Plain,
    /// Each packet is split in `u32` little-endian length-prefixed chunks, followed by
    /// a zero-length chunk.
    Chunked,
}

impl Framing {
    /// Parses a capability label into `(chunked, optional)`.
    fn capability(label: &str) -> Result<(bool, bool), TransportError> {
        match label {
            "chunked" => Ok((true, false)),
            "notchunked" => Ok((false, false)),
            "chunked_optional" => Ok((true, true)),
            "notchunked_optional" => Ok((false, true)),
            other => Err(TransportError::UnknownFraming(other.to_string())),
        }
    }

    /// Agrees on a framing for one direction. A mandatory capability wins over an
    /// optional one; two different mandatory capabilities cannot be reconciled.
    pub fn negotiate(server: &str, client: &str) -> Result<Framing, TransportError> {
        let (srv_chunked, srv_optional) = Self::capability(server)?;
        let (cl_chunked, cl_optional) = Self::capability(client)?;

        let chunked = match (srv_optional, cl_optional) {
            (false, false) if srv_chunked != cl_chunked => {
                return Err(TransportError::FramingMismatch {
                    server: server.to_string(),
                    client: client.to_string(),
                });
            }
            (_, false) => cl_chunked,
            _ => srv_chunked,
        };

        Ok(if chunked {
            Framing::Chunked
        } else {
            Framing::Plain
        })
    }
}

/// Writes one packet with the given framing.
pub fn write_packet<P: Encode, W: Write>(
    dst: &mut W,
    packet: P,
    framing: Framing,
) -> Result<(), TransportError> {
    match framing {
        Framing::Plain => {
            encode_into_std_write(packet, dst, wire_config())?;
        }
        Framing::Chunked => {
            let bytes = encode_to_vec(packet, wire_config())?;
            for chunk in bytes.chunks(MAX_CHUNK_SIZE) {
                dst.write_all(&(chunk.len() as u32).to_le_bytes())?;
                dst.write_all(chunk)?;
            }
            dst.write_all(&0u32.to_le_bytes())?;
        }
    }
    Ok(())
}

/// Reads one packet with the given framing.
pub fn read_packet<P: Decode<()>, R: Read>(
    src: &mut R,
    framing: Framing,
) -> Result<P, TransportError> {
    match framing {
        Framing::Plain => Ok(decode_from_std_read(src, limited_wire_config())?),
        Framing::Chunked => {
            let mut packet = Vec::new();
            loop {
                let mut len = [0u8; 4];
                src.read_exact(&mut len)?;
                let len = u32::from_le_bytes(len) as usize;
                if len == 0 {
                    break;
                }
                if packet.len() + len > MAX_PACKET_SIZE {
                    return Err(TransportError::PacketTooLarge(packet.len() + len));
                }
                trace!("reading chunk of {len} bytes");
                let start = packet.len();
                packet.resize(start + len, 0);
                src.read_exact(&mut packet[start..])?;
            }
            Ok(decode_from_slice(&packet, limited_wire_config())?.0)
        }
    }
}

/// Read half of a server connection.
///
/// Reads are bounded by `read_timeout`; [`PacketReader::poll`] waits a shorter,
/// caller-chosen time for the next packet to start arriving.
pub struct PacketReader {
    reader: BufReader<TcpStream>,
    framing: Framing,
    read_timeout: Option<Duration>,
}

impl PacketReader {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            reader: BufReader::new(stream),
            framing: Framing::Plain,
            read_timeout: None,
        }
    }

    pub fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.read_timeout = Some(timeout).filter(|t| !t.is_zero());
        self.reader.get_ref().set_read_timeout(self.read_timeout)?;
        Ok(())
    }

    pub fn stream(&self) -> &TcpStream {
        self.reader.get_ref()
    }

    /// Direct access to the buffered byte stream, for preambles that precede the
    /// packet protocol.
    pub fn raw(&mut self) -> &mut BufReader<TcpStream> {
        &mut self.reader
    }

    pub fn read_request(&mut self) -> Result<Request, TransportError> {
        read_packet(&mut self.reader, self.framing)
    }

    /// Returns true when bytes (or end of stream) are available within `timeout`.
    /// A zero timeout still waits up to a millisecond.
    ///
    /// The socket stays in blocking mode throughout: its descriptor is shared with the
    /// writer half of the connection.
    pub fn poll(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }

        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout.max(READY_CHECK)))?;
        let ready = match self.reader.fill_buf() {
            Ok(_) => Ok(true),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(TransportError::Io(e)),
        };
        self.reader.get_ref().set_read_timeout(self.read_timeout)?;
        ready
    }
}

/// Single-stream transport used by clients: write requests, read responses.
pub struct ProtocolTransport<T: Read + Write> {
    stream: BufReader<T>,
    send_framing: Framing,
    recv_framing: Framing,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream: BufReader::new(stream),
            send_framing: Framing::Plain,
            recv_framing: Framing::Plain,
        }
    }

    pub fn set_framing(&mut self, send: Framing, recv: Framing) {
        self.send_framing = send;
        self.recv_framing = recv;
    }

    pub fn get_ref(&self) -> &T {
        self.stream.get_ref()
    }

    pub fn write_request(&mut self, req: &Request) -> Result<(), TransportError> {
        let stream = self.stream.get_mut();
        write_packet(stream, req, self.send_framing)?;
        stream.flush()?;
        Ok(())
    }

    /// Writes raw bytes ahead of the packet protocol (e.g. a PROXY header).
    pub fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes)?;
        stream.flush()?;
        Ok(())
    }

    pub fn read_response(&mut self) -> Result<Response, TransportError> {
        read_packet(&mut self.stream, self.recv_framing)
    }

    pub fn write_response(&mut self, resp: &Response) -> Result<(), TransportError> {
        let stream = self.stream.get_mut();
        write_packet(stream, resp, self.send_framing)?;
        stream.flush()?;
        Ok(())
    }

    pub fn read_request(&mut self) -> Result<Request, TransportError> {
        read_packet(&mut self.stream, self.recv_framing)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Cursor, Seek, SeekFrom},
        net::TcpListener,
        thread,
    };

    use super::*;

    #[test]
    fn read_write_request() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_request(&Request::Cancel).unwrap();
        transport.stream.get_mut().seek(SeekFrom::Start(0)).unwrap();
        let req = transport.read_request().unwrap();
        assert_eq!(req, Request::Cancel);
    }

    #[test]
    fn read_write_response() {
        let stream = Cursor::new(Vec::new());
        let mut transport = ProtocolTransport::new(stream);

        transport.write_response(&Response::Pong).unwrap();
        transport.stream.get_mut().seek(SeekFrom::Start(0)).unwrap();
        let resp = transport.read_response().unwrap();
        assert_eq!(resp, Response::Pong);
    }

    #[test]
    fn chunked_packets_are_terminated() {
        let mut buf = Vec::new();
        write_packet(&mut buf, &Response::EndOfStream, Framing::Chunked).unwrap();
        write_packet(&mut buf, &Response::Pong, Framing::Chunked).unwrap();

        assert_eq!(&buf[buf.len() - 4..], &[0, 0, 0, 0]);

        let mut cursor = Cursor::new(buf);
        let first: Response = read_packet(&mut cursor, Framing::Chunked).unwrap();
        let second: Response = read_packet(&mut cursor, Framing::Chunked).unwrap();
        assert_eq!(first, Response::EndOfStream);
        assert_eq!(second, Response::Pong);
    }

    #[test]
    fn truncated_stream_is_disconnect() {
        let mut cursor = Cursor::new(vec![0u8, 0]);
        let err = read_packet::<Request, _>(&mut cursor, Framing::Plain).unwrap_err();

        assert!(err.is_disconnect());
        assert!(!err.is_malformed());
    }

    #[test]
    fn unknown_packet_is_malformed() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 200]);
        let err = read_packet::<Request, _>(&mut cursor, Framing::Plain).unwrap_err();

        assert!(err.is_malformed());
    }

    #[test]
    fn oversized_length_claim_is_rejected_before_allocating() {
        // Data packet whose payload claims a terabyte.
        let mut bytes = vec![0u8, 0, 0, 2];
        bytes.extend_from_slice(&(1u64 << 40).to_be_bytes());
        let mut cursor = Cursor::new(bytes);
        let err = read_packet::<Request, _>(&mut cursor, Framing::Plain).unwrap_err();

        assert!(matches!(
            err,
            TransportError::Deserialize(bincode::error::DecodeError::LimitExceeded)
        ));
        assert!(err.is_malformed());
    }

    #[test]
    fn oversized_chunked_packet_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(MAX_PACKET_SIZE as u32 + 1).to_le_bytes());
        let mut cursor = Cursor::new(bytes);
        let err = read_packet::<Request, _>(&mut cursor, Framing::Chunked).unwrap_err();

        assert!(matches!(err, TransportError::PacketTooLarge(_)));
    }

    #[test]
    fn framing_negotiation() {
        let cases = vec![
            ("notchunked", "notchunked", Framing::Plain),
            ("chunked_optional", "notchunked", Framing::Plain),
            ("notchunked_optional", "chunked", Framing::Chunked),
            ("chunked", "notchunked_optional", Framing::Chunked),
            ("chunked_optional", "notchunked_optional", Framing::Chunked),
        ];

        for (server, client, expected) in cases {
            assert_eq!(Framing::negotiate(server, client).unwrap(), expected);
        }
    }

    #[test]
    fn framing_negotiation_conflict() {
        assert!(matches!(
            Framing::negotiate("chunked", "notchunked"),
            Err(TransportError::FramingMismatch { .. })
        ));
        assert!(matches!(
            Framing::negotiate("sometimes", "chunked"),
            Err(TransportError::UnknownFraming(_))
        ));
    }

    #[test]
    fn polling_leaves_the_shared_socket_blocking() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut writer = stream.try_clone().unwrap();
        let mut reader = PacketReader::new(stream);

        let total = 8 << 20;
        let sending = thread::spawn(move || writer.write_all(&vec![7u8; total]));
        let receiving = thread::spawn(move || {
            let mut buf = vec![0u8; 64 * 1024];
            let mut received = 0;
            while received < total {
                thread::sleep(Duration::from_millis(1));
                received += peer.read(&mut buf).unwrap();
            }
            received
        });

        while !sending.is_finished() {
            assert!(!reader.poll(Duration::ZERO).unwrap());
        }
        sending.join().unwrap().unwrap();
        assert_eq!(receiving.join().unwrap(), total);
    }

    #[test]
    fn poll_sees_pending_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (stream, _) = listener.accept().unwrap();
        let mut reader = PacketReader::new(stream);

        assert!(!reader.poll(Duration::ZERO).unwrap());
        write_packet(&mut peer, &Request::Ping, Framing::Plain).unwrap();
        assert!(reader.poll(Duration::from_secs(5)).unwrap());
        assert_eq!(reader.read_request().unwrap(), Request::Ping);
    }
}
