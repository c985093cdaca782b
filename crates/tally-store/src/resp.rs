//! Minimal RESP2 client used by the Redis backend.
//!
//! Blocking I/O over a `TcpStream` with connect and read/write timeouts.
//! Commands are encoded as arrays of bulk strings; replies are parsed
//! into [`Reply`]. Server error replies are returned as data, not as
//! I/O errors, so callers can tell "Redis said no" from "Redis is gone".
//!
//! ```text
//! RespConnection::command(["HINCRBYFLOAT", key, field, "1"])
//!   → *4\r\n$12\r\nHINCRBYFLOAT\r\n...
//!   ← $1\r\n1\r\n  → Reply::Bulk(Some(b"1"))
//! ```

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// One parsed RESP2 reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Bulk or simple string as UTF-8 text.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Reply::Simple(s) => Some(s.clone()),
            Reply::Bulk(Some(bytes)) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(Some(items)) => Some(items),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Bulk(None) | Reply::Array(None))
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command<S: AsRef<[u8]>>(args: &[S]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + args.len() * 16);
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn read_line<R: BufRead>(reader: &mut R) -> io::Result<String> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
    }
    if !line.ends_with("\r\n") {
        return Err(protocol_error("reply line not terminated by CRLF"));
    }
    line.truncate(line.len() - 2);
    Ok(line)
}

fn parse_len(s: &str) -> io::Result<i64> {
    s.parse()
        .map_err(|_| protocol_error(format!("invalid length {s:?}")))
}

/// Read exactly one reply.
pub fn read_reply<R: BufRead>(reader: &mut R) -> io::Result<Reply> {
    let line = read_line(reader)?;
    let mut chars = line.chars();
    let prefix = chars.next();
    let rest = chars.as_str();
    match prefix {
        Some('+') => Ok(Reply::Simple(rest.to_string())),
        Some('-') => Ok(Reply::Error(rest.to_string())),
        Some(':') => Ok(Reply::Integer(parse_len(rest)?)),
        Some('$') => {
            let len = parse_len(rest)?;
            if len < 0 {
                return Ok(Reply::Bulk(None));
            }
            let mut buf = vec![0u8; len as usize + 2];
            reader.read_exact(&mut buf)?;
            if &buf[len as usize..] != b"\r\n" {
                return Err(protocol_error("bulk string not terminated by CRLF"));
            }
            buf.truncate(len as usize);
            Ok(Reply::Bulk(Some(buf)))
        }
        Some('*') => {
            let len = parse_len(rest)?;
            if len < 0 {
                return Ok(Reply::Array(None));
            }
            let items = (0..len)
                .map(|_| read_reply(reader))
                .collect::<io::Result<Vec<_>>>()?;
            Ok(Reply::Array(Some(items)))
        }
        Some(other) => Err(protocol_error(format!("unknown reply type {other:?}"))),
        None => Err(protocol_error("empty reply line")),
    }
}

// ── Connection ─────────────────────────────────────────────────────

/// A single blocking connection to a Redis server.
pub struct RespConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl std::fmt::Debug for RespConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RespConnection")
            .field("peer", &self.writer.peer_addr().ok())
            .finish()
    }
}

impl RespConnection {
    pub fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        io_timeout: Duration,
    ) -> io::Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {host}:{port}")))?;

        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        stream.set_nodelay(true)?;

        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Send one command and read its reply.
    pub fn command<S: AsRef<[u8]>>(&mut self, args: &[S]) -> io::Result<Reply> {
        self.writer.write_all(&encode_command(args))?;
        read_reply(&mut self.reader)
    }

    /// Send several commands in one write, then read one reply per command.
    pub fn pipeline<S: AsRef<[u8]>>(&mut self, commands: &[Vec<S>]) -> io::Result<Vec<Reply>> {
        let mut buf = Vec::new();
        for cmd in commands {
            buf.extend_from_slice(&encode_command(cmd));
        }
        self.writer.write_all(&buf)?;
        commands
            .iter()
            .map(|_| read_reply(&mut self.reader))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(bytes: &[u8]) -> io::Result<Reply> {
        read_reply(&mut Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn encodes_bulk_array() {
        let encoded = encode_command(&["SET", "mykey", "myvalue"]);
        assert_eq!(encoded, b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n".to_vec());
    }

    #[test]
    fn encodes_binary_safe_arguments() {
        let encoded = encode_command(&["HGET", "k", "a\r\nb"]);
        assert!(encoded.ends_with(b"$4\r\na\r\nb\r\n"));
    }

    #[test]
    fn parses_scalar_replies() {
        assert_eq!(parse(b"+OK\r\n").unwrap(), Reply::Simple("OK".into()));
        assert_eq!(parse(b"-ERR nope\r\n").unwrap(), Reply::Error("ERR nope".into()));
        assert_eq!(parse(b":42\r\n").unwrap(), Reply::Integer(42));
        assert_eq!(parse(b"$-1\r\n").unwrap(), Reply::Bulk(None));
        assert_eq!(parse(b"$3\r\nabc\r\n").unwrap(), Reply::Bulk(Some(b"abc".to_vec())));
    }

    #[test]
    fn parses_nested_arrays() {
        let reply = parse(b"*2\r\n$1\r\n0\r\n*2\r\n$1\r\na\r\n$1\r\nb\r\n").unwrap();
        let items = reply.into_array().unwrap();
        assert_eq!(items[0].as_text().as_deref(), Some("0"));
        let inner = items[1].clone().into_array().unwrap();
        assert_eq!(inner.len(), 2);
    }

    #[test]
    fn nil_array_from_aborted_exec() {
        assert!(parse(b"*-1\r\n").unwrap().is_nil());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse(b"?what\r\n").is_err());
        assert!(parse(b"+OK\n").is_err());
        assert!(parse(b"$3\r\nabcd\r\n").is_err());
        assert!(parse(b"").is_err());
    }

    #[test]
    fn command_over_tcp() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let _ = read_reply(&mut reader);
                let _ = stream.write_all(b"+PONG\r\n");
            }
        });

        let mut conn = RespConnection::connect(
            "127.0.0.1",
            port,
            Duration::from_secs(2),
            Duration::from_secs(2),
        )
        .unwrap();
        assert_eq!(conn.command(&["PING"]).unwrap(), Reply::Simple("PONG".into()));
    }
}
