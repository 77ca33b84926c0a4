//! The text control protocol spoken over TCP before any framed data flows.
//!
//! Lines are `\n`-terminated. The base exchange is
//! `"<node_id> <transporter_type>"` from the client answered by
//! `"<server_node_id>"`; the shared-memory backend follows up with its
//! four-line setup sequence on the same socket.

use std::{
    fmt, io,
    io::{Read, Write},
    net::TcpStream,
    str::FromStr,
    time::Duration,
};

use signet_wire::NodeId;
use thiserror::Error;

/// Backend discriminator exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TransporterKind {
    Tcp = 1,
    Shm = 2,
    Rdma = 3,
    Ose = 4,
}

impl TransporterKind {
    fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Tcp),
            2 => Some(Self::Shm),
            3 => Some(Self::Rdma),
            4 => Some(Self::Ose),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ControlLineError {
    #[error("unparseable control line {0:?}")]
    Malformed(String),
    #[error("unknown transporter type {0}")]
    UnknownKind(u32),
}

/// One parsed line of the control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    /// `"<node_id> <type>"` or, from peers predating type negotiation,
    /// `"<node_id>"`. The server's reply is the same shape without a type.
    NodeGreeting { node_id: NodeId, kind: Option<TransporterKind> },
    /// `"shm server 1 ok: <pid>"`
    ShmServerReady { pid: u32 },
    /// `"shm client 1 ok: <pid>"`
    ShmClientReady { pid: u32 },
    /// `"shm server 2 ok"`
    ShmServerUp,
    /// `"shm client 2 ok"`
    ShmClientUp,
}

impl FromStr for ControlLine {
    type Err = ControlLineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        if let Some(rest) = s.strip_prefix("shm server 1 ok: ") {
            let pid =
                rest.trim().parse().map_err(|_| ControlLineError::Malformed(s.to_string()))?;
            return Ok(Self::ShmServerReady { pid });
        }
        if let Some(rest) = s.strip_prefix("shm client 1 ok: ") {
            let pid =
                rest.trim().parse().map_err(|_| ControlLineError::Malformed(s.to_string()))?;
            return Ok(Self::ShmClientReady { pid });
        }
        if s == "shm server 2 ok" {
            return Ok(Self::ShmServerUp);
        }
        if s == "shm client 2 ok" {
            return Ok(Self::ShmClientUp);
        }

        let mut fields = s.split_whitespace();
        let node_id = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| ControlLineError::Malformed(s.to_string()))?;
        let kind = match fields.next() {
            None => None,
            Some(f) => {
                let code = f.parse().map_err(|_| ControlLineError::Malformed(s.to_string()))?;
                Some(TransporterKind::from_code(code).ok_or(ControlLineError::UnknownKind(code))?)
            }
        };
        if fields.next().is_some() {
            return Err(ControlLineError::Malformed(s.to_string()));
        }
        Ok(Self::NodeGreeting { node_id, kind })
    }
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeGreeting { node_id, kind: Some(kind) } => {
                write!(f, "{node_id} {}", *kind as u8)
            }
            Self::NodeGreeting { node_id, kind: None } => write!(f, "{node_id}"),
            Self::ShmServerReady { pid } => write!(f, "shm server 1 ok: {pid}"),
            Self::ShmClientReady { pid } => write!(f, "shm client 1 ok: {pid}"),
            Self::ShmServerUp => write!(f, "shm server 2 ok"),
            Self::ShmClientUp => write!(f, "shm client 2 ok"),
        }
    }
}

pub fn write_control_line(stream: &mut TcpStream, line: &ControlLine) -> io::Result<()> {
    stream.write_all(format!("{line}\n").as_bytes())
}

const MAX_LINE: usize = 256;

/// Read one `\n`-terminated line, byte by byte so nothing past the newline
/// is consumed (framed data may follow on the same socket).
pub fn read_control_line(stream: &mut TcpStream, timeout: Duration) -> io::Result<ControlLine> {
    stream.set_read_timeout(Some(timeout))?;
    let mut line = Vec::with_capacity(64);
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte)? {
            0 => return Err(io::ErrorKind::UnexpectedEof.into()),
            _ => {
                if byte[0] == b'\n' {
                    break;
                }
                if line.len() >= MAX_LINE {
                    return Err(io::ErrorKind::InvalidData.into());
                }
                line.push(byte[0]);
            }
        }
    }
    let text = std::str::from_utf8(&line)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;
    text.parse().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_forms() {
        assert_eq!(
            "7 2".parse::<ControlLine>().unwrap(),
            ControlLine::NodeGreeting { node_id: 7, kind: Some(TransporterKind::Shm) }
        );
        assert_eq!(
            "7".parse::<ControlLine>().unwrap(),
            ControlLine::NodeGreeting { node_id: 7, kind: None }
        );
        assert!("7 9".parse::<ControlLine>().is_err());
        assert!("x 1".parse::<ControlLine>().is_err());
        assert!("7 1 junk".parse::<ControlLine>().is_err());
    }

    #[test]
    fn shm_setup_lines() {
        assert_eq!(
            "shm server 1 ok: 1234".parse::<ControlLine>().unwrap(),
            ControlLine::ShmServerReady { pid: 1234 }
        );
        assert_eq!(
            "shm client 1 ok: 99".parse::<ControlLine>().unwrap(),
            ControlLine::ShmClientReady { pid: 99 }
        );
        assert_eq!("shm server 2 ok".parse::<ControlLine>().unwrap(), ControlLine::ShmServerUp);
        assert_eq!("shm client 2 ok".parse::<ControlLine>().unwrap(), ControlLine::ShmClientUp);
        assert!("shm server 1 ok: nope".parse::<ControlLine>().is_err());
    }

    #[test]
    fn display_matches_wire_format() {
        for (line, text) in [
            (ControlLine::NodeGreeting { node_id: 3, kind: Some(TransporterKind::Tcp) }, "3 1"),
            (ControlLine::NodeGreeting { node_id: 3, kind: None }, "3"),
            (ControlLine::ShmServerReady { pid: 42 }, "shm server 1 ok: 42"),
            (ControlLine::ShmServerUp, "shm server 2 ok"),
        ] {
            assert_eq!(line.to_string(), text);
            assert_eq!(text.parse::<ControlLine>().unwrap(), line);
        }
    }
}
