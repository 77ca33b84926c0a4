use std::{io, net::TcpStream};

/// Pluggable socket authentication, run on the control socket before the
/// node greeting. The transporter layer treats it as opaque: both sides
/// either pass and continue with the handshake, or the socket dies.
pub trait Authenticator: Send + Sync {
    /// Client half; runs right after the socket connects.
    fn client_authenticate(&self, stream: &mut TcpStream) -> io::Result<bool>;
    /// Server half; runs before the greeting is read.
    fn server_authenticate(&self, stream: &mut TcpStream) -> io::Result<bool>;
}

/// Single challenge/response framing: the client presents a shared secret
/// on one line, the server answers with a verdict line.
pub struct ChallengeResponseAuth {
    secret: String,
}

impl ChallengeResponseAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

const AUTH_OK: &str = "auth ok";
const AUTH_REFUSED: &str = "auth refused";

impl Authenticator for ChallengeResponseAuth {
    fn client_authenticate(&self, stream: &mut TcpStream) -> io::Result<bool> {
        use std::io::{Read, Write};
        stream.write_all(format!("auth {}\n", self.secret).as_bytes())?;

        // byte-wise read so nothing after the verdict line is swallowed
        let mut line = Vec::with_capacity(32);
        let mut byte = [0u8; 1];
        loop {
            if stream.read(&mut byte)? == 0 {
                return Ok(false);
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > 64 {
                return Ok(false);
            }
        }
        Ok(line == AUTH_OK.as_bytes())
    }

    fn server_authenticate(&self, stream: &mut TcpStream) -> io::Result<bool> {
        use std::io::{Read, Write};
        let mut line = Vec::with_capacity(32);
        let mut byte = [0u8; 1];
        loop {
            if stream.read(&mut byte)? == 0 {
                return Ok(false);
            }
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > 128 {
                return Ok(false);
            }
        }
        let expected = format!("auth {}", self.secret);
        let ok = line == expected.as_bytes();
        stream.write_all(format!("{}\n", if ok { AUTH_OK } else { AUTH_REFUSED }).as_bytes())?;
        Ok(ok)
    }
}
