//! Trojan request header
//!
//! ```text
//! hex(SHA224(password)) CRLF CMD ATYP ADDR PORT CRLF payload...
//! ```
//!
//! Sent once over the TLS stream; the server does not answer it.

use super::socks::{TargetAddr, CMD_CONNECT};
use sha2::{Digest, Sha224};
use tokio::io::{AsyncWrite, AsyncWriteExt};

const CRLF: &[u8] = b"\r\n";

/// Hex-encoded SHA-224 of the password (56 characters)
pub fn password_hash(password: &str) -> String {
    hex::encode(Sha224::digest(password.as_bytes()))
}

/// Build the CONNECT header for `target`
pub fn request_header(password: &str, target: &TargetAddr) -> Vec<u8> {
    let mut header = Vec::with_capacity(56 + 2 + 1 + 1 + 256 + 2 + 2);
    header.extend_from_slice(password_hash(password).as_bytes());
    header.extend_from_slice(CRLF);
    header.push(CMD_CONNECT);
    target.write_to(&mut header);
    header.extend_from_slice(CRLF);
    header
}

/// Write the header; the stream then carries the payload unchanged
pub async fn connect<S>(stream: &mut S, password: &str, target: &TargetAddr) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&request_header(password, target)).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_password_hash() {
        // SHA-224("password")
        assert_eq!(
            password_hash("password"),
            "d63dc919e201d7bc4c825630d2cf25fdc93d4b2f0d46706d29038d01"
        );
    }

    #[test]
    fn test_header_layout() {
        let target = TargetAddr::Domain("example.com".into(), 443);
        let header = request_header("secret", &target);

        assert_eq!(&header[..56], password_hash("secret").as_bytes());
        assert_eq!(&header[56..58], CRLF);
        assert_eq!(header[58], CMD_CONNECT);
        assert_eq!(header[59], 0x03);
        assert_eq!(header[60] as usize, "example.com".len());
        assert_eq!(&header[61..72], b"example.com");
        assert_eq!(&header[72..74], &443u16.to_be_bytes());
        assert_eq!(&header[74..], CRLF);
    }

    #[tokio::test]
    async fn test_connect_writes_header() {
        let (mut client, mut server) = tokio::io::duplex(512);
        let target = TargetAddr::Ip("10.0.0.1:80".parse().unwrap());
        connect(&mut client, "pw", &target).await.unwrap();
        drop(client);

        let mut received = vec![];
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, request_header("pw", &target));
    }
}
