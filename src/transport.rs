//! Delivery of finished packets to a mix server.  The trait is the seam
//! the rest of the client sees; tests substitute a mock for it.

use crate::descriptor::RoutingInfo;
use crate::prelude::*;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const BATCH_MAGIC: &[u8] = b"MMTP-BATCH-0\n";
const ACK_OK: u8 = 0x01;

pub trait Transport {
    /// Deliver a batch of packets to one server, or fail as a unit.
    fn send_packets(
        &self,
        routing: &RoutingInfo,
        packets: &[Vec<u8>],
        timeout: Duration,
    ) -> Result<()>;
}

/// The real thing: a framed batch over TCP, acknowledged with one byte.
pub struct TcpTransport;

impl Transport for TcpTransport {
    fn send_packets(
        &self,
        routing: &RoutingInfo,
        packets: &[Vec<u8>],
        timeout: Duration,
    ) -> Result<()> {
        let addr = format!("{}:{}", routing.hostname, routing.port)
            .to_socket_addrs()
            .map_err(|e| wire_error(routing, e))?
            .next()
            .ok_or_else(|| {
                MixError::Protocol(format!("could not resolve {}", routing))
            })?;
        let mut stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| wire_error(routing, e))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut inner = || -> io::Result<u8> {
            stream.write_all(BATCH_MAGIC)?;
            stream.write_all(&(packets.len() as u32).to_be_bytes())?;
            for packet in packets {
                stream.write_all(&(packet.len() as u32).to_be_bytes())?;
                stream.write_all(packet)?;
            }
            stream.flush()?;
            let mut ack = [0u8; 1];
            stream.read_exact(&mut ack)?;
            Ok(ack[0])
        };
        match inner() {
            Err(e) => Err(wire_error(routing, e)),
            Ok(ACK_OK) => Ok(()),
            Ok(code) => Err(MixError::Protocol(format!(
                "server at {} rejected the batch (code {:#04x})",
                routing, code
            ))
            .into()),
        }
    }
}

fn wire_error(routing: &RoutingInfo, e: io::Error) -> eyre::Report {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            MixError::TransportTimeout(routing.to_string()).into()
        }
        _ => MixError::Protocol(format!("{}: {}", routing, e)).into(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_util::test_routing;
    use std::io::Read;
    use std::net::TcpListener;

    #[test]
    fn test_batch_framing_and_ack() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();
        let server = std::thread::spawn(move || -> io::Result<Vec<u8>> {
            let (mut conn, _) = listener.accept()?;
            let mut buf = Vec::new();
            // read magic + count + one frame, then ack
            let mut header = vec![0u8; BATCH_MAGIC.len() + 4 + 4 + 3];
            conn.read_exact(&mut header)?;
            buf.extend_from_slice(&header);
            conn.write_all(&[ACK_OK])?;
            Ok(buf)
        });

        let mut routing = test_routing("ignored");
        routing.hostname = "127.0.0.1".to_owned();
        routing.port = port;
        TcpTransport.send_packets(
            &routing,
            &[b"abc".to_vec()],
            Duration::from_secs(5),
        )?;

        let seen = server.join().expect("server thread panicked")?;
        assert!(seen.starts_with(BATCH_MAGIC));
        let off = BATCH_MAGIC.len();
        assert_eq!(&seen[off..off + 4], &1u32.to_be_bytes());
        assert_eq!(&seen[off + 4..off + 8], &3u32.to_be_bytes());
        assert_eq!(&seen[off + 8..], b"abc");
        Ok(())
    }

    #[test]
    fn test_connection_refused_is_protocol_error() {
        // a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut routing = test_routing("localhost");
        routing.hostname = "127.0.0.1".to_owned();
        routing.port = port;
        let err = TcpTransport
            .send_packets(&routing, &[vec![1]], Duration::from_millis(500))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MixError>(),
            Some(MixError::Protocol(_) | MixError::TransportTimeout(_))
        ));
    }
}
