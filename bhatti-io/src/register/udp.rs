//! Modbus over UDP (MBAP framing, one request per datagram)

use super::pdu;
use crate::error::{TransportError, TransportResult};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Largest datagram a Modbus server sends back
const MAX_DATAGRAM: usize = 260;

/// Stale replies from earlier transactions skipped before giving up
const MAX_STALE_REPLIES: usize = 4;

pub struct UdpLink {
    socket: UdpSocket,
    transaction: u16,
}

impl UdpLink {
    /// Bind an ephemeral socket and fix its peer
    pub fn connect(host: &str, port: u16, timeout: Duration) -> TransportResult<Self> {
        let target = format!("{}:{}", host, port);
        let connect_err = |source: std::io::Error| TransportError::Connect {
            target: target.clone(),
            source: Box::new(source),
        };

        let addr = resolve(host, port).map_err(connect_err)?;
        let local: SocketAddr = if addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };

        let socket = UdpSocket::bind(local).map_err(connect_err)?;
        socket.connect(addr).map_err(connect_err)?;
        socket.set_read_timeout(Some(timeout)).map_err(connect_err)?;

        log::info!("Modbus UDP socket bound for {}", target);
        Ok(Self {
            socket,
            transaction: 0,
        })
    }

    /// Send one request PDU and return the matching reply PDU
    pub fn request(&mut self, unit: u8, request: &[u8]) -> TransportResult<Vec<u8>> {
        self.transaction = self.transaction.wrapping_add(1);
        let transaction = self.transaction;
        self.socket
            .send(&pdu::encode_mbap(transaction, unit, request))?;

        let mut buf = [0u8; MAX_DATAGRAM];
        for _ in 0..=MAX_STALE_REPLIES {
            let n = self.socket.recv(&mut buf)?;
            let (reply_tid, reply_unit, reply) = pdu::decode_mbap(&buf[..n])?;
            if reply_tid != transaction {
                log::debug!(
                    "Dropping stale UDP reply (transaction {}, expected {})",
                    reply_tid,
                    transaction
                );
                continue;
            }
            if reply_unit != unit {
                return Err(TransportError::InvalidResponse(format!(
                    "reply from unit {} to request for unit {}",
                    reply_unit, unit
                )));
            }
            return Ok(reply);
        }
        Err(TransportError::InvalidResponse(format!(
            "no reply for transaction {}",
            transaction
        )))
    }
}

pub(crate) fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} did not resolve", host),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    /// Answers one read-input request with a single register
    fn spawn_server(value: u16, stale_first: bool) -> (u16, thread::JoinHandle<()>) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 64];
            let (n, peer) = socket.recv_from(&mut buf).unwrap();
            let (tid, unit, req) = pdu::decode_mbap(&buf[..n]).unwrap();
            assert_eq!(req[0], pdu::READ_INPUT_REGISTERS);

            let [hi, lo] = value.to_be_bytes();
            let reply = [pdu::READ_INPUT_REGISTERS, 2, hi, lo];
            if stale_first {
                let stale = pdu::encode_mbap(tid.wrapping_sub(1), unit, &reply);
                socket.send_to(&stale, peer).unwrap();
            }
            socket
                .send_to(&pdu::encode_mbap(tid, unit, &reply), peer)
                .unwrap();
        });
        (port, handle)
    }

    #[test]
    fn test_udp_request() {
        let (port, server) = spawn_server(1850, false);
        let mut link = UdpLink::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();

        let request = pdu::read_request(pdu::READ_INPUT_REGISTERS, 4, 1).unwrap();
        let reply = link.request(1, &request).unwrap();
        assert_eq!(
            pdu::parse_read_response(pdu::READ_INPUT_REGISTERS, 1, &reply).unwrap(),
            vec![1850]
        );
        server.join().unwrap();
    }

    #[test]
    fn test_udp_skips_stale_transaction() {
        let (port, server) = spawn_server(42, true);
        let mut link = UdpLink::connect("127.0.0.1", port, Duration::from_secs(1)).unwrap();

        let request = pdu::read_request(pdu::READ_INPUT_REGISTERS, 0, 1).unwrap();
        let reply = link.request(1, &request).unwrap();
        assert_eq!(reply, vec![pdu::READ_INPUT_REGISTERS, 2, 0, 42]);
        server.join().unwrap();
    }

    #[test]
    fn test_udp_timeout() {
        // Bound but silent peer
        let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        let mut link = UdpLink::connect("127.0.0.1", port, Duration::from_millis(100)).unwrap();

        assert!(matches!(
            link.request(1, &[0x04, 0x00, 0x00, 0x00, 0x01]),
            Err(TransportError::Io(_))
        ));
    }
}
