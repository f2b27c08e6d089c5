use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::{io::AsyncWriteExt, net::TcpStream};
use tokio_util::codec::Framed;

use super::{
    check_range,
    frame::{self, TpktCodec},
    DeviceAddress, DeviceConnector, DeviceSession, ProtocolError,
};

/// PDU size requested during setup; devices may negotiate it down.
pub const DEFAULT_PDU_SIZE: u16 = 480;

type Transport = Framed<TcpStream, TpktCodec>;

/// Opens S7 sessions with bounded connect and request times.
#[derive(Debug, Clone)]
pub struct S7Connector {
    connect_timeout: Duration,
    request_timeout: Duration,
    pdu_size: u16,
}

impl S7Connector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
            pdu_size: DEFAULT_PDU_SIZE,
        }
    }
}

/// One open connection to a controller. Owned by a single task.
pub struct S7Session {
    address: DeviceAddress,
    transport: Option<Transport>,
    request_timeout: Duration,
    pdu_size: u16,
    pdu_ref: u16,
}

impl S7Session {
    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    async fn exchange(&mut self, request: Bytes) -> Result<Bytes, ProtocolError> {
        let timeout = self.request_timeout;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| ProtocolError::Read("session already closed".to_string()))?;
        exchange(transport, request, timeout).await
    }
}

async fn exchange(transport: &mut Transport, request: Bytes, timeout: Duration) -> Result<Bytes, ProtocolError> {
    tokio::time::timeout(timeout, transport.send(request))
        .await
        .map_err(|_| ProtocolError::Timeout("request"))?
        .map_err(|e| ProtocolError::Read(e.to_string()))?;

    match tokio::time::timeout(timeout, transport.next()).await {
        Ok(Some(Ok(frame))) => Ok(frame),
        Ok(Some(Err(e))) => Err(ProtocolError::Read(e.to_string())),
        Ok(None) => Err(ProtocolError::Read("connection closed by device".to_string())),
        Err(_elapsed) => Err(ProtocolError::Timeout("response")),
    }
}

/// COTP connect followed by S7 setup. Returns the negotiated PDU size.
async fn handshake(
    transport: &mut Transport,
    address: &DeviceAddress,
    requested_pdu: u16,
    timeout: Duration,
) -> Result<u16, ProtocolError> {
    let reply = exchange(transport, frame::connection_request(address.rack, address.slot), timeout).await?;
    frame::parse_connection_confirm(&reply).map_err(|e| ProtocolError::Read(e.to_string()))?;

    let reply = exchange(transport, frame::setup_communication(0, requested_pdu), timeout).await?;
    let negotiated = frame::parse_setup_response(&reply).map_err(|e| ProtocolError::Read(e.to_string()))?;
    let pdu = negotiated.min(requested_pdu);
    if usize::from(pdu) <= frame::READ_OVERHEAD.max(frame::WRITE_OVERHEAD) {
        return Err(ProtocolError::Read(format!("negotiated PDU of {pdu} bytes is too small")));
    }
    Ok(pdu)
}

#[async_trait::async_trait]
impl DeviceConnector for S7Connector {
    type Session = S7Session;

    async fn connect(&self, address: &DeviceAddress) -> Result<S7Session, ProtocolError> {
        let connect_failed = |reason: String| ProtocolError::Connect {
            address: address.ip.clone(),
            reason,
        };

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((address.ip.as_str(), address.port)),
        )
        .await
        .map_err(|_| ProtocolError::Timeout("connect"))?
        .map_err(|e| connect_failed(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(device = %address, error = %e, "failed to disable nagle on s7 socket");
        }

        let mut transport = Framed::new(stream, TpktCodec);
        let pdu_size = handshake(&mut transport, address, self.pdu_size, self.request_timeout)
            .await
            .map_err(|e| match e {
                ProtocolError::Timeout(_) => ProtocolError::Timeout("connect"),
                other => connect_failed(other.to_string()),
            })?;

        tracing::debug!(device = %address, pdu_size, "s7 session established");
        Ok(S7Session {
            address: address.clone(),
            transport: Some(transport),
            request_timeout: self.request_timeout,
            pdu_size,
            pdu_ref: 0,
        })
    }
}

#[async_trait::async_trait]
impl DeviceSession for S7Session {
    async fn read(&mut self, block: u16, offset: u32, length: u32) -> Result<Bytes, ProtocolError> {
        check_range(offset, length)?;

        let max_chunk = (usize::from(self.pdu_size) - frame::READ_OVERHEAD) as u32;
        let mut out = BytesMut::with_capacity(length as usize);
        let mut done = 0u32;

        while done < length {
            let chunk = (length - done).min(max_chunk);
            let pdu_ref = self.next_ref();
            let request = frame::read_var_request(pdu_ref, block, offset + done, chunk as u16);
            let reply = self.exchange(request).await?;
            let data = frame::parse_read_response(&reply).map_err(|e| ProtocolError::Read(e.to_string()))?;
            if data.len() != chunk as usize {
                return Err(ProtocolError::Read(format!(
                    "expected {chunk} bytes, device returned {}",
                    data.len()
                )));
            }
            out.extend_from_slice(&data);
            done += chunk;
        }

        Ok(out.freeze())
    }

    async fn write(&mut self, block: u16, offset: u32, data: &[u8]) -> Result<(), ProtocolError> {
        check_range(offset, data.len() as u32)?;

        let max_chunk = usize::from(self.pdu_size) - frame::WRITE_OVERHEAD;
        let mut written = 0usize;
        for chunk in data.chunks(max_chunk) {
            let pdu_ref = self.next_ref();
            let request = frame::write_var_request(pdu_ref, block, offset + written as u32, chunk);
            let reply = self.exchange(request).await.map_err(|e| match e {
                ProtocolError::Read(reason) => ProtocolError::Write(reason),
                other => other,
            })?;
            frame::parse_write_response(&reply).map_err(|e| ProtocolError::Write(e.to_string()))?;
            written += chunk.len();
        }

        tracing::debug!(device = %self.address, block, offset, bytes = written, "s7 write acknowledged");
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.get_mut().shutdown().await {
                tracing::debug!(device = %self.address, error = %e, "s7 session shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use tokio::net::TcpListener;

    use super::*;
    use crate::s7::{decode, simulator::SimulatedDevice, Scalar, ValueType};

    fn connector() -> S7Connector {
        S7Connector::new(Duration::from_secs(2), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn long_reads_are_split_across_pdus() {
        let image: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
        let device = SimulatedDevice::spawn(image.clone(), 240).await;

        let mut session = connector().connect(&device.address).await.unwrap();
        assert_eq!(session.pdu_size(), 240);

        let bytes = session.read(1, 10, 500).await.unwrap();
        assert_eq!(&bytes[..], &image[10..510]);
        // 222 payload bytes per PDU of 240
        assert_eq!(device.reads.load(Ordering::SeqCst), 3);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn counter_round_trips_through_a_session() {
        let mut image = vec![0u8; 16];
        image[4..8].copy_from_slice(&10_100u32.to_be_bytes());
        let device = SimulatedDevice::spawn(image, 480).await;

        let mut session = connector().connect(&device.address).await.unwrap();
        let bytes = session.read(1, 4, 4).await.unwrap();
        assert_eq!(decode(&bytes, ValueType::Uint32).unwrap(), Scalar::Int(10_100));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn writes_land_in_the_data_block() {
        let device = SimulatedDevice::spawn(vec![0u8; 600], 240).await;
        let mut session = connector().connect(&device.address).await.unwrap();

        session.write(1, 2, &[0x00, 0x03]).await.unwrap();
        assert_eq!(&device.image()[2..4], &[0x00, 0x03]);

        // 212 payload bytes per PDU of 240
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 7) as u8 + 1).collect();
        session.write(1, 100, &payload).await.unwrap();
        assert_eq!(&device.image()[100..400], &payload[..]);
        assert_eq!(device.writes.load(Ordering::SeqCst), 3);

        let bytes = session.read(1, 2, 2).await.unwrap();
        assert_eq!(decode(&bytes, ValueType::Uint16).unwrap(), Scalar::Int(3));
        session.disconnect().await;
    }

    #[tokio::test]
    async fn rejected_write_is_a_write_error() {
        let device = SimulatedDevice::spawn(vec![0u8; 8], 480).await;
        let mut session = connector().connect(&device.address).await.unwrap();

        let err = session.write(1, 6, &[1, 2, 3, 4]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Write(_)));
        assert_eq!(device.image(), vec![0u8; 8]);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn out_of_range_read_fails_before_any_io() {
        let device = SimulatedDevice::spawn(vec![0u8; 16], 480).await;
        let mut session = connector().connect(&device.address).await.unwrap();

        let err = session.read(1, 65_534, 4).await.unwrap_err();
        assert_eq!(err, ProtocolError::Range { offset: 65_534, length: 4 });
        let err = session.write(1, 65_535, &[0, 1]).await.unwrap_err();
        assert_eq!(err, ProtocolError::Range { offset: 65_535, length: 2 });
        assert_eq!(device.reads.load(Ordering::SeqCst), 0);
        assert_eq!(device.writes.load(Ordering::SeqCst), 0);
        session.disconnect().await;
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut address = DeviceAddress::new("127.0.0.1");
        address.port = port;
        let err = connector().connect(&address).await.err().unwrap();
        assert!(matches!(err, ProtocolError::Connect { .. }));
    }

    #[tokio::test]
    async fn silent_device_times_out_during_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let mut address = DeviceAddress::new("127.0.0.1");
        address.port = port;
        let connector = S7Connector::new(Duration::from_secs(2), Duration::from_millis(100));
        let err = connector.connect(&address).await.err().unwrap();
        assert_eq!(err, ProtocolError::Timeout("connect"));
    }
}
