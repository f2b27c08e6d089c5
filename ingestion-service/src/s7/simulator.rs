//! In-process S7 controller for tests: one data block image shared by every
//! connection, served over a real TCP listener.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use super::{frame::TpktCodec, DeviceAddress};

/// Item return code for an address outside the block.
const ITEM_OUT_OF_RANGE: u8 = 0x05;

pub(crate) struct SimulatedDevice {
    pub address: DeviceAddress,
    pub reads: Arc<AtomicUsize>,
    pub writes: Arc<AtomicUsize>,
    pub connections: Arc<AtomicUsize>,
    image: Arc<Mutex<Vec<u8>>>,
}

#[derive(Clone)]
struct Shared {
    image: Arc<Mutex<Vec<u8>>>,
    pdu: u16,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl SimulatedDevice {
    pub async fn spawn(image: Vec<u8>, pdu: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Shared {
            image: Arc::new(Mutex::new(image)),
            pdu,
            reads: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        };
        let connections = Arc::new(AtomicUsize::new(0));

        let device = Self {
            address: DeviceAddress {
                port,
                ..DeviceAddress::new("127.0.0.1")
            },
            reads: shared.reads.clone(),
            writes: shared.writes.clone(),
            connections: connections.clone(),
            image: shared.image.clone(),
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, shared.clone()));
            }
        });
        device
    }

    pub fn image(&self) -> Vec<u8> {
        self.image.lock().unwrap().clone()
    }
}

fn ack(pdu_ref: &[u8], params: &[u8], data: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(&[0x02, 0xF0, 0x80, 0x32, 0x03, 0x00, 0x00]);
    buf.put_slice(pdu_ref);
    buf.put_u16(params.len() as u16);
    buf.put_u16(data.len() as u16);
    buf.put_u16(0);
    buf.put_slice(params);
    buf.put_slice(data);
    buf.freeze()
}

async fn serve(stream: TcpStream, shared: Shared) {
    let mut framed = Framed::new(stream, TpktCodec);
    while let Some(Ok(frame)) = framed.next().await {
        let reply = if frame[1] == 0xE0 {
            Bytes::from_static(&[0x06, 0xD0, 0x00, 0x01, 0x00, 0x01, 0x00])
        } else {
            respond(&frame[3..], &shared)
        };
        if framed.send(reply).await.is_err() {
            break;
        }
    }
}

fn respond(s7: &[u8], shared: &Shared) -> Bytes {
    let pdu_ref = &s7[4..6];
    let param_len = usize::from(u16::from_be_bytes([s7[6], s7[7]]));
    let params = &s7[10..10 + param_len];
    let data = &s7[10 + param_len..];

    if params[0] == 0xF0 {
        let mut p = vec![0xF0, 0x00, 0x00, 0x01, 0x00, 0x01];
        p.extend_from_slice(&shared.pdu.to_be_bytes());
        return ack(pdu_ref, &p, &[]);
    }

    let len = usize::from(u16::from_be_bytes([params[6], params[7]]));
    let bits = u32::from_be_bytes([0, params[11], params[12], params[13]]);
    let start = (bits / 8) as usize;
    let mut image = shared.image.lock().unwrap();
    let in_range = start + len <= image.len();

    match params[0] {
        0x05 => {
            shared.writes.fetch_add(1, Ordering::SeqCst);
            let status = if in_range {
                image[start..start + len].copy_from_slice(&data[4..4 + len]);
                0xFF
            } else {
                ITEM_OUT_OF_RANGE
            };
            ack(pdu_ref, &[0x05, 0x01], &[status])
        }
        _ => {
            shared.reads.fetch_add(1, Ordering::SeqCst);
            if !in_range {
                return ack(pdu_ref, &[0x04, 0x01], &[ITEM_OUT_OF_RANGE, 0x00, 0x00, 0x00]);
            }
            let mut item = vec![0xFF, 0x04];
            item.extend_from_slice(&((len * 8) as u16).to_be_bytes());
            item.extend_from_slice(&image[start..start + len]);
            ack(pdu_ref, &[0x04, 0x01], &item)
        }
    }
}
