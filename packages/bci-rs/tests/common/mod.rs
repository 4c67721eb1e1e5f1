// In-process stand-in for the acquisition server
#![allow(dead_code)]

use bci_rs::source::codec::{encode_data, encode_frame};
use bci_rs::FormatCode;
use ndarray::Array2;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// How the server answers the next `R` command
pub enum Reply {
    Block(Array2<f64>),
    Empty,
    /// Announce a payload, send part of it and close the connection
    Truncated,
    /// Never answer
    Stall,
}

struct ServerState {
    header: Vec<u8>,
    names: Vec<u8>,
    received: Vec<u8>,
    replies: VecDeque<Reply>,
}

pub struct MockServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
}

pub const MUSE_HEADER: &str = "NAME=MUSE,HARDWARE=Muse2016,FS=256,DATA=ffffi,#CH=5";
pub const MUSE_NAMES: &str = "TP9,AF7,AF8,TP10,STATUS";

pub fn muse_format() -> Vec<FormatCode> {
    FormatCode::parse_sequence("ffffi").unwrap()
}

/// Four EEG channels oscillating at `freq` Hz and a zero status column
pub fn muse_samples(freq: f64, start: usize, n_samples: usize) -> Array2<f64> {
    Array2::from_shape_fn((n_samples, 5), |(i, j)| {
        if j == 4 {
            return 0.0;
        }
        let t = (start + i) as f64 / 256.0;
        10.0 * (2.0 * PI * freq * t + j as f64).sin() + 2.0 * (2.0 * PI * 1.5 * t).sin()
    })
}

impl MockServer {
    pub async fn start(header: &str, names: &str, format: Vec<FormatCode>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(ServerState {
            header: header.as_bytes().to_vec(),
            names: names.as_bytes().to_vec(),
            received: Vec::new(),
            replies: VecDeque::new(),
        }));

        let shared = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve(socket, Arc::clone(&shared), format.clone()));
            }
        });

        Self { addr, state }
    }

    pub async fn muse() -> Self {
        Self::start(MUSE_HEADER, MUSE_NAMES, muse_format()).await
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn push(&self, reply: Reply) {
        self.state.lock().replies.push_back(reply);
    }

    /// Change what later `H` and `N` commands return
    pub fn set_device(&self, header: &str, names: &str) {
        let mut state = self.state.lock();
        state.header = header.as_bytes().to_vec();
        state.names = names.as_bytes().to_vec();
    }

    pub fn pending_replies(&self) -> usize {
        self.state.lock().replies.len()
    }

    /// Command bytes received so far, across all connections
    pub fn received(&self) -> Vec<u8> {
        self.state.lock().received.clone()
    }
}

async fn write_frame(socket: &mut TcpStream, payload: &[u8]) -> std::io::Result<()> {
    socket.write_all(&encode_frame(payload)).await
}

async fn serve(mut socket: TcpStream, state: Arc<Mutex<ServerState>>, format: Vec<FormatCode>) {
    loop {
        let command = match socket.read_u8().await {
            Ok(byte) => byte,
            Err(_) => return,
        };
        state.lock().received.push(command);

        let written = match command {
            b'H' => {
                let header = state.lock().header.clone();
                write_frame(&mut socket, &header).await
            }
            b'N' => {
                let names = state.lock().names.clone();
                write_frame(&mut socket, &names).await
            }
            b'R' => {
                let reply = state.lock().replies.pop_front().unwrap_or(Reply::Empty);
                match reply {
                    Reply::Block(samples) => {
                        let payload = encode_data(&samples, &format).unwrap();
                        write_frame(&mut socket, &payload).await
                    }
                    Reply::Empty => write_frame(&mut socket, &[]).await,
                    Reply::Truncated => {
                        let frame = encode_frame(&[0u8; 16]);
                        let _ = socket.write_all(&frame[..8]).await;
                        return;
                    }
                    Reply::Stall => {
                        std::future::pending::<()>().await;
                        return;
                    }
                }
            }
            b'K' => return,
            _ => Ok(()),
        };

        if written.is_err() {
            return;
        }
    }
}
