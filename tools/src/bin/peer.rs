// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A chunkswarm peer serving a fragment file and downloading chunks on
//! demand. Commands are read from standard input.

use std::cell::RefCell;
use std::io::BufRead;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use clap::Parser;
use log::debug;
use log::error;
use log::info;
use log::warn;
use mio::Token;
use mio::Waker;

use chunkswarm::Chunk;
use chunkswarm::ChunkHash;
use chunkswarm::ChunkStore;
use chunkswarm::Config;
use chunkswarm::Endpoint;
use chunkswarm::TransportHandler;
use chunkswarm::DEFAULT_TICK;
use chunkswarm::MAX_DATAGRAM_SIZE;
use chunkswarm_tools::load_chunkhash_list;
use chunkswarm_tools::load_peer_map;
use chunkswarm_tools::Command;
use chunkswarm_tools::PeerSocket;
use chunkswarm_tools::Result;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

const SOCKET_TOKEN: Token = Token(0);
const STDIN_TOKEN: Token = Token(1);

#[derive(Parser, Debug)]
#[clap(name = "peer")]
pub struct PeerOpt {
    /// Peer map listing `<identity> <host> <port>` per line.
    #[clap(short, long = "peer-map", value_name = "FILE")]
    pub peer_map: String,

    /// Fragment file holding the chunks served by this peer.
    #[clap(short = 'c', long = "chunks", value_name = "FILE")]
    pub chunk_file: String,

    /// Maximum number of peers served at the same time.
    #[clap(short, long = "max-conn", default_value = "16", value_name = "NUM")]
    pub max_conn: usize,

    /// Identity of this peer in the peer map.
    #[clap(short, long, value_name = "ID")]
    pub identity: u32,

    /// Fixed retransmission timeout in milliseconds, 0 to estimate it.
    #[clap(short, long, default_value = "0", value_name = "TIME")]
    pub timeout: u64,

    /// Identity tag carried in packet headers.
    #[clap(long, default_value = "29", value_name = "NUM")]
    pub source_id: u8,

    /// Abort an upload after this many consecutive timeouts.
    #[clap(long, value_name = "NUM")]
    pub max_timeouts: Option<u32>,

    /// Interval of the timeout sweep in milliseconds, 100 by default.
    #[clap(long, value_name = "TIME")]
    pub tick: Option<u64>,

    /// Log level, support OFF/ERROR/WARN/INFO/DEBUG/TRACE.
    #[clap(long, default_value = "INFO")]
    pub log_level: log::LevelFilter,
}

/// Progress of the current DOWNLOAD command.
#[derive(Default)]
struct DownloadState {
    /// Chunks to write to the output file.
    hashes: Vec<ChunkHash>,

    /// The output fragment file.
    output_file: Option<String>,

    /// Whether every chunk is held.
    complete: bool,
}

/// Transfer callbacks of the peer.
struct PeerHandler {
    state: Rc<RefCell<DownloadState>>,
}

impl TransportHandler for PeerHandler {
    fn on_upload_finished(&mut self, peer: SocketAddr, hash: &ChunkHash) {
        info!("sent chunk {} to {}", hash, peer);
    }

    fn on_upload_aborted(&mut self, peer: SocketAddr, hash: &ChunkHash) {
        warn!("gave up sending chunk {} to {}", hash, peer);
    }

    fn on_download_finished(&mut self, peer: SocketAddr, chunk: &Chunk) {
        info!("received chunk {} from {}", chunk.hash(), peer);
    }

    fn on_download_complete(&mut self) {
        self.state.borrow_mut().complete = true;
    }
}

struct Peer {
    /// Chunkswarm endpoint.
    endpoint: Endpoint,

    /// Event poll.
    poll: mio::Poll,

    /// Peer socket.
    sock: Rc<PeerSocket>,

    /// Commands read by the stdin thread.
    commands: mpsc::Receiver<String>,

    /// Progress of the current download.
    state: Rc<RefCell<DownloadState>>,

    /// Packet read buffer.
    recv_buf: Vec<u8>,
}

impl Peer {
    fn new(option: &PeerOpt) -> Result<Self> {
        let peers = load_peer_map(&option.peer_map)?;
        let local = peers
            .iter()
            .find(|(id, _)| *id == option.identity)
            .map(|(_, addr)| *addr)
            .ok_or_else(|| format!("identity {} not in peer map", option.identity))?;

        let mut config = Config::new();
        config.set_identity(option.identity);
        config.set_source_id(option.source_id);
        config.set_peers(peers);
        config.set_max_concurrent_sends(option.max_conn);
        config.set_timeout(option.timeout);
        config.set_max_consecutive_timeouts(option.max_timeouts);

        let store = ChunkStore::load(&option.chunk_file)?;
        info!("serving {} chunks from {}", store.len(), option.chunk_file);

        let poll = mio::Poll::new()?;
        let sock = Rc::new(PeerSocket::new(&local, poll.registry(), SOCKET_TOKEN)?);
        info!("listening on {}", sock.local_addr());

        // Standard input is read by a thread which wakes the poll up.
        let waker = Waker::new(poll.registry(), STDIN_TOKEN)?;
        let (tx, commands) = mpsc::channel();
        thread::spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(_) => break,
                };
                if tx.send(line).is_err() || waker.wake().is_err() {
                    break;
                }
            }
        });

        let state = Rc::new(RefCell::new(DownloadState::default()));
        let handler = PeerHandler {
            state: state.clone(),
        };

        Ok(Peer {
            endpoint: Endpoint::new(config, store, Box::new(handler), sock.clone()),
            poll,
            sock,
            commands,
            state,
            recv_buf: vec![0; MAX_DATAGRAM_SIZE],
        })
    }

    /// Read and process all available datagrams.
    fn process_read_event(&mut self) -> Result<()> {
        loop {
            let (len, remote) = match self.sock.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) => {
                    if e.kind() == std::io::ErrorKind::WouldBlock {
                        break;
                    }
                    return Err(format!("socket recv error: {:?}", e).into());
                }
            };
            debug!("socket recv {} bytes from {}", len, remote);

            let pkt_buf = &self.recv_buf[..len];
            if let Err(e) = self.endpoint.recv(pkt_buf, remote, Instant::now()) {
                debug!("recv from {} failed: {:?}", remote, e);
            }
        }
        Ok(())
    }

    /// Process pending commands from standard input.
    fn process_commands(&mut self) {
        while let Ok(line) = self.commands.try_recv() {
            if line.trim().is_empty() {
                continue;
            }
            if let Err(e) = self.process_command(&line) {
                error!("command {:?} failed: {:?}", line.trim(), e);
            }
        }
    }

    fn process_command(&mut self, line: &str) -> Result<()> {
        match Command::parse(line)? {
            Command::Download {
                chunkhash_file,
                output_file,
            } => {
                let hashes = load_chunkhash_list(&chunkhash_file)?;
                *self.state.borrow_mut() = DownloadState {
                    hashes: hashes.clone(),
                    output_file: Some(output_file),
                    complete: false,
                };
                self.endpoint.download(&hashes)?;
            }
        }
        Ok(())
    }

    /// Write the output file once the current download is complete.
    fn finish_download(&mut self) -> Result<()> {
        let (hashes, output_file) = {
            let mut state = self.state.borrow_mut();
            if !state.complete {
                return Ok(());
            }
            state.complete = false;
            let output_file = match state.output_file.take() {
                Some(f) => f,
                None => return Ok(()),
            };
            (std::mem::take(&mut state.hashes), output_file)
        };

        let mut output = ChunkStore::new();
        for hash in &hashes {
            match self.endpoint.store().get(hash) {
                Some(chunk) => output.insert(chunk.clone()),
                None => return Err(format!("chunk {} missing", hash).into()),
            }
        }
        output.save(&output_file)?;
        println!("GOT {}", output_file);
        Ok(())
    }
}

fn main() -> Result<()> {
    let option = PeerOpt::parse();

    // Initialize logging.
    env_logger::builder().filter_level(option.log_level).init();

    // Initialize peer.
    let mut peer = Peer::new(&option)?;
    let tick = option
        .tick
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_TICK);

    // Run event loop.
    let mut events = mio::Events::with_capacity(1024);
    let mut last_sweep = Instant::now();
    loop {
        let timeout = tick.saturating_sub(last_sweep.elapsed());
        peer.poll.poll(&mut events, Some(timeout))?;

        // Process IO events
        for event in events.iter() {
            match event.token() {
                SOCKET_TOKEN => peer.process_read_event()?,
                STDIN_TOKEN => peer.process_commands(),
                _ => (),
            }
        }

        // Process timeout events
        let now = Instant::now();
        if now.saturating_duration_since(last_sweep) >= tick {
            peer.endpoint.on_timeout(now);
            last_sweep = now;
        }

        if let Err(e) = peer.finish_download() {
            error!("write download failed: {:?}", e);
        }
    }
}
