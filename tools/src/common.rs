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

use std::fs;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::path::Path;

use log::debug;
use log::trace;
use mio::net::UdpSocket;
use mio::Interest;
use mio::Registry;
use mio::Token;

use chunkswarm::ChunkHash;
use chunkswarm::PacketSendHandler;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

/// UDP socket wrapper for a peer.
pub struct PeerSocket {
    /// The underlying UDP socket.
    sock: UdpSocket,

    /// Local address of the socket.
    local_addr: SocketAddr,
}

impl PeerSocket {
    pub fn new(local: &SocketAddr, registry: &Registry, token: Token) -> Result<Self> {
        let mut sock = UdpSocket::bind(*local)?;
        let local_addr = sock.local_addr()?;
        registry.register(&mut sock, token, Interest::READABLE)?;

        Ok(Self { sock, local_addr })
    }

    /// Return the local address of the socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive data from the socket.
    pub fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.sock.recv_from(buf)
    }

    /// Send data on the socket to the given address.
    pub fn send_to(&self, buf: &[u8], dst: SocketAddr) -> std::io::Result<usize> {
        self.sock.send_to(buf, dst)
    }
}

impl PacketSendHandler for PeerSocket {
    fn on_packets_send(&self, pkts: &[(Vec<u8>, SocketAddr)]) -> chunkswarm::Result<usize> {
        let mut count = 0;
        for (pkt, dst) in pkts {
            if let Err(e) = self.send_to(pkt, *dst) {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    debug!("socket send would block");
                    return Ok(count);
                }
                return Err(e.into());
            }
            trace!("written {} bytes to {}", pkt.len(), dst);
            count += 1;
        }
        Ok(count)
    }
}

/// Commands read from standard input.
#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    /// Download the chunks listed in a chunkhash file and write them to a
    /// fragment file.
    Download {
        chunkhash_file: String,
        output_file: String,
    },
}

impl Command {
    /// Parse a command line such as `DOWNLOAD <chunkhash file> <output file>`.
    pub fn parse(line: &str) -> Result<Command> {
        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["DOWNLOAD", chunkhash_file, output_file] => Ok(Command::Download {
                chunkhash_file: chunkhash_file.to_string(),
                output_file: output_file.to_string(),
            }),
            _ => Err(format!("unknown command {:?}", line.trim()).into()),
        }
    }
}

/// Parse a peer map. Each line is `<identity> <host> <port>`, lines starting
/// with `#` are comments.
pub fn parse_peer_map(content: &str) -> Result<Vec<(u32, SocketAddr)>> {
    let mut peers = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        let (id, host, port) = match words.as_slice() {
            [id, host, port] => (id.parse::<u32>()?, *host, port.parse::<u16>()?),
            _ => return Err(format!("bad peer line {:?}", line).into()),
        };
        let addr = (host, port)
            .to_socket_addrs()?
            .find(|a| a.is_ipv4())
            .ok_or_else(|| format!("unresolved peer host {}", host))?;
        peers.push((id, addr));
    }
    Ok(peers)
}

/// Parse a chunkhash list. Each line is `<index> <hex digest>`.
pub fn parse_chunkhash_list(content: &str) -> Result<Vec<ChunkHash>> {
    let mut hashes = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_whitespace().collect::<Vec<&str>>().as_slice() {
            [_, hash] => hashes.push(hash.parse::<ChunkHash>()?),
            _ => return Err(format!("bad chunkhash line {:?}", line).into()),
        }
    }
    Ok(hashes)
}

/// Load a peer map file.
pub fn load_peer_map<P: AsRef<Path>>(path: P) -> Result<Vec<(u32, SocketAddr)>> {
    parse_peer_map(&fs::read_to_string(path)?)
}

/// Load a chunkhash list file.
pub fn load_chunkhash_list<P: AsRef<Path>>(path: P) -> Result<Vec<ChunkHash>> {
    parse_chunkhash_list(&fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_map() -> Result<()> {
        let content = "# id host port\n1 127.0.0.1 4001\n\n2 127.0.0.1 4002\n";
        let peers = parse_peer_map(content)?;
        assert_eq!(
            peers,
            vec![
                (1, "127.0.0.1:4001".parse::<SocketAddr>()?),
                (2, "127.0.0.1:4002".parse::<SocketAddr>()?)
            ]
        );

        assert!(parse_peer_map("1 127.0.0.1").is_err());
        assert!(parse_peer_map("x 127.0.0.1 4001").is_err());
        assert!(parse_peer_map("1 127.0.0.1 70000").is_err());
        Ok(())
    }

    #[test]
    fn chunkhash_list() -> Result<()> {
        let content = "0 a9993e364706816aba3e25717850c26c9cd0d89d\n\
                       1 0000000000000000000000000000000000000000\n";
        let hashes = parse_chunkhash_list(content)?;
        assert_eq!(hashes.len(), 2);
        assert_eq!(
            hashes[0].to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(hashes[1], ChunkHash::default());

        assert!(parse_chunkhash_list("0 a9993e").is_err());
        assert!(parse_chunkhash_list("a9993e364706816aba3e25717850c26c9cd0d89d").is_err());
        Ok(())
    }

    #[test]
    fn command() -> Result<()> {
        assert_eq!(
            Command::parse("DOWNLOAD A.chunkhash out.fragment\n")?,
            Command::Download {
                chunkhash_file: "A.chunkhash".to_string(),
                output_file: "out.fragment".to_string(),
            }
        );
        assert!(Command::parse("DOWNLOAD A.chunkhash").is_err());
        assert!(Command::parse("UPLOAD a b").is_err());
        Ok(())
    }
}
