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

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;

use chunkswarm::Chunk;
use chunkswarm::ChunkHash;
use chunkswarm::ChunkStore;
use chunkswarm::Config;
use chunkswarm::Endpoint;
use chunkswarm::PacketSendHandler;
use chunkswarm::TransportHandler;
use chunkswarm::CHUNK_DATA_SIZE;

#[derive(Default)]
struct Outbox {
    pkts: RefCell<Vec<(Vec<u8>, SocketAddr)>>,
}

impl PacketSendHandler for Outbox {
    fn on_packets_send(&self, pkts: &[(Vec<u8>, SocketAddr)]) -> chunkswarm::Result<usize> {
        self.pkts.borrow_mut().extend_from_slice(pkts);
        Ok(pkts.len())
    }
}

struct Quiet;

impl TransportHandler for Quiet {
    fn on_upload_finished(&mut self, _peer: SocketAddr, _hash: &ChunkHash) {}

    fn on_upload_aborted(&mut self, _peer: SocketAddr, _hash: &ChunkHash) {}

    fn on_download_finished(&mut self, _peer: SocketAddr, _chunk: &Chunk) {}

    fn on_download_complete(&mut self) {}
}

fn addr(identity: u32) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000 + identity as u16))
}

fn new_peer(identity: u32, store: ChunkStore) -> (Endpoint, Rc<Outbox>) {
    let mut conf = Config::new();
    conf.set_identity(identity);
    conf.set_peers(vec![(1, addr(1)), (2, addr(2))]);

    let outbox = Rc::new(Outbox::default());
    let endpoint = Endpoint::new(conf, store, Box::new(Quiet), outbox.clone());
    (endpoint, outbox)
}

/// Move one chunk between two peers over a perfect link.
fn transfer(chunk: &Chunk) {
    let mut store = ChunkStore::new();
    store.insert(chunk.clone());
    let (mut server, server_out) = new_peer(1, store);
    let (mut client, client_out) = new_peer(2, ChunkStore::new());

    let mut now = Instant::now();
    client.download(&[*chunk.hash()]).unwrap();
    while !client.store().contains(chunk.hash()) {
        let pkts: Vec<_> = client_out.pkts.borrow_mut().drain(..).collect();
        for (pkt, _) in pkts {
            let _ = server.recv(&pkt, addr(2), now);
        }
        let pkts: Vec<_> = server_out.pkts.borrow_mut().drain(..).collect();
        for (pkt, _) in pkts {
            let _ = client.recv(&pkt, addr(1), now);
        }
        now += Duration::from_millis(1);
    }
}

pub fn transfer_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..CHUNK_DATA_SIZE).map(|i| (i % 251) as u8).collect();
    let chunk = Chunk::new(Bytes::from(data));

    c.bench_function("transfer chunk", |b| b.iter(|| transfer(&chunk)));
}

criterion_group!(benches, transfer_benchmark);
criterion_main!(benches);
