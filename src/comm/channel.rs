//! In-process mesh transport: every rank is a thread of one process,
//! connected pairwise by unbounded channels.
//!
//! Point-to-point matching follows the layer contract the engine is built
//! on: messages are addressed by `(source, tag)` and delivered in send
//! order per source and tag. A receiver pulling a specific `(source, tag)`
//! stashes whatever else arrives in the meantime and replays the stash
//! first on later receives, so out-of-order arrival across tags never
//! reorders a single tag's stream.

use std::cell::RefCell;
use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{wire, Communicator, PendingRequest, Rank, Tag, COORDINATOR, CTRL_TAG};
use crate::error::Error;
use crate::Result;

struct Envelope {
    src: Rank,
    tag: Tag,
    bytes: Vec<u8>,
}

/// One rank's endpoint of the in-process mesh.
pub struct ChannelCommunicator {
    rank: Rank,
    // A rank holds no sender to its own inbox, so a fully-departed world is
    // observable as a channel disconnect.
    peers: Vec<Option<Sender<Envelope>>>,
    inbox: Receiver<Envelope>,
    stash: RefCell<VecDeque<Envelope>>,
}

/// Build a fully-connected mesh of `size` ranks. The returned endpoints are
/// indexed by rank; move each one onto its own thread.
pub fn mesh(size: usize) -> Vec<ChannelCommunicator> {
    let mut senders = Vec::with_capacity(size);
    let mut inboxes = Vec::with_capacity(size);
    for _ in 0..size {
        let (tx, rx) = unbounded();
        senders.push(tx);
        inboxes.push(rx);
    }
    inboxes
        .into_iter()
        .enumerate()
        .map(|(rank, inbox)| ChannelCommunicator {
            rank,
            peers: senders
                .iter()
                .enumerate()
                .map(|(dst, tx)| (dst != rank).then(|| tx.clone()))
                .collect(),
            inbox,
            stash: RefCell::new(VecDeque::new()),
        })
        .collect()
}

impl ChannelCommunicator {
    fn post(&self, dst: Rank, tag: Tag, bytes: Vec<u8>) -> Result<()> {
        self.peers[dst]
            .as_ref()
            .ok_or(Error::Disconnected)?
            .send(Envelope { src: self.rank, tag, bytes })
            .map_err(|_| Error::Disconnected)
    }

    fn recv_match(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        let mut stash = self.stash.borrow_mut();
        if let Some(pos) = stash.iter().position(|e| e.src == src && e.tag == tag) {
            return Ok(stash.remove(pos).expect("position just found").bytes);
        }
        loop {
            let envelope = self.inbox.recv().map_err(|_| Error::Disconnected)?;
            if envelope.src == src && envelope.tag == tag {
                return Ok(envelope.bytes);
            }
            stash.push_back(envelope);
        }
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, dst: Rank, tag: Tag, payload: &[u8]) -> Result<()> {
        self.post(dst, tag, payload.to_vec())
    }

    fn recv(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        self.recv_match(src, tag)
    }

    fn broadcast(&self, payload: &[u8]) -> Result<()> {
        debug_assert_eq!(self.rank, COORDINATOR);
        for dst in 0..self.peers.len() {
            if dst != self.rank {
                self.post(dst, CTRL_TAG, payload.to_vec())?;
            }
        }
        Ok(())
    }

    fn broadcast_recv(&self) -> Result<Vec<u8>> {
        debug_assert_ne!(self.rank, COORDINATOR);
        self.recv_match(COORDINATOR, CTRL_TAG)
    }

    fn isend(&self, dst: Rank, tag: Tag, values: &[f64]) -> Result<PendingRequest> {
        // Unbounded channels buffer the payload immediately, so the send
        // half of the request is complete the moment it is issued.
        self.post(dst, tag, wire::encode_values(values))?;
        Ok(PendingRequest::Send { dst, tag })
    }

    fn irecv(&self, src: Rank, tag: Tag) -> Result<PendingRequest> {
        Ok(PendingRequest::Recv { src, tag })
    }

    fn wait(&self, request: PendingRequest) -> Result<Option<Vec<f64>>> {
        match request {
            PendingRequest::Send { .. } => Ok(None),
            PendingRequest::Recv { src, tag } => {
                let bytes = self.recv_match(src, tag)?;
                wire::decode_values(&bytes).map(Some)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_ranks_and_sizes() {
        let comms = mesh(3);
        for (i, c) in comms.iter().enumerate() {
            assert_eq!(c.rank(), i);
            assert_eq!(c.size(), 3);
        }
    }

    #[test]
    fn point_to_point_roundtrip() {
        let comms = mesh(2);
        comms[0].send(1, 20, b"hello").unwrap();
        assert_eq!(comms[1].recv(0, 20).unwrap(), b"hello");
    }

    #[test]
    fn out_of_order_tags_are_stashed() {
        let comms = mesh(2);
        comms[0].send(1, 20, b"first").unwrap();
        comms[0].send(1, 21, b"second").unwrap();
        // Pull the later tag first; the earlier envelope must survive.
        assert_eq!(comms[1].recv(0, 21).unwrap(), b"second");
        assert_eq!(comms[1].recv(0, 20).unwrap(), b"first");
    }

    #[test]
    fn same_tag_preserves_order() {
        let comms = mesh(2);
        comms[0].send(1, 20, b"a").unwrap();
        comms[0].send(1, 20, b"b").unwrap();
        comms[0].send(1, 21, b"x").unwrap();
        assert_eq!(comms[1].recv(0, 21).unwrap(), b"x");
        assert_eq!(comms[1].recv(0, 20).unwrap(), b"a");
        assert_eq!(comms[1].recv(0, 20).unwrap(), b"b");
    }

    #[test]
    fn broadcast_reaches_every_worker() {
        let comms = mesh(3);
        comms[0].broadcast(b"params").unwrap();
        assert_eq!(comms[1].broadcast_recv().unwrap(), b"params");
        assert_eq!(comms[2].broadcast_recv().unwrap(), b"params");
    }

    #[test]
    fn isend_completes_without_a_matching_receive() {
        let comms = mesh(2);
        let req = comms[0].isend(1, 30, &[1.0, 2.0]).unwrap();
        // The transfer is buffered; waiting on the send half never blocks.
        assert_eq!(comms[0].wait(req).unwrap(), None);
        let req = comms[1].irecv(0, 30).unwrap();
        assert_eq!(comms[1].wait(req).unwrap(), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn dropped_peer_is_a_disconnect() {
        let mut comms = mesh(2);
        let c1 = comms.remove(1);
        drop(comms);
        assert!(matches!(c1.recv(0, 20), Err(Error::Disconnected)));
    }
}
