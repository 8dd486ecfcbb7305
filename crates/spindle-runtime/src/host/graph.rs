//! Stream capture and graph replay for the host accelerator.
//!
//! A capture starts on an origin stream. Other streams join by waiting on an
//! event recorded inside the capture, and must be joined back into the
//! origin (the origin waits on an event they recorded after their last
//! operation) before the capture ends. Operations are kept in enqueue order,
//! which is a topological order of the fork/join dependencies, and a graph
//! replays them as one operation on the launch stream.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use spindle_core::DeviceError;

use super::event::EventState;
use super::stream::Op;

pub(crate) struct CaptureSession {
    pub(crate) origin: u64,
    nodes: Vec<Op>,
    /// Member stream id → whether it has work not yet joined into the origin.
    members: HashMap<u64, bool>,
    /// Events recorded inside the capture; they forget it when it ends.
    events: Vec<Arc<EventState>>,
}

impl CaptureSession {
    pub(crate) fn new(origin: u64) -> Self {
        let mut members = HashMap::new();
        members.insert(origin, false);
        Self { origin, nodes: Vec::new(), members, events: Vec::new() }
    }

    pub(crate) fn note_event(&mut self, event: &Arc<EventState>, stream: u64) {
        event.mark_captured(Some(stream));
        self.events.push(Arc::clone(event));
    }

    pub(crate) fn is_member(&self, stream: u64) -> bool {
        self.members.contains_key(&stream)
    }

    pub(crate) fn push(&mut self, stream: u64, op: Op) {
        if stream != self.origin {
            self.members.insert(stream, true);
        }
        self.nodes.push(op);
    }

    /// `stream` waits on an event recorded by member `source` inside the capture.
    pub(crate) fn wait(&mut self, stream: u64, source: u64) {
        if !self.members.contains_key(&stream) {
            self.members.insert(stream, false);
        }
        if stream == self.origin {
            if let Some(unjoined) = self.members.get_mut(&source) {
                *unjoined = false;
            }
        }
    }

    pub(crate) fn finish(self, device: usize) -> Result<HostGraph, DeviceError> {
        for event in &self.events {
            event.mark_captured(None);
        }
        if let Some((stream, _)) = self.members.iter().find(|(_, unjoined)| **unjoined) {
            return Err(DeviceError::Capture {
                device,
                msg: format!("stream {stream} was not joined back into the capture origin"),
            });
        }
        Ok(HostGraph { nodes: Arc::new(self.nodes) })
    }
}

/// Instantiated graph of the host accelerator.
#[derive(Clone)]
pub struct HostGraph {
    nodes: Arc<Vec<Op>>,
}

impl HostGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// One operation replaying every node in order.
    pub(crate) fn replay_op(&self) -> Op {
        let nodes = Arc::clone(&self.nodes);
        Arc::new(move || nodes.iter().try_for_each(|node| node()))
    }
}

impl fmt::Debug for HostGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostGraph").field("nodes", &self.nodes.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn push_log(log: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Op {
        let log = Arc::clone(log);
        Arc::new(move || {
            log.lock().push(tag);
            Ok(())
        })
    }

    #[test]
    fn test_fork_join_replay_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut session = CaptureSession::new(1);
        session.wait(2, 1);
        session.push(2, push_log(&log, "copy"));
        session.push(1, push_log(&log, "kernel"));
        session.wait(1, 2);
        let graph = session.finish(0).unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(format!("{graph:?}"), "HostGraph { nodes: 2 }");

        let replay = graph.replay_op();
        replay().unwrap();
        replay().unwrap();
        assert_eq!(*log.lock(), vec!["copy", "kernel", "copy", "kernel"]);
    }

    #[test]
    fn test_unjoined_stream_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut session = CaptureSession::new(1);
        session.wait(2, 1);
        session.push(2, push_log(&log, "copy"));
        let err = session.finish(4).unwrap_err();
        assert!(matches!(err, DeviceError::Capture { device: 4, .. }));
    }
}
