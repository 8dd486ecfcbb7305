//! Host streams: in-order queues drained by one worker thread each.
//!
//! Failures are sticky. Once an operation fails, later operations on the
//! stream are skipped while event signals and waits still run, so streams
//! waiting on this one never deadlock. The next synchronize reports the
//! first failure.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use spindle_core::DeviceError;

use super::event::EventState;

/// Unit of enqueued work. `Fn` so captured graphs can replay it.
pub(crate) type Op = Arc<dyn Fn() -> Result<(), DeviceError> + Send + Sync>;

pub(crate) enum Command {
    Op(Op),
    Signal(Arc<EventState>, u64),
    Wait(Arc<EventState>, u64),
    Fence(Sender<()>),
}

/// Stream handle of the host accelerator. Dropping it drains the queue and
/// joins the worker.
pub struct HostStream {
    pub(crate) id: u64,
    label: String,
    device: usize,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    error: Arc<Mutex<Option<DeviceError>>>,
}

impl HostStream {
    pub(crate) fn spawn(device: usize, id: u64, label: &str) -> Result<Self, DeviceError> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let error = Arc::new(Mutex::new(None));
        let sticky = Arc::clone(&error);
        let worker = std::thread::Builder::new()
            .name(format!("spindle-dev{device}-{label}"))
            .spawn(move || drain(device, receiver, sticky))
            .map_err(|e| DeviceError::Init { device, msg: format!("cannot spawn stream '{label}': {e}") })?;
        Ok(Self {
            id,
            label: label.to_string(),
            device,
            sender: Some(sender),
            worker: Some(worker),
            error,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn send(&self, cmd: Command) -> Result<(), DeviceError> {
        let sent = match &self.sender {
            Some(sender) => sender.send(cmd).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            Err(DeviceError::Sync {
                device: self.device,
                msg: format!("stream '{}' is no longer running", self.label),
            })
        }
    }

    /// Block until every queued command has run, then report the sticky error.
    pub(crate) fn synchronize(&self) -> Result<(), DeviceError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.send(Command::Fence(tx))?;
        rx.recv().map_err(|_| DeviceError::Sync {
            device: self.device,
            msg: format!("stream '{}' worker exited", self.label),
        })?;
        match self.error.lock().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("stream '{}' worker panicked", self.label);
            }
        }
    }
}

fn drain(device: usize, receiver: Receiver<Command>, error: Arc<Mutex<Option<DeviceError>>>) {
    for cmd in receiver {
        match cmd {
            Command::Op(op) => {
                if error.lock().is_some() {
                    continue;
                }
                let outcome = catch_unwind(AssertUnwindSafe(|| op())).unwrap_or_else(|panic| {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "operation panicked".to_string());
                    Err(DeviceError::Launch { device, kernel: "<panic>".into(), msg })
                });
                if let Err(err) = outcome {
                    tracing::error!("{}", err);
                    *error.lock() = Some(err);
                }
            }
            Command::Signal(event, gen) => event.complete(gen),
            Command::Wait(event, gen) => event.wait_for(gen),
            Command::Fence(done) => {
                let _ = done.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn op(f: impl Fn() -> Result<(), DeviceError> + Send + Sync + 'static) -> Command {
        Command::Op(Arc::new(f))
    }

    #[test]
    fn test_in_order_execution() {
        let stream = HostStream::spawn(0, 1, "compute").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream
                .send(op(move || {
                    log.lock().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_sticky_error_skips_ops_but_signals() {
        let stream = HostStream::spawn(2, 1, "compute").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let event = Arc::new(EventState::default());

        stream
            .send(op(|| Err(DeviceError::Launch { device: 2, kernel: "k".into(), msg: "boom".into() })))
            .unwrap();
        let counter = Arc::clone(&ran);
        stream
            .send(op(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
        let gen = event.next_generation();
        stream.send(Command::Signal(Arc::clone(&event), gen)).unwrap();

        let err = stream.synchronize().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        event.wait_for(gen);
        // Sticky: reported again.
        assert!(stream.synchronize().is_err());
    }

    #[test]
    fn test_panic_becomes_error() {
        let stream = HostStream::spawn(0, 1, "compute").unwrap();
        stream.send(op(|| panic!("index out of bounds"))).unwrap();
        let err = stream.synchronize().unwrap_err();
        assert!(matches!(err, DeviceError::Launch { .. }));
        assert!(err.to_string().contains("index out of bounds"));
    }

    #[test]
    fn test_concurrent_senders() {
        fn assert_send_sync<S: Send + Sync>() {}
        assert_send_sync::<HostStream>();

        let stream = HostStream::spawn(0, 1, "compute").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            for _ in 0..4 {
                let (stream, ran) = (&stream, Arc::clone(&ran));
                scope.spawn(move || {
                    for _ in 0..25 {
                        let ran = Arc::clone(&ran);
                        stream
                            .send(op(move || {
                                ran.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }))
                            .unwrap();
                    }
                });
            }
        });
        stream.synchronize().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_cross_stream_wait() {
        let a = HostStream::spawn(0, 1, "transfer").unwrap();
        let b = HostStream::spawn(0, 2, "compute").unwrap();
        let event = Arc::new(EventState::default());
        let value = Arc::new(AtomicUsize::new(0));

        let gen = event.next_generation();
        b.send(Command::Wait(Arc::clone(&event), gen)).unwrap();
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let (v, s) = (Arc::clone(&value), Arc::clone(&seen));
        b.send(op(move || {
            s.store(v.load(Ordering::SeqCst), Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();

        let v = Arc::clone(&value);
        a.send(op(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            v.store(7, Ordering::SeqCst);
            Ok(())
        }))
        .unwrap();
        a.send(Command::Signal(Arc::clone(&event), gen)).unwrap();

        b.synchronize().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }
}
