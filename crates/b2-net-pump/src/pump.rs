use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use b2_net_backend::{decode_record, FrameBuf, NatPumpChannels, MAX_FRAME_SIZE, MAX_RECORD_LEN};
use thiserror::Error;

use crate::redirect::RedirectRule;
use crate::stack::{FrameSink, Interest, PollSet, StackError, UserNetStack};

/// Longest the pump blocks in `poll(2)`, whatever the stack asks for. Bounds how long
/// [`NatPump::stop`] waits for the thread to notice cancellation.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum PumpError {
    #[error(transparent)]
    Stack(#[from] StackError),

    #[error("failed to configure NAT input channel: {0}")]
    Channel(#[source] io::Error),

    #[error("failed to spawn NAT pump thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Snapshot of [`NatPump`] counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// Guest frames handed to the stack.
    pub frames_in: u64,
    /// Stack output delivered to the device.
    pub frames_out: u64,
    /// Stack output dropped because the device side was full or gone.
    pub frames_dropped: u64,
    /// Guest records rejected as malformed and dropped.
    pub corrupt_records: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    frames_dropped: AtomicU64,
    corrupt_records: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PumpStats {
        PumpStats {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            corrupt_records: self.corrupt_records.load(Ordering::Relaxed),
        }
    }
}

/// Background thread moving frames between the device's NAT channels and a [`UserNetStack`].
#[derive(Debug)]
pub struct NatPump {
    cancel: Arc<AtomicBool>,
    counters: Arc<Counters>,
    thread: Option<JoinHandle<()>>,
}

impl NatPump {
    /// Initialize `stack`, install `rules` and start the pump thread.
    ///
    /// Each rule is installed exactly once, before the first iteration. A rule the stack
    /// rejects is reported through `on_warning` and skipped. If initialization fails, the stack
    /// and the channels are dropped before returning.
    pub fn spawn<S>(
        stack: S,
        rules: &[RedirectRule],
        channels: NatPumpChannels,
        on_warning: &mut dyn FnMut(&StackError),
    ) -> Result<Self, PumpError>
    where
        S: UserNetStack + 'static,
    {
        Self::spawn_with_max_wait(stack, rules, channels, DEFAULT_MAX_WAIT, on_warning)
    }

    pub fn spawn_with_max_wait<S>(
        mut stack: S,
        rules: &[RedirectRule],
        channels: NatPumpChannels,
        max_wait: Duration,
        on_warning: &mut dyn FnMut(&StackError),
    ) -> Result<Self, PumpError>
    where
        S: UserNetStack + 'static,
    {
        stack.init()?;

        for rule in rules {
            match stack.add_redirect(rule) {
                Ok(()) => tracing::info!(%rule, "installed host forwarding rule"),
                Err(err) => {
                    tracing::warn!("{err}");
                    on_warning(&err);
                }
            }
        }

        channels
            .from_guest
            .set_nonblocking(true)
            .map_err(PumpError::Channel)?;

        let cancel = Arc::new(AtomicBool::new(false));
        let counters = Arc::new(Counters::default());
        let worker = Worker {
            stack,
            channels,
            cancel: Arc::clone(&cancel),
            counters: Arc::clone(&counters),
            max_wait,
            input_open: true,
            record: vec![0; MAX_RECORD_LEN],
            buf: FrameBuf::new(),
            poll_set: PollSet::new(),
        };

        let thread = thread::Builder::new()
            .name("b2-nat-pump".to_string())
            .spawn(move || worker.run())
            .map_err(PumpError::Spawn)?;

        Ok(Self {
            cancel,
            counters,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    /// Signal the thread and wait for it to exit. Safe to call more than once.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("NAT pump thread panicked");
            }
        }
    }
}

impl Drop for NatPump {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<S> {
    stack: S,
    channels: NatPumpChannels,
    cancel: Arc<AtomicBool>,
    counters: Arc<Counters>,
    max_wait: Duration,
    /// Cleared when the input channel fails for good.
    input_open: bool,
    record: Vec<u8>,
    buf: FrameBuf,
    poll_set: PollSet,
}

impl<S: UserNetStack> Worker<S> {
    fn run(mut self) {
        tracing::debug!("NAT pump started");
        while !self.cancel.load(Ordering::Acquire) {
            self.drain_guest_input();
            self.service_stack();
        }
        tracing::debug!("NAT pump stopped");
    }

    /// Feed at most one pending guest frame to the stack.
    fn drain_guest_input(&mut self) {
        if !self.input_open {
            return;
        }
        let n = match self.channels.from_guest.recv(&mut self.record) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return,
            Err(err) => {
                tracing::error!("NAT input channel read failed, closing it: {err}");
                self.input_open = false;
                return;
            }
        };

        match decode_record(&self.record[..n], &mut self.buf) {
            Ok(()) => {
                self.counters.frames_in.fetch_add(1, Ordering::Relaxed);
                let mut sink = DeviceSink {
                    socket: &self.channels.to_guest,
                    counters: &self.counters,
                };
                self.stack.input(self.buf.as_slice(), &mut sink);
            }
            Err(err) => {
                self.counters
                    .corrupt_records
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!("dropping malformed NAT input record: {err}");
            }
        }
    }

    fn service_stack(&mut self) {
        self.poll_set.clear();
        let wanted = self.stack.fill_poll_set(&mut self.poll_set);
        // Registered after the stack's entries so its tokens are unaffected; wakes the pump as
        // soon as the guest sends.
        if self.input_open {
            self.poll_set
                .register(self.channels.from_guest.as_raw_fd(), Interest::READABLE);
        }

        let timeout = wanted.min(self.max_wait);
        if let Err(err) = self.poll_set.poll(timeout) {
            tracing::warn!("NAT pump poll failed: {err}");
            thread::sleep(timeout);
            return;
        }

        let mut sink = DeviceSink {
            socket: &self.channels.to_guest,
            counters: &self.counters,
        };
        self.stack.poll_complete(&self.poll_set, &mut sink);
    }
}

/// Writes stack output to the device, one frame per datagram. Never blocks.
struct DeviceSink<'a> {
    socket: &'a UnixDatagram,
    counters: &'a Counters,
}

impl FrameSink for DeviceSink<'_> {
    fn emit(&mut self, frame: &[u8]) {
        if frame.len() > MAX_FRAME_SIZE {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(len = frame.len(), "dropping oversized NAT output frame");
            return;
        }
        match self.socket.send(frame) {
            Ok(_) => {
                self.counters.frames_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping NAT output frame: {err}");
            }
        }
    }
}
