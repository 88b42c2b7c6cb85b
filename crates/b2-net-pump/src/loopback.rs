use std::time::Duration;

use crate::redirect::RedirectRule;
use crate::stack::{FrameSink, PollSet, StackError, UserNetStack};

/// How long an idle loopback stack lets the pump sleep between iterations.
const IDLE_WAIT: Duration = Duration::from_millis(10);

/// A [`UserNetStack`] that re-emits every ingested frame unchanged.
///
/// Owns no descriptors. Useful for diagnostics and for exercising the NAT channel plumbing
/// without a real TCP/IP stack.
#[derive(Debug, Default, Clone)]
pub struct LoopbackStack {
    redirects: Vec<RedirectRule>,
    frames: u64,
}

impl LoopbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn redirects(&self) -> &[RedirectRule] {
        &self.redirects
    }

    /// Frames reflected so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl UserNetStack for LoopbackStack {
    fn add_redirect(&mut self, rule: &RedirectRule) -> Result<(), StackError> {
        tracing::debug!(%rule, "loopback stack accepted host forwarding rule");
        self.redirects.push(*rule);
        Ok(())
    }

    fn input(&mut self, frame: &[u8], out: &mut dyn FrameSink) {
        self.frames += 1;
        out.emit(frame);
    }

    fn fill_poll_set(&mut self, _set: &mut PollSet) -> Duration {
        IDLE_WAIT
    }

    fn poll_complete(&mut self, _set: &PollSet, _out: &mut dyn FrameSink) {}
}
