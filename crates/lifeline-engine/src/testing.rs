//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use lifeline_core::{ConnectionId, IdentityKey, TransportError, UserId};
use parking_lot::Mutex;

use crate::registry::ConnectionInfo;
use crate::transport::{Frame, Transport};

/// How a [`FakeTransport`] answers probes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProbeScript {
    /// Always answer.
    Answer,
    /// Answer the first `n` probes, then never answer again.
    AnswerThenHang(u32),
    /// Never answer.
    Hang,
    /// Fail with a transport error.
    Fail,
    /// Panic inside the probe.
    Panic,
}

pub(crate) struct FakeTransport {
    script: Mutex<ProbeScript>,
    pub probes: AtomicU32,
    pub closes: AtomicU32,
    pub sent: Mutex<Vec<Frame>>,
    fail_close: bool,
}

impl FakeTransport {
    pub(crate) fn new(script: ProbeScript) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            probes: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            fail_close: false,
        })
    }

    pub(crate) fn failing_close() -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(ProbeScript::Answer),
            probes: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            sent: Mutex::new(Vec::new()),
            fail_close: true,
        })
    }

    pub(crate) fn set_script(&self, script: ProbeScript) {
        *self.script.lock() = script;
    }

    pub(crate) fn probe_count(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst);
        let script = *self.script.lock();
        match script {
            ProbeScript::Answer => Ok(()),
            ProbeScript::AnswerThenHang(limit) if n < limit => Ok(()),
            ProbeScript::AnswerThenHang(_) | ProbeScript::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
            ProbeScript::Fail => Err(TransportError::Send("connection reset".into())),
            ProbeScript::Panic => panic!("probe exploded"),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let _ = self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

pub(crate) fn info_with(id: &str, user: &str, transport: Arc<dyn Transport>) -> ConnectionInfo {
    ConnectionInfo::with_id(
        ConnectionId::from(id),
        UserId::from(user),
        IdentityKey::from(format!("session-{id}")),
        transport,
    )
}

pub(crate) fn info(id: &str, user: &str) -> ConnectionInfo {
    info_with(id, user, FakeTransport::new(ProbeScript::Answer))
}
