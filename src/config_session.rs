//! Request/acknowledgement handshake for `UBX-CFG-VALSET`.
//!
//! The serial link is shared by two threads: a background listener that reads
//! the port and forwards every `ACK-ACK`/`ACK-NAK` it sees, and the caller,
//! which writes one configuration frame at a time and waits for its answer.
//!
//! ```text
//!   Idle --write frame--> AwaitingAck --ACK / skipped NAK--> Idle
//!                              |
//!                              +--NAK, short write...--> Failed
//! ```
//!
//! Only one request is in flight at any time. Answers are correlated by class
//! and message id; an answer for some other message is logged and dropped.
//! All configuration frames share the same class and id though, so a late
//! answer to an earlier frame would still be taken for the current one.

use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ubx_config::{
    build_config_set_frame, encode_key_value, ConfigRequest, Layers, Registry, UBX_CFG_VALSET,
    UBX_CLASS_CFG,
};
use crate::ubx_frame::FrameParser;
use crate::ubx_messages::{AckRecord, Message};

/// Pause after every exchange so the receiver can digest the new setting.
pub const DEFAULT_INTER_REQUEST_DELAY: Duration = Duration::from_millis(100);

/// Pause after a read error that is not a timeout.
pub(crate) const READ_ERROR_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Persistence layers written by every request
    pub layers: Layers,
    /// Log rejected settings and carry on instead of aborting the run
    pub skip_nak: bool,
    pub inter_request_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            layers: Layers::default(),
            skip_nak: false,
            inter_request_delay: DEFAULT_INTER_REQUEST_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingAck,
    /// Terminal
    Failed,
}

/// What happened to a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// Rejected by the receiver and skipped by policy.
    Skipped,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub applied: Vec<ConfigRequest>,
    pub skipped: Vec<ConfigRequest>,
}

/// Background thread forwarding acknowledgements read from the port.
///
/// The read half is owned by the thread and released when it exits.
#[derive(Debug)]
pub struct AckListener {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AckListener {
    pub fn spawn<R: Read + Send + 'static>(reader: R, acks: Sender<AckRecord>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || listen(reader, acks, &stop_flag));
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// Signals the thread and waits for it to leave its current read.
    ///
    /// Takes up to one read timeout of the underlying port.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("acknowledgement listener panicked");
            }
        }
    }
}

impl Drop for AckListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen<R: Read>(mut reader: R, acks: Sender<AckRecord>, stop: &AtomicBool) {
    let mut parser = FrameParser::new();
    let mut buffer = [0u8; 1024];
    while !stop.load(Ordering::SeqCst) {
        match reader.read(&mut buffer) {
            Ok(0) => thread::sleep(READ_ERROR_BACKOFF),
            Ok(n) => {
                parser.push(&buffer[..n]);
                for frame in parser.by_ref() {
                    match Message::decode(&frame) {
                        Ok(Message::Ack(ack)) => {
                            debug!("received {ack}");
                            if acks.send(ack).is_err() {
                                // nobody is waiting anymore
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(err) => debug!("ignoring frame: {err}"),
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::TimedOut => {}
            Err(err) => {
                debug!("read error: {err}");
                thread::sleep(READ_ERROR_BACKOFF);
            }
        }
    }
    debug!("acknowledgement listener stopped");
}

/// A configuration run over one serial link.
///
/// Dropping the session stops the listener and joins it before the write
/// half is released, so the port is closed once, after the last read.
pub struct ConfigSession<W: Write> {
    writer: W,
    acks: Receiver<AckRecord>,
    listener: AckListener,
    config: SessionConfig,
    state: SessionState,
    report: SessionReport,
}

impl<W: Write> ConfigSession<W> {
    /// Starts the listener on `reader` and returns an idle session.
    ///
    /// `reader` and `writer` are two handles on the same port, e.g. a serial
    /// port and its `try_clone()`.
    pub fn start<R: Read + Send + 'static>(reader: R, writer: W, config: SessionConfig) -> Self {
        let (tx, acks) = mpsc::channel();
        Self {
            writer,
            acks,
            listener: AckListener::spawn(reader, tx),
            config,
            state: SessionState::Idle,
            report: SessionReport::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Requests processed so far.
    pub fn report(&self) -> &SessionReport {
        &self.report
    }

    /// Sends every request in order, stopping at the first failure.
    pub fn run(&mut self, requests: &[ConfigRequest], registry: &Registry) -> Result<SessionReport> {
        for request in requests {
            self.apply(request, registry)?;
        }
        Ok(self.report.clone())
    }

    /// Sends one request and waits for its answer.
    pub fn apply(&mut self, request: &ConfigRequest, registry: &Registry) -> Result<Outcome> {
        if self.state == SessionState::Failed {
            return Err(Error::SessionFailed);
        }
        match self.exchange(request, registry) {
            Ok(outcome) => {
                self.state = SessionState::Idle;
                match outcome {
                    Outcome::Applied => self.report.applied.push(request.clone()),
                    Outcome::Skipped => self.report.skipped.push(request.clone()),
                }
                thread::sleep(self.config.inter_request_delay);
                Ok(outcome)
            }
            Err(err) => {
                self.state = SessionState::Failed;
                Err(err)
            }
        }
    }

    fn exchange(&mut self, request: &ConfigRequest, registry: &Registry) -> Result<Outcome> {
        let pair = encode_key_value(&request.key, request.value, registry)?;
        let frame = build_config_set_frame(&pair, self.config.layers);
        let (class, id) = (UBX_CLASS_CFG, UBX_CFG_VALSET);

        debug!("sending {} bytes for {}", frame.len(), request.key);
        let sent = self.writer.write(&frame)?;
        if sent != frame.len() {
            return Err(Error::ShortWrite {
                expected: frame.len(),
                sent,
            });
        }
        self.writer.flush()?;
        self.state = SessionState::AwaitingAck;

        loop {
            // no timeout here, the listener's reads are bounded by the port
            let response = self.acks.recv().map_err(|_| Error::ReceiverStopped)?;
            if response.acknowledges(class, id) {
                info!("{} set to {}", request.key, request.value);
                return Ok(Outcome::Applied);
            }
            if !response.concerns(class, id) {
                warn!("ignoring unrelated {response}, waiting for clsID={class:#04x}, msgID={id:#04x}");
                continue;
            }
            if self.config.skip_nak {
                warn!("received NAK, failed to set {} to {}", request.key, request.value);
                return Ok(Outcome::Skipped);
            }
            return Err(Error::ConfigurationFailed {
                key: request.key.clone(),
                value: request.value,
                response: response.to_string(),
                class,
                id,
            });
        }
    }

    /// Stops and joins the listener. Idempotent.
    pub fn shutdown(&mut self) {
        self.listener.stop();
    }
}

impl<W: Write> Drop for ConfigSession<W> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
