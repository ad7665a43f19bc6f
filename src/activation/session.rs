//! Server end of the client connection.
//!
//! A worker thread accepts one client, sends it the encryption parameters,
//! and then reads messages until the connection closes. Key and input
//! messages are forwarded as setup events; activation replies are routed to
//! the one-shot channel registered under their request id.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::errors::{HeError, HeResult, ProtocolError};
use crate::protocol::message::function;
use crate::protocol::{Function, Message, MessageKind, WireTensor, read_message, write_message};
use crate::scheme::EncryptionParameters;

const ACCEPT_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Listening,
    Accepted,
    KeyExchanged,
    ShapeSent,
    ActivationRound,
    ResultsSent,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

enum SetupEvent {
    Keys { public_key: Vec<u8>, eval_key: Vec<u8> },
    ClientInputs(Message),
    Failed(ProtocolError),
}

type Reply = HeResult<Message>;

struct Shared {
    phase: Mutex<SessionPhase>,
    writer: Mutex<Option<TcpStream>>,
    pending: Mutex<HashMap<u64, Sender<Reply>>>,
    shutdown: AtomicBool,
    max_message_size: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn phase(&self) -> SessionPhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: SessionPhase) {
        let mut current = lock(&self.phase);
        if *current != phase {
            info!(from = %*current, to = %phase, "session phase");
            *current = phase;
        }
    }

    fn send(&self, message: &Message) -> HeResult<()> {
        let mut writer = lock(&self.writer);
        let stream = writer.as_mut().ok_or(ProtocolError::PeerDisconnected)?;
        write_message(stream, message, self.max_message_size)
    }

    /// Fails every waiting request and closes the session. Later sends
    /// find no writer.
    fn fail_pending(&self, error: &ProtocolError) {
        let mut pending = lock(&self.pending);
        for (request_id, reply) in pending.drain() {
            debug!(request_id, %error, "failing pending request");
            let _ = reply.send(Err(error.clone().into()));
        }
        *lock(&self.writer) = None;
        self.set_phase(SessionPhase::Closed);
    }
}

/// The listening side of a secure-activation session.
pub struct ServerSession {
    local_addr: SocketAddr,
    shared: Arc<Shared>,
    events: Mutex<Receiver<SetupEvent>>,
    next_request_id: AtomicU64,
    worker: Option<JoinHandle<()>>,
}

impl ServerSession {
    /// Binds `address` and waits for a client in the background.
    pub fn start(
        address: SocketAddr,
        params: EncryptionParameters,
        max_message_size: u64,
    ) -> HeResult<Self> {
        let listener = TcpListener::bind(address)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let shared = Arc::new(Shared {
            phase: Mutex::new(SessionPhase::Listening),
            writer: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            max_message_size,
        });
        let (events_tx, events_rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("he-session".to_string())
            .spawn(move || run(listener, &worker_shared, params, &events_tx))?;
        info!(%local_addr, "listening for client");
        Ok(Self {
            local_addr,
            shared,
            events: Mutex::new(events_rx),
            next_request_id: AtomicU64::new(1),
            worker: Some(worker),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    fn next_event(&self, timeout: Duration, waiting_for: &str) -> HeResult<SetupEvent> {
        match lock(&self.events).recv_timeout(timeout) {
            Ok(SetupEvent::Failed(error)) => Err(error.into()),
            Ok(event) => Ok(event),
            Err(RecvTimeoutError::Timeout) => Err(ProtocolError::Timeout {
                millis: timeout.as_millis(),
                waiting_for: waiting_for.to_string(),
            }
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(ProtocolError::PeerDisconnected.into()),
        }
    }

    /// Blocks until the client's public and evaluation keys arrive.
    pub fn wait_for_keys(&self, timeout: Duration) -> HeResult<(Vec<u8>, Vec<u8>)> {
        match self.next_event(timeout, "client keys")? {
            SetupEvent::Keys { public_key, eval_key } => Ok((public_key, eval_key)),
            _ => Err(self.unexpected("client inputs before keys")),
        }
    }

    /// Describes the tensors the client has to provide.
    pub fn send_inference_shape(&self, tensors: Vec<WireTensor>) -> HeResult<()> {
        let phase = self.phase();
        if phase < SessionPhase::KeyExchanged {
            return Err(ProtocolError::MissingKeys.into());
        }
        if phase == SessionPhase::Closed {
            return Err(ProtocolError::PeerDisconnected.into());
        }
        if phase != SessionPhase::KeyExchanged {
            return Err(self.unexpected("second inference shape"));
        }
        self.shared.set_phase(SessionPhase::ShapeSent);
        let request = Message::request(Function::new(function::PARAMETER), 0, tensors);
        self.shared.send(&request)
    }

    /// Blocks until the client answers the inference shape.
    pub fn wait_for_client_inputs(&self, timeout: Duration) -> HeResult<Message> {
        match self.next_event(timeout, "client inputs")? {
            SetupEvent::ClientInputs(message) => Ok(message),
            _ => Err(self.unexpected("keys after key exchange")),
        }
    }

    /// Sends an activation request and registers its reply channel.
    pub fn send_request(
        &self,
        function: Function,
        tensors: Vec<WireTensor>,
    ) -> HeResult<(u64, Receiver<Reply>)> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel();
        {
            let mut pending = lock(&self.shared.pending);
            match self.phase() {
                SessionPhase::Listening | SessionPhase::Accepted => {
                    return Err(ProtocolError::MissingKeys.into());
                }
                SessionPhase::Closed => return Err(ProtocolError::PeerDisconnected.into()),
                _ => {}
            }
            pending.insert(request_id, tx);
            // Under the pending lock so a concurrent close cannot be undone.
            self.shared.set_phase(SessionPhase::ActivationRound);
        }
        let request = Message::request(function, request_id, tensors);
        if let Err(e) = self.shared.send(&request) {
            lock(&self.shared.pending).remove(&request_id);
            return Err(e);
        }
        trace!(request_id, "request sent");
        Ok((request_id, rx))
    }

    /// Waits for the reply to `request_id`.
    pub fn wait_reply(
        &self,
        request_id: u64,
        reply: &Receiver<Reply>,
        timeout: Duration,
    ) -> HeResult<Message> {
        match reply.recv_timeout(timeout) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.shared.pending).remove(&request_id);
                Err(ProtocolError::Timeout {
                    millis: timeout.as_millis(),
                    waiting_for: format!("reply to request {request_id}"),
                }
                .into())
            }
            Err(RecvTimeoutError::Disconnected) => Err(ProtocolError::PeerDisconnected.into()),
        }
    }

    /// Sends the graph outputs and ends the inference.
    pub fn send_results(&self, tensors: Vec<WireTensor>) -> HeResult<()> {
        let phase = self.phase();
        if phase < SessionPhase::ShapeSent || phase == SessionPhase::Closed {
            return Err(self.unexpected("results"));
        }
        self.shared
            .send(&Message::request(Function::new(function::RESULT), 0, tensors))?;
        self.shared.set_phase(SessionPhase::ResultsSent);
        Ok(())
    }

    fn unexpected(&self, message: &str) -> HeError {
        ProtocolError::UnexpectedMessage {
            phase: self.phase().to_string(),
            message: message.to_string(),
        }
        .into()
    }
}

impl Drop for ServerSession {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        if let Some(stream) = lock(&self.shared.writer).as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("session worker panicked");
            }
        }
        debug!(local_addr = %self.local_addr, "session torn down");
    }
}

fn run(
    listener: TcpListener,
    shared: &Shared,
    params: EncryptionParameters,
    events: &Sender<SetupEvent>,
) {
    let error = match accept(&listener, shared) {
        Ok(Some(stream)) => match serve(stream, shared, params, events) {
            Ok(()) => ProtocolError::PeerDisconnected,
            Err(HeError::Protocol { source }) => source,
            Err(e) => {
                debug!(error = %e, "session reader stopped");
                ProtocolError::PeerDisconnected
            }
        },
        Ok(None) => ProtocolError::PeerDisconnected,
        Err(e) => {
            warn!(error = %e, "accept failed");
            ProtocolError::PeerDisconnected
        }
    };
    shared.fail_pending(&error);
    let _ = events.send(SetupEvent::Failed(error));
}

/// Polls for a client until one connects or the session is dropped.
fn accept(listener: &TcpListener, shared: &Shared) -> HeResult<Option<TcpStream>> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                info!(%peer, "client connected");
                return Ok(Some(stream));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => return Err(e.into()),
        }
    }
}

fn serve(
    stream: TcpStream,
    shared: &Shared,
    params: EncryptionParameters,
    events: &Sender<SetupEvent>,
) -> HeResult<()> {
    let mut reader = stream.try_clone()?;
    *lock(&shared.writer) = Some(stream);
    if shared.shutdown.load(Ordering::SeqCst) {
        return Ok(());
    }
    shared.set_phase(SessionPhase::Accepted);
    shared.send(&Message::parameters(params))?;
    loop {
        let message = read_message(&mut reader, shared.max_message_size)?;
        dispatch(shared, events, message)?;
    }
}

fn dispatch(shared: &Shared, events: &Sender<SetupEvent>, message: Message) -> HeResult<()> {
    let phase = shared.phase();
    let unexpected = |message: &Message| -> HeError {
        ProtocolError::UnexpectedMessage {
            phase: phase.to_string(),
            message: message.summary(),
        }
        .into()
    };
    if message.is_keys() {
        if phase != SessionPhase::Accepted {
            return Err(unexpected(&message));
        }
        let (Some(public_key), Some(eval_key)) = (message.public_key, message.eval_key) else {
            return Err(ProtocolError::malformed("keys message without eval key").into());
        };
        shared.set_phase(SessionPhase::KeyExchanged);
        let _ = events.send(SetupEvent::Keys { public_key, eval_key });
        return Ok(());
    }
    if message.kind != MessageKind::Response {
        return Err(unexpected(&message));
    }
    match (phase, message.function_name()) {
        (SessionPhase::ShapeSent, Some(function::PARAMETER)) => {
            let _ = events.send(SetupEvent::ClientInputs(message));
            Ok(())
        }
        (SessionPhase::ActivationRound, Some(_)) => {
            let request_id = message.request_id;
            match lock(&shared.pending).remove(&request_id) {
                Some(reply) => {
                    trace!(request_id, "reply routed");
                    let _ = reply.send(Ok(message));
                }
                None => warn!(request_id, "reply to unknown or expired request"),
            }
            Ok(())
        }
        _ => Err(unexpected(&message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn start() -> ServerSession {
        let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        ServerSession::start(address, EncryptionParameters::default(), 1 << 20).unwrap()
    }

    fn connect(session: &ServerSession) -> TcpStream {
        let mut stream = TcpStream::connect(session.local_addr()).unwrap();
        let hello = read_message(&mut stream, 1 << 20).unwrap();
        assert!(hello.encryption_parameters.is_some());
        stream
    }

    #[test]
    fn requests_need_keys() {
        let session = start();
        assert_eq!(session.phase(), SessionPhase::Listening);
        let err = session
            .send_request(Function::new(function::RELU), Vec::new())
            .unwrap_err();
        assert!(matches!(
            err,
            HeError::Protocol {
                source: ProtocolError::MissingKeys
            }
        ));
    }

    #[test]
    fn keys_then_reply_routing() {
        let session = start();
        let mut client = connect(&session);
        write_message(&mut client, &Message::keys(vec![1], vec![2]), 1 << 20).unwrap();
        let (pk, ek) = session.wait_for_keys(Duration::from_secs(5)).unwrap();
        assert_eq!((pk, ek), (vec![1], vec![2]));

        let (id, rx) = session
            .send_request(Function::new(function::RELU), Vec::new())
            .unwrap();
        let request = read_message(&mut client, 1 << 20).unwrap();
        assert_eq!(request.request_id, id);
        let reply = Message::response(Function::new(function::RELU), id, Vec::new());
        write_message(&mut client, &reply, 1 << 20).unwrap();
        let got = session.wait_reply(id, &rx, Duration::from_secs(5)).unwrap();
        assert_eq!(got.request_id, id);
    }

    #[test]
    fn silent_client_times_out() {
        let session = start();
        let _client = connect(&session);
        let err = session.wait_for_keys(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(
            err,
            HeError::Protocol {
                source: ProtocolError::Timeout { .. }
            }
        ));
    }

    #[test]
    fn disconnect_fails_pending_requests() {
        let session = start();
        let mut client = connect(&session);
        write_message(&mut client, &Message::keys(vec![1], vec![2]), 1 << 20).unwrap();
        session.wait_for_keys(Duration::from_secs(5)).unwrap();
        let (id, rx) = session
            .send_request(Function::new(function::RELU), Vec::new())
            .unwrap();
        drop(client);
        let err = session.wait_reply(id, &rx, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(
            err,
            HeError::Protocol {
                source: ProtocolError::PeerDisconnected
            }
        ));
    }

    #[test]
    fn requests_after_a_disconnect_fail_fast() {
        let session = start();
        let mut client = connect(&session);
        write_message(&mut client, &Message::keys(vec![1], vec![2]), 1 << 20).unwrap();
        session.wait_for_keys(Duration::from_secs(5)).unwrap();
        let (id, rx) = session
            .send_request(Function::new(function::RELU), Vec::new())
            .unwrap();
        drop(client);
        assert!(session.wait_reply(id, &rx, Duration::from_secs(5)).is_err());

        for _ in 0..3 {
            let err = session
                .send_request(Function::new(function::RELU), Vec::new())
                .unwrap_err();
            assert!(matches!(
                err,
                HeError::Protocol {
                    source: ProtocolError::PeerDisconnected
                }
            ));
            assert_eq!(session.phase(), SessionPhase::Closed);
        }
        assert!(lock(&session.shared.writer).is_none());
        assert!(lock(&session.shared.pending).is_empty());
    }

    #[test]
    fn out_of_order_message_closes_session() {
        let session = start();
        let mut client = connect(&session);
        let early = Message::response(Function::new(function::RELU), 9, Vec::new());
        write_message(&mut client, &early, 1 << 20).unwrap();
        let err = session.wait_for_keys(Duration::from_secs(5)).unwrap_err();
        assert!(matches!(
            err,
            HeError::Protocol {
                source: ProtocolError::UnexpectedMessage { .. }
            }
        ));
    }
}
