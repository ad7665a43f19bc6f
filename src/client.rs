//! The key-holding peer of a secure inference.
//!
//! The client generates the key set, supplies its private inputs encrypted,
//! evaluates activations on request and finally decrypts the results. All
//! of it runs on a background thread; [`HeClient::wait_for_results`] blocks
//! until the server has sent the graph outputs.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::activation::coordinator::{ACTIVATION_TENSOR, CANDIDATES_TENSOR};
use crate::activation::{GcMasks, InProcessGarbler, Plain, SecureComputation};
use crate::errors::{HeError, HeResult, ProtocolError};
use crate::kernel::activation::Activation;
use crate::protocol::message::{INPUT_MASK_TENSOR, OUTPUT_MASK_TENSOR, function};
use crate::protocol::{
    DEFAULT_MAX_MESSAGE_SIZE, Function, Message, WireTensor, WireValue, read_message,
    write_message,
};
use crate::scheme::HeScheme;
use crate::tensor::{ElementType, HeTensor};
use crate::value;

/// Decrypted graph outputs, in result order.
pub type Outputs = Vec<(String, Vec<f64>)>;

pub struct HeClient<S: HeScheme> {
    results: Receiver<HeResult<Outputs>>,
    stream: TcpStream,
    worker: Option<JoinHandle<()>>,
    _scheme: PhantomData<fn() -> S>,
}

impl<S: HeScheme> HeClient<S> {
    /// Connects to the server at `address` and serves it in the background.
    ///
    /// `inputs` maps client parameter names to their logical row-major
    /// values.
    pub fn connect(address: SocketAddr, inputs: HashMap<String, Vec<f64>>) -> HeResult<Self> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        let worker_stream = stream.try_clone()?;
        let (tx, rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("he-client".to_string())
            .spawn(move || run::<S>(worker_stream, &inputs, &tx))?;
        info!(%address, "client connected");
        Ok(Self {
            results: rx,
            stream,
            worker: Some(worker),
            _scheme: PhantomData,
        })
    }

    /// Blocks until the server sends the graph outputs.
    pub fn wait_for_results(&self, timeout: Duration) -> HeResult<Outputs> {
        match self.results.recv_timeout(timeout) {
            Ok(outputs) => outputs,
            Err(RecvTimeoutError::Timeout) => Err(ProtocolError::Timeout {
                millis: timeout.as_millis(),
                waiting_for: "results".to_string(),
            }
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(ProtocolError::PeerDisconnected.into()),
        }
    }
}

impl<S: HeScheme> Drop for HeClient<S> {
    fn drop(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("client worker panicked");
            }
        }
    }
}

fn run<S: HeScheme>(
    stream: TcpStream,
    inputs: &HashMap<String, Vec<f64>>,
    results: &Sender<HeResult<Outputs>>,
) {
    let outcome = serve::<S>(stream, inputs);
    if let Err(e) = &outcome {
        debug!(error = %e, "client stopped");
    }
    let _ = results.send(outcome);
}

fn serve<S: HeScheme>(
    mut stream: TcpStream,
    inputs: &HashMap<String, Vec<f64>>,
) -> HeResult<Outputs> {
    let limit = DEFAULT_MAX_MESSAGE_SIZE;
    let hello = read_message(&mut stream, limit)?;
    let params = hello
        .encryption_parameters
        .ok_or_else(|| ProtocolError::malformed("first message carries no parameters"))?;
    let scheme = S::from_parameters(params)?;
    scheme.generate_keys()?;
    let keys = Message::keys(scheme.export_public_key()?, scheme.export_eval_key()?);
    write_message(&mut stream, &keys, limit)?;
    info!("sent keys");

    let peer = Peer {
        scheme: &scheme,
        complex_packing: scheme.parameters().complex_packing(),
    };
    loop {
        let message = read_message(&mut stream, limit)?;
        let reply = match message.function_name() {
            Some(function::PARAMETER) => peer.encrypt_inputs(&message, inputs)?,
            Some(function::RELU | function::BOUNDED_RELU) => peer.activate(&message)?,
            Some(function::MAX_POOL) => peer.max(&message)?,
            Some(function::RESULT) => {
                let outputs = peer.decrypt_results(&message)?;
                info!(outputs = outputs.len(), "received results");
                return Ok(outputs);
            }
            _ => {
                return Err(ProtocolError::UnexpectedMessage {
                    phase: "client".to_string(),
                    message: message.summary(),
                }
                .into());
            }
        };
        write_message(&mut stream, &reply, limit)?;
    }
}

struct Peer<'a, S: HeScheme> {
    scheme: &'a S,
    complex_packing: bool,
}

impl<S: HeScheme> Peer<'_, S> {
    fn encrypt_inputs(
        &self,
        request: &Message,
        inputs: &HashMap<String, Vec<f64>>,
    ) -> HeResult<Message> {
        let tensors = request
            .tensors
            .iter()
            .map(|desc| {
                let values = inputs.get(&desc.name).ok_or_else(|| {
                    HeError::validation(format!("no client input named {}", desc.name))
                })?;
                let mut tensor = HeTensor::<S::Ciphertext>::new_plain(
                    desc.name.clone(),
                    ElementType::F64,
                    desc.shape.clone(),
                    desc.packed,
                    self.complex_packing,
                );
                tensor.write(values)?;
                tensor.encrypt_in_place(self.scheme, true)?;
                let wire = tensor
                    .data()
                    .iter()
                    .map(|v| WireValue::from_value(self.scheme, v))
                    .collect::<HeResult<Vec<_>>>()?;
                let tensor = WireTensor::describe(&desc.name, desc.shape.clone(), desc.packed);
                Ok(tensor.with_values(0, wire))
            })
            .collect::<HeResult<Vec<_>>>()?;
        debug!(tensors = tensors.len(), "sending inputs");
        Ok(Message::response(
            Function::new(function::PARAMETER),
            request.request_id,
            tensors,
        ))
    }

    fn activate(&self, request: &Message) -> HeResult<Message> {
        let function = request
            .function
            .as_ref()
            .ok_or_else(|| ProtocolError::malformed("activation request without function"))?;
        let activation =
            Activation::from_wire(&function.name, function.bound).ok_or_else(|| {
                ProtocolError::malformed(format!("unknown activation {}", function.name))
            })?;
        let tensor = request.tensor(ACTIVATION_TENSOR)?;
        let batch = batch_of(tensor);
        let masked = self.open(tensor, batch)?;
        let masks = read_masks(request)?;
        let outputs = computation(function).activate(activation, &masked, &masks)?;
        let values = self.seal(&outputs)?;
        Ok(Message::response(
            function.clone(),
            request.request_id,
            vec![WireTensor::describe(ACTIVATION_TENSOR, tensor.shape.clone(), tensor.packed)
                .with_values(tensor.offset, values)],
        ))
    }

    fn max(&self, request: &Message) -> HeResult<Message> {
        let function = request
            .function
            .as_ref()
            .ok_or_else(|| ProtocolError::malformed("max request without function"))?;
        let tensor = request.tensor(CANDIDATES_TENSOR)?;
        let candidates = self.open(tensor, batch_of(tensor))?;
        let masks = read_masks(request)?;
        let max = computation(function).max(&candidates, &masks)?;
        let values = self.seal(&[max])?;
        Ok(Message::response(
            function.clone(),
            request.request_id,
            vec![WireTensor::describe(CANDIDATES_TENSOR, tensor.shape.clone(), tensor.packed)
                .with_values(0, values)],
        ))
    }

    /// Decrypts every value of `tensor` to `batch` slot values.
    fn open(&self, tensor: &WireTensor, batch: usize) -> HeResult<Vec<Vec<f64>>> {
        tensor
            .values
            .iter()
            .map(|wire| {
                let value = wire.clone().into_value(self.scheme, self.complex_packing)?;
                Ok(value::to_plaintext(self.scheme, &value, batch)?.expand(batch))
            })
            .collect()
    }

    fn seal(&self, values: &[Vec<f64>]) -> HeResult<Vec<WireValue>> {
        values
            .iter()
            .map(|v| {
                let ct = self.scheme.encrypt(v, self.complex_packing)?;
                Ok(WireValue::Cipher(self.scheme.save_ciphertext(&ct)?))
            })
            .collect()
    }

    fn decrypt_results(&self, message: &Message) -> HeResult<Outputs> {
        message
            .tensors
            .iter()
            .map(|wire| {
                let data = wire
                    .values
                    .iter()
                    .map(|v| v.clone().into_value(self.scheme, self.complex_packing))
                    .collect::<HeResult<Vec<_>>>()?;
                let tensor = HeTensor::from_values(
                    wire.name.clone(),
                    ElementType::F64,
                    wire.shape.clone(),
                    wire.packed,
                    self.complex_packing,
                    data,
                )?;
                Ok((wire.name.clone(), tensor.read(self.scheme)?))
            })
            .collect()
    }
}

fn computation(function: &Function) -> &'static dyn SecureComputation {
    if function.enable_gc { &InProcessGarbler } else { &Plain }
}

fn batch_of(tensor: &WireTensor) -> usize {
    if tensor.packed {
        tensor.shape.first().copied().unwrap_or(1)
    } else {
        1
    }
}

fn read_masks(request: &Message) -> HeResult<GcMasks> {
    let read = |name: &str| -> HeResult<Option<Vec<Vec<f64>>>> {
        let Some(tensor) = request.tensors.iter().find(|t| t.name == name) else {
            return Ok(None);
        };
        tensor
            .values
            .iter()
            .map(|v| match v {
                WireValue::Plain(values) => Ok(values.clone()),
                _ => Err(ProtocolError::malformed(format!("{name} must be plaintext")).into()),
            })
            .collect::<HeResult<Vec<_>>>()
            .map(Some)
    };
    Ok(GcMasks {
        input: read(INPUT_MASK_TENSOR)?,
        output: read(OUTPUT_MASK_TENSOR)?,
    })
}
