//! Server side of the secure activation protocol.

use tracing::{debug, instrument, trace};

use super::mask::GcMasks;
use super::session::ServerSession;
use crate::config::ExecutorConfig;
use crate::errors::{HeError, HeResult, ProtocolError};
use crate::kernel::activation::Activation;
use crate::kernel::arith::scalar_subtract;
use crate::kernel::pool::{PoolParams, max_plain, pool_windows};
use crate::precision::match_to_smallest_chain_index;
use crate::protocol::message::{INPUT_MASK_TENSOR, OUTPUT_MASK_TENSOR, function};
use crate::protocol::{Function, Message, WireTensor, WireValue};
use crate::scheme::HeScheme;
use crate::shape::{Shape, shape_size};
use crate::value::{CipherInner, HePlaintext, HeValue};

/// Name of the data tensor in activation requests and replies.
pub const ACTIVATION_TENSOR: &str = "activation";
/// Name of the data tensor in max-pool requests and replies.
pub const CANDIDATES_TENSOR: &str = "candidates";

/// Ships encrypted elements to the client and puts the answers back.
pub struct ActivationCoordinator<'a, S: HeScheme> {
    scheme: &'a S,
    session: &'a ServerSession,
    config: &'a ExecutorConfig,
}

/// Elements that have to leave the server, in issue order.
struct Issued<C> {
    /// Issued position to element index.
    index: Vec<usize>,
    ciphertexts: Vec<C>,
}

impl<'a, S: HeScheme> ActivationCoordinator<'a, S> {
    pub fn new(scheme: &'a S, session: &'a ServerSession, config: &'a ExecutorConfig) -> Self {
        Self {
            scheme,
            session,
            config,
        }
    }

    fn masking(&self) -> (bool, bool) {
        let gc = self.config.enable_gc;
        (gc && self.config.mask_gc_inputs, gc && self.config.mask_gc_outputs)
    }

    fn function(&self, name: &str, bound: Option<f64>) -> Function {
        Function::new(name)
            .with_bound(bound)
            .with_gc(self.config.enable_gc)
    }

    /// Applies `activation` to every element with the client's help.
    ///
    /// Plaintext and known elements never leave the server.
    #[instrument(skip_all, fields(activation = activation.name(), elements = input.len()))]
    pub fn activate(
        &self,
        input: &[HeValue<S::Ciphertext>],
        activation: Activation,
        batch_size: usize,
    ) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
        let cp = input.first().is_some_and(HeValue::complex_packing);
        let mut values = input.to_vec();
        match_to_smallest_chain_index(self.scheme, &mut values)?;

        let mut out: Vec<Option<HeValue<S::Ciphertext>>> = vec![None; values.len()];
        let mut issued = Issued {
            index: Vec::new(),
            ciphertexts: Vec::new(),
        };
        for (idx, v) in values.into_iter().enumerate() {
            match v {
                HeValue::Plaintext(p) => {
                    out[idx] = Some(HeValue::Plaintext(activation.apply_plain(&p)));
                }
                HeValue::Ciphertext(c) => match c.into_inner() {
                    CipherInner::Known(k) => {
                        out[idx] = Some(HeValue::known(activation.apply(k), cp));
                    }
                    CipherInner::Encrypted(mut ct) => {
                        self.scheme.mod_switch_to(&mut ct, 0)?;
                        issued.index.push(idx);
                        issued.ciphertexts.push(ct);
                    }
                },
            }
        }
        if issued.index.is_empty() {
            debug!("nothing to send");
            return collect(out);
        }

        let (mask_in, mask_out) = self.masking();
        let count = issued.index.len();
        let masks = GcMasks::sample(count, batch_size, mask_in, mask_out, &mut rand::rng())?;
        let function = self.function(activation.name(), activation.bound());
        let shape = vec![batch_size, count];

        let mut inflight = Vec::new();
        let max_batch = self.config.max_activation_batch.max(1);
        for (chunk_idx, chunk) in issued.ciphertexts.chunks(max_batch).enumerate() {
            let start = chunk_idx * max_batch;
            let batch_masks = masks.window(start, chunk.len());
            let data = chunk
                .iter()
                .enumerate()
                .map(|(k, ct)| {
                    let masked = match batch_masks.input_at(k) {
                        Some(mask) => self.scheme.add_plain(ct, mask, cp)?,
                        None => ct.clone(),
                    };
                    Ok(WireValue::Cipher(self.scheme.save_ciphertext(&masked)?))
                })
                .collect::<HeResult<Vec<_>>>()?;
            let activations = WireTensor::describe(ACTIVATION_TENSOR, shape.clone(), true)
                .with_values(start, data);
            let mut tensors = vec![activations];
            tensors.extend(mask_tensors(&batch_masks, &shape, start));
            let (request_id, reply) = self.session.send_request(function.clone(), tensors)?;
            trace!(request_id, start, len = chunk.len(), "activation batch sent");
            inflight.push((request_id, reply));
        }
        debug!(requests = inflight.len(), elements = issued.index.len(), "activation round issued");

        let mut received = 0;
        for (request_id, reply) in inflight {
            let message = self
                .session
                .wait_reply(request_id, &reply, self.config.activation_timeout)?;
            let tensor = message.tensor(ACTIVATION_TENSOR)?;
            for (k, wire) in tensor.values.iter().enumerate() {
                let position = tensor.offset + k;
                let idx = *issued.index.get(position).ok_or_else(|| {
                    ProtocolError::malformed(format!("reply position {position} was never issued"))
                })?;
                let value = wire.clone().into_value(self.scheme, cp)?;
                out[idx] = Some(self.unmask_output(value, masks.output_at(position), cp)?);
                received += 1;
            }
        }
        if received != issued.index.len() {
            return Err(ProtocolError::malformed(format!(
                "received {received} of {} activation values",
                issued.index.len()
            ))
            .into());
        }
        collect(out)
    }

    /// Max pooling with one client round trip per window.
    #[instrument(skip_all, fields(windows = tracing::field::Empty))]
    pub fn max_pool(
        &self,
        data: &[HeValue<S::Ciphertext>],
        data_shape: &[usize],
        params: &PoolParams,
        batch_size: usize,
    ) -> HeResult<(Vec<HeValue<S::Ciphertext>>, Shape)> {
        if data.len() != shape_size(data_shape) {
            return Err(HeError::validation("MaxPool: data size does not match shape"));
        }
        let (windows, out_shape) = pool_windows(data_shape, params)?;
        tracing::Span::current().record("windows", windows.len());
        let cp = data.first().is_some_and(HeValue::complex_packing);
        let mut values = data.to_vec();
        match_to_smallest_chain_index(self.scheme, &mut values)?;
        let (mask_in, mask_out) = self.masking();

        let mut out = Vec::with_capacity(windows.len());
        for window in &windows {
            if window.is_empty() {
                return Err(HeError::validation("MaxPool: window covers no elements"));
            }
            let candidates: Vec<&HeValue<S::Ciphertext>> =
                window.iter().map(|&i| &values[i]).collect();
            let local = candidates
                .iter()
                .all(|v| v.as_plaintext().is_some() || v.is_known_value());
            if local {
                out.push(local_max(&candidates, batch_size));
                continue;
            }
            let mut rng = rand::rng();
            let mut masks =
                GcMasks::sample(candidates.len(), batch_size, mask_in, false, &mut rng)?;
            masks.output = GcMasks::sample(1, batch_size, false, mask_out, &mut rng)?.output;
            let shape = vec![batch_size, candidates.len()];
            let wire = candidates
                .iter()
                .enumerate()
                .map(|(k, v)| self.outgoing(v, masks.input_at(k), batch_size, cp))
                .collect::<HeResult<Vec<_>>>()?;
            let candidates_tensor =
                WireTensor::describe(CANDIDATES_TENSOR, shape.clone(), true).with_values(0, wire);
            let mut tensors = vec![candidates_tensor];
            tensors.extend(mask_tensors(&masks, &shape, 0));
            let (request_id, reply) = self
                .session
                .send_request(self.function(function::MAX_POOL, None), tensors)?;
            let message = self
                .session
                .wait_reply(request_id, &reply, self.config.activation_timeout)?;
            out.push(self.max_from_reply(&message, masks.output_at(0), cp)?);
        }
        Ok((out, out_shape))
    }

    /// Wire form of one candidate at the lowest level, with its input mask.
    fn outgoing(
        &self,
        value: &HeValue<S::Ciphertext>,
        mask: Option<&[f64]>,
        batch_size: usize,
        cp: bool,
    ) -> HeResult<WireValue> {
        let ct = match value {
            HeValue::Ciphertext(c) => match c.inner() {
                CipherInner::Encrypted(ct) => {
                    let mut ct = ct.clone();
                    self.scheme.mod_switch_to(&mut ct, 0)?;
                    ct
                }
                CipherInner::Known(k) => return Ok(masked_plain(vec![*k; batch_size], mask)),
            },
            HeValue::Plaintext(p) => return Ok(masked_plain(p.expand(batch_size), mask)),
        };
        let ct = match mask {
            Some(mask) => self.scheme.add_plain(&ct, mask, cp)?,
            None => ct,
        };
        Ok(WireValue::Cipher(self.scheme.save_ciphertext(&ct)?))
    }

    fn max_from_reply(
        &self,
        message: &Message,
        mask: Option<&[f64]>,
        cp: bool,
    ) -> HeResult<HeValue<S::Ciphertext>> {
        let tensor = message.tensor(CANDIDATES_TENSOR)?;
        let [wire] = tensor.values.as_slice() else {
            return Err(ProtocolError::malformed(format!(
                "max reply carries {} values",
                tensor.values.len()
            ))
            .into());
        };
        let value = wire.clone().into_value(self.scheme, cp)?;
        self.unmask_output(value, mask, cp)
    }

    fn unmask_output(
        &self,
        value: HeValue<S::Ciphertext>,
        mask: Option<&[f64]>,
        cp: bool,
    ) -> HeResult<HeValue<S::Ciphertext>> {
        match mask {
            Some(mask) => scalar_subtract(self.scheme, &value, &HeValue::plain(mask.to_vec(), cp)),
            None => Ok(value),
        }
    }
}

fn collect<C>(out: Vec<Option<HeValue<C>>>) -> HeResult<Vec<HeValue<C>>> {
    out.into_iter()
        .enumerate()
        .map(|(idx, v)| {
            v.ok_or_else(|| {
                ProtocolError::malformed(format!("no activation value for element {idx}")).into()
            })
        })
        .collect()
}

fn mask_tensors(masks: &GcMasks, shape: &[usize], offset: usize) -> Vec<WireTensor> {
    [(INPUT_MASK_TENSOR, &masks.input), (OUTPUT_MASK_TENSOR, &masks.output)]
        .into_iter()
        .filter_map(|(name, mask)| {
            mask.as_ref().map(|m| {
                let values = m.iter().map(|v| WireValue::Plain(v.clone())).collect();
                WireTensor::describe(name, shape.to_vec(), true).with_values(offset, values)
            })
        })
        .collect()
}

fn masked_plain(values: Vec<f64>, mask: Option<&[f64]>) -> WireValue {
    match mask {
        Some(mask) => WireValue::Plain(values.iter().zip(mask).map(|(v, m)| v + m).collect()),
        None => WireValue::Plain(values),
    }
}

/// Maximum of a window that holds no encrypted value.
fn local_max<C>(candidates: &[&HeValue<C>], batch_size: usize) -> HeValue<C> {
    let cp = candidates.iter().any(|v| v.complex_packing());
    let known: Option<Vec<f64>> = candidates
        .iter()
        .map(|v| match v {
            HeValue::Ciphertext(c) => c.known_scalar(),
            HeValue::Plaintext(_) => None,
        })
        .collect();
    if let Some(known) = known {
        return HeValue::known(known.into_iter().fold(f64::NEG_INFINITY, f64::max), cp);
    }
    let plains: Vec<HePlaintext> = candidates
        .iter()
        .filter_map(|v| match v {
            HeValue::Plaintext(p) => Some(p.clone()),
            HeValue::Ciphertext(c) => c.known_scalar().map(|k| HePlaintext::scalar(k, cp)),
        })
        .collect();
    HeValue::Plaintext(max_plain(&plains, batch_size))
}
