//! Graph compilation and the op-dispatch interpreter.
//!
//! [`HeBackend::compile`] validates a [`Graph`], computes tensor lifetimes
//! and, when a client is expected, starts listening for it. Each
//! [`Executable::call`] then walks the nodes in order over a fresh
//! [`TensorStore`].

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info, instrument, trace, warn};

use crate::activation::{ActivationCoordinator, ServerSession};
use crate::config::ExecutorConfig;
use crate::errors::{HeError, HeResult, ProtocolError};
use crate::graph::{Graph, Node, OpKind};
use crate::kernel::activation::{Activation, activate_local};
use crate::kernel::{arith, batch_norm, convolution, dot, nonlinear, pool, reduce, structural};
use crate::liveness::Liveness;
use crate::precision::{rescale_tensor, rescale_values};
use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, Message, WireTensor, WireValue};
use crate::scheme::{EncryptionParameters, HeScheme};
use crate::shape::packed_shape;
use crate::store::TensorStore;
use crate::tensor::HeTensor;
use crate::value::{self, HeValue};

/// Where an [`Executable`] is in its life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutableState {
    Compiled,
    EvaluatingOp { index: usize, op: &'static str },
    Done,
}

/// Compiles graphs against one scheme instance and policy.
pub struct HeBackend<S: HeScheme> {
    scheme: Arc<S>,
    config: ExecutorConfig,
}

impl<S: HeScheme> HeBackend<S> {
    pub fn new(params: EncryptionParameters, config: ExecutorConfig) -> HeResult<Self> {
        Ok(Self {
            scheme: Arc::new(S::from_parameters(params)?),
            config,
        })
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Validates `graph` and prepares it for calls.
    ///
    /// Without a client, encryption keys are generated here when any data
    /// or model tensor is to be encrypted.
    pub fn compile(&self, graph: Graph) -> HeResult<Executable<S>> {
        graph.validate()?;
        let liveness = Liveness::compute(&graph);
        let session = if self.config.enable_client {
            Some(ServerSession::start(
                self.config.client_address,
                self.scheme.parameters().clone(),
                DEFAULT_MAX_MESSAGE_SIZE,
            )?)
        } else {
            if (self.config.encrypt_data || self.config.encrypt_model)
                && !self.scheme.has_public_key()
            {
                self.scheme.generate_keys()?;
            }
            None
        };
        info!(
            nodes = graph.nodes().len(),
            client = session.is_some(),
            "compiled graph"
        );
        Ok(Executable {
            scheme: Arc::clone(&self.scheme),
            config: self.config.clone(),
            graph,
            liveness,
            session,
            keys_imported: false,
            state: ExecutableState::Compiled,
        })
    }
}

pub struct Executable<S: HeScheme> {
    scheme: Arc<S>,
    config: ExecutorConfig,
    graph: Graph,
    liveness: Liveness,
    session: Option<ServerSession>,
    keys_imported: bool,
    state: ExecutableState,
}

type Tensor<S> = HeTensor<<S as HeScheme>::Ciphertext>;

impl<S: HeScheme> Executable<S> {
    /// Address the client should connect to, if a client is enabled.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(ServerSession::local_addr)
    }

    pub fn state(&self) -> &ExecutableState {
        &self.state
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    fn complex_packing(&self) -> bool {
        self.scheme.parameters().complex_packing()
    }

    fn packs(&self, shape: &[usize]) -> bool {
        self.config.pack_data && !shape.is_empty()
    }

    /// A plaintext tensor for server parameter `index`, filled with
    /// logical row-major `values`.
    pub fn input_tensor(&self, index: usize, values: &[f64]) -> HeResult<Tensor<S>> {
        let node = self
            .graph
            .server_parameters()
            .nth(index)
            .ok_or_else(|| HeError::validation(format!("no server parameter {index}")))?;
        let mut tensor = HeTensor::new_plain(
            node.desc.name.clone(),
            node.desc.element_type,
            node.desc.shape.clone(),
            false,
            self.complex_packing(),
        );
        tensor.write(values)?;
        Ok(tensor)
    }

    /// Runs the graph on `inputs`, one tensor per server parameter in graph
    /// order. Returns one tensor per result node.
    #[instrument(skip_all, fields(nodes = self.graph.nodes().len(), inputs = inputs.len()))]
    pub fn call(&mut self, inputs: Vec<Tensor<S>>) -> HeResult<Vec<Tensor<S>>> {
        self.validate_inputs(&inputs)?;
        let mut store = TensorStore::new();
        if self.session.is_some() {
            self.exchange_setup(&mut store)?;
        }
        self.bind_parameters(inputs, &mut store)?;
        let outcome = self.run(&mut store).and_then(|()| self.bind_results(&mut store));
        self.state = ExecutableState::Done;
        outcome
    }

    fn validate_inputs(&self, inputs: &[Tensor<S>]) -> HeResult<()> {
        let params: Vec<&Node> = self.graph.server_parameters().collect();
        if params.len() != inputs.len() {
            return Err(HeError::validation(format!(
                "expected {} inputs, got {}",
                params.len(),
                inputs.len()
            )));
        }
        for (node, tensor) in params.iter().zip(inputs) {
            if tensor.shape() != node.desc.shape.as_slice()
                || tensor.element_type() != node.desc.element_type
            {
                return Err(HeError::validation(format!(
                    "input {} must be {:?} {:?}, got {:?} {:?}",
                    node.desc.name,
                    node.desc.element_type,
                    node.desc.shape,
                    tensor.element_type(),
                    tensor.shape()
                )));
            }
        }
        Ok(())
    }

    /// Key exchange, inference shape and client inputs.
    fn exchange_setup(&mut self, store: &mut TensorStore<S::Ciphertext>) -> HeResult<()> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };
        let timeout = self.config.activation_timeout;
        if !self.keys_imported {
            let (public_key, eval_key) = session.wait_for_keys(timeout)?;
            self.scheme.import_public_key(&public_key)?;
            self.scheme.import_eval_key(&eval_key)?;
            self.keys_imported = true;
            info!("imported client keys");
        }
        let client_params: Vec<&Node> = self.graph.client_parameters().collect();
        let shape = client_params
            .iter()
            .map(|n| {
                let packed = self.packs(&n.desc.shape);
                WireTensor::describe(&n.desc.name, n.desc.shape.clone(), packed)
            })
            .collect();
        session.send_inference_shape(shape)?;
        let message = session.wait_for_client_inputs(timeout)?;
        for node in client_params {
            let tensor = self.client_tensor(&message, node)?;
            store.insert(node.output, tensor);
        }
        Ok(())
    }

    fn client_tensor(&self, message: &Message, node: &Node) -> HeResult<Tensor<S>> {
        let wire = message.tensor(&node.desc.name)?;
        if wire.shape != node.desc.shape || wire.packed != self.packs(&node.desc.shape) {
            return Err(ProtocolError::malformed(format!(
                "client input {} has shape {:?} (packed {}), expected {:?}",
                wire.name, wire.shape, wire.packed, node.desc.shape
            ))
            .into());
        }
        let cp = self.complex_packing();
        let data = wire
            .values
            .iter()
            .map(|v| v.clone().into_value(&*self.scheme, cp))
            .collect::<HeResult<Vec<_>>>()?;
        HeTensor::from_values(
            node.desc.name.clone(),
            node.desc.element_type,
            wire.shape.clone(),
            wire.packed,
            cp,
            data,
        )
    }

    fn bind_parameters(
        &self,
        inputs: Vec<Tensor<S>>,
        store: &mut TensorStore<S::Ciphertext>,
    ) -> HeResult<()> {
        let ids: Vec<_> = self.graph.server_parameters().map(|n| n.output).collect();
        for (id, mut tensor) in ids.into_iter().zip(inputs) {
            if self.packs(tensor.shape()) && tensor.is_plaintext() {
                tensor.pack()?;
            }
            if self.config.encrypt_data {
                tensor.encrypt_in_place(&*self.scheme, self.config.known_zero_fast_path)?;
            }
            store.insert(id, tensor);
        }
        Ok(())
    }

    fn run(&mut self, store: &mut TensorStore<S::Ciphertext>) -> HeResult<()> {
        let graph = &self.graph;
        for (index, node) in graph.nodes().iter().enumerate() {
            if !matches!(node.op, OpKind::Parameter { .. }) {
                self.state = ExecutableState::EvaluatingOp {
                    index,
                    op: node.op.name(),
                };
                if !node.op.inherits_rescale() {
                    for &input in &node.inputs {
                        rescale_tensor(&*self.scheme, store.get_mut(input)?)?;
                    }
                }
                let inputs = node
                    .inputs
                    .iter()
                    .map(|&id| store.get(id))
                    .collect::<HeResult<Vec<_>>>()?;
                debug!(index, op = node.op.name(), output = %node.output, "dispatch");
                let mut output = self.evaluate(node, &inputs)?;
                self.mark_rescale(node, &inputs, &mut output)?;
                store.insert(node.output, output);
            }
            for &id in &self.liveness.free[index] {
                trace!(tensor = %id, "evict");
                store.evict(id)?;
            }
        }
        Ok(())
    }

    fn mark_rescale(
        &self,
        node: &Node,
        inputs: &[&Tensor<S>],
        output: &mut Tensor<S>,
    ) -> HeResult<()> {
        if node.op.inherits_rescale() {
            output.set_pending_rescale(inputs.first().is_some_and(|t| t.pending_rescale()));
        } else if node.op.changes_level() && output.is_ciphertext() {
            if self.config.lazy_rescaling {
                output.set_pending_rescale(true);
            } else {
                rescale_values(&*self.scheme, output.data_mut())?;
            }
        }
        Ok(())
    }

    fn bind_results(&self, store: &mut TensorStore<S::Ciphertext>) -> HeResult<Vec<Tensor<S>>> {
        let mut results = Vec::new();
        for node in self.graph.results() {
            let mut tensor = store.take(node.output)?;
            rescale_tensor(&*self.scheme, &mut tensor)?;
            results.push(tensor);
        }
        if let Some(session) = &self.session {
            let wire = results
                .iter()
                .map(|t| {
                    let values = t
                        .data()
                        .iter()
                        .map(|v| WireValue::from_value(&*self.scheme, v))
                        .collect::<HeResult<Vec<_>>>()?;
                    Ok(WireTensor::describe(t.name(), t.shape().to_vec(), t.is_packed())
                        .with_values(0, values))
                })
                .collect::<HeResult<Vec<_>>>()?;
            session.send_results(wire)?;
        }
        Ok(results)
    }

    fn evaluate(&self, node: &Node, inputs: &[&Tensor<S>]) -> HeResult<Tensor<S>> {
        let scheme = &*self.scheme;
        let op = node.op.name();
        let cp = self.complex_packing();
        let cipher = inputs.iter().any(|t| !t.is_plaintext());
        let packed = inputs.iter().any(|t| t.is_packed());
        let batch = inputs.iter().map(|t| t.batch_size()).max().unwrap_or(1);
        let desc = &node.desc;
        let out_storage = if packed {
            packed_shape(&desc.shape)
        } else {
            desc.shape.clone()
        };
        let first = || {
            inputs
                .first()
                .copied()
                .ok_or_else(|| HeError::validation(format!("{op} has no inputs")))
        };
        let unsupported = |what: &str| HeError::unsupported(op, what.to_string());

        let data = match &node.op {
            OpKind::Parameter { .. } => {
                return Err(HeError::validation("parameters are bound, not evaluated"));
            }
            OpKind::Constant { values } => return self.constant(node, values),
            OpKind::Add | OpKind::Subtract | OpKind::Multiply => {
                let a = align(op, inputs[0], packed)?;
                let b = align(op, inputs[1], packed)?;
                let f = match node.op {
                    OpKind::Add => arith::add::<S>,
                    OpKind::Subtract => arith::subtract::<S>,
                    _ => arith::multiply::<S>,
                };
                f(scheme, a.data(), b.data())?
            }
            OpKind::Negate => arith::negate(scheme, first()?.data())?,
            OpKind::Divide | OpKind::Minimum | OpKind::Power => {
                let a = align(op, inputs[0], packed)?;
                let b = align(op, inputs[1], packed)?;
                match node.op {
                    OpKind::Divide => {
                        self.decrypts_locally(op, !b.is_plaintext())?;
                        nonlinear::divide(scheme, a.data(), b.data(), batch)?
                    }
                    OpKind::Minimum => {
                        self.decrypts_locally(op, cipher)?;
                        nonlinear::minimum(scheme, a.data(), b.data(), batch)?
                    }
                    _ => {
                        self.decrypts_locally(op, cipher)?;
                        nonlinear::power(scheme, a.data(), b.data(), batch)?
                    }
                }
            }
            OpKind::Exp => {
                self.decrypts_locally(op, cipher)?;
                nonlinear::exp(scheme, first()?.data(), batch)?
            }
            OpKind::Max { axes } => {
                let x = first()?;
                if x.is_packed() && axes.contains(&0) {
                    return Err(unsupported("max over the packed batch axis"));
                }
                self.decrypts_locally(op, cipher)?;
                nonlinear::max(scheme, x.data(), &x.storage_shape(), axes, batch)?.0
            }
            OpKind::Softmax { axes } => {
                let x = first()?;
                if x.is_packed() && axes.contains(&0) {
                    return Err(unsupported("softmax over the packed batch axis"));
                }
                self.decrypts_locally(op, cipher)?;
                nonlinear::softmax(scheme, x.data(), &x.storage_shape(), axes, batch)?
            }
            OpKind::Dot { reduction_axes } => {
                let (a, b) = (inputs[0], inputs[1]);
                if b.is_packed() {
                    return Err(unsupported("packed right operand"));
                }
                dot::dot(
                    scheme,
                    a.data(),
                    &a.storage_shape(),
                    b.data(),
                    &b.storage_shape(),
                    *reduction_axes,
                )?
                .0
            }
            OpKind::Convolution(params) => {
                let (x, w) = (inputs[0], inputs[1]);
                if w.is_packed() {
                    return Err(unsupported("packed filters"));
                }
                convolution::convolution(
                    scheme,
                    x.data(),
                    &x.storage_shape(),
                    w.data(),
                    &w.storage_shape(),
                    params,
                )?
                .0
            }
            OpKind::AvgPool {
                params,
                include_padding,
            } => {
                let x = first()?;
                pool::avg_pool(scheme, x.data(), &x.storage_shape(), params, *include_padding)?.0
            }
            OpKind::MaxPool(params) => {
                let x = first()?;
                match &self.session {
                    Some(session) => {
                        ActivationCoordinator::new(scheme, session, &self.config)
                            .max_pool(x.data(), &x.storage_shape(), params, batch)?
                            .0
                    }
                    None => pool::max_pool(scheme, x.data(), &x.storage_shape(), params, batch)?.0,
                }
            }
            OpKind::Sum { axes } => {
                let x = first()?;
                if x.is_packed() && axes.contains(&0) {
                    return Err(unsupported("sum over the packed batch axis"));
                }
                reduce::sum(scheme, x.data(), &x.storage_shape(), axes)?.0
            }
            OpKind::Broadcast { axes } => {
                let x = first()?;
                if x.is_packed() && axes.contains(&0) {
                    return Err(unsupported("broadcast into the packed batch axis"));
                }
                structural::broadcast(x.data(), &x.storage_shape(), &out_storage, axes)?
            }
            OpKind::Reshape { input_order } => {
                let x = first()?;
                if x.is_packed()
                    && (input_order.first() != Some(&0)
                        || desc.shape.first() != x.shape().first())
                {
                    return Err(unsupported("reshape moving the packed batch axis"));
                }
                structural::reshape(x.data(), &x.storage_shape(), input_order, &out_storage)?
            }
            OpKind::Concat { axis } => {
                if packed && *axis == 0 {
                    return Err(unsupported("concat along the packed batch axis"));
                }
                let aligned = inputs
                    .iter()
                    .map(|t| align(op, t, packed))
                    .collect::<HeResult<Vec<_>>>()?;
                let shapes: Vec<_> = aligned.iter().map(|t| t.storage_shape()).collect();
                let parts: Vec<_> = aligned
                    .iter()
                    .zip(&shapes)
                    .map(|(t, s)| (t.data(), s.as_slice()))
                    .collect();
                structural::concat(&parts, *axis)?.0
            }
            OpKind::Slice {
                lower,
                upper,
                strides,
            } => {
                let x = first()?;
                let (mut lower, mut upper, mut strides) =
                    (lower.clone(), upper.clone(), strides.clone());
                if x.is_packed() {
                    let full = x.shape().first().copied().unwrap_or(1);
                    if lower.first() != Some(&0)
                        || upper.first() != Some(&full)
                        || strides.first().is_some_and(|&s| s != 1)
                    {
                        return Err(unsupported("partial slice of the packed batch axis"));
                    }
                    upper[0] = 1;
                    lower[0] = 0;
                    if let Some(s) = strides.first_mut() {
                        *s = 1;
                    }
                }
                structural::slice(x.data(), &x.storage_shape(), &lower, &upper, &strides)?
            }
            OpKind::Reverse { axes } => {
                let x = first()?;
                if x.is_packed() && axes.contains(&0) {
                    return Err(unsupported("reverse of the packed batch axis"));
                }
                structural::reverse(x.data(), &x.storage_shape(), axes)?
            }
            OpKind::Pad {
                below,
                above,
                value,
            } => {
                let x = first()?;
                let pads_batch = below.first().is_some_and(|&b| b != 0)
                    || above.first().is_some_and(|&a| a != 0);
                if x.is_packed() && pads_batch {
                    return Err(unsupported("padding the packed batch axis"));
                }
                let fill = if cipher {
                    HeValue::known(*value, cp)
                } else {
                    HeValue::plain_scalar(*value, cp)
                };
                structural::pad(x.data(), &x.storage_shape(), below, above, &fill)?.0
            }
            OpKind::BatchNormInference { eps } => {
                let x = inputs[0];
                batch_norm::batch_norm_inference(
                    scheme,
                    x.data(),
                    &x.storage_shape(),
                    inputs[1].data(),
                    inputs[2].data(),
                    inputs[3].data(),
                    inputs[4].data(),
                    *eps,
                )?
            }
            OpKind::Relu => self.activate(first()?, Activation::Relu)?,
            OpKind::BoundedRelu { bound } => {
                self.activate(first()?, Activation::BoundedRelu(*bound))?
            }
            OpKind::Result => {
                let mut out = first()?.clone();
                out.set_name(desc.name.clone());
                return Ok(out);
            }
        };

        let mut data = data;
        if cipher {
            self.encrypt_plain_elements(&mut data)?;
        }
        HeTensor::from_values(
            desc.name.clone(),
            desc.element_type,
            desc.shape.clone(),
            packed,
            cp,
            data,
        )
    }

    fn activate(
        &self,
        input: &Tensor<S>,
        activation: Activation,
    ) -> HeResult<Vec<HeValue<S::Ciphertext>>> {
        let batch = input.batch_size();
        match &self.session {
            Some(session) => ActivationCoordinator::new(&*self.scheme, session, &self.config)
                .activate(input.data(), activation, batch),
            None => activate_local(&*self.scheme, input.data(), activation, batch),
        }
    }

    /// Refuses ops that would decrypt `cipher` operands on the server when
    /// a client holds the secret key.
    fn decrypts_locally(&self, op: &str, cipher: bool) -> HeResult<()> {
        if !cipher {
            return Ok(());
        }
        if self.session.is_some() {
            return Err(HeError::unsupported(op, "ciphertext operand with a client attached"));
        }
        warn!(op, "decrypting on the server without a client is not privacy-preserving");
        Ok(())
    }

    /// A constant is plaintext unless the model is encrypted. It is never
    /// packed.
    fn constant(&self, node: &Node, values: &[f64]) -> HeResult<Tensor<S>> {
        let mut tensor = HeTensor::new_plain(
            node.desc.name.clone(),
            node.desc.element_type,
            node.desc.shape.clone(),
            false,
            self.complex_packing(),
        );
        tensor.write(values)?;
        if self.config.encrypt_model {
            tensor.encrypt_in_place(&*self.scheme, self.config.known_zero_fast_path)?;
        }
        Ok(tensor)
    }

    /// Keeps an output homogeneous when a kernel mixed in cleartext values.
    fn encrypt_plain_elements(&self, data: &mut [HeValue<S::Ciphertext>]) -> HeResult<()> {
        for v in data.iter_mut() {
            if let HeValue::Plaintext(p) = v {
                let fast_path = self.config.known_zero_fast_path;
                *v = HeValue::Ciphertext(value::encrypt(&*self.scheme, p, fast_path)?);
            }
        }
        Ok(())
    }
}

/// Packs an unpacked plaintext operand to meet a packed one.
fn align<'t, C: Clone>(
    op: &str,
    tensor: &'t HeTensor<C>,
    packed: bool,
) -> HeResult<Cow<'t, HeTensor<C>>> {
    if !packed || tensor.is_packed() {
        return Ok(Cow::Borrowed(tensor));
    }
    if !tensor.is_plaintext() {
        return Err(HeError::unsupported(op, "packed operand with unpacked ciphertext"));
    }
    let mut copy = tensor.clone();
    copy.pack()?;
    Ok(Cow::Owned(copy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::scheme::{SimCiphertext, SimulatedCkks};
    use crate::tensor::ElementType;
    use approx::assert_abs_diff_eq;

    fn backend(config: ExecutorConfig) -> HeBackend<SimulatedCkks> {
        let params = EncryptionParameters::builder()
            .poly_modulus_degree(1024)
            .coeff_modulus_bits(vec![60, 40, 40, 60])
            .scale(2f64.powi(40))
            .build()
            .unwrap();
        HeBackend::new(params, config).unwrap()
    }

    fn encrypted() -> ExecutorConfig {
        ExecutorConfig::builder().encrypt_data(true).build().unwrap()
    }

    #[test]
    fn multiply_then_add_is_rescaled_lazily() {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2, 2], ElementType::F64);
        let w = b.constant("w", vec![2, 2], ElementType::F64, vec![2.0; 4]).unwrap();
        let y = b.multiply(x, w).unwrap();
        let z = b.add(y, x).unwrap();
        b.result(z).unwrap();
        let backend = backend(encrypted());
        let mut exe = backend.compile(b.build().unwrap()).unwrap();
        let input = exe.input_tensor(0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let out = exe.call(vec![input]).unwrap();
        assert_eq!(exe.state(), &ExecutableState::Done);
        assert!(out[0].is_ciphertext() && out[0].is_packed());
        let values = out[0].read(exe.scheme()).unwrap();
        for (got, want) in values.iter().zip([3.0, 6.0, 9.0, 12.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-3);
        }
    }

    #[test]
    fn plaintext_graph_stays_plaintext() {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![3], ElementType::F32);
        let r = b.relu(x).unwrap();
        b.result(r).unwrap();
        let backend = backend(ExecutorConfig::default());
        let mut exe = backend.compile(b.build().unwrap()).unwrap();
        let input = exe.input_tensor(0, &[-1.0, 0.5, 2.0]).unwrap();
        let out = exe.call(vec![input]).unwrap();
        assert!(out[0].is_plaintext());
        assert_eq!(out[0].read_plain().unwrap(), vec![0.0, 0.5, 2.0]);
    }

    #[test]
    fn wrong_inputs_are_rejected_at_entry() {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2], ElementType::F32);
        b.result(x).unwrap();
        let backend = backend(ExecutorConfig::default());
        let mut exe = backend.compile(b.build().unwrap()).unwrap();
        assert!(matches!(exe.call(Vec::new()), Err(HeError::Validation { .. })));
        let wrong = HeTensor::new_plain("x", ElementType::F32, vec![3], false, false);
        assert!(matches!(exe.call(vec![wrong]), Err(HeError::Validation { .. })));
    }

    #[test]
    fn mixed_outputs_follow_the_zero_fast_path_setting() {
        let run = |fast_path: bool| {
            let mut b = GraphBuilder::new();
            let x = b.parameter("x", vec![1, 2], ElementType::F64);
            let z = b.constant("z", vec![1, 2], ElementType::F64, vec![0.0; 2]).unwrap();
            let c = b.concat(vec![x, z], 1).unwrap();
            b.result(c).unwrap();
            let config = ExecutorConfig::builder()
                .encrypt_data(true)
                .pack_data(false)
                .known_zero_fast_path(fast_path)
                .build()
                .unwrap();
            let backend = backend(config);
            let mut exe = backend.compile(b.build().unwrap()).unwrap();
            let input = exe.input_tensor(0, &[1.0, 2.0]).unwrap();
            let mut out = exe.call(vec![input]).unwrap();
            let values = out[0].read(exe.scheme()).unwrap();
            (out.remove(0), values)
        };
        let encrypted = |v: &HeValue<SimCiphertext>| match v {
            HeValue::Ciphertext(c) => c.as_encrypted().is_some(),
            HeValue::Plaintext(_) => false,
        };

        let (tensor, values) = run(false);
        assert!(tensor.data().iter().all(encrypted));
        assert_abs_diff_eq!(values[3], 0.0, epsilon = 1e-3);

        let (tensor, values) = run(true);
        assert!(tensor.is_ciphertext());
        assert!(tensor.data()[2..].iter().all(|v| v.known_scalar() == Some(0.0)));
        assert_abs_diff_eq!(values[0], 1.0, epsilon = 1e-3);
    }

    #[test]
    fn client_graphs_refuse_server_side_decryption() {
        let mut b = GraphBuilder::new();
        let x = b.client_parameter("x", vec![1, 3], ElementType::F64);
        let y = b.exp(x).unwrap();
        b.result(y).unwrap();
        let config = ExecutorConfig::builder()
            .encrypt_data(true)
            .enable_client(true)
            .client_port(0)
            .build()
            .unwrap();
        let exe = backend(config).compile(b.build().unwrap()).unwrap();
        let err = exe.decrypts_locally("Exp", true).unwrap_err();
        assert!(matches!(err, HeError::UnsupportedCombination { .. }));
        assert!(exe.decrypts_locally("Exp", false).is_ok());
    }

    #[test]
    fn packed_batch_slice_must_cover_the_batch() {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2, 3], ElementType::F64);
        let s = b.slice(x, vec![0, 1], vec![1, 3], vec![1, 1]).unwrap();
        b.result(s).unwrap();
        let backend = backend(ExecutorConfig::default());
        let mut exe = backend.compile(b.build().unwrap()).unwrap();
        let input = exe.input_tensor(0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let err = exe.call(vec![input]).unwrap_err();
        assert!(matches!(err, HeError::UnsupportedCombination { .. }));
    }

    #[test]
    fn packed_slice_keeps_the_whole_batch() {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2, 3], ElementType::F64);
        let s = b.slice(x, vec![0, 1], vec![2, 3], vec![1, 1]).unwrap();
        b.result(s).unwrap();
        let backend = backend(ExecutorConfig::default());
        let mut exe = backend.compile(b.build().unwrap()).unwrap();
        let input = exe.input_tensor(0, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let out = exe.call(vec![input]).unwrap();
        assert_eq!(out[0].read_plain().unwrap(), vec![2.0, 3.0, 5.0, 6.0]);
    }
}
