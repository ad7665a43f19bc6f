//! Computation graphs: topologically ordered nodes over tensor descriptors.

use std::fmt;

use crate::errors::{HeError, HeResult};
use crate::kernel::convolution::{ConvolutionParams, convolution_shape};
use crate::kernel::dot::dot_shape;
use crate::kernel::pool::{PoolParams, pool_shape};
use crate::kernel::structural::slice_shape;
use crate::shape::{Shape, project, reduce_shape, shape_size};
use crate::tensor::ElementType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub usize);

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    pub name: String,
    pub shape: Shape,
    pub element_type: ElementType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpKind {
    /// Graph input. Client parameters are supplied by the remote peer.
    Parameter { from_client: bool },
    /// Logical row-major values.
    Constant { values: Vec<f64> },
    Add,
    Subtract,
    Multiply,
    Negate,
    Divide,
    Minimum,
    /// First operand raised to the second, elementwise.
    Power,
    Exp,
    /// Max reduction over `axes`.
    Max { axes: Vec<usize> },
    Softmax { axes: Vec<usize> },
    Dot { reduction_axes: usize },
    Convolution(ConvolutionParams),
    AvgPool { params: PoolParams, include_padding: bool },
    MaxPool(PoolParams),
    Sum { axes: Vec<usize> },
    Broadcast { axes: Vec<usize> },
    /// Output shape comes from the node descriptor.
    Reshape { input_order: Vec<usize> },
    Concat { axis: usize },
    Slice { lower: Vec<usize>, upper: Vec<usize>, strides: Vec<usize> },
    Reverse { axes: Vec<usize> },
    Pad { below: Vec<usize>, above: Vec<usize>, value: f64 },
    /// Inputs: data, gamma, beta, mean, variance.
    BatchNormInference { eps: f64 },
    Relu,
    BoundedRelu { bound: f64 },
    Result,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Parameter { .. } => "Parameter",
            OpKind::Constant { .. } => "Constant",
            OpKind::Add => "Add",
            OpKind::Subtract => "Subtract",
            OpKind::Multiply => "Multiply",
            OpKind::Negate => "Negate",
            OpKind::Divide => "Divide",
            OpKind::Minimum => "Minimum",
            OpKind::Power => "Power",
            OpKind::Exp => "Exp",
            OpKind::Max { .. } => "Max",
            OpKind::Softmax { .. } => "Softmax",
            OpKind::Dot { .. } => "Dot",
            OpKind::Convolution(_) => "Convolution",
            OpKind::AvgPool { .. } => "AvgPool",
            OpKind::MaxPool(_) => "MaxPool",
            OpKind::Sum { .. } => "Sum",
            OpKind::Broadcast { .. } => "Broadcast",
            OpKind::Reshape { .. } => "Reshape",
            OpKind::Concat { .. } => "Concat",
            OpKind::Slice { .. } => "Slice",
            OpKind::Reverse { .. } => "Reverse",
            OpKind::Pad { .. } => "Pad",
            OpKind::BatchNormInference { .. } => "BatchNormInference",
            OpKind::Relu => "Relu",
            OpKind::BoundedRelu { .. } => "BoundedRelu",
            OpKind::Result => "Result",
        }
    }

    /// Ops whose ciphertext outputs carry a squared scale.
    pub fn changes_level(&self) -> bool {
        matches!(
            self,
            OpKind::Multiply
                | OpKind::Divide
                | OpKind::Dot { .. }
                | OpKind::Convolution(_)
                | OpKind::AvgPool { .. }
                | OpKind::BatchNormInference { .. }
        )
    }

    /// Ops that move values without combining them and so may consume a
    /// tensor that still awaits its rescale.
    pub fn inherits_rescale(&self) -> bool {
        matches!(
            self,
            OpKind::Reshape { .. }
                | OpKind::Broadcast { .. }
                | OpKind::Slice { .. }
                | OpKind::Reverse { .. }
                | OpKind::Result
        )
    }

    fn arity(&self) -> Option<usize> {
        match self {
            OpKind::Parameter { .. } | OpKind::Constant { .. } => Some(0),
            OpKind::Add
            | OpKind::Subtract
            | OpKind::Multiply
            | OpKind::Divide
            | OpKind::Minimum
            | OpKind::Power
            | OpKind::Dot { .. }
            | OpKind::Convolution(_) => Some(2),
            OpKind::BatchNormInference { .. } => Some(5),
            OpKind::Concat { .. } => None,
            _ => Some(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub op: OpKind,
    pub inputs: Vec<TensorId>,
    pub output: TensorId,
    pub desc: TensorDesc,
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    /// Wraps nodes listed in topological order, checking that every input
    /// is produced before it is used and that ids are produced once.
    pub fn new(nodes: Vec<Node>) -> HeResult<Self> {
        let graph = Self { nodes };
        graph.validate()?;
        Ok(graph)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&Node> {
        self.nodes.get(index)
    }

    pub fn tensor_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| n.output.0 + 1)
            .max()
            .unwrap_or(0)
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.op, OpKind::Parameter { .. }))
    }

    pub fn server_parameters(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.op, OpKind::Parameter { from_client: false }))
    }

    pub fn client_parameters(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.op, OpKind::Parameter { from_client: true }))
    }

    pub fn results(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.op == OpKind::Result)
    }

    pub fn validate(&self) -> HeResult<()> {
        let mut produced = vec![false; self.tensor_count()];
        for (index, node) in self.nodes.iter().enumerate() {
            if let Some(arity) = node.op.arity() {
                if node.inputs.len() != arity {
                    return Err(HeError::validation(format!(
                        "node {index} ({}) takes {arity} inputs, got {}",
                        node.op.name(),
                        node.inputs.len()
                    )));
                }
            }
            for input in &node.inputs {
                if !produced.get(input.0).copied().unwrap_or(false) {
                    return Err(HeError::validation(format!(
                        "node {index} ({}) uses {input} before it is produced",
                        node.op.name()
                    )));
                }
            }
            if produced[node.output.0] {
                return Err(HeError::validation(format!(
                    "{} is produced twice",
                    node.output
                )));
            }
            produced[node.output.0] = true;
        }
        Ok(())
    }
}

/// Builds a [`Graph`] node by node, inferring output shapes.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn desc(&self, id: TensorId) -> HeResult<&TensorDesc> {
        self.nodes
            .get(id.0)
            .map(|n| &n.desc)
            .ok_or(HeError::MissingTensor { id: id.0 })
    }

    fn push(
        &mut self,
        op: OpKind,
        inputs: Vec<TensorId>,
        name: Option<String>,
        shape: Shape,
        element_type: ElementType,
    ) -> TensorId {
        let output = TensorId(self.nodes.len());
        let name = name.unwrap_or_else(|| format!("{}_{}", op.name(), output.0));
        self.nodes.push(Node {
            op,
            inputs,
            output,
            desc: TensorDesc {
                name,
                shape,
                element_type,
            },
        });
        output
    }

    /// Pushes an op whose output shape is `shape_of(input descriptors)`.
    fn op(
        &mut self,
        op: OpKind,
        inputs: Vec<TensorId>,
        shape_of: impl FnOnce(&[&TensorDesc]) -> HeResult<Shape>,
    ) -> HeResult<TensorId> {
        let descs = inputs
            .iter()
            .map(|&id| self.desc(id))
            .collect::<HeResult<Vec<_>>>()?;
        let element_type = descs
            .first()
            .map(|d| d.element_type)
            .unwrap_or(ElementType::F32);
        let shape = shape_of(&descs)?;
        Ok(self.push(op, inputs, None, shape, element_type))
    }

    pub fn parameter(
        &mut self,
        name: &str,
        shape: Shape,
        element_type: ElementType,
    ) -> TensorId {
        self.push(
            OpKind::Parameter { from_client: false },
            Vec::new(),
            Some(name.to_string()),
            shape,
            element_type,
        )
    }

    /// A parameter whose value the client provides.
    pub fn client_parameter(
        &mut self,
        name: &str,
        shape: Shape,
        element_type: ElementType,
    ) -> TensorId {
        self.push(
            OpKind::Parameter { from_client: true },
            Vec::new(),
            Some(name.to_string()),
            shape,
            element_type,
        )
    }

    pub fn constant(
        &mut self,
        name: &str,
        shape: Shape,
        element_type: ElementType,
        values: Vec<f64>,
    ) -> HeResult<TensorId> {
        if values.len() != shape_size(&shape) {
            return Err(HeError::validation(format!(
                "constant {name} of shape {shape:?} given {} values",
                values.len()
            )));
        }
        Ok(self.push(
            OpKind::Constant { values },
            Vec::new(),
            Some(name.to_string()),
            shape,
            element_type,
        ))
    }

    fn same_shape(op: &str, descs: &[&TensorDesc]) -> HeResult<Shape> {
        let first = &descs[0].shape;
        if descs.iter().any(|d| &d.shape != first) {
            return Err(HeError::validation(format!(
                "{op}: operand shapes differ: {:?}",
                descs.iter().map(|d| &d.shape).collect::<Vec<_>>()
            )));
        }
        Ok(first.clone())
    }

    pub fn add(&mut self, a: TensorId, b: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Add, vec![a, b], |d| Self::same_shape("Add", d))
    }

    pub fn subtract(&mut self, a: TensorId, b: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Subtract, vec![a, b], |d| Self::same_shape("Subtract", d))
    }

    pub fn multiply(&mut self, a: TensorId, b: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Multiply, vec![a, b], |d| Self::same_shape("Multiply", d))
    }

    pub fn negate(&mut self, a: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Negate, vec![a], |d| Ok(d[0].shape.clone()))
    }

    pub fn divide(&mut self, a: TensorId, b: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Divide, vec![a, b], |d| Self::same_shape("Divide", d))
    }

    pub fn minimum(&mut self, a: TensorId, b: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Minimum, vec![a, b], |d| Self::same_shape("Minimum", d))
    }

    pub fn power(&mut self, a: TensorId, b: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Power, vec![a, b], |d| Self::same_shape("Power", d))
    }

    pub fn exp(&mut self, a: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Exp, vec![a], |d| Ok(d[0].shape.clone()))
    }

    pub fn dot(&mut self, a: TensorId, b: TensorId, reduction_axes: usize) -> HeResult<TensorId> {
        self.op(OpKind::Dot { reduction_axes }, vec![a, b], |d| {
            dot_shape(&d[0].shape, &d[1].shape, reduction_axes)
        })
    }

    pub fn convolution(
        &mut self,
        data: TensorId,
        filters: TensorId,
        params: ConvolutionParams,
    ) -> HeResult<TensorId> {
        let shape_params = params.clone();
        self.op(OpKind::Convolution(params), vec![data, filters], move |d| {
            convolution_shape(&d[0].shape, &d[1].shape, &shape_params)
        })
    }

    pub fn avg_pool(
        &mut self,
        data: TensorId,
        params: PoolParams,
        include_padding: bool,
    ) -> HeResult<TensorId> {
        let shape = pool_shape(&self.desc(data)?.shape, &params)?;
        self.op(
            OpKind::AvgPool {
                params,
                include_padding,
            },
            vec![data],
            move |_| Ok(shape),
        )
    }

    pub fn max_pool(&mut self, data: TensorId, params: PoolParams) -> HeResult<TensorId> {
        let shape = pool_shape(&self.desc(data)?.shape, &params)?;
        self.op(OpKind::MaxPool(params), vec![data], move |_| Ok(shape))
    }

    fn check_axes(&self, op: &str, a: TensorId, axes: &[usize]) -> HeResult<Shape> {
        let in_shape = self.desc(a)?.shape.clone();
        if axes.iter().any(|&axis| axis >= in_shape.len()) {
            return Err(HeError::validation(format!(
                "{op}: axes {axes:?} out of range for {in_shape:?}"
            )));
        }
        Ok(in_shape)
    }

    pub fn sum(&mut self, a: TensorId, axes: Vec<usize>) -> HeResult<TensorId> {
        let shape = reduce_shape(&self.check_axes("Sum", a, &axes)?, &axes);
        self.op(OpKind::Sum { axes }, vec![a], move |_| Ok(shape))
    }

    /// Maximum over `axes`, which are removed from the shape.
    pub fn max(&mut self, a: TensorId, axes: Vec<usize>) -> HeResult<TensorId> {
        let shape = reduce_shape(&self.check_axes("Max", a, &axes)?, &axes);
        self.op(OpKind::Max { axes }, vec![a], move |_| Ok(shape))
    }

    pub fn softmax(&mut self, a: TensorId, axes: Vec<usize>) -> HeResult<TensorId> {
        let shape = self.check_axes("Softmax", a, &axes)?;
        self.op(OpKind::Softmax { axes }, vec![a], move |_| Ok(shape))
    }

    pub fn broadcast(
        &mut self,
        a: TensorId,
        out_shape: Shape,
        axes: Vec<usize>,
    ) -> HeResult<TensorId> {
        let in_shape = &self.desc(a)?.shape;
        if &project(&out_shape, &axes) != in_shape {
            return Err(HeError::validation(format!(
                "Broadcast: {in_shape:?} does not fit {out_shape:?} along {axes:?}"
            )));
        }
        self.op(OpKind::Broadcast { axes }, vec![a], move |_| Ok(out_shape))
    }

    pub fn reshape(
        &mut self,
        a: TensorId,
        input_order: Vec<usize>,
        out_shape: Shape,
    ) -> HeResult<TensorId> {
        let in_shape = &self.desc(a)?.shape;
        if shape_size(in_shape) != shape_size(&out_shape) || input_order.len() != in_shape.len() {
            return Err(HeError::validation(format!(
                "Reshape: cannot view {in_shape:?} as {out_shape:?}"
            )));
        }
        self.op(OpKind::Reshape { input_order }, vec![a], move |_| Ok(out_shape))
    }

    pub fn concat(&mut self, inputs: Vec<TensorId>, axis: usize) -> HeResult<TensorId> {
        if inputs.is_empty() {
            return Err(HeError::validation("Concat: no inputs"));
        }
        self.op(OpKind::Concat { axis }, inputs, |d| {
            let mut shape = d[0].shape.clone();
            if axis >= shape.len() {
                return Err(HeError::validation(format!(
                    "Concat: axis {axis} out of range for {shape:?}"
                )));
            }
            shape[axis] = d.iter().map(|t| t.shape.get(axis).copied().unwrap_or(0)).sum();
            Ok(shape)
        })
    }

    pub fn slice(
        &mut self,
        a: TensorId,
        lower: Vec<usize>,
        upper: Vec<usize>,
        strides: Vec<usize>,
    ) -> HeResult<TensorId> {
        let shape = slice_shape(&lower, &upper, &strides);
        self.op(
            OpKind::Slice {
                lower,
                upper,
                strides,
            },
            vec![a],
            move |_| Ok(shape),
        )
    }

    pub fn reverse(&mut self, a: TensorId, axes: Vec<usize>) -> HeResult<TensorId> {
        self.op(OpKind::Reverse { axes }, vec![a], |d| Ok(d[0].shape.clone()))
    }

    pub fn pad(
        &mut self,
        a: TensorId,
        below: Vec<usize>,
        above: Vec<usize>,
        value: f64,
    ) -> HeResult<TensorId> {
        let in_shape = self.desc(a)?.shape.clone();
        if below.len() != in_shape.len() || above.len() != in_shape.len() {
            return Err(HeError::validation("Pad: padding rank mismatch"));
        }
        let shape = (0..in_shape.len())
            .map(|i| below[i] + in_shape[i] + above[i])
            .collect();
        self.op(OpKind::Pad { below, above, value }, vec![a], move |_| Ok(shape))
    }

    pub fn batch_norm_inference(
        &mut self,
        input: TensorId,
        gamma: TensorId,
        beta: TensorId,
        mean: TensorId,
        variance: TensorId,
        eps: f64,
    ) -> HeResult<TensorId> {
        self.op(
            OpKind::BatchNormInference { eps },
            vec![input, gamma, beta, mean, variance],
            |d| Ok(d[0].shape.clone()),
        )
    }

    pub fn relu(&mut self, a: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Relu, vec![a], |d| Ok(d[0].shape.clone()))
    }

    pub fn bounded_relu(&mut self, a: TensorId, bound: f64) -> HeResult<TensorId> {
        self.op(OpKind::BoundedRelu { bound }, vec![a], |d| Ok(d[0].shape.clone()))
    }

    /// Marks `a` as a graph output.
    pub fn result(&mut self, a: TensorId) -> HeResult<TensorId> {
        self.op(OpKind::Result, vec![a], |d| Ok(d[0].shape.clone()))
    }

    pub fn build(self) -> HeResult<Graph> {
        Graph::new(self.nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_infers_shapes() {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2, 3], ElementType::F32);
        let w = b
            .constant("w", vec![3, 4], ElementType::F32, vec![0.5; 12])
            .unwrap();
        let y = b.dot(x, w, 1).unwrap();
        let r = b.relu(y).unwrap();
        let out = b.result(r).unwrap();
        let graph = b.build().unwrap();
        assert_eq!(graph.nodes()[out.0].desc.shape, vec![2, 4]);
        assert_eq!(graph.parameters().count(), 1);
        assert_eq!(graph.results().count(), 1);
        assert!(graph.nodes()[y.0].op.changes_level());
    }

    #[test]
    fn bad_shapes_are_rejected() {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2, 3], ElementType::F32);
        let y = b.parameter("y", vec![3, 2], ElementType::F32);
        assert!(b.add(x, y).is_err());
        assert!(b.dot(x, x, 1).is_err());
        assert!(b.constant("c", vec![2], ElementType::F32, vec![1.0]).is_err());
    }

    #[test]
    fn reductions_check_their_axes() {
        let mut b = GraphBuilder::new();
        let x = b.parameter("x", vec![2, 3, 4], ElementType::F32);
        let m = b.max(x, vec![1, 2]).unwrap();
        let s = b.softmax(x, vec![2]).unwrap();
        let q = b.divide(s, s).unwrap();
        assert!(b.max(x, vec![3]).is_err());
        assert!(b.softmax(x, vec![5]).is_err());
        assert!(b.power(m, x).is_err());
        let graph = b.build().unwrap();
        assert_eq!(graph.nodes()[m.0].desc.shape, vec![2]);
        assert_eq!(graph.nodes()[s.0].desc.shape, vec![2, 3, 4]);
        assert!(graph.nodes()[q.0].op.changes_level());
        assert!(!graph.nodes()[s.0].op.changes_level());
    }

    #[test]
    fn binary_ops_need_two_inputs() {
        let desc = |name: &str| TensorDesc {
            name: name.into(),
            shape: vec![1],
            element_type: ElementType::F32,
        };
        let nodes = vec![
            Node {
                op: OpKind::Parameter { from_client: false },
                inputs: Vec::new(),
                output: TensorId(0),
                desc: desc("x"),
            },
            Node {
                op: OpKind::Minimum,
                inputs: vec![TensorId(0)],
                output: TensorId(1),
                desc: desc("m"),
            },
        ];
        assert!(matches!(Graph::new(nodes), Err(HeError::Validation { .. })));
    }

    #[test]
    fn use_before_definition_fails_validation() {
        let desc = TensorDesc {
            name: "r".into(),
            shape: vec![1],
            element_type: ElementType::F32,
        };
        let nodes = vec![Node {
            op: OpKind::Result,
            inputs: vec![TensorId(1)],
            output: TensorId(0),
            desc,
        }];
        assert!(Graph::new(nodes).is_err());
    }
}
