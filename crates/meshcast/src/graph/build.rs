use hashbrown::HashSet;

use crate::optim::Sgd;
use crate::sharding::Placement;
use crate::{Error, Result};

use super::node::{DType, Initializer, Node, Op};

/// Identifies a tensor value inside a graph under construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TensorId(pub(crate) usize);

/// Whether a graph runs inference only or also a training step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Forward pass only.
    Predict,
    /// Forward pass plus backward sweep and optimizer step.
    Train,
}

/// Records a computation as a sequence of typed nodes.
///
/// Every operator method validates shapes and element kinds eagerly, so a
/// malformed graph fails at build time rather than mid-execution.
pub struct GraphBuilder {
    mode: Mode,
    nodes: Vec<Node>,
    placeholders: Vec<usize>,
    var_names: HashSet<String>,
    minimize: Option<(usize, Sgd)>,
}

impl GraphBuilder {
    /// Starts an empty graph in the given mode.
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            nodes: Vec::new(),
            placeholders: Vec::new(),
            var_names: HashSet::new(),
            minimize: None,
        }
    }

    fn push(&mut self, op: Op, shape: Vec<usize>, dtype: DType) -> TensorId {
        let id = self.nodes.len();
        self.nodes.push(Node { op, shape, dtype });
        TensorId(id)
    }

    fn node(&self, id: TensorId) -> &Node {
        &self.nodes[id.0]
    }

    fn expect_f32(&self, id: TensorId, what: &str) -> Result<()> {
        if self.node(id).dtype != DType::F32 {
            return Err(Error::DTypeMismatch(format!("{what} expects an f32 tensor")));
        }
        Ok(())
    }

    /// Declares a typed input, fed positionally at execution time.
    pub fn placeholder(&mut self, _name: &str, shape: &[usize], dtype: DType) -> TensorId {
        let id = self.push(Op::Placeholder, shape.to_vec(), dtype);
        self.placeholders.push(id.0);
        id
    }

    /// Declares a named persistent variable with a placement and initializer.
    ///
    /// The variable's value lives in the [`super::Session`] and survives
    /// across runs, which is what lets optimizer updates accumulate.
    pub fn variable(
        &mut self,
        name: &str,
        shape: &[usize],
        placement: Placement,
        init: Initializer,
    ) -> Result<TensorId> {
        if !self.var_names.insert(name.to_string()) {
            return Err(Error::Graph(format!("variable {name:?} declared twice")));
        }
        placement.validate_for(shape.len())?;
        if matches!(init, Initializer::Identity) && (shape.len() != 2 || shape[0] != shape[1]) {
            return Err(Error::ShapeMismatch(format!(
                "identity initializer needs a square matrix, got {shape:?}"
            )));
        }
        Ok(self.push(
            Op::Variable {
                name: name.to_string(),
                placement,
                init,
            },
            shape.to_vec(),
            DType::F32,
        ))
    }

    /// Casts a tensor to a new placement, mirroring the cast for gradients.
    pub fn parallel_cast(&mut self, input: TensorId, target: Placement) -> Result<TensorId> {
        self.cast_inner(input, target, None)
    }

    /// Casts a tensor to a new placement with a manual gradient placement.
    ///
    /// During the backward sweep the incoming gradient is cast to `grad`
    /// instead of back to the input's placement, allowing asymmetric
    /// forward/backward communication patterns.
    pub fn parallel_cast_with_grad(
        &mut self,
        input: TensorId,
        target: Placement,
        grad: Placement,
    ) -> Result<TensorId> {
        self.cast_inner(input, target, Some(grad))
    }

    fn cast_inner(
        &mut self,
        input: TensorId,
        target: Placement,
        grad: Option<Placement>,
    ) -> Result<TensorId> {
        let node = self.node(input);
        let (shape, dtype) = (node.shape.clone(), node.dtype);
        target.validate_for(shape.len())?;
        if let Some(grad) = &grad {
            grad.validate_for(shape.len())?;
        }
        Ok(self.push(
            Op::Cast {
                input: input.0,
                target,
                grad,
            },
            shape,
            dtype,
        ))
    }

    /// Matrix product of two rank-2 tensors.
    pub fn matmul(&mut self, lhs: TensorId, rhs: TensorId) -> Result<TensorId> {
        self.expect_f32(lhs, "matmul")?;
        self.expect_f32(rhs, "matmul")?;
        let a = &self.node(lhs).shape;
        let b = &self.node(rhs).shape;
        if a.len() != 2 || b.len() != 2 {
            return Err(Error::ShapeMismatch(format!(
                "matmul expects rank-2 operands, got {a:?} and {b:?}"
            )));
        }
        if a[1] != b[0] {
            return Err(Error::ShapeMismatch(format!(
                "matmul inner dimensions differ: {a:?} x {b:?}"
            )));
        }
        let shape = vec![a[0], b[1]];
        Ok(self.push(
            Op::MatMul {
                lhs: lhs.0,
                rhs: rhs.0,
            },
            shape,
            DType::F32,
        ))
    }

    /// Elementwise rectified linear unit.
    pub fn relu(&mut self, input: TensorId) -> Result<TensorId> {
        self.expect_f32(input, "relu")?;
        let shape = self.node(input).shape.clone();
        Ok(self.push(Op::Relu { input: input.0 }, shape, DType::F32))
    }

    /// Sum over a set of axes, optionally keeping them as size-1 dims.
    pub fn reduce_sum(
        &mut self,
        input: TensorId,
        axes: &[usize],
        keepdims: bool,
    ) -> Result<TensorId> {
        self.expect_f32(input, "reduce_sum")?;
        let in_shape = self.node(input).shape.clone();
        let mut axes = axes.to_vec();
        axes.sort_unstable();
        axes.dedup();
        if axes.iter().any(|&ax| ax >= in_shape.len()) {
            return Err(Error::ShapeMismatch(format!(
                "reduce_sum axes {axes:?} out of range for shape {in_shape:?}"
            )));
        }
        let mut shape = Vec::new();
        for (ax, &dim) in in_shape.iter().enumerate() {
            if axes.contains(&ax) {
                if keepdims {
                    shape.push(1);
                }
            } else {
                shape.push(dim);
            }
        }
        Ok(self.push(
            Op::ReduceSum {
                input: input.0,
                axes,
                keepdims,
            },
            shape,
            DType::F32,
        ))
    }

    /// Rows of `input` selected by a rank-1 integer index tensor.
    pub fn gather(&mut self, input: TensorId, indices: TensorId) -> Result<TensorId> {
        self.expect_f32(input, "gather")?;
        if self.node(indices).dtype != DType::I32 {
            return Err(Error::DTypeMismatch("gather indices must be i32".into()));
        }
        let idx_shape = &self.node(indices).shape;
        if idx_shape.len() != 1 {
            return Err(Error::ShapeMismatch(format!(
                "gather indices must be rank 1, got {idx_shape:?}"
            )));
        }
        let in_shape = &self.node(input).shape;
        if in_shape.is_empty() {
            return Err(Error::ShapeMismatch("gather input must have rank >= 1".into()));
        }
        let mut shape = vec![self.node(indices).shape[0]];
        shape.extend_from_slice(&self.node(input).shape[1..]);
        Ok(self.push(
            Op::Gather {
                input: input.0,
                indices: indices.0,
            },
            shape,
            DType::F32,
        ))
    }

    /// A contiguous sub-block, one `(begin, size)` pair per axis.
    pub fn slice(&mut self, input: TensorId, begin: &[usize], size: &[usize]) -> Result<TensorId> {
        self.expect_f32(input, "slice")?;
        let in_shape = self.node(input).shape.clone();
        if begin.len() != in_shape.len() || size.len() != in_shape.len() {
            return Err(Error::ShapeMismatch(format!(
                "slice needs one (begin, size) pair per axis of {in_shape:?}"
            )));
        }
        for (ax, ((&b, &s), &dim)) in begin.iter().zip(size).zip(&in_shape).enumerate() {
            if b + s > dim {
                return Err(Error::ShapeMismatch(format!(
                    "slice [{b}, {}) exceeds axis {ax} of length {dim}",
                    b + s
                )));
            }
        }
        Ok(self.push(
            Op::Slice {
                input: input.0,
                begin: begin.to_vec(),
                size: size.to_vec(),
            },
            size.to_vec(),
            DType::F32,
        ))
    }

    /// Reinterprets the value under a new shape; one dim may be `-1`.
    pub fn reshape(&mut self, input: TensorId, shape: &[i64]) -> Result<TensorId> {
        self.expect_f32(input, "reshape")?;
        let in_shape = self.node(input).shape.clone();
        let total: usize = in_shape.iter().product();
        let mut known: usize = 1;
        let mut infer = None;
        for (ax, &dim) in shape.iter().enumerate() {
            match dim {
                -1 if infer.is_none() => infer = Some(ax),
                -1 => {
                    return Err(Error::ShapeMismatch(
                        "reshape allows at most one -1 dimension".into(),
                    ));
                }
                d if d < 0 => {
                    return Err(Error::ShapeMismatch(format!(
                        "reshape dimension {d} is negative"
                    )));
                }
                d => known *= d as usize,
            }
        }
        let mut out: Vec<usize> = shape
            .iter()
            .map(|&d| if d < 0 { 0 } else { d as usize })
            .collect();
        if let Some(ax) = infer {
            if known == 0 || total % known != 0 {
                return Err(Error::ShapeMismatch(format!(
                    "cannot infer -1 in reshape of {total} elements to {shape:?}"
                )));
            }
            out[ax] = total / known;
        } else if known != total {
            return Err(Error::ShapeMismatch(format!(
                "reshape of {total} elements to {shape:?} changes the element count"
            )));
        }
        Ok(self.push(Op::Reshape { input: input.0 }, out, DType::F32))
    }

    /// Attaches an SGD step minimizing `loss` (summed over its elements).
    ///
    /// Only valid in [`Mode::Train`].
    pub fn minimize(&mut self, loss: TensorId, sgd: Sgd) -> Result<()> {
        if self.mode != Mode::Train {
            return Err(Error::Graph("minimize requires Mode::Train".into()));
        }
        self.expect_f32(loss, "minimize")?;
        if self.minimize.is_some() {
            return Err(Error::Graph("minimize attached twice".into()));
        }
        self.minimize = Some((loss.0, sgd));
        Ok(())
    }

    /// Seals the graph with its return value.
    pub fn finish(self, output: TensorId) -> Graph {
        Graph {
            mode: self.mode,
            nodes: self.nodes,
            placeholders: self.placeholders,
            minimize: self.minimize,
            output: output.0,
        }
    }
}

/// A sealed computation ready for execution by a [`super::Session`].
pub struct Graph {
    mode: Mode,
    nodes: Vec<Node>,
    placeholders: Vec<usize>,
    minimize: Option<(usize, Sgd)>,
    output: usize,
}

impl Graph {
    /// The execution mode the graph was built in.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn placeholders(&self) -> &[usize] {
        &self.placeholders
    }

    pub(crate) fn minimize(&self) -> Option<&(usize, Sgd)> {
        self.minimize.as_ref()
    }

    pub(crate) fn output(&self) -> usize {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::PiecewiseConstantScheduler;

    #[test]
    fn test_matmul_shape_inference() {
        let mut g = GraphBuilder::new(Mode::Predict);
        let a = g.placeholder("a", &[4, 8], DType::F32);
        let b = g.placeholder("b", &[8, 2], DType::F32);
        let y = g.matmul(a, b).unwrap();
        assert_eq!(g.node(y).shape, vec![4, 2]);
    }

    #[test]
    fn test_matmul_inner_dims_must_agree() {
        let mut g = GraphBuilder::new(Mode::Predict);
        let a = g.placeholder("a", &[4, 8], DType::F32);
        let b = g.placeholder("b", &[4, 2], DType::F32);
        assert!(g.matmul(a, b).is_err());
    }

    #[test]
    fn test_reduce_sum_keepdims_shape() {
        let mut g = GraphBuilder::new(Mode::Predict);
        let x = g.placeholder("x", &[4, 8], DType::F32);
        let kept = g.reduce_sum(x, &[1], true).unwrap();
        assert_eq!(g.node(kept).shape, vec![4, 1]);
        let dropped = g.reduce_sum(x, &[1], false).unwrap();
        assert_eq!(g.node(dropped).shape, vec![4]);
    }

    #[test]
    fn test_reshape_infers_one_dim() {
        let mut g = GraphBuilder::new(Mode::Predict);
        let x = g.placeholder("x", &[8, 8], DType::F32);
        let y = g.reshape(x, &[4, 2, -1]).unwrap();
        assert_eq!(g.node(y).shape, vec![4, 2, 8]);
        assert!(g.reshape(x, &[-1, -1]).is_err());
        assert!(g.reshape(x, &[3, 7]).is_err());
    }

    #[test]
    fn test_slice_bounds_checked() {
        let mut g = GraphBuilder::new(Mode::Predict);
        let x = g.placeholder("x", &[4, 8], DType::F32);
        assert!(g.slice(x, &[0, 1], &[4, 7]).is_ok());
        assert!(g.slice(x, &[0, 2], &[4, 7]).is_err());
    }

    #[test]
    fn test_minimize_needs_train_mode() {
        let mut g = GraphBuilder::new(Mode::Predict);
        let x = g.placeholder("x", &[4], DType::F32);
        let sgd = Sgd::new(
            PiecewiseConstantScheduler::new(vec![], vec![1e-3]).unwrap(),
            0.0,
        );
        assert!(g.minimize(x, sgd).is_err());
    }

    #[test]
    fn test_duplicate_variable_rejected() {
        let mut g = GraphBuilder::new(Mode::Predict);
        let placement = Placement::from_tags(&[4], &["B"]).unwrap();
        g.variable("v", &[4, 4], placement.clone(), Initializer::Ones)
            .unwrap();
        assert!(g.variable("v", &[4, 4], placement, Initializer::Ones).is_err());
    }

    #[test]
    fn test_gather_requires_i32_indices() {
        let mut g = GraphBuilder::new(Mode::Predict);
        let x = g.placeholder("x", &[8, 4], DType::F32);
        let bad = g.placeholder("idx", &[3], DType::F32);
        assert!(g.gather(x, bad).is_err());
        let idx = g.placeholder("idx2", &[3], DType::I32);
        let y = g.gather(x, idx).unwrap();
        assert_eq!(g.node(y).shape, vec![3, 4]);
    }
}
