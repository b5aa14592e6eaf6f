use hashbrown::HashMap;
use ndarray::{ArrayD, Axis, Ix2, IxDyn, Slice};

use crate::cast;
use crate::sharding::{DeviceMesh, Distribution, Placement};
use crate::{Error, Result, ShardedTensor};

use super::build::{Graph, Mode};
use super::node::{HostTensor, Op};
use super::session::Session;

/// A graph value materialized on the devices.
enum DeviceValue {
    F32(ShardedTensor<f32>),
    I32(ShardedTensor<i32>),
}

impl DeviceValue {
    fn placement(&self) -> &Placement {
        match self {
            DeviceValue::F32(t) => t.placement(),
            DeviceValue::I32(t) => t.placement(),
        }
    }

    fn assemble(&self) -> Result<HostTensor> {
        match self {
            DeviceValue::F32(t) => Ok(HostTensor::F32(t.assemble()?)),
            DeviceValue::I32(t) => Ok(HostTensor::I32(t.assemble()?)),
        }
    }
}

pub(crate) fn run(session: &mut Session, graph: &Graph, feeds: &[HostTensor]) -> Result<HostTensor> {
    if feeds.len() != graph.placeholders().len() {
        return Err(Error::Graph(format!(
            "graph expects {} inputs, got {}",
            graph.placeholders().len(),
            feeds.len(),
        )));
    }

    let nodes = graph.nodes();
    let mut sharded: Vec<Option<DeviceValue>> = (0..nodes.len()).map(|_| None).collect();
    let mut globals: Vec<Option<HostTensor>> = (0..nodes.len()).map(|_| None).collect();
    let mut feed_idx = 0;

    for (id, node) in nodes.iter().enumerate() {
        let value = match &node.op {
            Op::Placeholder => {
                let feed = &feeds[feed_idx];
                feed_idx += 1;
                if feed.dtype() != node.dtype || feed.shape() != node.shape {
                    return Err(Error::Graph(format!(
                        "input {} expects a {:?} tensor of shape {:?}, got {:?} of shape {:?}",
                        feed_idx - 1,
                        node.dtype,
                        node.shape,
                        feed.dtype(),
                        feed.shape(),
                    )));
                }
                let placement =
                    Placement::broadcast(DeviceMesh::contiguous(vec![session.device_count()])?);
                match feed {
                    HostTensor::F32(a) => {
                        DeviceValue::F32(ShardedTensor::scatter(a, placement)?)
                    }
                    HostTensor::I32(a) => {
                        DeviceValue::I32(ShardedTensor::scatter(a, placement)?)
                    }
                }
            }
            Op::Variable {
                name,
                placement,
                init,
            } => {
                check_mesh(session, placement, "variable")?;
                let tensor = match session.variables.get(name) {
                    Some(existing) => existing.clone(),
                    None => {
                        let global = init.materialize(&node.shape)?;
                        let tensor = ShardedTensor::scatter(&global, placement.clone())?;
                        session.variables.insert(name.clone(), tensor.clone());
                        tensor
                    }
                };
                DeviceValue::F32(tensor)
            }
            Op::Cast {
                input,
                target,
                grad,
            } => {
                check_mesh(session, target, "cast")?;
                if let Some(grad) = grad {
                    check_mesh(session, grad, "cast gradient")?;
                }
                match value_at(&sharded, *input)? {
                    DeviceValue::F32(t) => DeviceValue::F32(cast::cast(t, target)?),
                    DeviceValue::I32(t) => DeviceValue::I32(cast::cast(t, target)?),
                }
            }
            Op::MatMul { lhs, rhs } => {
                let a = global_f32(&globals, *lhs)?;
                let b = global_f32(&globals, *rhs)?;
                let y = dot2(a, b)?;
                reshard_f32(y, value_at(&sharded, *lhs)?.placement())?
            }
            Op::Relu { input } => match value_at(&sharded, *input)? {
                DeviceValue::F32(t) => {
                    let has_partial = t
                        .placement()
                        .distribution()
                        .iter()
                        .any(|d| matches!(d, Distribution::PartialSum));
                    if has_partial {
                        let y = global_f32(&globals, *input)?.mapv(|v| v.max(0.0));
                        reshard_f32(y, t.placement())?
                    } else {
                        // Elementwise on broadcast/split shards: no exchange.
                        let shards = t.shards().iter().map(|s| s.mapv(|v| v.max(0.0))).collect();
                        DeviceValue::F32(ShardedTensor::from_parts(
                            shards,
                            t.global_shape().to_vec(),
                            t.placement().clone(),
                        ))
                    }
                }
                DeviceValue::I32(_) => {
                    return Err(Error::DTypeMismatch("relu expects an f32 tensor".into()));
                }
            },
            Op::ReduceSum {
                input,
                axes,
                keepdims,
            } => {
                let x = global_f32(&globals, *input)?;
                let mut y = x.clone();
                for &ax in axes.iter().rev() {
                    y = y.sum_axis(Axis(ax));
                    if *keepdims {
                        y = y.insert_axis(Axis(ax));
                    }
                }
                reshard_f32(y, value_at(&sharded, *input)?.placement())?
            }
            Op::Gather { input, indices } => {
                let x = global_f32(&globals, *input)?;
                let idx = gather_indices(&globals, *indices, x.len_of(Axis(0)))?;
                let y = x.select(Axis(0), &idx);
                reshard_f32(y, value_at(&sharded, *input)?.placement())?
            }
            Op::Slice { input, begin, size } => {
                let x = global_f32(&globals, *input)?;
                let mut view = x.view();
                for (ax, (&b, &s)) in begin.iter().zip(size).enumerate() {
                    view.slice_axis_inplace(Axis(ax), Slice::from(b..b + s));
                }
                reshard_f32(view.to_owned(), value_at(&sharded, *input)?.placement())?
            }
            Op::Reshape { input } => {
                let x = global_f32(&globals, *input)?;
                let y = reshape_to(x, &node.shape)?;
                reshard_f32(y, value_at(&sharded, *input)?.placement())?
            }
        };
        globals[id] = Some(value.assemble()?);
        sharded[id] = Some(value);
    }

    let output = globals[graph.output()]
        .clone()
        .ok_or_else(|| Error::Graph("graph output was never computed".into()))?;

    if graph.mode() == Mode::Train {
        if let Some((loss, sgd)) = graph.minimize() {
            let var_grads = backward(graph, &sharded, &globals, *loss)?;
            let step = session.train_step;
            for (name, grad) in var_grads {
                let var = session
                    .variables
                    .get_mut(&name)
                    .ok_or_else(|| Error::Graph(format!("unknown variable {name:?}")))?;
                let mut global = var.assemble()?;
                let buffer = session
                    .momenta
                    .entry(name.clone())
                    .or_insert_with(|| ArrayD::zeros(global.raw_dim()));
                sgd.update(step, &mut global, &grad, buffer);
                *var = ShardedTensor::scatter(&global, var.placement().clone())?;
            }
            session.train_step += 1;
        }
    }

    Ok(output)
}

/// Reverse sweep from the minimized node, returning per-variable gradients.
///
/// Gradients flow as logical values except through cast nodes, where the
/// incoming gradient is re-sharded and cast to the manual gradient placement
/// if one was attached, or back to the input's placement otherwise.
fn backward(
    graph: &Graph,
    sharded: &[Option<DeviceValue>],
    globals: &[Option<HostTensor>],
    loss: usize,
) -> Result<HashMap<String, ArrayD<f32>>> {
    let nodes = graph.nodes();
    let mut grads: Vec<Option<ArrayD<f32>>> = (0..nodes.len()).map(|_| None).collect();
    grads[loss] = Some(ArrayD::from_elem(IxDyn(&nodes[loss].shape), 1.0));
    let mut var_grads = HashMap::new();

    for id in (0..nodes.len()).rev() {
        let Some(grad) = grads[id].take() else {
            continue;
        };
        match &nodes[id].op {
            Op::Placeholder => {}
            Op::Variable { name, .. } => {
                accumulate_named(&mut var_grads, name, grad);
            }
            Op::Cast { input, grad: manual, .. } => {
                let out_placement = value_at(sharded, id)?.placement().clone();
                let back_target = match manual {
                    Some(placement) => placement.clone(),
                    None => value_at(sharded, *input)?.placement().clone(),
                };
                let g = ShardedTensor::scatter(&grad, out_placement)?;
                let g = cast::cast(&g, &back_target)?;
                accumulate(&mut grads, *input, g.assemble()?);
            }
            Op::MatMul { lhs, rhs } => {
                let a = global_f32(globals, *lhs)?;
                let b = global_f32(globals, *rhs)?;
                let ga = dot2_t(&grad, b, false)?;
                let gb = dot2_t(a, &grad, true)?;
                accumulate(&mut grads, *lhs, ga);
                accumulate(&mut grads, *rhs, gb);
            }
            Op::Relu { input } => {
                let x = global_f32(globals, *input)?;
                let mut gx = grad;
                gx.zip_mut_with(x, |g, &v| {
                    if v <= 0.0 {
                        *g = 0.0;
                    }
                });
                accumulate(&mut grads, *input, gx);
            }
            Op::ReduceSum {
                input,
                axes,
                keepdims,
            } => {
                let in_shape = &nodes[*input].shape;
                let mut g = grad;
                if !keepdims {
                    for &ax in axes {
                        g = g.insert_axis(Axis(ax));
                    }
                }
                let gx = g
                    .broadcast(IxDyn(in_shape))
                    .ok_or_else(|| {
                        Error::ShapeMismatch(format!(
                            "cannot broadcast gradient {:?} to {in_shape:?}",
                            g.shape()
                        ))
                    })?
                    .to_owned();
                accumulate(&mut grads, *input, gx);
            }
            Op::Gather { input, indices } => {
                let in_shape = &nodes[*input].shape;
                let idx = gather_indices(globals, *indices, in_shape[0])?;
                let mut gx = ArrayD::zeros(IxDyn(in_shape));
                for (row, &target) in idx.iter().enumerate() {
                    let source = grad.index_axis(Axis(0), row);
                    let mut dest = gx.index_axis_mut(Axis(0), target);
                    dest += &source;
                }
                accumulate(&mut grads, *input, gx);
            }
            Op::Slice { input, begin, size } => {
                let in_shape = &nodes[*input].shape;
                let mut gx = ArrayD::zeros(IxDyn(in_shape));
                let mut dest = gx.view_mut();
                for (ax, (&b, &s)) in begin.iter().zip(size).enumerate() {
                    dest.slice_axis_inplace(Axis(ax), Slice::from(b..b + s));
                }
                dest.assign(&grad);
                accumulate(&mut grads, *input, gx);
            }
            Op::Reshape { input } => {
                let gx = reshape_to(&grad, &nodes[*input].shape)?;
                accumulate(&mut grads, *input, gx);
            }
        }
    }

    Ok(var_grads)
}

fn accumulate(grads: &mut [Option<ArrayD<f32>>], id: usize, grad: ArrayD<f32>) {
    match &mut grads[id] {
        Some(existing) => *existing += &grad,
        slot @ None => *slot = Some(grad),
    }
}

fn accumulate_named(
    grads: &mut HashMap<String, ArrayD<f32>>,
    name: &str,
    grad: ArrayD<f32>,
) {
    match grads.get_mut(name) {
        Some(existing) => *existing += &grad,
        None => {
            grads.insert(name.to_string(), grad);
        }
    }
}

fn value_at<'a>(sharded: &'a [Option<DeviceValue>], id: usize) -> Result<&'a DeviceValue> {
    sharded[id]
        .as_ref()
        .ok_or_else(|| Error::Graph("value referenced before it was computed".into()))
}

fn global_f32<'a>(globals: &'a [Option<HostTensor>], id: usize) -> Result<&'a ArrayD<f32>> {
    globals[id]
        .as_ref()
        .ok_or_else(|| Error::Graph("value referenced before it was computed".into()))?
        .as_f32()
}

fn gather_indices(
    globals: &[Option<HostTensor>],
    id: usize,
    rows: usize,
) -> Result<Vec<usize>> {
    let indices = globals[id]
        .as_ref()
        .ok_or_else(|| Error::Graph("value referenced before it was computed".into()))?
        .as_i32()?;
    indices
        .iter()
        .map(|&v| {
            if v < 0 || v as usize >= rows {
                Err(Error::Graph(format!(
                    "gather index {v} out of range for {rows} rows"
                )))
            } else {
                Ok(v as usize)
            }
        })
        .collect()
}

fn check_mesh(session: &Session, placement: &Placement, what: &str) -> Result<()> {
    let count = placement.mesh().num_devices();
    if count != session.device_count() {
        return Err(Error::Graph(format!(
            "{what} hierarchy {:?} needs {count} devices but the session has {}",
            placement.mesh().shape(),
            session.device_count(),
        )));
    }
    Ok(())
}

/// Re-shards an operator result, keeping as much of the operand's placement
/// as the new shape permits. Split tags past the output rank and partial-sum
/// tags (the value is already fully reduced) fall back to broadcast.
fn reshard_f32(value: ArrayD<f32>, operand: &Placement) -> Result<DeviceValue> {
    let out_ndim = value.ndim();
    let distribution = operand
        .distribution()
        .iter()
        .map(|d| match *d {
            Distribution::Split(k) if k < out_ndim => Distribution::Split(k),
            _ => Distribution::Broadcast,
        })
        .collect();
    let placement = Placement::new(operand.mesh().clone(), distribution)?;
    Ok(DeviceValue::F32(ShardedTensor::scatter(&value, placement)?))
}

fn dot2(a: &ArrayD<f32>, b: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let a2 = a
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
    let b2 = b
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
    Ok(a2.dot(&b2).into_dyn())
}

/// `g . b^T` when `transpose_lhs` is false, `a^T . g` when true.
fn dot2_t(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>, transpose_lhs: bool) -> Result<ArrayD<f32>> {
    let l = lhs
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
    let r = rhs
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
    let out = if transpose_lhs {
        l.t().dot(&r)
    } else {
        l.dot(&r.t())
    };
    Ok(out.into_dyn())
}

fn reshape_to(value: &ArrayD<f32>, shape: &[usize]) -> Result<ArrayD<f32>> {
    value
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order(IxDyn(shape))
        .map_err(|e| Error::ShapeMismatch(e.to_string()))
}
