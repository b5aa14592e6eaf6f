use core::fmt;
use core::str::FromStr;

use crate::{Error, Result};

use super::DeviceMesh;

/// Specifies how a single mesh axis distributes a tensor.
///
/// One tag is attached per mesh axis, so a `[2, 2]` mesh carries two tags.
/// The tags compose by nested narrowing in mesh-axis order: with
/// `[Split(0), Split(0)]` the outer axis partitions tensor axis 0 into two
/// chunks and the inner axis partitions each chunk again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Distribution {
    /// Every device along the axis holds a full copy. Written `B`.
    Broadcast,
    /// Tensor axis `k` is partitioned across the devices of the mesh axis.
    /// Written `S(k)`.
    Split(usize),
    /// Each device along the axis holds an addend; the logical value is the
    /// elementwise sum over the axis. Written `P`.
    PartialSum,
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Distribution::Broadcast => write!(f, "B"),
            Distribution::Split(k) => write!(f, "S({k})"),
            Distribution::PartialSum => write!(f, "P"),
        }
    }
}

impl FromStr for Distribution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "B" => Ok(Distribution::Broadcast),
            "P" => Ok(Distribution::PartialSum),
            _ => {
                let axis = s
                    .strip_prefix("S(")
                    .and_then(|rest| rest.strip_suffix(')'))
                    .and_then(|axis| axis.parse::<usize>().ok())
                    .ok_or_else(|| {
                        Error::InvalidDistribution(format!(
                            "unknown distribution tag {s:?}, expected \"B\", \"S(k)\" or \"P\""
                        ))
                    })?;
                Ok(Distribution::Split(axis))
            }
        }
    }
}

/// A device mesh together with one [`Distribution`] tag per mesh axis.
///
/// A `Placement` fully describes the physical layout of a logical tensor:
/// which devices hold data, and what slice (or addend, or copy) of the
/// logical value each one holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    mesh: DeviceMesh,
    distribution: Vec<Distribution>,
}

impl Placement {
    /// Pairs a mesh with a distribution vector.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDistribution`] when the vector length does not
    /// match the mesh rank.
    pub fn new(mesh: DeviceMesh, distribution: Vec<Distribution>) -> Result<Self> {
        if distribution.len() != mesh.rank() {
            return Err(Error::InvalidDistribution(format!(
                "distribution {:?} has {} axes but mesh shape {:?} has rank {}",
                distribution,
                distribution.len(),
                mesh.shape(),
                mesh.rank(),
            )));
        }
        Ok(Self { mesh, distribution })
    }

    /// Builds a placement over a contiguous mesh from textual tags.
    ///
    /// ```
    /// use meshcast::sharding::Placement;
    ///
    /// let placement = Placement::from_tags(&[2, 2], &["B", "S(1)"]).unwrap();
    /// assert_eq!(placement.mesh().num_devices(), 4);
    /// ```
    pub fn from_tags(mesh_shape: &[usize], tags: &[&str]) -> Result<Self> {
        let mesh = DeviceMesh::contiguous(mesh_shape.to_vec())?;
        let distribution = tags
            .iter()
            .map(|tag| tag.parse())
            .collect::<Result<Vec<_>>>()?;
        Self::new(mesh, distribution)
    }

    /// A placement that replicates the full value on every device.
    pub fn broadcast(mesh: DeviceMesh) -> Self {
        let distribution = vec![Distribution::Broadcast; mesh.rank()];
        Self { mesh, distribution }
    }

    /// The device mesh of this placement.
    pub fn mesh(&self) -> &DeviceMesh {
        &self.mesh
    }

    /// The per-axis distribution tags of this placement.
    pub fn distribution(&self) -> &[Distribution] {
        &self.distribution
    }

    /// Whether every axis is [`Distribution::Broadcast`].
    pub fn is_fully_broadcast(&self) -> bool {
        self.distribution
            .iter()
            .all(|d| matches!(d, Distribution::Broadcast))
    }

    /// Checks that every `Split(k)` refers to an existing tensor axis.
    pub fn validate_for(&self, tensor_ndim: usize) -> Result<()> {
        for dist in &self.distribution {
            if let Distribution::Split(k) = dist {
                if *k >= tensor_ndim {
                    return Err(Error::InvalidDistribution(format!(
                        "S({k}) refers past the last axis of a {tensor_ndim}-d tensor"
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn set_axis(&mut self, axis: usize, dist: Distribution) {
        self.distribution[axis] = dist;
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[", self.mesh.shape())?;
        for (i, d) in self.distribution.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}
