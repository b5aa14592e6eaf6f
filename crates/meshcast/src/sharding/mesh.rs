use crate::{Error, Result};

/// Represents a logical arrangement of devices used for parallel computation.
///
/// A `DeviceMesh` defines a structured, N-dimensional topology over a set of
/// physical devices. The mesh shape is an ordered sequence of positive
/// integers whose product equals the device count: `[2, 2]` arranges four
/// devices as two groups of two, `[4]` arranges the same devices flat. Nested
/// mesh axes are what make hierarchical distribution specifiers possible: a
/// tensor can be split across the outer axis and replicated across the inner
/// one, or vice versa.
///
/// Devices are stored in row-major order with respect to the mesh shape, so
/// for a `[2, 2]` mesh the linear order is `(0,0), (0,1), (1,0), (1,1)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMesh {
    /// Physical devices in an n-dimensional logical arrangement.
    devices: Vec<usize>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
}

impl DeviceMesh {
    /// Builds a mesh over devices `0..shape.product()` in row-major order.
    pub fn contiguous<S: Into<Vec<usize>>>(shape: S) -> Result<Self> {
        let shape = shape.into();
        let count: usize = shape.iter().product();
        DeviceMeshBuilder::new((0..count).collect(), shape).build()
    }

    /// Shape of the logical mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Devices of the mesh in linear (row-major) order.
    pub fn devices(&self) -> &[usize] {
        &self.devices
    }

    /// Number of mesh axes.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of devices in the mesh.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Size of one mesh axis.
    pub fn axis_size(&self, axis: usize) -> usize {
        self.shape[axis]
    }

    /// Mesh coordinates of a device given its linear position.
    pub fn coords(&self, linear: usize) -> Vec<usize> {
        let mut rem = linear;
        let mut out = vec![0; self.shape.len()];
        for axis in (0..self.shape.len()).rev() {
            out[axis] = rem % self.shape[axis];
            rem /= self.shape[axis];
        }
        out
    }

    /// Linear position of a device given its mesh coordinates.
    pub fn linear(&self, coords: &[usize]) -> usize {
        coords
            .iter()
            .zip(&self.shape)
            .fold(0, |acc, (&c, &s)| acc * s + c)
    }

    /// Groups of linear device positions that vary only along `axis`.
    ///
    /// Each group is ordered by its coordinate along `axis` and is the set of
    /// peers participating in one collective when that axis changes
    /// distribution. Groups partition the mesh, so a collective over all
    /// groups forms a synchronization barrier across the whole axis.
    pub fn axis_groups(&self, axis: usize) -> Vec<Vec<usize>> {
        let mut groups = Vec::with_capacity(self.num_devices() / self.shape[axis]);
        for linear in 0..self.num_devices() {
            let coords = self.coords(linear);
            if coords[axis] != 0 {
                continue;
            }
            let group = (0..self.shape[axis])
                .map(|c| {
                    let mut peer = coords.clone();
                    peer[axis] = c;
                    self.linear(&peer)
                })
                .collect();
            groups.push(group);
        }
        groups
    }
}

/// A builder for constructing a [`DeviceMesh`].
///
/// Validates that the mesh shape is non-degenerate and that the device count
/// matches the product of the shape before the mesh can be used.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder {
    devices: Vec<usize>,
    shape: Vec<usize>,
}

impl DeviceMeshBuilder {
    /// Creates a new [`DeviceMeshBuilder`] with the given devices and shape.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<usize>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
        }
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidMesh`] when the shape is empty, an axis has
    /// size zero, or the device count does not match the shape product.
    pub fn build(self) -> Result<DeviceMesh> {
        if self.shape.is_empty() {
            return Err(Error::InvalidMesh("mesh shape must not be empty".into()));
        }
        if self.shape.iter().any(|&s| s == 0) {
            return Err(Error::InvalidMesh(format!(
                "mesh shape {:?} contains a zero-sized axis",
                self.shape
            )));
        }
        let expected_devices: usize = self.shape.iter().product();
        if self.devices.len() != expected_devices {
            return Err(Error::InvalidMesh(format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.devices.len(),
                self.shape,
            )));
        }
        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_mesh_2x2() {
        let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2]).build();

        assert!(mesh.is_ok());
    }

    #[test]
    #[should_panic = "Device count (4) doesn't match mesh shape [3, 2]"]
    fn test_device_mesh_devices_should_match_shape() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [3, 2])
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "mesh shape must not be empty"]
    fn test_device_mesh_shape_should_not_be_empty() {
        let _mesh = DeviceMeshBuilder::new(vec![], []).build().unwrap();
    }

    #[test]
    #[should_panic = "zero-sized axis"]
    fn test_device_mesh_axis_should_not_be_zero() {
        let _mesh = DeviceMeshBuilder::new(vec![], [2, 0]).build().unwrap();
    }

    #[test]
    fn test_coords_round_trip() {
        let mesh = DeviceMesh::contiguous([2, 3]).unwrap();
        for linear in 0..6 {
            let coords = mesh.coords(linear);
            assert_eq!(mesh.linear(&coords), linear);
        }
        assert_eq!(mesh.coords(4), vec![1, 1]);
    }

    #[test]
    fn test_axis_groups() {
        let mesh = DeviceMesh::contiguous([2, 2]).unwrap();
        assert_eq!(mesh.axis_groups(0), vec![vec![0, 2], vec![1, 3]]);
        assert_eq!(mesh.axis_groups(1), vec![vec![0, 1], vec![2, 3]]);
    }
}
