use hashbrown::HashMap;
use ndarray::ArrayD;

use crate::{Error, Result, ShardedTensor};

use super::build::Graph;
use super::exec;
use super::node::HostTensor;

/// Owns the device configuration and the persistent training state.
///
/// A session is configured with a fixed physical device count; every mesh
/// referenced by a graph it executes must multiply out to exactly that
/// count. Variables are created on first use and persist across runs until
/// [`Session::reset`].
pub struct Session {
    device_count: usize,
    pub(crate) variables: HashMap<String, ShardedTensor<f32>>,
    pub(crate) momenta: HashMap<String, ArrayD<f32>>,
    pub(crate) train_step: usize,
}

impl Session {
    /// Creates a session driving `device_count` devices.
    pub fn with_devices(device_count: usize) -> Result<Self> {
        if device_count == 0 {
            return Err(Error::Graph("session needs at least one device".into()));
        }
        Ok(Self {
            device_count,
            variables: HashMap::new(),
            momenta: HashMap::new(),
            train_step: 0,
        })
    }

    /// The physical device count configured for this session.
    pub fn device_count(&self) -> usize {
        self.device_count
    }

    /// Number of completed training steps.
    pub fn train_step(&self) -> usize {
        self.train_step
    }

    /// Drops all variables, momentum buffers, and the step counter.
    pub fn reset(&mut self) {
        self.variables.clear();
        self.momenta.clear();
        self.train_step = 0;
    }

    /// Executes a graph against concrete inputs, one per placeholder in
    /// declaration order, and returns the assembled output value.
    ///
    /// For graphs built in [`super::Mode::Train`] with an attached
    /// optimizer, a backward sweep follows the forward pass and variables
    /// are updated in place before the (pre-update) output is returned.
    pub fn run(&mut self, graph: &Graph, feeds: &[HostTensor]) -> Result<HostTensor> {
        exec::run(self, graph, feeds)
    }
}
