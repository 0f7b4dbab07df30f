use std::sync::Arc;

use crate::config::Config;
use crate::error::{Result, StrataError};
use crate::storage::Storage;

/// One storage layer of the union. Immutable after mount; every other
/// component refers to layers by index into the [`LayerStack`].
pub struct Layer {
    /// Stable index within the stack. Index 0 is the upper layer; lower
    /// layers follow from topmost-lower to bottom.
    pub index: usize,
    pub is_upper: bool,
    /// Filesystem-instance id, mixed into display inode numbers when
    /// remapping is enabled.
    pub fsid: u64,
    pub store: Arc<dyn Storage>,
}

/// The ordered set of layers plus the session configuration.
pub struct LayerStack {
    layers: Vec<Layer>,
    config: Config,
}

impl LayerStack {
    /// Assemble a stack from one writable upper store and at least one
    /// read-only lower store, ordered topmost-lower first.
    pub fn new(
        upper: Arc<dyn Storage>,
        lowers: Vec<Arc<dyn Storage>>,
        config: Config,
    ) -> Result<Self> {
        if lowers.is_empty() {
            return Err(StrataError::Inconsistent(
                "a union requires at least one lower layer".into(),
            ));
        }
        let mut layers = Vec::with_capacity(lowers.len() + 1);
        layers.push(Layer { index: 0, is_upper: true, fsid: 0, store: upper });
        for (i, store) in lowers.into_iter().enumerate() {
            layers.push(Layer { index: i + 1, is_upper: false, fsid: (i + 1) as u64, store });
        }
        Ok(LayerStack { layers, config })
    }

    pub fn upper(&self) -> &Layer {
        &self.layers[0]
    }

    pub fn lowers(&self) -> &[Layer] {
        &self.layers[1..]
    }

    pub fn layer(&self, index: usize) -> &Layer {
        &self.layers[index]
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
