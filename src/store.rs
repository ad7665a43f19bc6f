use std::collections::HashMap;

use crate::errors::{HeError, HeResult};
use crate::graph::TensorId;
use crate::tensor::HeTensor;

/// Tensors alive during one call, keyed by graph tensor id.
#[derive(Debug)]
pub struct TensorStore<C> {
    tensors: HashMap<TensorId, HeTensor<C>>,
}

impl<C> TensorStore<C> {
    pub fn new() -> Self {
        Self {
            tensors: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: TensorId, tensor: HeTensor<C>) {
        self.tensors.insert(id, tensor);
    }

    pub fn get(&self, id: TensorId) -> HeResult<&HeTensor<C>> {
        self.tensors
            .get(&id)
            .ok_or(HeError::MissingTensor { id: id.0 })
    }

    pub fn get_mut(&mut self, id: TensorId) -> HeResult<&mut HeTensor<C>> {
        self.tensors
            .get_mut(&id)
            .ok_or(HeError::MissingTensor { id: id.0 })
    }

    pub fn take(&mut self, id: TensorId) -> HeResult<HeTensor<C>> {
        self.tensors
            .remove(&id)
            .ok_or(HeError::MissingTensor { id: id.0 })
    }

    /// Drops a tensor after its last use. Evicting twice is an error.
    pub fn evict(&mut self, id: TensorId) -> HeResult<()> {
        self.take(id).map(drop)
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.tensors.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl<C> Default for TensorStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::ElementType;

    #[test]
    fn evict_exactly_once() {
        let mut store: TensorStore<()> = TensorStore::new();
        store.insert(
            TensorId(3),
            HeTensor::new_plain("t", ElementType::F32, vec![2], false, false),
        );
        assert!(store.contains(TensorId(3)));
        store.evict(TensorId(3)).unwrap();
        assert!(store.is_empty());
        assert!(matches!(
            store.evict(TensorId(3)),
            Err(HeError::MissingTensor { id: 3 })
        ));
    }
}
