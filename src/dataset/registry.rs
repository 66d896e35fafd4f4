// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

//! ComId→DatasetId mapping, dataset storage, cycle detection and the
//! per-comId cached size (spec.md §4.8 "Size computation").

use crate::dataset::types::{Count, Dataset, DatasetId, ElementKind};
use crate::error::{Error, Result};
use std::collections::HashMap;

/// Cached result of the first size computation for a comId. Static
/// datasets (no dynamic arrays anywhere in the tree) carry an exact size;
/// dynamic ones carry an upper bound only — the actual marshalled size of
/// any one instance may be smaller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeInfo {
    pub marshalled_size: usize,
    pub max_depth: u32,
    pub is_static: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
    datasets: HashMap<DatasetId, Dataset>,
    com_id_to_dataset: HashMap<u32, DatasetId>,
    size_cache: HashMap<u32, SizeInfo>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset definition. Does not itself check for cycles —
    /// call [`Registry::check_acyclic`] once the whole set of datasets a
    /// session needs has been registered, since a back-edge may point to a
    /// dataset registered later.
    pub fn define(&mut self, dataset: Dataset) {
        self.datasets.insert(dataset.id, dataset);
    }

    pub fn bind_com_id(&mut self, com_id: u32, dataset_id: DatasetId) -> Result<()> {
        if !self.datasets.contains_key(&dataset_id) {
            return Err(Error::Marshalling("unknown dataset id"));
        }
        self.com_id_to_dataset.insert(com_id, dataset_id);
        Ok(())
    }

    pub fn dataset_for_com_id(&self, com_id: u32) -> Result<&Dataset> {
        let dataset_id = self.com_id_to_dataset.get(&com_id).ok_or(Error::Marshalling(
            "unknown comId",
        ))?;
        self.datasets.get(dataset_id).ok_or(Error::Marshalling("unknown dataset id"))
    }

    pub fn dataset(&self, id: DatasetId) -> Option<&Dataset> {
        self.datasets.get(&id)
    }

    /// DFS over the nested-dataset dependency graph of every registered
    /// dataset; a back-edge to a dataset currently on the path aborts with
    /// [`Error::DatasetCycle`] (spec.md §4.8).
    pub fn check_acyclic(&self) -> Result<()> {
        let mut visiting = Vec::new();
        let mut done = std::collections::HashSet::new();
        for id in self.datasets.keys() {
            self.visit(*id, &mut visiting, &mut done)?;
        }
        Ok(())
    }

    fn visit(
        &self,
        id: DatasetId,
        visiting: &mut Vec<DatasetId>,
        done: &mut std::collections::HashSet<DatasetId>,
    ) -> Result<()> {
        if done.contains(&id) {
            return Ok(());
        }
        if visiting.contains(&id) {
            return Err(Error::DatasetCycle);
        }
        let Some(dataset) = self.datasets.get(&id) else {
            // A dangling nested reference is a marshalling mismatch, not a
            // cycle; caught separately when actually marshalling.
            return Ok(());
        };
        visiting.push(id);
        for element in &dataset.elements {
            if let ElementKind::Nested(nested_id) = element.kind {
                self.visit(nested_id, visiting, done)?;
            }
        }
        visiting.pop();
        done.insert(id);
        Ok(())
    }

    /// Compute (and cache) the marshalled size and max nesting depth for
    /// `com_id`'s dataset. Subsequent calls reuse the cached value.
    pub fn size_of(&mut self, com_id: u32) -> Result<SizeInfo> {
        if let Some(info) = self.size_cache.get(&com_id) {
            return Ok(*info);
        }
        let dataset_id =
            *self.com_id_to_dataset.get(&com_id).ok_or(Error::Marshalling("unknown comId"))?;
        let mut is_static = true;
        let size = self.size_of_dataset(dataset_id, 0, &mut is_static)?;
        let depth = self.depth_of_dataset(dataset_id, 0);
        let info = SizeInfo { marshalled_size: size, max_depth: depth, is_static };
        self.size_cache.insert(com_id, info);
        Ok(info)
    }

    fn size_of_dataset(
        &self,
        id: DatasetId,
        align_cursor: usize,
        is_static: &mut bool,
    ) -> Result<usize> {
        let dataset = self.datasets.get(&id).ok_or(Error::Marshalling("unknown dataset id"))?;
        let mut cursor = align_cursor;
        for element in &dataset.elements {
            let alignment = element.kind.alignment();
            cursor = align_up(cursor, alignment);
            match element.count {
                Count::Dynamic => {
                    *is_static = false;
                    // Upper bound contribution for a dynamic array: just the
                    // 4-byte length prefix: the true byte count is unknown
                    // until marshal time.
                    cursor += 4;
                }
                Count::Fixed(n) => {
                    let element_size = match element.kind {
                        ElementKind::Primitive(p) => p.size(),
                        ElementKind::Nested(nested_id) => {
                            self.size_of_dataset(nested_id, 0, is_static)?
                        }
                    };
                    cursor += element_size * n as usize;
                }
            }
        }
        Ok(cursor)
    }

    fn depth_of_dataset(&self, id: DatasetId, depth: u32) -> u32 {
        let Some(dataset) = self.datasets.get(&id) else { return depth };
        dataset
            .elements
            .iter()
            .filter_map(|e| match e.kind {
                ElementKind::Nested(nested_id) => {
                    Some(self.depth_of_dataset(nested_id, depth + 1))
                }
                ElementKind::Primitive(_) => None,
            })
            .max()
            .unwrap_or(depth)
    }
}

fn align_up(cursor: usize, alignment: usize) -> usize {
    if alignment == 0 {
        return cursor;
    }
    (cursor + alignment - 1) / alignment * alignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::types::{Element, Primitive};

    #[test]
    fn static_dataset_size_is_cached_and_exact() {
        let mut registry = Registry::new();
        registry.define(Dataset {
            id: 1,
            elements: vec![
                Element::scalar(ElementKind::Primitive(Primitive::Uint8)),
                Element::scalar(ElementKind::Primitive(Primitive::Uint32)),
            ],
        });
        registry.bind_com_id(1000, 1).unwrap();
        let info = registry.size_of(1000).unwrap();
        // 1 byte, pad to 4-byte alignment, then 4 bytes = 8.
        assert_eq!(info.marshalled_size, 8);
        assert!(info.is_static);
        let cached = registry.size_of(1000).unwrap();
        assert_eq!(cached, info);
    }

    #[test]
    fn dynamic_array_marks_dataset_non_static() {
        let mut registry = Registry::new();
        registry.define(Dataset {
            id: 2,
            elements: vec![Element {
                kind: ElementKind::Primitive(Primitive::Char8),
                count: Count::Dynamic,
            }],
        });
        registry.bind_com_id(2000, 2).unwrap();
        let info = registry.size_of(2000).unwrap();
        assert!(!info.is_static);
    }

    #[test]
    fn self_referencing_dataset_is_rejected_as_cyclic() {
        let mut registry = Registry::new();
        registry.define(Dataset {
            id: 3,
            elements: vec![Element::scalar(ElementKind::Nested(3))],
        });
        assert!(matches!(registry.check_acyclic(), Err(Error::DatasetCycle)));
    }

    #[test]
    fn mutually_referencing_datasets_are_rejected_as_cyclic() {
        let mut registry = Registry::new();
        registry.define(Dataset { id: 4, elements: vec![Element::scalar(ElementKind::Nested(5))] });
        registry.define(Dataset { id: 5, elements: vec![Element::scalar(ElementKind::Nested(4))] });
        assert!(matches!(registry.check_acyclic(), Err(Error::DatasetCycle)));
    }

    #[test]
    fn acyclic_nested_datasets_pass() {
        let mut registry = Registry::new();
        registry.define(Dataset {
            id: 6,
            elements: vec![Element::scalar(ElementKind::Primitive(Primitive::Uint8))],
        });
        registry.define(Dataset { id: 7, elements: vec![Element::scalar(ElementKind::Nested(6))] });
        assert!(registry.check_acyclic().is_ok());
    }
}
