use super::inner::{InnerNode, CHILD_ID_SIZE, INNER_HEADER_SIZE};
use super::leaf::{LeafNode, LEAF_HEADER_SIZE};
use super::node::{page_tag, Node, INNER_TAG, LEAF_TAG};
use crate::access::comparator::KeyComparator;
use crate::access::serializer::FixedLengthSerializer;
use crate::storage::config::TreeConfig;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::storage::resource::ResourceManager;
use std::cmp::Ordering;
use std::sync::Arc;

/// Creates and loads nodes of one tree.
///
/// Nodes refer to each other only by page id; the store resolves those ids
/// through the resource manager and carries the encodings and ordering every
/// node needs.
pub struct NodeStore<K, V> {
    manager: Arc<dyn ResourceManager>,
    key_serializer: Arc<dyn FixedLengthSerializer<K>>,
    value_serializer: Arc<dyn FixedLengthSerializer<V>>,
    comparator: Arc<dyn KeyComparator<K>>,
    max_leaf_entries: usize,
    max_inner_keys: usize,
}

impl<K, V> NodeStore<K, V> {
    pub fn new(
        manager: Arc<dyn ResourceManager>,
        key_serializer: Arc<dyn FixedLengthSerializer<K>>,
        value_serializer: Arc<dyn FixedLengthSerializer<V>>,
        comparator: Arc<dyn KeyComparator<K>>,
        config: TreeConfig,
    ) -> StorageResult<Arc<Self>> {
        config.validate()?;

        let page_size = manager.page_size();
        let key_len = key_serializer.serialized_length();
        let value_len = value_serializer.serialized_length();
        if key_len == 0 {
            return Err(StorageError::InvalidConfig("keys must not be zero-length".to_string()));
        }

        let max_leaf_entries = page_size.saturating_sub(LEAF_HEADER_SIZE) / (key_len + value_len);
        let max_inner_keys =
            page_size.saturating_sub(INNER_HEADER_SIZE + CHILD_ID_SIZE) / (key_len + CHILD_ID_SIZE);

        if max_leaf_entries < config.min_leaf_entries {
            return Err(StorageError::InvalidConfig(format!(
                "a {} byte page fits {} leaf entries, {} required",
                page_size, max_leaf_entries, config.min_leaf_entries
            )));
        }
        if max_inner_keys < config.min_inner_keys {
            return Err(StorageError::InvalidConfig(format!(
                "a {} byte page fits {} inner keys, {} required",
                page_size, max_inner_keys, config.min_inner_keys
            )));
        }

        Ok(Arc::new(Self {
            manager,
            key_serializer,
            value_serializer,
            comparator,
            max_leaf_entries,
            max_inner_keys,
        }))
    }

    pub fn manager(&self) -> &Arc<dyn ResourceManager> {
        &self.manager
    }

    pub fn page_size(&self) -> usize {
        self.manager.page_size()
    }

    pub fn key_serializer(&self) -> &dyn FixedLengthSerializer<K> {
        self.key_serializer.as_ref()
    }

    pub fn value_serializer(&self) -> &dyn FixedLengthSerializer<V> {
        self.value_serializer.as_ref()
    }

    pub fn key_len(&self) -> usize {
        self.key_serializer.serialized_length()
    }

    pub fn value_len(&self) -> usize {
        self.value_serializer.serialized_length()
    }

    pub fn entry_len(&self) -> usize {
        self.key_len() + self.value_len()
    }

    pub fn max_leaf_entries(&self) -> usize {
        self.max_leaf_entries
    }

    pub fn max_inner_keys(&self) -> usize {
        self.max_inner_keys
    }

    pub fn compare(&self, a: &K, b: &K) -> Ordering {
        self.comparator.compare(a, b)
    }

    pub fn create_leaf(self: &Arc<Self>) -> StorageResult<LeafNode<K, V>> {
        let page = self.manager.create_page()?;
        LeafNode::initialize(self.clone(), page)
    }

    pub fn load_leaf(self: &Arc<Self>, id: PageId) -> StorageResult<LeafNode<K, V>> {
        let page = self.manager.get_page(id)?;
        LeafNode::load(self.clone(), page)
    }

    pub fn create_inner(self: &Arc<Self>) -> StorageResult<InnerNode<K, V>> {
        let page = self.manager.create_page()?;
        InnerNode::initialize(self.clone(), page)
    }

    pub fn load_inner(self: &Arc<Self>, id: PageId) -> StorageResult<InnerNode<K, V>> {
        let page = self.manager.get_page(id)?;
        InnerNode::load(self.clone(), page)
    }

    /// Load whichever node type the page holds.
    pub fn load_node(self: &Arc<Self>, id: PageId) -> StorageResult<Node<K, V>> {
        let page = self.manager.get_page(id)?;
        let tag = page_tag(page.read().data());
        match tag {
            LEAF_TAG => Ok(Node::Leaf(LeafNode::load(self.clone(), page)?)),
            INNER_TAG => Ok(Node::Inner(InnerNode::load(self.clone(), page)?)),
            other => Err(StorageError::corruption(format!(
                "page {} holds no tree node (tag {})",
                id, other
            ))),
        }
    }
}
