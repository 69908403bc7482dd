//! Access layer: the paged B-tree and the encodings it is parameterised by.
//!
//! - **BTree**: multimap from fixed-length keys to fixed-length values
//! - **FixedLengthSerializer**: turns keys and values into exactly N bytes
//! - **KeyComparator**: total order the tree sorts keys by
//!
//! The tree never interprets key or value bytes itself; all ordering goes
//! through the comparator and all encoding through the serializers.

pub mod btree;
pub mod comparator;
pub mod serializer;

pub use btree::{BTree, KeyRange};
pub use comparator::{KeyComparator, NaturalOrder, ReverseOrder};
pub use serializer::{FixedLengthSerializer, FixedStringSerializer, I32Serializer, I64Serializer, U32Serializer};
