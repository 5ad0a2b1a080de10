pub mod btree;
pub mod btree_page;
pub mod index_iterator;
pub mod key_comparator;

pub use btree::BPlusTree;
pub use btree_page::{BTreeNode, BTreeNodeRef, NodeKind};
pub use index_iterator::BTreeIterator;
pub use key_comparator::{IndexKey, KeyComparator, U32Comparator};
