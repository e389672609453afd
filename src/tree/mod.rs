mod accessor;
mod internal;
mod leaf;
mod leaf_manager;
mod node;
mod root;
#[allow(clippy::module_inception)]
mod tree;

pub use accessor::{ReadAccessor, ValueAccessor};
pub use internal::{Internal1, Internal2, InternalNode, Slot, Tile};
pub use leaf::{LeafMask, LeafNode};
pub use leaf_manager::LeafManager;
pub use node::TreeNode;
pub use root::RootNode;
pub use tree::{BoolTree, DoubleTree, FloatTree, Int32Tree, Tree};
