mod topology;

pub use topology::{read_tree, write_tree};
