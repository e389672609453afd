mod morphology;

pub use morphology::{dilate_voxels, dilate_voxels_with, erode_voxels, erode_voxels_with};
