//! FluoTrack Core - Cell Tracking over Labeled 4D Microscopy Volumes
//!
//! The engine turns per-frame segmentation labels into lineage links:
//! 1. **Initialization**: cells, contacts and vertices from each frame's voxels
//! 2. **Linking**: voxel overlap between consecutive frames as weighted edges
//! 3. **Resolution**: merging over-segmented cells and splitting fused ones
//! 4. **Relaxation**: seeded, repeated link decisions until the map settles
//!
//! Manual edits, id propagation across frames and a binary file format
//! sit on top of the same map.

pub mod analysis;
pub mod cell;
pub mod clustering;
pub mod codec;
pub mod consistent;
pub mod edit;
pub mod error;
pub mod graph;
pub mod initialize;
pub mod processor;
pub mod relax;
pub mod resolve;
pub mod track_map;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export key types for convenience
pub use analysis::{LinkLists, MapSummary, VertexUncertainty};
pub use cell::{BoundingBox, Cell, Vertex};
pub use clustering::{Dbscan, ExpectationMax, KMeans, KmeansEm};
pub use codec::{decode_map, encode_map, CodecError};
pub use consistent::new_cell_id;
pub use error::TrackError;
pub use graph::{ContactEdge, InterGraph, InterNode, LinkEdge, LinkState, NodeKey, UncertainBin};
pub use processor::{ClusterConfig, TrackConfig, TrackMapProcessor};
pub use relax::{AlterPath, PathVert};
pub use track_map::{FrameData, TrackMap, VolumeInfo};
