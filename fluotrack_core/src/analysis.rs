//! Read-only queries over a track map.

use crate::error::TrackError;
use crate::graph::{LinkState, NodeKey, UncertainBin};
use crate::processor::TrackMapProcessor;
use crate::relax::{alternating_paths, uncertain_histogram, AlterPath};
use crate::track_map::TrackMap;
use fluotrack_env::VolumeCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Vertices of one frame whose links look wrong.
///
/// "In" refers to the graph with the previous frame, "out" to the next.
/// Vertices below the size threshold are not listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkLists {
    pub frame: usize,
    pub in_orphans: Vec<u32>,
    pub out_orphans: Vec<u32>,
    pub in_multi: Vec<u32>,
    pub out_multi: Vec<u32>,
}

/// Flip counts of a vertex toward both neighbor frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexUncertainty {
    pub id: u32,
    pub in_count: u32,
    pub out_count: u32,
}

/// Totals over a whole map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapSummary {
    pub frames: usize,
    pub cells: usize,
    pub vertices: usize,
    pub contacts: usize,
    pub inter_edges: usize,
    pub unlinked: usize,
    pub linked: usize,
    pub forced: usize,
    pub counter: u32,
}

impl TrackMap {
    /// Counts cells, vertices, contacts and edges by link state.
    pub fn summary(&self) -> MapSummary {
        let mut summary = MapSummary {
            frames: self.frames.len(),
            cells: self.cell_total(),
            vertices: self.vertex_total(),
            contacts: self.frames.iter().map(|f| f.intra.edge_count()).sum(),
            counter: self.counter,
            ..Default::default()
        };
        for ig in &self.inter {
            for (_, edge) in ig.graph.edges() {
                summary.inter_edges += 1;
                match edge.link {
                    LinkState::Unlinked | LinkState::Reserved => summary.unlinked += 1,
                    LinkState::Linked => summary.linked += 1,
                    LinkState::Forced => summary.forced += 1,
                }
            }
        }
        summary
    }
}

impl<C> TrackMapProcessor<C>
where
    C: VolumeCache,
{
    /// Orphans and multi-linked vertices of `frame` on both sides.
    pub fn link_lists(&self, frame: usize) -> Result<LinkLists, TrackError> {
        self.check_frame(frame)?;
        let mut lists = LinkLists {
            frame,
            ..Default::default()
        };
        let data = &self.map.frames[frame];
        let sides = [
            (frame.checked_sub(1), &mut lists.in_orphans, &mut lists.in_multi),
            (Some(frame + 1), &mut lists.out_orphans, &mut lists.out_multi),
        ];
        for (other, orphans, multi) in sides {
            let Some(ig) = other.and_then(|o| self.map.inter_between(frame, o)) else {
                continue;
            };
            for v in data.vertices.values() {
                if f64::from(v.size_ui) < self.config.size_thresh {
                    continue;
                }
                match ig.linked_valence(NodeKey::new(frame, v.id)) {
                    0 => orphans.push(v.id),
                    1 => {}
                    _ => multi.push(v.id),
                }
            }
        }
        Ok(lists)
    }

    /// [`Self::link_lists`] for every frame.
    pub fn link_table(&self) -> Vec<LinkLists> {
        (0..self.map.frame_count())
            .filter_map(|f| self.link_lists(f).ok())
            .collect()
    }

    /// Histogram of flip counts of `frame`'s vertices in the graph shared
    /// with `other`.
    pub fn uncertainty_histogram(&self, frame: usize, other: usize) -> Result<Vec<UncertainBin>, TrackError> {
        self.check_linked_pair(frame, other)?;
        let ig = self.map.inter_between(frame, other).ok_or(TrackError::MissingGraph(frame.min(other)))?;
        Ok(uncertain_histogram(ig, frame, self.map.frames[frame].vertices.keys().copied()))
    }

    /// Flip counts of the vertices owning `cells` in `frame`.
    pub fn cell_uncertainty(&self, frame: usize, cells: &[u32]) -> Result<Vec<VertexUncertainty>, TrackError> {
        self.check_frame(frame)?;
        let data = &self.map.frames[frame];
        let vertices: BTreeSet<u32> = cells.iter().filter_map(|&c| data.vertex_of_cell(c)).map(|v| v.id).collect();
        let count = |other: Option<usize>, id: u32| {
            other
                .and_then(|o| self.map.inter_between(frame, o))
                .map_or(0, |ig| ig.node_count(NodeKey::new(frame, id)))
        };
        Ok(vertices
            .into_iter()
            .map(|id| VertexUncertainty {
                id,
                in_count: count(frame.checked_sub(1), id),
                out_count: count(Some(frame + 1), id),
            })
            .collect())
    }

    /// Alternating paths of depth 2 from the vertices owning `cells`.
    pub fn paths(&self, f1: usize, f2: usize, cells: &[u32]) -> Result<Vec<AlterPath>, TrackError> {
        self.check_linked_pair(f1, f2)?;
        let Some(ig) = self.map.inter_between(f1, f2) else {
            return Ok(Vec::new());
        };
        let data = &self.map.frames[f1];
        let vertices: BTreeSet<u32> = cells.iter().filter_map(|&c| data.vertex_of_cell(c)).map(|v| v.id).collect();
        Ok(vertices
            .into_iter()
            .flat_map(|id| alternating_paths(ig, NodeKey::new(f1, id), 2))
            .collect())
    }

    /// Cells of `f2` whose vertices are linked to the vertices owning
    /// `cells` in `f1`.
    pub fn mapped_cells(&self, f1: usize, cells: &[u32], f2: usize) -> Result<Vec<u32>, TrackError> {
        self.check_linked_pair(f1, f2)?;
        let data1 = &self.map.frames[f1];
        let data2 = &self.map.frames[f2];
        let mut out = BTreeSet::new();
        for &cid in cells {
            let Some(v) = data1.vertex_of_cell(cid) else { continue };
            for other in self.map.linked_vertices(f1, v.id, f2) {
                if let Some(v2) = data2.vertex(other) {
                    out.extend(v2.cells.iter().copied());
                }
            }
        }
        Ok(out.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{set_inter_edge, synthetic_processor};

    fn three_frames() -> TrackMapProcessor<fluotrack_env::InMemoryCache> {
        let mut proc = synthetic_processor(&[
            &[(1, [2.0; 3], 100), (2, [10.0; 3], 100)],
            &[(3, [2.0; 3], 100), (4, [10.0; 3], 100), (5, [6.0; 3], 10)],
            &[(6, [2.0; 3], 100)],
        ]);
        set_inter_edge(&mut proc, 0, 1, 3, 50.0, LinkState::Linked);
        set_inter_edge(&mut proc, 0, 2, 3, 20.0, LinkState::Linked);
        set_inter_edge(&mut proc, 0, 2, 4, 20.0, LinkState::Forced);
        set_inter_edge(&mut proc, 1, 3, 6, 50.0, LinkState::Linked);
        set_inter_edge(&mut proc, 1, 4, 6, 10.0, LinkState::Unlinked);
        proc
    }

    #[test]
    fn test_link_lists() {
        let proc = three_frames();
        let lists = proc.link_lists(1).unwrap();
        assert!(lists.in_orphans.is_empty());
        assert_eq!(lists.in_multi, vec![3]);
        assert_eq!(lists.out_orphans, vec![4]);
        assert!(lists.out_multi.is_empty());

        let first = proc.link_lists(0).unwrap();
        assert_eq!(first.out_multi, vec![2]);
        assert_eq!(proc.link_table().len(), 3);
        assert!(proc.link_lists(3).is_err());
    }

    #[test]
    fn test_mapped_cells_follow_links() {
        let proc = three_frames();
        assert_eq!(proc.mapped_cells(0, &[2], 1).unwrap(), vec![3, 4]);
        assert_eq!(proc.mapped_cells(1, &[3, 4], 0).unwrap(), vec![1, 2]);
        assert_eq!(proc.mapped_cells(1, &[4], 2).unwrap(), Vec::<u32>::new());
    }

    #[test]
    fn test_cell_uncertainty_and_histogram() {
        let mut proc = three_frames();
        proc.map.inter[0].graph.node_mut(NodeKey::new(1, 3)).unwrap().count = 2;
        proc.map.inter[1].graph.node_mut(NodeKey::new(1, 3)).unwrap().count = 5;

        let u = proc.cell_uncertainty(1, &[3, 99]).unwrap();
        assert_eq!(u, vec![VertexUncertainty { id: 3, in_count: 2, out_count: 5 }]);

        let hist = proc.uncertainty_histogram(1, 0).unwrap();
        assert_eq!(hist.len(), 3);
        assert_eq!(hist[0].count, 1);
        assert_eq!(hist[2].count, 1);
    }

    #[test]
    fn test_paths_from_cells() {
        let proc = three_frames();
        let paths = proc.paths(0, 1, &[2]).unwrap();
        assert!(!paths.is_empty());
        assert!(paths.iter().all(|p| p[0].vert == NodeKey::new(0, 2)));
    }

    #[test]
    fn test_summary_counts_links() {
        let proc = three_frames();
        let summary = proc.map().summary();
        assert_eq!(summary.frames, 3);
        assert_eq!(summary.cells, 6);
        assert_eq!(summary.inter_edges, 5);
        assert_eq!(summary.linked, 3);
        assert_eq!(summary.forced, 1);
        assert_eq!(summary.unlinked, 1);
    }
}
