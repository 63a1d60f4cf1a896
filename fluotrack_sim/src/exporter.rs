//! JSON exporter for tracked maps.
//!
//! Flattens a `TrackMap` into per-frame cell and link lists that plotting
//! scripts can read without knowing the binary format.

use crate::error::SimError;
use fluotrack_core::{LinkState, MapSummary, TrackMap};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// A cell as exported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellRecord {
    pub id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertex: Option<u32>,
    pub size: u32,
    pub center: [f64; 3],
}

/// A link from a vertex of this frame to one of the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub from: u32,
    pub to: u32,
    /// "unlinked", "linked", "forced" or "reserved"
    pub state: String,
    pub overlap: f64,
    pub count: u32,
}

/// One frame of the export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame: usize,
    pub cells: Vec<CellRecord>,
    /// Links toward frame + 1
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<LinkRecord>,
}

/// Complete tracking export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Final results
    pub passed: bool,

    pub summary: MapSummary,

    /// All frames
    pub frames: Vec<FrameRecord>,
}

fn state_name(link: LinkState) -> &'static str {
    match link {
        LinkState::Unlinked => "unlinked",
        LinkState::Linked => "linked",
        LinkState::Forced => "forced",
        LinkState::Reserved => "reserved",
    }
}

impl TrackExport {
    /// Flattens `map`.
    pub fn from_map(scenario: &str, seed: u64, passed: bool, map: &TrackMap) -> Self {
        let frames = map
            .frames()
            .iter()
            .enumerate()
            .map(|(f, data)| {
                let cells = data
                    .cells()
                    .values()
                    .map(|c| CellRecord {
                        id: c.id,
                        vertex: c.vertex,
                        size: c.size_ui,
                        center: [c.center.x, c.center.y, c.center.z],
                    })
                    .collect();
                let links = map
                    .inter_graph(f)
                    .map(|ig| {
                        ig.graph
                            .edges()
                            .map(|((a, b), e)| {
                                let (from, to) = if a.frame <= b.frame { (a, b) } else { (b, a) };
                                LinkRecord {
                                    from: from.id,
                                    to: to.id,
                                    state: state_name(e.link).to_string(),
                                    overlap: e.size_d,
                                    count: e.count,
                                }
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                FrameRecord { frame: f, cells, links }
            })
            .collect();
        Self {
            scenario: scenario.to_string(),
            seed,
            passed,
            summary: map.summary(),
            frames,
        }
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScenarioRunner;
    use crate::scenarios::ScenarioId;

    #[test]
    fn test_export_isolated_cell() {
        let run = ScenarioRunner::new(3).run_scenario(ScenarioId::IsolatedCell).unwrap();
        let export = TrackExport::from_map("isolated_cell", 3, run.result.passed, run.processor.map());

        assert_eq!(export.frames.len(), 3);
        assert_eq!(export.frames[0].cells[0].id, 100);
        assert_eq!(export.frames[0].links.len(), 1);
        assert_eq!(export.frames[0].links[0].state, "linked");
        assert!(export.frames[2].links.is_empty());

        let json = serde_json::to_string(&export).unwrap();
        let back: TrackExport = serde_json::from_str(&json).unwrap();
        assert_eq!(back.frames, export.frames);
        assert_eq!(back.summary, export.summary);
    }

    #[test]
    fn test_write_to_file() {
        let run = ScenarioRunner::new(3).run_scenario(ScenarioId::AmbiguousSwap).unwrap();
        let export = TrackExport::from_map("ambiguous_swap", 3, true, run.processor.map());
        let path = std::env::temp_dir().join(format!("fluotrack_export_{}.json", std::process::id()));
        export.write_to_file(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"scenario\": \"ambiguous_swap\""));
        std::fs::remove_file(&path).ok();
    }
}
