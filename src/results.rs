//! Per-agent result files.
//!
//! Three JSON files per agent under the results folder: the final
//! placement, the send-rate buckets, and the private utility.

use std::fs;
use std::path::{Path, PathBuf};

use crate::driver::RunReport;
use crate::error::Result;
use crate::rap::Rap;

/// Write `placement_<agent>.json`, `rates_<agent>.json` and
/// `utility_<agent>.json`; returns the three paths.
pub fn write_results(
    folder: impl AsRef<Path>,
    agent_name: &str,
    report: &RunReport,
    rap: &Rap,
) -> Result<[PathBuf; 3]> {
    let folder = folder.as_ref();
    fs::create_dir_all(folder)?;

    let placement: Vec<[String; 3]> = report
        .implementation
        .iter()
        .map(|record| {
            [
                record.service.clone(),
                rap.function_name(record.function).to_string(),
                rap.node_name(record.node).to_string(),
            ]
        })
        .collect();
    let placement_path = folder.join(format!("placement_{agent_name}.json"));
    fs::write(&placement_path, serde_json::to_string_pretty(&placement)?)?;

    let rates_path = folder.join(format!("rates_{agent_name}.json"));
    fs::write(
        &rates_path,
        serde_json::to_string_pretty(&report.message_rates)?,
    )?;

    let utility_path = folder.join(format!("utility_{agent_name}.json"));
    fs::write(
        &utility_path,
        serde_json::to_string(&report.private_utility)?,
    )?;

    Ok([placement_path, rates_path, utility_path])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::RateSample;
    use crate::orchestrator::PlacementRecord;
    use crate::rap::tests::toy_rap;
    use crate::rap::{FunctionId, NodeId};

    fn sample_report() -> RunReport {
        RunReport {
            strong_agreement: true,
            implementation: vec![PlacementRecord {
                service: "0_s1".to_string(),
                function: FunctionId(0),
                node: NodeId(1),
            }],
            detailed_implementation: Vec::new(),
            private_utility: 42,
            message_rates: vec![RateSample {
                window_start: 0.0,
                window_end: 1.0,
                sent: 3,
            }],
            sent_messages: 3,
            received_messages: 5,
            last_update_after: Some(0.5),
            agreement_after: Some(0.9),
            total_time: 1.2,
        }
    }

    #[test]
    fn test_write_results_produces_three_files() {
        let rap = toy_rap(&["a", "b"]);
        let dir = tempfile::tempdir().unwrap();
        let paths = write_results(dir.path(), "a", &sample_report(), &rap).unwrap();

        for path in &paths {
            assert!(path.exists());
        }

        let placement: Vec<[String; 3]> =
            serde_json::from_str(&fs::read_to_string(&paths[0]).unwrap()).unwrap();
        assert_eq!(placement.len(), 1);
        assert_eq!(placement[0][0], "0_s1");
        assert_eq!(placement[0][1], "f_big"); // FunctionId(0) sorts first
        assert_eq!(placement[0][2], "n1");

        let utility: u64 = serde_json::from_str(&fs::read_to_string(&paths[2]).unwrap()).unwrap();
        assert_eq!(utility, 42);
    }
}
