use arbor::{CancelHandle, ConsolidationPhase, MemoryEngine};
use clap::{Parser, ValueEnum};

use crate::error::CliResult;
use crate::output::{OutputFormat, new_table, truncate_string};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum StopAfter {
    Analyzing,
    Extracting,
    Transferring,
    Promoting,
}

impl From<StopAfter> for ConsolidationPhase {
    fn from(stop: StopAfter) -> Self {
        match stop {
            StopAfter::Analyzing => ConsolidationPhase::Analyzing,
            StopAfter::Extracting => ConsolidationPhase::Extracting,
            StopAfter::Transferring => ConsolidationPhase::Transferring,
            StopAfter::Promoting => ConsolidationPhase::Promoting,
        }
    }
}

#[derive(Parser)]
pub struct ConsolidateCommand {
    #[clap(long, value_enum, help = "Stop the run after this phase")]
    pub stop_after: Option<StopAfter>,
}

impl ConsolidateCommand {
    pub async fn execute(&self, engine: &MemoryEngine, format: OutputFormat) -> CliResult<()> {
        let cancel = CancelHandle::new();
        if let Some(stop) = self.stop_after {
            cancel.cancel_after(stop.into());
        }

        let report = engine.consolidate_with(&cancel).await?;

        match format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            OutputFormat::Table => {
                println!("Consolidation Results");
                println!("=====================\n");

                let mut table = new_table();
                table.set_header(["Phase", "Status", "Processed", "Succeeded", "Failed"]);
                for phase in &report.phases {
                    table.add_row([
                        phase.phase.to_string(),
                        format!("{:?}", phase.status),
                        phase.stats.processed.to_string(),
                        phase.stats.succeeded.to_string(),
                        phase.stats.failed.to_string(),
                    ]);
                }
                println!("{table}\n");

                let promoted: Vec<String> = report
                    .promoted
                    .iter()
                    .map(|(category, count)| format!("{count} to {category}"))
                    .collect();
                println!(
                    "Scored {}, archived {}, promoted {}, expired {}, evicted {}",
                    report.scored,
                    report.archived,
                    if promoted.is_empty() {
                        "0".to_string()
                    } else {
                        promoted.join(", ")
                    },
                    report.expired,
                    report.evicted.len()
                );
                println!("Took {} ms", report.duration().num_milliseconds());

                if report.cancelled {
                    println!("Run was cancelled; remaining phases were skipped.");
                }
                if let Some(reason) = &report.aborted {
                    println!("Run aborted: {reason}");
                }

                if !report.failures.is_empty() {
                    let mut failures = new_table();
                    failures.set_header(["ID", "Phase", "Reason"]);
                    for failure in &report.failures {
                        failures.add_row([
                            truncate_string(&failure.id.to_string(), 8),
                            failure.phase.to_string(),
                            failure.reason.clone(),
                        ]);
                    }
                    println!("\nFailures:\n{failures}");
                }
            }
        }

        Ok(())
    }
}
