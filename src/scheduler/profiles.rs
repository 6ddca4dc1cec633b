//! Built-in schedule, used when the config lists no jobs.

use super::cron::{ScheduleEntry, ScheduledTask};

/// Suites ingested by the default profile.
pub const DEFAULT_SUITES: [&str; 9] = [
    "smoke",
    "fs",
    "rados",
    "rbd",
    "krbd",
    "orch",
    "rgw",
    "crimson-rados",
    "powercycle",
];

/// Return the default out-of-box schedules.
pub fn defaults() -> Vec<ScheduleEntry> {
    vec![ScheduleEntry {
        name: "ingest-default-suites".to_string(),
        cron: "0 0 */4 * * *".to_string(), // every 4 hours
        enabled: true,
        task: ScheduledTask::Ingest {
            suites: DEFAULT_SUITES.iter().map(|s| s.to_string()).collect(),
            branches: Vec::new(),
            user: None,
            machine_type: None,
        },
    }]
}
