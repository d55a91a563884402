//! Key block history shown in corruption reports
//!
//! The engine records what it knew about a key block at the moment it found
//! the block corrupted: why the block was read, the last read or write of the
//! block during this run, and the detection time. The report orders these
//! events with the write time found in the first bad sector.

use crate::bad_sector::{format_ms, BadSector};
use blockdv_core::CorruptionFlags;
use std::fmt;

/// Why a block was read when its corruption was found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ReadReason {
    /// The workload asked for the read
    #[default]
    Normal,
    /// Read issued before overwriting the block
    PreRead,
    /// Read issued right after writing the block
    ReadImmediate,
    /// Read issued by crash recovery for a pending write
    PendingRead,
    /// Second read of a pending write during crash recovery
    PendingReread,
}

impl fmt::Display for ReadReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReadReason::Normal => "workload requested read",
            ReadReason::PreRead => "read-before-write",
            ReadReason::ReadImmediate => "read-after-write",
            ReadReason::PendingRead => "pending-write-read",
            ReadReason::PendingReread => "pending-write-reread",
        };
        f.write_str(text)
    }
}

/// Kind of the last I/O on a key block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Validated read
    Read,
    /// Confirmed write
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Read => "read",
            Operation::Write => "written",
        })
    }
}

/// Last I/O on a key block, timestamped just after it finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastUse {
    /// What the I/O was
    pub op: Operation,
    /// Milliseconds since the Unix epoch
    pub at_ms: u64,
}

/// Per-block history known to the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UseHistory {
    /// History tracking is off
    #[default]
    NotTracked,
    /// Tracking is on and the block was not used during this run
    Unused,
    /// Last use during this run
    Used(LastUse),
}

/// What the engine knew when it found a sector bad.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadContext {
    /// Why the block was read
    pub reason: ReadReason,
    /// Last use of the key block before this read
    pub history: UseHistory,
    /// Detection time in milliseconds since the Unix epoch; 0 when unknown
    pub detected_ms: u64,
}

/// Timeline lines for a key block, given its first bad sector.
///
/// Timestamped events are listed oldest first; on equal times the sector
/// write comes before the last use, which comes before the detection.
pub fn timeline_lines(first: &BadSector) -> Vec<String> {
    let ctx = first.context;
    let checksum_ok = !first.flags.contains(CorruptionFlags::BAD_CHECKSUM);

    let mut lines = vec!["Timeline:".to_string()];
    if !checksum_ok {
        lines.push("No valid timestamp found in first corrupted sector".to_string());
    }
    if ctx.history == UseHistory::Unused {
        lines.push("This key block has not been used (yet) during this run.".to_string());
    }
    if ctx.reason == ReadReason::PendingRead {
        lines.push(
            ">>>>>>> This key block was read because crash recovery found a pending write"
                .to_string(),
        );
    }

    let mut events: Vec<(u64, u8, String)> = Vec::new();
    if checksum_ok {
        events.push((
            first.observed.timestamp_ms,
            0,
            format!(
                "{} Sector last written. (As found in the first corrupted sector; \
                 taken just before the write.)",
                format_ms(first.observed.timestamp_ms)
            ),
        ));
    }
    if let UseHistory::Used(last) = ctx.history {
        events.push((
            last.at_ms,
            1,
            format!(
                "{} Key block was last {}. (Taken just after the read or write.)",
                format_ms(last.at_ms),
                last.op
            ),
        ));
    }
    if ctx.detected_ms != 0 {
        events.push((
            ctx.detected_ms,
            2,
            format!(
                "{} Key block first found to be corrupted during a {}.",
                format_ms(ctx.detected_ms),
                ctx.reason
            ),
        ));
    }
    events.sort();
    lines.extend(events.into_iter().map(|(_, _, text)| text));
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bad_sector::tests::{sector_bytes, site};

    // Sector header timestamp used by `sector_bytes`
    const WRITTEN_MS: u64 = 1_700_000_000_000;

    fn bad(flags: CorruptionFlags, ctx: ReadContext) -> BadSector {
        let s = site(0);
        let expected = sector_bytes(s.sector_lba(), 5, 0);
        let observed = sector_bytes(s.sector_lba(), 5, 1);
        BadSector::analyze(s, flags, &observed, &expected, &expected)
            .unwrap()
            .with_context(ctx)
    }

    #[test]
    fn test_events_sorted_by_time() {
        let ctx = ReadContext {
            reason: ReadReason::ReadImmediate,
            history: UseHistory::Used(LastUse {
                op: Operation::Write,
                at_ms: WRITTEN_MS + 5,
            }),
            detected_ms: WRITTEN_MS + 9,
        };
        let lines = timeline_lines(&bad(CorruptionFlags::BAD_DATA, ctx));
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "Timeline:");
        assert!(lines[1].contains("Sector last written."));
        assert!(lines[2].ends_with("Key block was last written. (Taken just after the read or write.)"));
        assert!(lines[3].ends_with("first found to be corrupted during a read-after-write."));
    }

    #[test]
    fn test_last_use_before_sector_write() {
        // Someone else wrote the sector after this run last touched it
        let ctx = ReadContext {
            reason: ReadReason::Normal,
            history: UseHistory::Used(LastUse {
                op: Operation::Read,
                at_ms: WRITTEN_MS - 1,
            }),
            detected_ms: WRITTEN_MS + 1,
        };
        let lines = timeline_lines(&bad(CorruptionFlags::BAD_DATA, ctx));
        assert!(lines[1].contains("Key block was last read."));
        assert!(lines[2].contains("Sector last written."));
    }

    #[test]
    fn test_bad_checksum_and_unused_block() {
        let ctx = ReadContext {
            reason: ReadReason::PendingRead,
            history: UseHistory::Unused,
            detected_ms: 0,
        };
        let lines = timeline_lines(&bad(CorruptionFlags::BAD_CHECKSUM, ctx));
        assert_eq!(
            lines,
            vec![
                "Timeline:".to_string(),
                "No valid timestamp found in first corrupted sector".to_string(),
                "This key block has not been used (yet) during this run.".to_string(),
                ">>>>>>> This key block was read because crash recovery found a pending write"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_reason_text() {
        assert_eq!(ReadReason::default().to_string(), "workload requested read");
        assert_eq!(ReadReason::PendingReread.to_string(), "pending-write-reread");
        assert_eq!(Operation::Write.to_string(), "written");
    }
}
