//! IA32_QM_EVTSEL / IA32_QM_CTR read protocol
//!
//! The counter register reports two status bits next to the data. ERROR means
//! the selection may have been changed underneath us (another agent wrote
//! EVTSEL between our write and read); UNAVAILABLE means the data for the
//! selected RMID is not ready yet. The read is a bounded state machine:
//!
//! ```text
//! NeedRewrite --write EVTSEL, read CTR--> Done | WaitReady | NeedRewrite
//! WaitReady   --read CTR----------------> Done | WaitReady | NeedRewrite
//! any state after MAX_READ_ATTEMPTS ----> Failed
//! ```

use rdtflow_raw::current_arch::rdt::{msr, QmCounter, QmEventSelect};

use crate::common::platform::{read_reg, write_reg, Platform};
use crate::error::{RdtError, Result};

pub const MAX_READ_ATTEMPTS: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    NeedRewrite,
    WaitReady,
    Done(u64),
    Failed,
}

/// Read the counter of `event_id` for `rmid` through `lcore`'s L3 domain
pub fn read_counter(platform: &dyn Platform, lcore: u32, rmid: u32, event_id: u8) -> Result<u64> {
    let selection = QmEventSelect { rmid, event_id };
    let mut state = ReadState::NeedRewrite;
    let mut attempts = 0;

    loop {
        state = match state {
            ReadState::Done(value) => return Ok(value),
            ReadState::Failed => {
                tracing::warn!(
                    "Counter read for event {} RMID{} on core {} failed after {} attempts",
                    event_id,
                    rmid,
                    lcore,
                    MAX_READ_ATTEMPTS
                );
                return Err(RdtError::ReadError {
                    cpu: lcore,
                    rmid,
                    event: event_id,
                });
            }
            _ if attempts >= MAX_READ_ATTEMPTS => ReadState::Failed,
            current => {
                attempts += 1;
                if current == ReadState::NeedRewrite {
                    write_reg(platform, lcore, msr::IA32_QM_EVTSEL, &selection)?;
                }
                step(platform, lcore, &selection)?
            }
        };
    }
}

fn step(platform: &dyn Platform, lcore: u32, selection: &QmEventSelect) -> Result<ReadState> {
    let counter: QmCounter = read_reg(platform, lcore, msr::IA32_QM_CTR)?;

    if counter.error {
        let current: QmEventSelect = read_reg(platform, lcore, msr::IA32_QM_EVTSEL)?;
        if current != *selection {
            tracing::debug!(
                "EVTSEL changed on core {} (now RMID{} event {}), reselecting",
                lcore,
                current.rmid,
                current.event_id
            );
            return Ok(ReadState::NeedRewrite);
        }
    }

    if counter.unavailable {
        return Ok(ReadState::WaitReady);
    }

    Ok(ReadState::Done(counter.data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mock::MockPlatform;
    use rdtflow_raw::current_arch::rdt::{QM_CTR_ERROR, QM_CTR_UNAVAILABLE};
    use rdtflow_raw::RegisterLayout;

    const EVENT: u8 = 3;

    fn evtsel(rmid: u32) -> u64 {
        QmEventSelect {
            rmid,
            event_id: EVENT,
        }
        .to_msr_value()
    }

    #[test]
    fn test_plain_read() {
        let platform = MockPlatform::new();
        platform.set_msr(1, msr::IA32_QM_CTR, 0x1234);

        assert_eq!(read_counter(&platform, 1, 5, EVENT).unwrap(), 0x1234);
        assert_eq!(platform.writes_to(msr::IA32_QM_EVTSEL), vec![(1, evtsel(5))]);
    }

    #[test]
    fn test_unavailable_retries_without_rewrite() {
        let platform = MockPlatform::new();
        platform.script_reads(
            0,
            msr::IA32_QM_CTR,
            [QM_CTR_UNAVAILABLE, QM_CTR_UNAVAILABLE, 77],
        );

        assert_eq!(read_counter(&platform, 0, 2, EVENT).unwrap(), 77);
        assert_eq!(platform.writes_to(msr::IA32_QM_EVTSEL).len(), 1);
    }

    #[test]
    fn test_error_with_changed_selection_rewrites() {
        let platform = MockPlatform::new();
        platform.script_reads(0, msr::IA32_QM_CTR, [QM_CTR_ERROR, 99]);
        // Another agent selected RMID 9 before our read
        platform.script_reads(0, msr::IA32_QM_EVTSEL, [evtsel(9)]);

        assert_eq!(read_counter(&platform, 0, 2, EVENT).unwrap(), 99);
        assert_eq!(
            platform.writes_to(msr::IA32_QM_EVTSEL),
            vec![(0, evtsel(2)), (0, evtsel(2))]
        );
    }

    #[test]
    fn test_error_with_intact_selection_falls_through() {
        let platform = MockPlatform::new();
        platform.script_reads(0, msr::IA32_QM_CTR, [QM_CTR_ERROR | 42]);

        assert_eq!(read_counter(&platform, 0, 2, EVENT).unwrap(), 42);
        assert_eq!(platform.writes_to(msr::IA32_QM_EVTSEL).len(), 1);
    }

    #[test]
    fn test_exhaustion_is_read_error() {
        let platform = MockPlatform::new();
        platform.set_msr(3, msr::IA32_QM_CTR, QM_CTR_UNAVAILABLE);

        let err = read_counter(&platform, 3, 6, EVENT).unwrap_err();
        assert!(matches!(
            err,
            RdtError::ReadError {
                cpu: 3,
                rmid: 6,
                event: EVENT
            }
        ));
    }

    #[test]
    fn test_register_failure_propagates() {
        let platform = MockPlatform::new();
        platform.fail_read(0, msr::IA32_QM_CTR);
        assert!(matches!(
            read_counter(&platform, 0, 1, EVENT),
            Err(RdtError::Msr(_))
        ));
    }
}
