//! Result verification
//!
//! After the download copy the staging payload must hold the element count
//! in element 0 and twice the uploaded value (`2 * i`) everywhere else.

use rayon::prelude::*;
use serde::Serialize;

use crate::backend::device::ComputeDevice;
use crate::compute::allocator::RunBuffers;
use crate::compute::scope::MappedMemory;
use crate::error::{ForgeError, ForgeResult};

/// Elements summed for the summary line, starting at index 1
const LEADING_SUM_LEN: usize = 5;

/// One element that differs from its expected value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub index: usize,
    pub observed: u32,
    pub expected: u32,
}

/// Outcome of checking the downloaded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub element_count: u32,
    /// Element 0 holds the element count
    pub count_reached_program: bool,
    pub first_mismatch: Option<Mismatch>,
    pub mismatches: usize,
    /// Sum of elements 1..=5
    pub leading_sum: u64,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.mismatches == 0
    }

    /// The first mismatch as a (non-fatal) error
    pub fn to_error(&self) -> Option<ForgeError> {
        self.first_mismatch.map(|m| ForgeError::VerificationMismatch {
            index: m.index,
            observed: m.observed,
            expected: m.expected,
        })
    }
}

/// Value element `index` must hold after the run
pub fn expected_value(index: usize, element_count: u32) -> u32 {
    if index == 0 {
        element_count
    } else {
        (index as u32).wrapping_mul(2)
    }
}

/// Check `values` against the doubling transform
pub fn verify_elements(values: &[u32], element_count: u32) -> VerificationReport {
    let mismatch_at = |(index, &observed): (usize, &u32)| {
        let expected = expected_value(index, element_count);
        (observed != expected).then_some(Mismatch {
            index,
            observed,
            expected,
        })
    };

    let first_mismatch = values.par_iter().enumerate().find_map_first(mismatch_at);
    let mismatches = match first_mismatch {
        Some(_) => values
            .par_iter()
            .enumerate()
            .filter_map(mismatch_at)
            .count(),
        None => 0,
    };
    let leading_sum = values
        .iter()
        .skip(1)
        .take(LEADING_SUM_LEN)
        .map(|&v| u64::from(v))
        .sum();

    VerificationReport {
        element_count,
        count_reached_program: values.first() == Some(&element_count),
        first_mismatch,
        mismatches,
        leading_sum,
    }
}

/// Map the staging payload and verify it
///
/// The mapping is released before this returns, whatever the outcome.
pub fn verify_staging<D: ComputeDevice + ?Sized>(
    device: &D,
    buffers: &RunBuffers,
    element_count: u32,
) -> ForgeResult<VerificationReport> {
    let mapping = MappedMemory::map(
        device,
        buffers.staging_memory.memory,
        buffers.staging.offset,
        buffers.payload_size,
        "result mapping",
    )?;
    let words = mapping.words()?;
    let report = verify_elements(&words[..words.len().min(element_count as usize)], element_count);
    drop(mapping);

    match &report.first_mismatch {
        None => tracing::info!(
            "verify_staging: {} elements verified, sum of elements 1..=5 is {}",
            element_count,
            report.leading_sum
        ),
        Some(m) => tracing::warn!(
            "verify_staging: {} mismatches, first at element {} (observed {}, expected {})",
            report.mismatches,
            m.index,
            m.observed,
            m.expected
        ),
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_result(count: u32) -> Vec<u32> {
        (0..count).map(|i| expected_value(i as usize, count)).collect()
    }

    #[test]
    fn test_clean_result_passes() {
        let values = good_result(4096);
        let report = verify_elements(&values, 4096);
        assert!(report.passed());
        assert!(report.count_reached_program);
        assert_eq!(report.first_mismatch, None);
        assert_eq!(report.leading_sum, 2 + 4 + 6 + 8 + 10);
        assert!(report.to_error().is_none());
    }

    #[test]
    fn test_first_mismatch_is_lowest_index() {
        let mut values = good_result(10_000);
        values[9000] = 1;
        values[123] = 7;
        let report = verify_elements(&values, 10_000);

        assert_eq!(report.mismatches, 2);
        assert_eq!(
            report.first_mismatch,
            Some(Mismatch {
                index: 123,
                observed: 7,
                expected: 246
            })
        );
        let err = report.to_error().unwrap();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_missing_count_in_element_zero() {
        let mut values = good_result(64);
        values[0] = 0;
        let report = verify_elements(&values, 64);
        assert!(!report.count_reached_program);
        assert_eq!(report.first_mismatch.map(|m| m.index), Some(0));
    }

    #[test]
    fn test_short_result_sums_what_exists() {
        let report = verify_elements(&[3, 2, 4], 3);
        assert!(report.passed());
        assert_eq!(report.leading_sum, 6);
    }

    #[test]
    fn test_report_serializes() {
        let report = verify_elements(&good_result(8), 8);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["element_count"], 8);
        assert_eq!(json["mismatches"], 0);
        assert!(json["first_mismatch"].is_null());
    }
}
