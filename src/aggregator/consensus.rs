//! Consensus methods
//!
//! Every function here is a pure function of the response *set*: inputs are
//! sorted before reduction, so arrival order never affects the result.

use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::AggregationError;
use crate::models::{ConsensusMethod, NodeId, OracleValue, Response};

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusPolicy {
    pub method: ConsensusMethod,
    pub quorum_size: usize,
    pub minimum_responses: usize,
    /// Measured from the first counted response
    pub quorum_timeout: Duration,
    /// Numeric values within this distance are treated as equal
    pub equality_tolerance: Decimal,
    /// Relative deviation from the median beyond which a value is excluded
    pub outlier_deviation: Option<Decimal>,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            method: ConsensusMethod::Median,
            quorum_size: 3,
            minimum_responses: 2,
            quorum_timeout: Duration::from_secs(30),
            equality_tolerance: Decimal::ZERO,
            outlier_deviation: Some(Decimal::new(1, 1)),
        }
    }
}

/// Agreed value and the nodes whose values produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Agreement {
    pub value: OracleValue,
    pub contributing: BTreeSet<NodeId>,
}

pub fn decide(
    policy: &ConsensusPolicy,
    responses: &[Response],
) -> Result<Agreement, AggregationError> {
    if responses.is_empty() {
        return Err(AggregationError::InsufficientResponses {
            received: 0,
            required: policy.minimum_responses.max(1),
        });
    }

    match policy.method {
        ConsensusMethod::Median => median_agreement(responses, policy.outlier_deviation),
        ConsensusMethod::MajorityEqual => {
            let groups = group_values(responses, policy.equality_tolerance);
            let winner = unique_largest(&groups).ok_or(AggregationError::NoMajority)?;
            if winner.len() * 2 <= policy.quorum_size {
                return Err(AggregationError::NoMajority);
            }
            Ok(agreement_of(winner))
        }
        ConsensusMethod::Mode => {
            let groups = group_values(responses, policy.equality_tolerance);
            // groups are sorted by value, so the first largest is the smallest
            let winner = groups
                .iter()
                .fold(None::<&Vec<&Response>>, |best, group| match best {
                    Some(best) if best.len() >= group.len() => Some(best),
                    _ => Some(group),
                })
                .ok_or(AggregationError::NoMajority)?;
            Ok(agreement_of(winner))
        }
    }
}

/// Median of a non-empty set; the two middle values are averaged when the
/// count is even.
pub fn median(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }

    let mut sorted = values.to_vec();
    sorted.sort();
    let mid = sorted.len() / 2;

    let value = if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        let (low, high) = (sorted[mid - 1], sorted[mid]);
        let two = Decimal::TWO;
        match low.checked_add(high) {
            Some(sum) => sum / two,
            // the sum only overflows when both share a sign, so the gap fits
            None => low + (high - low) / two,
        }
    };

    Some(value.normalize())
}

/// Whether `value` lies within `threshold` relative deviation of `center`.
/// A zero center falls back to absolute deviation. A distance too large to
/// represent is never within; a bound too large to represent covers all.
pub fn within_deviation(value: Decimal, center: Decimal, threshold: Decimal) -> bool {
    let bound = if center.is_zero() {
        Some(threshold)
    } else {
        threshold.checked_mul(center.abs())
    };
    match (value.checked_sub(center), bound) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(distance), Some(bound)) => distance.abs() <= bound,
    }
}

fn median_agreement(
    responses: &[Response],
    outlier_deviation: Option<Decimal>,
) -> Result<Agreement, AggregationError> {
    let numeric: Vec<(&NodeId, Decimal)> = responses
        .iter()
        .map(|response| {
            response
                .value
                .as_decimal()
                .map(|value| (&response.node_id, value))
                .ok_or(AggregationError::NonNumericValues)
        })
        .collect::<Result<_, _>>()?;

    let all: Vec<Decimal> = numeric.iter().map(|(_, value)| *value).collect();
    let center = median(&all).ok_or(AggregationError::NonNumericValues)?;

    let mut kept: Vec<(&NodeId, Decimal)> = match outlier_deviation {
        Some(threshold) => numeric
            .iter()
            .filter(|(_, value)| within_deviation(*value, center, threshold))
            .copied()
            .collect(),
        None => numeric.clone(),
    };
    if kept.is_empty() {
        kept = numeric;
    }

    let values: Vec<Decimal> = kept.iter().map(|(_, value)| *value).collect();
    let value = median(&values).ok_or(AggregationError::NonNumericValues)?;

    Ok(Agreement {
        value: OracleValue::Numeric(value),
        contributing: kept.into_iter().map(|(node, _)| node.clone()).collect(),
    })
}

fn kind_rank(value: &OracleValue) -> u8 {
    match value {
        OracleValue::Numeric(_) => 0,
        OracleValue::Text(_) => 1,
        OracleValue::Boolean(_) => 2,
    }
}

/// Total order over values: numeric, then text, then boolean.
fn compare_values(a: &OracleValue, b: &OracleValue) -> Ordering {
    match (a, b) {
        (OracleValue::Numeric(x), OracleValue::Numeric(y)) => x.cmp(y),
        (OracleValue::Text(x), OracleValue::Text(y)) => x.cmp(y),
        (OracleValue::Boolean(x), OracleValue::Boolean(y)) => x.cmp(y),
        _ => kind_rank(a).cmp(&kind_rank(b)),
    }
}

/// Sort responses by value (node id breaks ties) and cluster adjacent
/// values. Numeric clusters span at most `tolerance` from their smallest
/// member; other kinds cluster on exact equality.
fn group_values(responses: &[Response], tolerance: Decimal) -> Vec<Vec<&Response>> {
    let mut sorted: Vec<&Response> = responses.iter().collect();
    sorted.sort_by(|a, b| {
        compare_values(&a.value, &b.value).then_with(|| a.node_id.cmp(&b.node_id))
    });

    let mut groups: Vec<Vec<&Response>> = Vec::new();
    for response in sorted {
        let joins = groups
            .last()
            .and_then(|group| group.first())
            .map_or(false, |anchor| match (&anchor.value, &response.value) {
                (OracleValue::Numeric(start), OracleValue::Numeric(value)) => value
                    .checked_sub(*start)
                    .map_or(false, |distance| distance <= tolerance),
                (anchor, value) => anchor == value,
            });

        match groups.last_mut() {
            Some(group) if joins => group.push(response),
            _ => groups.push(vec![response]),
        }
    }
    groups
}

fn unique_largest<'a>(groups: &'a [Vec<&'a Response>]) -> Option<&'a Vec<&'a Response>> {
    let largest = groups.iter().map(Vec::len).max()?;
    let mut candidates = groups.iter().filter(|group| group.len() == largest);
    let winner = candidates.next()?;
    match candidates.next() {
        Some(_) => None,
        None => Some(winner),
    }
}

fn agreement_of(group: &[&Response]) -> Agreement {
    let contributing = group.iter().map(|response| response.node_id.clone()).collect();
    let numeric: Option<Vec<Decimal>> = group.iter().map(|response| response.value.as_decimal()).collect();

    let value = match numeric.as_deref().and_then(median) {
        Some(value) => OracleValue::Numeric(value),
        None => group[0].value.clone(),
    };

    Agreement { value, contributing }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RequestId;
    use chrono::{TimeZone, Utc};

    fn responses(values: &[i64]) -> Vec<Response> {
        let request_id = RequestId::new();
        values
            .iter()
            .enumerate()
            .map(|(i, value)| Response {
                request_id,
                node_id: NodeId(format!("node-{i}")),
                value: OracleValue::from(*value),
                submitted_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            })
            .collect()
    }

    fn policy(method: ConsensusMethod) -> ConsensusPolicy {
        ConsensusPolicy {
            method,
            ..ConsensusPolicy::default()
        }
    }

    #[test]
    fn test_median_of_three() {
        let agreement = decide(&policy(ConsensusMethod::Median), &responses(&[100, 102, 101])).unwrap();
        assert_eq!(agreement.value, OracleValue::from(101));
        assert_eq!(agreement.contributing.len(), 3);
    }

    #[test]
    fn test_median_averages_middle_pair() {
        let values = [Decimal::from(100), Decimal::from(101)];
        assert_eq!(median(&values), Some(Decimal::new(1005, 1)));
    }

    #[test]
    fn test_majority_equal_with_zero_tolerance() {
        let agreement = decide(
            &policy(ConsensusMethod::MajorityEqual),
            &responses(&[100, 100, 999]),
        )
        .unwrap();
        assert_eq!(agreement.value, OracleValue::from(100));
        assert_eq!(
            agreement.contributing,
            BTreeSet::from([NodeId::from("node-0"), NodeId::from("node-1")])
        );
    }

    #[test]
    fn test_majority_equal_without_majority() {
        let result = decide(
            &policy(ConsensusMethod::MajorityEqual),
            &responses(&[100, 200, 300]),
        );
        assert_eq!(result, Err(AggregationError::NoMajority));

        // tied largest groups
        let quorum_four = ConsensusPolicy {
            quorum_size: 4,
            ..policy(ConsensusMethod::MajorityEqual)
        };
        assert_eq!(
            decide(&quorum_four, &responses(&[1, 1, 2, 2])),
            Err(AggregationError::NoMajority)
        );
    }

    #[test]
    fn test_majority_equal_tolerance_groups_close_values() {
        let tolerant = ConsensusPolicy {
            equality_tolerance: Decimal::from(2),
            ..policy(ConsensusMethod::MajorityEqual)
        };
        let agreement = decide(&tolerant, &responses(&[100, 101, 102, 500])).unwrap();
        assert_eq!(agreement.value, OracleValue::from(101));
        assert_eq!(agreement.contributing.len(), 3);
    }

    #[test]
    fn test_outlier_excluded_from_value_only() {
        let quorum_four = ConsensusPolicy {
            quorum_size: 4,
            ..policy(ConsensusMethod::Median)
        };
        let agreement = decide(&quorum_four, &responses(&[100, 101, 100, 5000])).unwrap();
        assert_eq!(agreement.value, OracleValue::from(100));
        assert_eq!(agreement.contributing.len(), 3);
        assert!(!agreement.contributing.contains(&NodeId::from("node-3")));
    }

    #[test]
    fn test_outlier_filter_never_empties_the_set() {
        let agreement = decide(&policy(ConsensusMethod::Median), &responses(&[0, 100])).unwrap();
        assert_eq!(agreement.value, OracleValue::from(50));
        assert_eq!(agreement.contributing.len(), 2);
    }

    #[test]
    fn test_median_rejects_non_numeric() {
        let mut set = responses(&[1, 2]);
        set[1].value = OracleValue::Text("two".into());
        assert_eq!(
            decide(&policy(ConsensusMethod::Median), &set),
            Err(AggregationError::NonNumericValues)
        );
    }

    #[test]
    fn test_mode_breaks_ties_by_smallest_value() {
        let agreement = decide(&policy(ConsensusMethod::Mode), &responses(&[7, 3, 7, 3, 9])).unwrap();
        assert_eq!(agreement.value, OracleValue::from(3));
    }

    #[test]
    fn test_text_majority() {
        let mut set = responses(&[0, 0, 0]);
        set[0].value = OracleValue::Text("shipped".into());
        set[1].value = OracleValue::Text("shipped".into());
        set[2].value = OracleValue::Text("lost".into());
        let agreement = decide(&policy(ConsensusMethod::MajorityEqual), &set).unwrap();
        assert_eq!(agreement.value, OracleValue::Text("shipped".into()));
    }

    #[test]
    fn test_order_independence() {
        let base = responses(&[100, 101, 100, 5000, 99]);
        let expected = decide(&policy(ConsensusMethod::Median), &base).unwrap();

        let mut reversed = base.clone();
        reversed.reverse();
        let mut rotated = base.clone();
        rotated.rotate_left(2);

        for permutation in [reversed, rotated] {
            assert_eq!(decide(&policy(ConsensusMethod::Median), &permutation).unwrap(), expected);
        }
    }

    fn extreme(values: &[Decimal]) -> Vec<Response> {
        let mut set = responses(&vec![0; values.len()]);
        for (response, value) in set.iter_mut().zip(values) {
            response.value = OracleValue::Numeric(*value);
        }
        set
    }

    #[test]
    fn test_median_survives_values_at_decimal_bounds() {
        let set = extreme(&[-Decimal::MAX, Decimal::MAX, Decimal::MAX]);
        let agreement = decide(&policy(ConsensusMethod::Median), &set).unwrap();
        assert_eq!(agreement.value, OracleValue::Numeric(Decimal::MAX));
        assert_eq!(agreement.contributing.len(), 2);

        assert_eq!(median(&[Decimal::MAX, Decimal::MAX]), Some(Decimal::MAX));
        assert_eq!(median(&[-Decimal::MAX, Decimal::MAX]), Some(Decimal::ZERO));
    }

    #[test]
    fn test_majority_equal_survives_values_at_decimal_bounds() {
        let tolerant = ConsensusPolicy {
            equality_tolerance: Decimal::ONE,
            ..policy(ConsensusMethod::MajorityEqual)
        };
        let set = extreme(&[-Decimal::MAX, Decimal::MAX, Decimal::MAX]);
        let agreement = decide(&tolerant, &set).unwrap();
        assert_eq!(agreement.value, OracleValue::Numeric(Decimal::MAX));
        assert_eq!(agreement.contributing.len(), 2);
    }

    #[test]
    fn test_within_deviation_at_decimal_bounds() {
        let threshold = Decimal::new(1, 1);
        assert!(!within_deviation(-Decimal::MAX, Decimal::MAX, threshold));
        assert!(within_deviation(Decimal::MAX, Decimal::MAX, threshold));
        // a bound past Decimal::MAX admits everything representable
        assert!(within_deviation(-Decimal::MAX, Decimal::MAX, Decimal::from(2)));
    }

    #[test]
    fn test_within_deviation_at_zero_center() {
        assert!(within_deviation(Decimal::new(5, 2), Decimal::ZERO, Decimal::new(1, 1)));
        assert!(!within_deviation(Decimal::ONE, Decimal::ZERO, Decimal::new(1, 1)));
    }
}
