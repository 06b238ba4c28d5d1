// Operator-to-interval translation. Open endpoints move one representable
// value inward so the searcher only ever sees closed intervals; a strict
// bound that cannot move (already at the type's edge) excludes everything
// on that side, which is the empty set.

use crate::key::{Direction, IndexKey};
use sortidx_base::{err, ErrorKind, Result};

#[cfg(test)]
use test_log::test;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl Op {
    fn is_lower(self) -> bool {
        matches!(self, Op::Gt | Op::Ge)
    }

    fn is_upper(self) -> bool {
        matches!(self, Op::Lt | Op::Le)
    }
}

// Smallest value strictly above `limit`, or None when the limit saturates.
fn strictly_above<T: IndexKey>(limit: &T, itemsize: usize) -> Option<T> {
    let next = limit.next_after(Direction::Up, itemsize);
    if next > *limit {
        Some(next)
    } else {
        None
    }
}

fn strictly_below<T: IndexKey>(limit: &T, itemsize: usize) -> Option<T> {
    let next = limit.next_after(Direction::Down, itemsize);
    if next < *limit {
        Some(next)
    } else {
        None
    }
}

/// Translate one or two operator/limit pairs into a closed `[lo, hi]`
/// interval. `None` means the predicate is unsatisfiable. Two-sided inputs
/// must pair one lower operator with one upper operator.
pub fn get_lookup_range<T: IndexKey>(
    ops: &[Op],
    limits: &[T],
    itemsize: usize,
) -> Result<Option<(T, T)>> {
    if ops.len() != limits.len() {
        return Err(err(ErrorKind::BadQuery, "operator and limit counts differ"));
    }
    match ops {
        [op] => {
            let limit = &limits[0];
            Ok(match op {
                Op::Lt => strictly_below(limit, itemsize)
                    .map(|hi| (T::neg_inf(itemsize), hi)),
                Op::Le => Some((T::neg_inf(itemsize), limit.clone())),
                Op::Eq => Some((limit.clone(), limit.clone())),
                Op::Ge => Some((limit.clone(), T::pos_inf(itemsize))),
                Op::Gt => strictly_above(limit, itemsize)
                    .map(|lo| (lo, T::pos_inf(itemsize))),
            })
        }
        [lower_op, upper_op] => {
            if !lower_op.is_lower() || !upper_op.is_upper() {
                return Err(err(
                    ErrorKind::BadQuery,
                    "two-sided query needs one lower and one upper operator",
                ));
            }
            let (lower, upper) = (&limits[0], &limits[1]);
            if lower > upper {
                return Ok(None);
            }
            let lo = match lower_op {
                Op::Ge => Some(lower.clone()),
                _ => strictly_above(lower, itemsize),
            };
            let hi = match upper_op {
                Op::Le => Some(upper.clone()),
                _ => strictly_below(upper, itemsize),
            };
            Ok(match (lo, hi) {
                (Some(lo), Some(hi)) => Some((lo, hi)),
                _ => None,
            })
        }
        _ => Err(err(
            ErrorKind::BadQuery,
            "expected one or two operator/limit pairs",
        )),
    }
}

#[test]
fn test_one_sided() -> Result<()> {
    assert_eq!(get_lookup_range(&[Op::Lt], &[5i64], 0)?, Some((i64::MIN, 4)));
    assert_eq!(get_lookup_range(&[Op::Le], &[5i64], 0)?, Some((i64::MIN, 5)));
    assert_eq!(get_lookup_range(&[Op::Eq], &[5i64], 0)?, Some((5, 5)));
    assert_eq!(get_lookup_range(&[Op::Ge], &[5i64], 0)?, Some((5, i64::MAX)));
    assert_eq!(get_lookup_range(&[Op::Gt], &[5i64], 0)?, Some((6, i64::MAX)));
    Ok(())
}

#[test]
fn test_two_sided() -> Result<()> {
    assert_eq!(
        get_lookup_range(&[Op::Gt, Op::Lt], &[2i64, 6], 0)?,
        Some((3, 5))
    );
    assert_eq!(
        get_lookup_range(&[Op::Ge, Op::Lt], &[2i64, 6], 0)?,
        Some((2, 5))
    );
    assert_eq!(
        get_lookup_range(&[Op::Gt, Op::Le], &[2i64, 6], 0)?,
        Some((3, 6))
    );
    assert_eq!(
        get_lookup_range(&[Op::Ge, Op::Le], &[2i64, 6], 0)?,
        Some((2, 6))
    );
    // Inverted bounds are unsatisfiable, not an error.
    assert_eq!(get_lookup_range(&[Op::Ge, Op::Le], &[6i64, 2], 0)?, None);
    Ok(())
}

#[test]
fn test_bad_op_sets() {
    assert!(get_lookup_range::<i64>(&[], &[], 0).is_err());
    assert!(get_lookup_range(&[Op::Lt, Op::Lt], &[1i64, 2], 0).is_err());
    assert!(get_lookup_range(&[Op::Ge, Op::Gt], &[1i64, 2], 0).is_err());
    assert!(get_lookup_range(&[Op::Eq], &[1i64, 2], 0).is_err());
}

#[test]
fn test_saturated_strict_bounds_are_empty() -> Result<()> {
    // Nothing lies below the type minimum or above the maximum.
    assert_eq!(get_lookup_range(&[Op::Lt], &[i64::MIN], 0)?, None);
    assert_eq!(get_lookup_range(&[Op::Gt], &[i64::MAX], 0)?, None);
    assert_eq!(get_lookup_range(&[Op::Lt], &[false], 0)?, None);
    use ordered_float::OrderedFloat;
    assert_eq!(
        get_lookup_range(&[Op::Gt], &[OrderedFloat(f64::INFINITY)], 0)?,
        None
    );
    // But strict bounds at an interior value still translate.
    assert_eq!(
        get_lookup_range(&[Op::Lt], &[OrderedFloat(f64::INFINITY)], 0)?,
        Some((OrderedFloat(f64::NEG_INFINITY), OrderedFloat(f64::MAX)))
    );
    Ok(())
}
