use ordered_float::OrderedFloat;
use test_log::test;

use crate::index::{derived_rows, Index};
use crate::key::{FixedBytes, IndexKey, KeyKind, Value};
use crate::meta::{Filters, Geometry};
use crate::range::Op;
use crate::AnyIndex;
use sortidx_base::{ErrorKind, Result};

fn tiny_geometry(ss: usize, cs: usize) -> Geometry {
    Geometry {
        superblocksize: 4 * ss,
        blocksize: 2 * ss,
        slicesize: ss,
        chunksize: cs,
    }
}

fn holds<T: Ord>(v: &T, op: Op, limit: &T) -> bool {
    match op {
        Op::Lt => v < limit,
        Op::Le => v <= limit,
        Op::Eq => v == limit,
        Op::Ge => v >= limit,
        Op::Gt => v > limit,
    }
}

// Search through the translated range and compare against a scan of the
// original column, both the count and the coordinate set.
fn check_against_scan<T: IndexKey>(
    ix: &mut Index<T>,
    column: &[T],
    ops: &[Op],
    limits: &[T],
) -> Result<()> {
    let range = ix.lookup_range(ops, limits)?;
    let count = ix.search(range)?;
    let expected = column
        .iter()
        .filter(|v| ops.iter().zip(limits).all(|(op, l)| holds(*v, *op, l)))
        .count();
    assert_eq!(count, expected, "count mismatch for {:?} {:?}", ops, limits);
    let mut coords = ix.get_coords(0, column.len() + 1)?;
    assert_eq!(coords.len(), expected);
    coords.sort_unstable();
    coords.dedup();
    assert_eq!(coords.len(), expected, "coords are not distinct");
    for &r in &coords {
        let v = &column[r as usize];
        assert!(ops.iter().zip(limits).all(|(op, l)| holds(v, *op, l)));
    }
    Ok(())
}

// Every stored invariant: per-slice sortedness, the derived arrays against
// their formulas, the permutation property of the reverse indices, and the
// last-row buffer layout.
fn check_invariants<T: IndexKey>(ix: &mut Index<T>) -> Result<()> {
    let ncs = ix.geo.nchunks_slice();
    for row in 0..ix.nslices() {
        let arr = ix.sorted.read_row(row)?;
        assert!(arr.windows(2).all(|w| w[0] <= w[1]), "slice {} unsorted", row);
        let d = derived_rows(&arr, &ix.geo);
        assert_eq!(ix.ranges.read_row(row)?, d.range);
        assert_eq!(ix.bounds.read_row(row)?, d.seps);
        assert_eq!(ix.abounds.read_flat(row * ncs, ncs)?, d.firsts);
        assert_eq!(ix.zbounds.read_flat(row * ncs, ncs)?, d.lasts);
        assert_eq!(ix.mbounds.read_flat(row * ncs, ncs)?, d.medians);
        assert_eq!(ix.mranges.read_flat(row, 1)?[0], d.mrange);
    }
    let mut seen = vec![false; ix.nelements()];
    for row in 0..ix.nslices() {
        for r in ix.indices.read_row(row)? {
            assert!(!seen[r as usize], "row {} indexed twice", r);
            seen[r as usize] = true;
        }
    }
    if ix.nelements_lr > 0 {
        let n = ix.nelements_lr;
        let mut lr = Vec::new();
        ix.indices_lr.read_cells(0, 0, n, &mut lr)?;
        for r in lr {
            assert!(!seen[r as usize], "row {} indexed twice", r);
            seen[r as usize] = true;
        }
        let mut vals = Vec::new();
        ix.sorted_lr
            .read_cells(0, ix.bebounds.len(), n, &mut vals)?;
        assert!(vals.windows(2).all(|w| w[0] <= w[1]), "last row unsorted");
        let mut be: Vec<T> = vals.iter().step_by(ix.geo.chunksize).cloned().collect();
        be.push(vals[n - 1].clone());
        assert_eq!(ix.bebounds, be);
    }
    assert!(seen.iter().all(|&s| s), "some rows never indexed");
    Ok(())
}

#[test]
fn test_two_slices_int64() -> Result<()> {
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 0, tiny_geometry(5, 2))?;
    let column = vec![5i64, 2, 8, 1, 9, 3, 7, 4, 6, 0];
    ix.append(&column[..5])?;
    ix.append(&column[5..])?;
    assert_eq!(ix.nelements(), 10);
    assert_eq!(ix.ranges.read_row(0)?, vec![1, 9]);
    assert_eq!(ix.ranges.read_row(1)?, vec![0, 7]);
    // Slice 0 sorts to [1,2,5,8,9]; the separators sit at positions 2 and 4.
    assert_eq!(ix.bounds.read_row(0)?, vec![5, 9]);
    check_invariants(&mut ix)?;

    let count = ix.search(ix.lookup_range(&[Op::Ge], &[3])?)?;
    assert_eq!(count, 7);

    // Full range covers everything, unseen points nothing.
    assert_eq!(ix.search(Some((i64::MIN, i64::MAX)))?, 10);
    assert_eq!(ix.search(ix.lookup_range(&[Op::Eq], &[42])?)?, 0);
    assert_eq!(ix.search(Some((5, 3)))?, 0);
    assert_eq!(ix.search(None)?, 0);

    for ops in [[Op::Lt], [Op::Le], [Op::Eq], [Op::Ge], [Op::Gt]] {
        for limit in [-1i64, 0, 3, 7, 9, 12] {
            check_against_scan(&mut ix, &column, &ops, &[limit])?;
        }
    }
    check_against_scan(&mut ix, &column, &[Op::Gt, Op::Le], &[2, 7])?;
    check_against_scan(&mut ix, &column, &[Op::Ge, Op::Lt], &[0, 10])?;
    Ok(())
}

#[test]
fn test_float_infinities_and_nan() -> Result<()> {
    let mut ix: Index<OrderedFloat<f64>> =
        Index::create_mem(0, Filters::default(), 0, tiny_geometry(4, 2))?;
    let vals: Vec<OrderedFloat<f64>> = [1.0, 2.0, f64::INFINITY, f64::NEG_INFINITY]
        .iter()
        .map(|&x| OrderedFloat(x))
        .collect();
    ix.append(&vals)?;
    check_invariants(&mut ix)?;
    let count = ix.search(ix.lookup_range(&[Op::Lt], &[OrderedFloat(f64::INFINITY)])?)?;
    assert_eq!(count, 3);
    let count = ix.search(ix.lookup_range(&[Op::Ge], &[OrderedFloat(f64::NEG_INFINITY)])?)?;
    assert_eq!(count, 4);

    // NaN never enters the index.
    let nans = vec![OrderedFloat(f64::NAN); 4];
    let e = ix.append(&nans).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Unsupported);
    assert_eq!(ix.nelements(), 4);
    Ok(())
}

#[test]
fn test_float_zero_signs_collapse() -> Result<()> {
    let mut ix: Index<OrderedFloat<f64>> =
        Index::create_mem(0, Filters::default(), 0, tiny_geometry(4, 2))?;
    ix.append(&[
        OrderedFloat(-0.0),
        OrderedFloat(0.0),
        OrderedFloat(1.0),
        OrderedFloat(2.0),
    ])?;
    // -0 and +0 compare equal, so a point query at zero sees both.
    let count = ix.search(ix.lookup_range(&[Op::Eq], &[OrderedFloat(0.0)])?)?;
    assert_eq!(count, 2);
    Ok(())
}

#[test]
fn test_byte_strings() -> Result<()> {
    let mut ix: Index<FixedBytes> =
        Index::create_mem(4, Filters::default(), 0, tiny_geometry(4, 2))?;
    let column: Vec<FixedBytes> = ["alfa", "beta", "alfa", "gamm"]
        .iter()
        .map(|s| FixedBytes::new(s.as_bytes(), 4))
        .collect();
    ix.append(&column)?;
    check_invariants(&mut ix)?;
    let count = ix.search(ix.lookup_range(&[Op::Gt], &[FixedBytes::new(b"alfa", 4)])?)?;
    assert_eq!(count, 2);
    let count = ix.search(ix.lookup_range(&[Op::Eq], &[FixedBytes::new(b"alfa", 4)])?)?;
    assert_eq!(count, 2);
    check_against_scan(&mut ix, &column, &[Op::Le], &[FixedBytes::new(b"beta", 4)])?;

    // No widening arithmetic for byte strings.
    let (_, _, toverlap) = ix.compute_overlaps()?;
    assert_eq!(toverlap, -1.0);
    Ok(())
}

#[test]
fn test_optimize_full_schedule() -> Result<()> {
    // Eight fully overlapping slices: slice k holds k, 8+k, .., 56+k.
    let geo = tiny_geometry(8, 2);
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 9, geo)?;
    let mut column = Vec::new();
    for k in 0..8i64 {
        let slice: Vec<i64> = (0..8).map(|j| j * 8 + k).collect();
        column.extend_from_slice(&slice);
        ix.append(&slice)?;
    }
    let (nover_before, _, tover_before) = ix.compute_overlaps()?;
    assert!(nover_before > 0);
    assert!(tover_before > 0.0);

    ix.optimize(Some(9))?;

    check_invariants(&mut ix)?;
    let (_, _, tover_after) = ix.compute_overlaps()?;
    assert!(
        tover_after <= tover_before,
        "overlap grew: {} -> {}",
        tover_before,
        tover_after
    );
    for ops in [[Op::Lt], [Op::Ge], [Op::Eq]] {
        for limit in [0i64, 7, 31, 32, 63, 64] {
            check_against_scan(&mut ix, &column, &ops, &[limit])?;
        }
    }
    check_against_scan(&mut ix, &column, &[Op::Gt, Op::Lt], &[10, 50])?;
    Ok(())
}

#[test]
fn test_optimize_below_level_three_is_a_noop() -> Result<()> {
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 0, tiny_geometry(4, 2))?;
    for k in 0..4i64 {
        let slice: Vec<i64> = (0..4).map(|j| j * 4 + k).collect();
        ix.append(&slice)?;
    }
    let before: Vec<Vec<i64>> = (0..4).map(|r| ix.sorted.read_row(r)).collect::<Result<_>>()?;
    ix.optimize(Some(2))?;
    let after: Vec<Vec<i64>> = (0..4).map(|r| ix.sorted.read_row(r)).collect::<Result<_>>()?;
    assert_eq!(before, after);
    Ok(())
}

#[test]
fn test_last_row_partial_slice() -> Result<()> {
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 0, tiny_geometry(5, 2))?;
    ix.append_last_row(&[10, 5, 7], 3)?;
    assert_eq!(ix.nelements(), 3);
    assert_eq!(ix.nrows(), 1);
    check_invariants(&mut ix)?;

    // The hit for the third appended item comes back through the last-row
    // reverse indices.
    let count = ix.search(ix.lookup_range(&[Op::Eq], &[7])?)?;
    assert_eq!(count, 1);
    assert_eq!(ix.get_coords(0, 10)?, vec![2]);

    // A repeated last-row append replaces the buffer.
    ix.append_last_row(&[10, 5, 7, 1], 4)?;
    assert_eq!(ix.nelements(), 4);
    check_invariants(&mut ix)?;
    assert_eq!(ix.search(ix.lookup_range(&[Op::Le], &[5])?)?, 2);

    // A full slice supersedes the buffer entirely.
    ix.append(&[4, 3, 2, 1, 0])?;
    assert_eq!(ix.nelements(), 5);
    assert_eq!(ix.nelements_lr, 0);
    check_invariants(&mut ix)?;
    Ok(())
}

#[test]
fn test_full_slices_then_last_row() -> Result<()> {
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 0, tiny_geometry(5, 2))?;
    let column = vec![5i64, 2, 8, 1, 9, 30, 20, 40];
    ix.append(&column[..5])?;
    ix.append_last_row(&column[5..], 8)?;
    assert_eq!(ix.nelements(), 8);
    assert_eq!(ix.nrows(), 2);
    check_invariants(&mut ix)?;
    for limit in [0i64, 5, 20, 40, 41] {
        check_against_scan(&mut ix, &column, &[Op::Ge], &[limit])?;
        check_against_scan(&mut ix, &column, &[Op::Lt], &[limit])?;
    }

    // A count that disagrees with the column is fatal and dirties the index.
    let e = ix.append_last_row(&[1, 2], 9).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Assertion);
    assert!(ix.dirty());
    Ok(())
}

#[test]
fn test_append_accounting() -> Result<()> {
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 0, tiny_geometry(4, 2))?;
    let e = ix.append(&[1, 2, 3]).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Assertion);
    for k in 0..3i64 {
        ix.append(&[k, k + 10, k + 20, k + 30])?;
        assert_eq!(ix.nelements(), (k as usize + 1) * 4);
        assert_eq!(ix.nelements_lr, 0);
    }
    ix.append_last_row(&[100, 101], 14)?;
    assert_eq!(ix.nelements(), 14);
    assert_ne!(ix.nelements_lr, 0);
    Ok(())
}

#[test]
fn test_search_cache_skips_chunk_reads() -> Result<()> {
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 0, tiny_geometry(8, 2))?;
    ix.append(&[0, 2, 4, 6, 8, 10, 12, 14])?;
    ix.append(&[1, 3, 5, 7, 9, 11, 13, 15])?;

    let range = ix.lookup_range(&[Op::Gt, Op::Le], &[3, 11])?;
    let first = ix.search(range.clone())?;
    assert_eq!(first, 8);

    ix.sorted.reset_reads();
    let second = ix.search(range)?;
    assert_eq!(second, first);
    assert_eq!(ix.sorted.reads(), 0, "cache hit touched the sorted array");
    Ok(())
}

#[test]
fn test_get_coords_pagination() -> Result<()> {
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 0, tiny_geometry(5, 2))?;
    let column = vec![5i64, 2, 8, 1, 9, 3, 7, 4, 6, 0];
    ix.append(&column[..5])?;
    ix.append(&column[5..])?;
    let total = ix.search(ix.lookup_range(&[Op::Ge], &[0])?)?;
    assert_eq!(total, 10);
    let all = ix.get_coords(0, 100)?;
    assert_eq!(all.len(), 10);
    let mut paged = Vec::new();
    let mut at = 0;
    loop {
        let page = ix.get_coords(at, 3)?;
        if page.is_empty() {
            break;
        }
        at += page.len();
        paged.extend(page);
    }
    assert_eq!(paged, all);
    Ok(())
}

#[test]
fn test_reopen_roundtrip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let geo = tiny_geometry(5, 2);
    let column = vec![5i64, 2, 8, 1, 9, 3, 7, 4, 6, 0, 100, 50];
    {
        let mut ix: Index<i64> =
            Index::create_with_geometry(dir.path(), "acol", 0, Filters::default(), 6, geo)?;
        ix.append(&column[..5])?;
        ix.append(&column[5..10])?;
        ix.append_last_row(&column[10..], 12)?;
        ix.sync()?;
    }
    let mut ix: Index<i64> = Index::open(dir.path(), "acol")?;
    assert_eq!(ix.geo, geo);
    assert_eq!(ix.optlevel, 6);
    assert_eq!(ix.nelements(), 12);
    assert_eq!(ix.nelements_lr, 2);
    check_invariants(&mut ix)?;
    for limit in [0i64, 4, 50, 101] {
        check_against_scan(&mut ix, &column, &[Op::Lt], &[limit])?;
    }

    // Opening under the wrong key type is refused.
    let e = Index::<u8>::open(dir.path(), "acol").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Unsupported);

    // Removal is recursive.
    ix.remove()?;
    assert!(!dir.path().join("acol").exists());
    Ok(())
}

#[test]
fn test_optimize_on_disk_cleans_scratch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut ix: Index<i64> =
        Index::create_with_geometry(dir.path(), "bcol", 0, Filters::default(), 9, tiny_geometry(8, 2))?;
    let mut column = Vec::new();
    for k in 0..8i64 {
        let slice: Vec<i64> = (0..8).map(|j| j * 8 + k).collect();
        column.extend_from_slice(&slice);
        ix.append(&slice)?;
    }
    ix.optimize(None)?;
    check_invariants(&mut ix)?;
    check_against_scan(&mut ix, &column, &[Op::Ge, Op::Le], &[5, 40])?;
    // No scratch directory survives the pass.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sortidx-"))
        .collect();
    assert!(leftovers.is_empty());
    Ok(())
}

#[test]
fn test_any_index_dispatch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut any = AnyIndex::create(
        dir.path(),
        "ccol",
        KeyKind::Int32,
        0,
        Filters::default(),
        0,
        1000,
    )?;
    assert_eq!(any.kind(), KeyKind::Int32);
    let ss = match &any {
        AnyIndex::Int32(ix) => ix.geo.slicesize,
        _ => unreachable!(),
    };
    let vals: Vec<Value> = (0..ss as i64).map(Value::Int).collect();
    any.append(&vals)?;
    assert_eq!(any.nelements(), ss);

    let range = any.lookup_range(&[Op::Ge, Op::Lt], &[Value::Int(10), Value::Int(20)])?;
    assert_eq!(any.search(range)?, 10);
    assert_eq!(any.get_coords(0, 100)?.len(), 10);

    // Out-of-range literals are bad queries at the boundary.
    let e = any
        .lookup_range(&[Op::Eq], &[Value::Int(i64::MAX)])
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::BadQuery);

    drop(any);
    let any = AnyIndex::open(dir.path(), "ccol")?;
    assert_eq!(any.kind(), KeyKind::Int32);
    assert_eq!(any.nelements(), ss);
    Ok(())
}

#[test]
fn test_bool_keys() -> Result<()> {
    let mut ix: Index<bool> = Index::create_mem(0, Filters::default(), 0, tiny_geometry(4, 2))?;
    let column = vec![true, false, true, true];
    ix.append(&column)?;
    check_invariants(&mut ix)?;
    assert_eq!(ix.search(ix.lookup_range(&[Op::Eq], &[true])?)?, 3);
    assert_eq!(ix.search(ix.lookup_range(&[Op::Eq], &[false])?)?, 1);
    // Nothing is strictly below false.
    assert_eq!(ix.search(ix.lookup_range(&[Op::Lt], &[false])?)?, 0);
    assert_eq!(ix.search(ix.lookup_range(&[Op::Gt], &[false])?)?, 3);
    Ok(())
}

#[test]
fn test_single_chunk_slices() -> Result<()> {
    // cs == ss leaves no separator rows; row bounds still apply to the
    // zero-width array, and reopening restores its logical row count.
    let dir = tempfile::tempdir()?;
    let geo = tiny_geometry(4, 4);
    let column = vec![3i64, 1, 2, 0, 7, 5, 6, 4];
    {
        let mut ix: Index<i64> =
            Index::create_with_geometry(dir.path(), "dcol", 0, Filters::default(), 0, geo)?;
        ix.append(&column[..4])?;
        ix.append(&column[4..])?;
        assert_eq!(ix.bounds.read_row(1)?, Vec::<i64>::new());
        assert_eq!(
            ix.bounds.read_row(2).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
        ix.sync()?;
    }
    let mut ix: Index<i64> = Index::open(dir.path(), "dcol")?;
    assert_eq!(ix.bounds.read_row(1)?, Vec::<i64>::new());
    assert_eq!(
        ix.bounds.read_row(2).unwrap_err().kind(),
        ErrorKind::OutOfRange
    );
    check_invariants(&mut ix)?;
    for limit in [0i64, 3, 4, 8] {
        check_against_scan(&mut ix, &column, &[Op::Ge], &[limit])?;
        check_against_scan(&mut ix, &column, &[Op::Lt], &[limit])?;
    }
    Ok(())
}

#[test]
fn test_many_slices_brute_force() -> Result<()> {
    // A deterministic shuffle over six slices plus a trailing buffer.
    let geo = tiny_geometry(8, 2);
    let mut ix: Index<i64> = Index::create_mem(0, Filters::default(), 0, geo)?;
    let mut column = Vec::new();
    let mut x = 7i64;
    for _ in 0..6 {
        let mut slice = Vec::with_capacity(8);
        for _ in 0..8 {
            x = (x * 31 + 17) % 101;
            slice.push(x);
        }
        column.extend_from_slice(&slice);
        ix.append(&slice)?;
    }
    let tail = vec![13i64, 99, 0];
    column.extend_from_slice(&tail);
    ix.append_last_row(&tail, column.len() as u64)?;
    check_invariants(&mut ix)?;

    for ops in [[Op::Lt], [Op::Le], [Op::Eq], [Op::Ge], [Op::Gt]] {
        for limit in [-5i64, 0, 13, 50, 99, 100, 120] {
            check_against_scan(&mut ix, &column, &ops, &[limit])?;
        }
    }
    check_against_scan(&mut ix, &column, &[Op::Ge, Op::Le], &[20, 80])?;
    check_against_scan(&mut ix, &column, &[Op::Gt, Op::Lt], &[0, 101])?;
    Ok(())
}
