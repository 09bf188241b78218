use super::QrError;
use super::reduce::{QrAccumulator, merge, reduce};
use ndarray::Array2;
use rayon::prelude::*;
use std::borrow::Borrow;

/// Folds a single-pass sequence of chunks into one accumulator.
///
/// Chunks are consumed exactly once, left to right:
/// `state_0 = Empty; state_i = reduce(state_{i-1}, chunk_i, threshold)`.
/// At most `max(threshold, columns)` rows are retained between chunks, so the
/// source may be far larger than memory. The result is still raw rows when the
/// whole input fit under `threshold`; call [`QrAccumulator::into_factor`] to
/// finalize it.
pub fn mapreduce_qr<I, M>(chunks: I, threshold: usize) -> Result<QrAccumulator, QrError>
where
    I: IntoIterator<Item = M>,
    M: Borrow<Array2<f64>>,
{
    try_mapreduce_qr(chunks.into_iter().map(Ok::<M, QrError>), threshold)
}

/// Like [`mapreduce_qr`] for fallible producers: the first `Err` stops the
/// fold and is returned.
pub fn try_mapreduce_qr<I, M, E>(chunks: I, threshold: usize) -> Result<QrAccumulator, QrError>
where
    I: IntoIterator<Item = Result<M, E>>,
    M: Borrow<Array2<f64>>,
    QrError: From<E>,
{
    let mut state = QrAccumulator::Empty;
    let mut num_chunks = 0usize;
    let mut num_rows = 0usize;

    for chunk in chunks {
        let chunk = chunk?;
        let chunk = chunk.borrow();
        num_chunks += 1;
        num_rows += chunk.nrows();
        state = reduce(state, chunk.view(), threshold)?;
    }

    if num_chunks == 0 {
        return Err(QrError::EmptyInput);
    }
    log::debug!(
        "Folded {} chunks ({} rows) into {} retained rows (factored: {})",
        num_chunks,
        num_rows,
        state.nrows(),
        state.is_factor()
    );
    Ok(state)
}

/// Parallel counterpart of [`mapreduce_qr`]: rayon workers fold disjoint runs
/// of chunks and the partial accumulators are merged pairwise. Equal to the
/// sequential fold up to rounding once both are finalized.
pub fn mapreduce_qr_parallel<I, M>(chunks: I, threshold: usize) -> Result<QrAccumulator, QrError>
where
    I: IntoParallelIterator<Item = M>,
    M: Borrow<Array2<f64>> + Send,
{
    let (state, num_chunks) = chunks
        .into_par_iter()
        .try_fold(
            || (QrAccumulator::Empty, 0usize),
            |(acc, count), chunk| {
                reduce(acc, chunk.borrow().view(), threshold).map(|acc| (acc, count + 1))
            },
        )
        .try_reduce(
            || (QrAccumulator::Empty, 0usize),
            |(left, left_count), (right, right_count)| {
                merge(left, right, threshold).map(|acc| (acc, left_count + right_count))
            },
        )?;

    if num_chunks == 0 {
        return Err(QrError::EmptyInput);
    }
    log::debug!(
        "Parallel fold of {} chunks left {} retained rows",
        num_chunks,
        state.nrows()
    );
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Axis, concatenate, s};

    fn test_matrix() -> Array2<f64> {
        let mut m = Array2::<f64>::eye(4);
        for i in 0..3 {
            m[[i, i + 1]] = -1.0;
            m[[i + 1, i]] = -1.0;
        }
        concatenate(Axis(0), &[m.view(), Array2::<f64>::ones((1, 4)).view()]).unwrap()
    }

    fn wavy_rows(n: usize, cols: usize) -> Array2<f64> {
        Array2::from_shape_fn((n, cols), |(i, j)| ((i * (j + 2)) as f64 * 0.37).sin() + j as f64)
    }

    fn assert_factors_close(a: &Array2<f64>, b: &Array2<f64>) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_on_iterator() {
        let chunks = (0..5).map(|_| test_matrix());
        let r = mapreduce_qr(chunks, 4).unwrap().into_matrix().unwrap();
        assert_eq!(r.shape(), &[4, 4]);
        for i in 0..4 {
            for j in 0..i {
                assert_eq!(r[[i, j]], 0.0);
            }
        }
    }

    #[test]
    fn test_large_threshold_returns_plain_stack() {
        let m = test_matrix();
        let chunks = vec![m.clone(), m.clone()];
        let stacked = mapreduce_qr(&chunks, 11).unwrap();
        assert!(!stacked.is_factor());
        assert_eq!(
            stacked.into_matrix().unwrap(),
            concatenate(Axis(0), &[m.view(), m.view()]).unwrap()
        );
    }

    #[test]
    fn test_chunk_boundaries_do_not_change_factor() {
        let data = wavy_rows(97, 4);
        let whole = mapreduce_qr([data.clone()], 0).unwrap().into_factor().unwrap();

        let boundaries = [0usize, 1, 8, 30, 31, 60, 97];
        let pieces: Vec<Array2<f64>> = boundaries
            .windows(2)
            .map(|w| data.slice(s![w[0]..w[1], ..]).to_owned())
            .collect();
        for threshold in [0usize, 3, 10, 50, 1000] {
            let streamed = mapreduce_qr(&pieces, threshold).unwrap().into_factor().unwrap();
            assert_factors_close(&streamed, &whole);
        }
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let data = wavy_rows(400, 5);
        let pieces: Vec<Array2<f64>> = data
            .axis_chunks_iter(Axis(0), 17)
            .map(|c| c.to_owned())
            .collect();
        let sequential = mapreduce_qr(&pieces, 20).unwrap().into_factor().unwrap();
        let parallel = mapreduce_qr_parallel(&pieces, 20).unwrap().into_factor().unwrap();
        assert_factors_close(&parallel, &sequential);
    }

    #[test]
    fn test_error_conditions() {
        let none: Vec<Array2<f64>> = Vec::new();
        assert!(matches!(mapreduce_qr(&none, 4).unwrap_err(), QrError::EmptyInput));
        assert!(matches!(
            mapreduce_qr_parallel(&none, 4).unwrap_err(),
            QrError::EmptyInput
        ));

        let mixed = vec![test_matrix(), Array2::<f64>::ones((2, 3))];
        match mapreduce_qr(&mixed, 100).unwrap_err() {
            QrError::DimensionMismatch { expected, found } => {
                assert_eq!(expected, 4);
                assert_eq!(found, 3);
            }
            other => panic!("Expected DimensionMismatch error, got {other:?}"),
        }

        let failing = vec![
            Ok(test_matrix()),
            Err(QrError::InvalidWeight { row: 0, value: -1.0 }),
            Ok(test_matrix()),
        ];
        assert!(matches!(
            try_mapreduce_qr(failing, 4).unwrap_err(),
            QrError::InvalidWeight { row: 0, .. }
        ));
    }
}
