use crate::element::Element;

pub(crate) fn vector_add_into<T: Element>(a: &[T], b: &[T], out: &mut [T]) {
    for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
        *o = x.add(y);
    }
}

/// Fill rows `row_start..` of C (one `n`-wide slice per row in `out_rows`)
/// with the row-major product of A (m x k) and B (k x n). Each dot product
/// accumulates over `k` in ascending order.
pub(crate) fn matmul_rows_into<T: Element>(
    a: &[T],
    b: &[T],
    out_rows: &mut [T],
    row_start: usize,
    n: usize,
    k: usize,
) {
    if n == 0 {
        return;
    }
    for (r, row) in out_rows.chunks_mut(n).enumerate() {
        let i = row_start + r;
        for (j, cell) in row.iter_mut().enumerate() {
            let mut acc = T::default();
            for p in 0..k {
                acc = T::mul_add(acc, a[i * k + p], b[p * n + j]);
            }
            *cell = acc;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matmul_2x2() {
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b = [5.0f32, 6.0, 7.0, 8.0];
        let mut c = [0.0f32; 4];
        matmul_rows_into(&a, &b, &mut c, 0, 2, 2);
        assert_eq!(c, [19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_matmul_row_offset() {
        let a = [1i32, 0, 0, 1, 2, 2];
        let b = [3i32, 4, 5, 6];
        let mut last_row = [0i32; 2];
        matmul_rows_into(&a, &b, &mut last_row, 2, 2, 2);
        assert_eq!(last_row, [16, 20]);
    }

    #[test]
    fn test_vector_add() {
        let mut out = [0i32; 3];
        vector_add_into(&[1, 2, 3], &[10, 20, 30], &mut out);
        assert_eq!(out, [11, 22, 33]);
    }
}
