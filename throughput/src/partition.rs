use crate::{Chunk, Error, Result};

/// Split `[0, element_count)` into `worker_count` contiguous chunks.
///
/// Workers `0..P-1` get `floor(N / P)` elements each; the last worker also
/// absorbs the remainder. Fails if `P == 0` or `P > N`.
pub fn partition(element_count: usize, worker_count: usize) -> Result<Vec<Chunk>> {
    if worker_count == 0 {
        return Err(Error::InvalidPartition("worker count must be at least 1".into()));
    }
    if worker_count > element_count {
        return Err(Error::InvalidPartition(format!(
            "{} workers for {} elements",
            worker_count, element_count
        )));
    }

    let chunk_size = element_count / worker_count;
    let chunks = (0..worker_count)
        .map(|worker_id| Chunk {
            start: worker_id * chunk_size,
            end: if worker_id == worker_count - 1 {
                element_count
            } else {
                (worker_id + 1) * chunk_size
            },
            worker_id,
        })
        .collect();
    Ok(chunks)
}
