use crate::types::{Chunk, FileEntry};

/// Splits `files` into at most `chunk_count` size-balanced chunks.
///
/// Files are taken heaviest first (ties keep input order) and each goes to
/// the currently lightest chunk, lowest index first. Empty chunks are
/// dropped. A `chunk_count` of zero is treated as one.
pub fn plan(files: Vec<FileEntry>, chunk_count: usize) -> Vec<Chunk> {
    let chunk_count = chunk_count.max(1);
    let mut files = files;
    // `sort_by` is stable.
    files.sort_by(|a, b| b.size.cmp(&a.size));

    let mut chunks = vec![Chunk::default(); chunk_count.min(files.len().max(1))];
    for file in files {
        let lightest = chunks
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| (c.size, *i))
            .map(|(i, _)| i)
            .unwrap_or(0);
        chunks[lightest].push(file);
    }

    chunks.retain(|c| !c.is_empty());
    tracing::debug!(chunks = chunks.len(), "planned bulk transfer");
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(sizes: &[u64]) -> Vec<FileEntry> {
        sizes
            .iter()
            .enumerate()
            .map(|(i, s)| FileEntry::new(format!("f{i}"), *s))
            .collect()
    }

    fn sizes(chunk: &Chunk) -> Vec<u64> {
        chunk.files.iter().map(|f| f.size).collect()
    }

    #[test]
    fn greedy_heaviest_first() {
        let chunks = plan(entries(&[10, 9, 8, 7, 6, 5]), 3);
        assert_eq!(chunks.len(), 3);
        assert_eq!(sizes(&chunks[0]), vec![10, 5]);
        assert_eq!(sizes(&chunks[1]), vec![9, 6]);
        assert_eq!(sizes(&chunks[2]), vec![8, 7]);
        assert!(chunks.iter().all(|c| c.size == 15));
    }

    #[test]
    fn every_file_lands_in_exactly_one_chunk() {
        let input = entries(&[3, 1, 4, 1, 5, 9, 2, 6, 5, 3, 5]);
        let chunks = plan(input.clone(), 4);
        assert!(chunks.len() <= 4);

        let mut seen: Vec<_> = chunks.iter().flat_map(|c| c.files.clone()).collect();
        seen.sort_by(|a, b| a.path.cmp(&b.path));
        let mut expected = input;
        expected.sort_by(|a, b| a.path.cmp(&b.path));
        assert_eq!(seen, expected);

        for chunk in &chunks {
            assert_eq!(chunk.size, chunk.files.iter().map(|f| f.size).sum::<u64>());
        }
    }

    #[test]
    fn ties_keep_input_order() {
        let chunks = plan(entries(&[4, 4, 4, 4]), 2);
        let names: Vec<Vec<String>> = chunks
            .iter()
            .map(|c| c.files.iter().map(|f| f.path.display().to_string()).collect())
            .collect();
        assert_eq!(names, vec![vec!["f0", "f2"], vec!["f1", "f3"]]);
    }

    #[test]
    fn deterministic() {
        let input = entries(&[7, 3, 3, 9, 1, 1, 8]);
        assert_eq!(plan(input.clone(), 3), plan(input, 3));
    }

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(plan(Vec::new(), 10).is_empty());
    }

    #[test]
    fn more_chunks_than_files() {
        let chunks = plan(entries(&[1, 2]), 10);
        assert_eq!(chunks.len(), 2);
        assert_eq!(sizes(&chunks[0]), vec![2]);
        assert_eq!(sizes(&chunks[1]), vec![1]);
    }

    #[test]
    fn zero_chunk_count_means_one() {
        let chunks = plan(entries(&[1, 2, 3]), 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 6);
    }

    #[test]
    fn zero_sized_files_are_kept() {
        let chunks = plan(entries(&[0, 0, 0]), 2);
        let total: usize = chunks.iter().map(|c| c.files.len()).sum();
        assert_eq!(total, 3);
    }
}
