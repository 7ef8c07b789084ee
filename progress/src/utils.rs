/// Size of each chunk when `len` items are split across `workers`, so
/// that there are at most `workers` chunks.
pub fn chunk_size(len: usize, workers: usize) -> usize {
    let workers = workers.max(1);
    f64::ceil(len as f64 / workers as f64).max(1.0) as usize
}

/// Split `items` into owned chunks of at most `size` elements.
pub fn chunker<T>(items: Vec<T>, size: usize) -> Vec<Vec<T>> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(items.len() / size + 1);
    let mut iter = items.into_iter().peekable();

    while iter.peek().is_some() {
        chunks.push(iter.by_ref().take(size).collect());
    }

    chunks
}

/// Table name from a DynamoDB table ARN, e.g.
/// `arn:aws:dynamodb:us-east-1:123:table/progress` gives `progress`.
/// Anything without a `:table/` segment is taken to be a bare name.
pub fn table_name_from_arn(arn: &str) -> &str {
    arn.rsplit(":table/").next().unwrap_or(arn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_match_worker_count() {
        assert_eq!(chunk_size(100, 25), 4);
        assert_eq!(chunk_size(101, 25), 5);
        assert_eq!(chunk_size(3, 25), 1);
        assert_eq!(chunk_size(0, 25), 1);
        assert_eq!(chunk_size(10, 0), 10);

        let chunks = chunker((0..101).collect::<Vec<_>>(), chunk_size(101, 25));
        assert_eq!(chunks.len(), 21);
        assert!(chunks.len() <= 25);
        assert_eq!(chunks.iter().map(Vec::len).sum::<usize>(), 101);
    }

    #[test]
    fn chunker_keeps_order() {
        let chunks = chunker(vec![1, 2, 3, 4, 5], 2);
        assert_eq!(chunks, vec![vec![1, 2], vec![3, 4], vec![5]]);
        assert!(chunker(Vec::<u8>::new(), 3).is_empty());
    }

    #[test]
    fn table_name() {
        assert_eq!(
            table_name_from_arn("arn:aws:dynamodb:us-east-1:1234:table/progress"),
            "progress"
        );
        assert_eq!(table_name_from_arn("progress"), "progress");
    }
}
