//! Partitions an ordered record set into batches under the bulk size limit.

use serde_json::Value;

use crate::error::AppError;
use crate::salesforce::Record;

/// Batch size presets for Salesforce Bulk API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchSize {
    /// 10 records per batch
    ExtraSmall,
    /// 200 records per batch
    Small,
    /// 2,000 records per batch
    Medium,
    /// 10,000 records per batch
    Large,
    /// Custom record count
    Custom(usize),
}

impl BatchSize {
    pub fn as_usize(self) -> usize {
        match self {
            BatchSize::ExtraSmall => 10,
            BatchSize::Small => 200,
            BatchSize::Medium => 2_000,
            BatchSize::Large => 10_000,
            BatchSize::Custom(n) => n,
        }
    }
}

impl From<BatchSize> for usize {
    fn from(batch_size: BatchSize) -> Self {
        batch_size.as_usize()
    }
}

/// Splits `records` into consecutive batches of at most `max_batch_size`.
///
/// Order is preserved and every record lands in exactly one batch; only the
/// last batch may be shorter. An empty input yields one empty batch.
///
/// # Errors
///
/// `AppError::InvalidArgument` when `max_batch_size` is 0.
pub fn split<T>(records: Vec<T>, max_batch_size: usize) -> Result<Vec<Vec<T>>, AppError> {
    if max_batch_size == 0 {
        return Err(AppError::InvalidArgument(
            "batch size must be at least 1".to_string(),
        ));
    }
    if records.is_empty() {
        return Ok(vec![Vec::new()]);
    }

    let mut batches = Vec::with_capacity(records.len().div_ceil(max_batch_size));
    let mut iter = records.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(max_batch_size).collect());
    }
    Ok(batches)
}

/// Converts a JSON array of objects into records.
///
/// # Errors
///
/// `AppError::InvalidArgument` when `value` is not an array or an element
/// is not an object.
pub fn records_from_value(value: Value) -> Result<Vec<Record>, AppError> {
    let Value::Array(items) = value else {
        return Err(AppError::InvalidArgument(
            "records must be a JSON array".to_string(),
        ));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(i, item)| match item {
            Value::Object(record) => Ok(record),
            _ => Err(AppError::InvalidArgument(format!(
                "record {} is not a JSON object",
                i
            ))),
        })
        .collect()
}

/// [`split`] for an untyped JSON payload.
pub fn split_value(value: Value, max_batch_size: usize) -> Result<Vec<Vec<Record>>, AppError> {
    split(records_from_value(value)?, max_batch_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_concatenation_reproduces_input() {
        for (len, max) in [(1, 1), (7, 3), (9, 3), (10, 4), (25_000, 10_000)] {
            let input: Vec<usize> = (0..len).collect();
            let batches = split(input.clone(), max).unwrap();

            assert!(batches.iter().all(|b| b.len() <= max && !b.is_empty()));
            let (last, rest) = batches.split_last().unwrap();
            assert!(rest.iter().all(|b| b.len() == max));
            assert!(last.len() <= max);
            assert_eq!(batches.concat(), input);
        }
    }

    #[test]
    fn test_exact_multiple_boundaries() {
        let exact = split((0..10_000).collect::<Vec<_>>(), 10_000).unwrap();
        assert_eq!(exact.len(), 1);

        let over = split((0..10_001).collect::<Vec<_>>(), 10_000).unwrap();
        assert_eq!(over.len(), 2);
        assert_eq!(over[1], vec![10_000]);
    }

    #[test]
    fn test_25k_records_make_three_batches() {
        let batches = split((0..25_000).collect::<Vec<_>>(), BatchSize::Large.into()).unwrap();
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10_000, 10_000, 5_000]);
    }

    #[test]
    fn test_empty_input_is_one_empty_batch() {
        let batches = split(Vec::<Record>::new(), 200).unwrap();
        assert_eq!(batches.len(), 1);
        assert!(batches[0].is_empty());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(matches!(
            split(vec![1, 2, 3], 0),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_split_value_rejects_non_array() {
        assert!(matches!(
            split_value(json!({"Name": "Acme"}), 10),
            Err(AppError::InvalidArgument(_))
        ));
        assert!(matches!(
            split_value(json!([{"Name": "Acme"}, 42]), 10),
            Err(AppError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_split_value_keeps_order() {
        let batches = split_value(
            json!([{"n": 1}, {"n": 2}, {"n": 3}]),
            BatchSize::Custom(2).as_usize(),
        )
        .unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][1]["n"], json!(2));
        assert_eq!(batches[1][0]["n"], json!(3));
    }
}
