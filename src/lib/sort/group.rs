//! Grouping of a sorted stream into runs of equal-keyed items.

use crate::errors::Result;

/// Yields contiguous runs of items for which `same_group` holds between each item and the first
/// item of the run.
///
/// Only the current run and one look-ahead item are held in memory. An error from the inner
/// iterator is yielded once and ends the stream.
pub struct GroupBy<I, T, F> {
    inner: I,
    same_group: F,
    pending: Option<T>,
    done: bool,
}

impl<I, T, F> GroupBy<I, T, F>
where
    I: Iterator<Item = Result<T>>,
    F: FnMut(&T, &T) -> bool,
{
    pub fn new(inner: I, same_group: F) -> Self {
        Self { inner, same_group, pending: None, done: false }
    }
}

impl<I, T, F> Iterator for GroupBy<I, T, F>
where
    I: Iterator<Item = Result<T>>,
    F: FnMut(&T, &T) -> bool,
{
    type Item = Result<Vec<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let first = match self.pending.take() {
            Some(item) => item,
            None => match self.inner.next()? {
                Ok(item) => item,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            },
        };

        let mut group = vec![first];
        loop {
            match self.inner.next() {
                Some(Ok(item)) => {
                    if (self.same_group)(&group[0], &item) {
                        group.push(item);
                    } else {
                        self.pending = Some(item);
                        break;
                    }
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        Some(Ok(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MarkDupError;

    fn ok(values: &[u32]) -> impl Iterator<Item = Result<u32>> + '_ {
        values.iter().copied().map(Ok)
    }

    #[test]
    fn test_groups_by_key() {
        let values = [1, 2, 11, 15, 21, 30, 31];
        let groups: Vec<Vec<u32>> =
            GroupBy::new(ok(&values), |a, b| a / 10 == b / 10).map(|g| g.unwrap()).collect();
        assert_eq!(groups, vec![vec![1, 2], vec![11, 15], vec![21], vec![30, 31]]);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(GroupBy::new(ok(&[]), |a: &u32, b: &u32| a == b).count(), 0);
    }

    #[test]
    fn test_error_ends_stream() {
        let items: Vec<Result<u32>> = vec![
            Ok(1),
            Ok(1),
            Err(MarkDupError::InvalidParameter {
                parameter: "x".to_string(),
                reason: "boom".to_string(),
            }),
            Ok(2),
        ];
        let mut groups = GroupBy::new(items.into_iter(), |a, b| a == b);
        assert!(groups.next().unwrap().is_err());
        assert!(groups.next().is_none());
    }
}
