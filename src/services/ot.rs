use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single positional edit. Positions and lengths are byte offsets into the
/// tab content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Insert { position: usize, text: String },
    Delete { position: usize, length: usize },
}

impl Operation {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        Operation::Insert { position, text: text.into() }
    }

    pub fn delete(position: usize, length: usize) -> Self {
        Operation::Delete { position, length }
    }

    pub fn position(&self) -> usize {
        match self {
            Operation::Insert { position, .. } | Operation::Delete { position, .. } => *position,
        }
    }

    fn with_position(self, position: usize) -> Self {
        match self {
            Operation::Insert { text, .. } => Operation::Insert { position, text },
            Operation::Delete { length, .. } => Operation::Delete { position, length },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpError {
    #[error("invalid position {position} for insert into content of length {len}")]
    InsertOutOfRange { position: usize, len: usize },
    #[error("invalid range {position}+{length} for delete from content of length {len}")]
    DeleteOutOfRange { position: usize, length: usize, len: usize },
    #[error("offset {0} does not fall on a character boundary")]
    NotCharBoundary(usize),
}

/// Apply `op` to `content` and return the edited text.
pub fn apply(content: &str, op: &Operation) -> Result<String, OpError> {
    match op {
        Operation::Insert { position, text } => {
            let position = *position;
            if position > content.len() {
                return Err(OpError::InsertOutOfRange { position, len: content.len() });
            }
            if !content.is_char_boundary(position) {
                return Err(OpError::NotCharBoundary(position));
            }
            let mut out = String::with_capacity(content.len() + text.len());
            out.push_str(&content[..position]);
            out.push_str(text);
            out.push_str(&content[position..]);
            Ok(out)
        }
        Operation::Delete { position, length } => {
            let (position, length) = (*position, *length);
            let end = match position.checked_add(length) {
                Some(end) if end <= content.len() => end,
                _ => {
                    return Err(OpError::DeleteOutOfRange { position, length, len: content.len() });
                }
            };
            for offset in [position, end] {
                if !content.is_char_boundary(offset) {
                    return Err(OpError::NotCharBoundary(offset));
                }
            }
            let mut out = String::with_capacity(content.len() - length);
            out.push_str(&content[..position]);
            out.push_str(&content[end..]);
            Ok(out)
        }
    }
}

/// Transform two concurrently issued operations against each other.
///
/// Returns `(a', b')` such that applying `a` then `b'` yields the same text as
/// applying `b` then `a'`, for the pairwise cases this supports. The pair is
/// ordered by position; at equal positions an insert goes before a delete and
/// otherwise `a` keeps precedence. Only two operations are handled, there is
/// no composition over a longer history.
pub fn transform(a: &Operation, b: &Operation) -> (Operation, Operation) {
    if goes_first(a, b) {
        transform_ordered(a, b)
    } else {
        let (b_prime, a_prime) = transform_ordered(b, a);
        (a_prime, b_prime)
    }
}

fn goes_first(a: &Operation, b: &Operation) -> bool {
    match a.position().cmp(&b.position()) {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => {
            !matches!((a, b), (Operation::Delete { .. }, Operation::Insert { .. }))
        }
    }
}

// `first` sits at or before `second`.
fn transform_ordered(first: &Operation, second: &Operation) -> (Operation, Operation) {
    match (first, second) {
        (Operation::Insert { text, .. }, _) => {
            let shifted = second.position() + text.len();
            (first.clone(), second.clone().with_position(shifted))
        }
        (Operation::Delete { position: del_pos, length: del_len }, Operation::Insert { position: ins_pos, .. }) => {
            let del_end = del_pos + del_len;
            let moved = if *ins_pos >= del_end {
                ins_pos - del_len
            } else {
                // insert fell inside the deleted range
                *del_pos
            };
            (first.clone(), second.clone().with_position(moved))
        }
        (
            Operation::Delete { position: p1, length: l1 },
            Operation::Delete { position: p2, length: l2 },
        ) => {
            let end1 = p1 + l1;
            let overlap = end1.saturating_sub(*p2).min(*l2);
            let second_pos = if *p2 >= end1 { p2 - l1 } else { *p1 };
            (
                Operation::delete(*p1, l1 - overlap),
                Operation::delete(second_pos, l2 - overlap),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converge(content: &str, a: &Operation, b: &Operation) -> (String, String) {
        let (a_prime, b_prime) = transform(a, b);
        let left = apply(&apply(content, a).unwrap(), &b_prime).unwrap();
        let right = apply(&apply(content, b).unwrap(), &a_prime).unwrap();
        (left, right)
    }

    #[test]
    fn apply_insert_and_delete() {
        assert_eq!(apply("abcdef", &Operation::insert(2, "XY")).unwrap(), "abXYcdef");
        assert_eq!(apply("abcdef", &Operation::insert(6, "!")).unwrap(), "abcdef!");
        assert_eq!(apply("abcdef", &Operation::delete(4, 2)).unwrap(), "abcd");
        assert_eq!(apply("", &Operation::insert(0, "hi")).unwrap(), "hi");
    }

    #[test]
    fn apply_rejects_out_of_range() {
        assert_eq!(
            apply("abc", &Operation::insert(4, "x")),
            Err(OpError::InsertOutOfRange { position: 4, len: 3 })
        );
        assert_eq!(
            apply("abc", &Operation::delete(2, 2)),
            Err(OpError::DeleteOutOfRange { position: 2, length: 2, len: 3 })
        );
        assert!(apply("abc", &Operation::delete(usize::MAX, 2)).is_err());
    }

    #[test]
    fn apply_rejects_split_characters() {
        // "é" is two bytes
        assert_eq!(apply("é", &Operation::insert(1, "x")), Err(OpError::NotCharBoundary(1)));
        assert_eq!(apply("éa", &Operation::delete(0, 1)), Err(OpError::NotCharBoundary(1)));
    }

    #[test]
    fn insert_then_later_delete_converges() {
        let a = Operation::insert(2, "XY");
        let b = Operation::delete(4, 2);
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime, a);
        assert_eq!(b_prime, Operation::delete(6, 2));

        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, "abXYcd");
        assert_eq!(left, right);
    }

    #[test]
    fn argument_order_is_preserved() {
        let a = Operation::delete(4, 2);
        let b = Operation::insert(2, "XY");
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime, Operation::delete(6, 2));
        assert_eq!(b_prime, b);
    }

    #[test]
    fn inserts_at_same_position_keep_first_argument_first() {
        let a = Operation::insert(1, "A");
        let b = Operation::insert(1, "B");
        let (left, right) = converge("xy", &a, &b);
        assert_eq!(left, "xABy");
        assert_eq!(left, right);
    }

    #[test]
    fn insert_beats_delete_at_same_position() {
        let a = Operation::delete(1, 2);
        let b = Operation::insert(1, "Z");
        let (left, right) = converge("abcd", &a, &b);
        assert_eq!(left, "aZd");
        assert_eq!(left, right);
    }

    #[test]
    fn delete_before_insert_shifts_or_clamps() {
        let del = Operation::delete(0, 2);
        let (_, after) = transform(&del, &Operation::insert(4, "X"));
        assert_eq!(after, Operation::insert(2, "X"));

        let (_, inside) = transform(&Operation::delete(1, 3), &Operation::insert(2, "X"));
        assert_eq!(inside, Operation::insert(1, "X"));

        let (left, right) = converge("abcdef", &del, &Operation::insert(4, "X"));
        assert_eq!(left, "cdXef");
        assert_eq!(left, right);
    }

    #[test]
    fn overlapping_deletes_shrink() {
        let a = Operation::delete(1, 3);
        let b = Operation::delete(2, 3);
        let (a_prime, b_prime) = transform(&a, &b);
        assert_eq!(a_prime, Operation::delete(1, 1));
        assert_eq!(b_prime, Operation::delete(1, 1));

        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, "af");
        assert_eq!(left, right);
    }

    #[test]
    fn contained_delete_floors_at_zero() {
        let outer = Operation::delete(1, 4);
        let inner = Operation::delete(2, 1);
        let (_, inner_prime) = transform(&outer, &inner);
        assert_eq!(inner_prime, Operation::delete(1, 0));

        let (left, right) = converge("abcdef", &outer, &inner);
        assert_eq!(left, "af");
        assert_eq!(left, right);
    }

    #[test]
    fn operation_wire_format() {
        let op: Operation = serde_json::from_str(r#"{"type":"insert","position":3,"text":"hi"}"#).unwrap();
        assert_eq!(op, Operation::insert(3, "hi"));
        let json = serde_json::to_value(Operation::delete(1, 2)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "delete", "position": 1, "length": 2}));
    }
}
