//! Key orderings used by the tree.

use std::cmp::Ordering;

/// Three-way comparison over keys. Must be a total order.
pub trait KeyComparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// The key type's own `Ord`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaturalOrder;

impl<K: Ord> KeyComparator<K> for NaturalOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}

/// The key type's `Ord`, reversed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseOrder;

impl<K: Ord> KeyComparator<K> for ReverseOrder {
    fn compare(&self, a: &K, b: &K) -> Ordering {
        b.cmp(a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders() {
        assert_eq!(NaturalOrder.compare(&1, &2), Ordering::Less);
        assert_eq!(ReverseOrder.compare(&1, &2), Ordering::Greater);
        assert_eq!(ReverseOrder.compare(&"a", &"a"), Ordering::Equal);
    }
}
