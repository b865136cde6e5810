//! Sets of 32-bit integers stored as sorted, disjoint, non-adjacent intervals.

use std::fmt;

/// Sets at most this large are multiplied value by value instead of by interval hull.
const EXACT_MUL_LIMIT: u64 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ValueSet {
    /// Inclusive bounds, sorted, never overlapping or touching
    intervals: Vec<(i32, i32)>,
}

/// Result of asking an analyzer for the concrete values of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every possible value, ascending
    Values(Vec<i32>),
    /// More values than the caller is willing to track
    Inconclusive,
}

impl ValueSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self::interval(i32::MIN, i32::MAX)
    }

    pub fn of(value: i32) -> Self {
        Self::interval(value, value)
    }

    /// Inclusive interval; the bounds are swapped if given in the wrong order.
    pub fn interval(start: i32, end: i32) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Self {
            intervals: vec![(start, end)],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn is_all(&self) -> bool {
        self.intervals == [(i32::MIN, i32::MAX)]
    }

    pub fn size(&self) -> u64 {
        self.intervals
            .iter()
            .map(|&(s, e)| (e as i64 - s as i64 + 1) as u64)
            .sum()
    }

    pub fn min(&self) -> Option<i32> {
        self.intervals.first().map(|&(s, _)| s)
    }

    pub fn max(&self) -> Option<i32> {
        self.intervals.last().map(|&(_, e)| e)
    }

    pub fn contains(&self, value: i32) -> bool {
        self.intervals.iter().any(|&(s, e)| s <= value && value <= e)
    }

    pub fn iter(&self) -> impl Iterator<Item = i32> + '_ {
        self.intervals.iter().flat_map(|&(s, e)| s..=e)
    }

    pub fn union(mut self, other: &ValueSet) -> Self {
        self.intervals.extend_from_slice(&other.intervals);
        self.normalize();
        self
    }

    /// Adds `scalar` to every value, wrapping around like the VM does.
    pub fn add(self, scalar: i32) -> Self {
        let mut intervals = Vec::with_capacity(self.intervals.len() + 1);

        for (s, e) in self.intervals {
            let start = s as i64 + scalar as i64;
            let end = e as i64 + scalar as i64;

            for (a, b) in wrap_interval(start, end) {
                intervals.push((a, b));
            }
        }

        let mut set = Self { intervals };
        set.normalize();
        set
    }

    pub fn sub(self, scalar: i32) -> Self {
        // i32::MIN has no positive counterpart, but adding it is the same modulo 2^32
        self.add(scalar.wrapping_neg())
    }

    /// Multiplies every value by `scalar`, wrapping around like the VM does.
    pub fn mul(self, scalar: i32) -> Self {
        const SPAN: i64 = 1 << 32;

        if self.is_empty() {
            return self;
        }

        if self.size() <= EXACT_MUL_LIMIT {
            return self.iter().map(|v| v.wrapping_mul(scalar)).collect();
        }

        let mut intervals = Vec::with_capacity(self.intervals.len() + 1);

        for &(s, e) in &self.intervals {
            let a = s as i64 * scalar as i64;
            let b = e as i64 * scalar as i64;
            let (start, end) = (a.min(b), a.max(b));

            // The products wrap onto every i32
            if end - start >= SPAN {
                return Self::all();
            }

            intervals.extend(wrap_interval(start, end));
        }

        let mut set = Self { intervals };
        set.normalize();
        set
    }

    /// Divides every value by `scalar`, truncating. Division by zero yields every value.
    pub fn div(self, scalar: i32) -> Self {
        if scalar == 0 {
            return Self::all();
        }

        let mut set = Self {
            intervals: self
                .intervals
                .iter()
                .map(|&(s, e)| {
                    let a = clamp(s as i64 / scalar as i64);
                    let b = clamp(e as i64 / scalar as i64);
                    (a.min(b), a.max(b))
                })
                .collect(),
        };
        set.normalize();
        set
    }

    /// All values if there are at most `bound` of them.
    pub fn resolve(&self, bound: usize) -> Resolution {
        if self.size() <= bound as u64 {
            Resolution::Values(self.iter().collect())
        } else {
            Resolution::Inconclusive
        }
    }

    fn normalize(&mut self) {
        self.intervals.sort_unstable();

        let mut merged: Vec<(i32, i32)> = Vec::with_capacity(self.intervals.len());
        for &(s, e) in &self.intervals {
            match merged.last_mut() {
                Some(last) if s as i64 <= last.1 as i64 + 1 => last.1 = last.1.max(e),
                _ => merged.push((s, e)),
            }
        }

        self.intervals = merged;
    }
}

fn clamp(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Maps an interval in i64 space back onto i32 with two's complement wrapping.
fn wrap_interval(start: i64, end: i64) -> Vec<(i32, i32)> {
    const SPAN: i64 = 1 << 32;
    let min = i32::MIN as i64;
    let max = i32::MAX as i64;

    if start > max {
        vec![((start - SPAN) as i32, (end - SPAN) as i32)]
    } else if end < min {
        vec![((start + SPAN) as i32, (end + SPAN) as i32)]
    } else if end > max {
        vec![(start as i32, i32::MAX), (i32::MIN, (end - SPAN) as i32)]
    } else if start < min {
        vec![((start + SPAN) as i32, i32::MAX), (i32::MIN, end as i32)]
    } else {
        vec![(start as i32, end as i32)]
    }
}

impl FromIterator<i32> for ValueSet {
    fn from_iter<I: IntoIterator<Item = i32>>(iter: I) -> Self {
        let mut set = Self {
            intervals: iter.into_iter().map(|v| (v, v)).collect(),
        };
        set.normalize();
        set
    }
}

impl fmt::Display for ValueSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, &(s, e)) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if s == e {
                write!(f, "{}", s)?;
            } else {
                write!(f, "{}..={}", s, e)?;
            }
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_basic_queries() {
        let set = ValueSet::interval(3, 7);
        assert_eq!(set.size(), 5);
        assert_eq!(set.min(), Some(3));
        assert_eq!(set.max(), Some(7));
        assert!(set.contains(5));
        assert!(!set.contains(8));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 4, 5, 6, 7]);

        assert!(ValueSet::empty().is_empty());
        assert_eq!(ValueSet::all().size(), 1u64 << 32);
        assert!(ValueSet::all().is_all());
    }

    #[test]
    fn test_union_merges_adjacent_and_overlapping() {
        let set = ValueSet::of(1)
            .union(&ValueSet::interval(3, 4))
            .union(&ValueSet::of(2))
            .union(&ValueSet::interval(10, 12))
            .union(&ValueSet::interval(11, 20));

        assert_eq!(set.to_string(), "{1..=4, 10..=20}");
        assert_eq!(set.size(), 15);
    }

    #[test]
    fn test_union_with_empty() {
        let set = ValueSet::empty().union(&ValueSet::of(9));
        assert_eq!(set, ValueSet::of(9));
        let set = set.union(&ValueSet::empty());
        assert_eq!(set, ValueSet::of(9));
    }

    #[rstest]
    #[case(ValueSet::interval(1, 3), 10, ValueSet::interval(11, 13))]
    #[case(ValueSet::interval(1, 3), -2, ValueSet::interval(-1, 1))]
    #[case(ValueSet::of(i32::MAX), 1, ValueSet::of(i32::MIN))]
    #[case(ValueSet::of(i32::MIN), -1, ValueSet::of(i32::MAX))]
    fn test_add(#[case] set: ValueSet, #[case] scalar: i32, #[case] expected: ValueSet) {
        assert_eq!(set.add(scalar), expected);
    }

    #[test]
    fn test_add_splits_on_overflow() {
        let set = ValueSet::interval(i32::MAX - 1, i32::MAX).add(1);
        assert_eq!(set.size(), 2);
        assert!(set.contains(i32::MAX));
        assert!(set.contains(i32::MIN));
        assert_eq!(set.min(), Some(i32::MIN));
    }

    #[test]
    fn test_sub() {
        assert_eq!(ValueSet::of(5).sub(7), ValueSet::of(-2));
        assert_eq!(ValueSet::of(0).sub(i32::MIN), ValueSet::of(i32::MIN));
    }

    #[test]
    fn test_mul_small_set_is_exact() {
        let set = ValueSet::interval(1, 3).mul(4);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![4, 8, 12]);

        let set = ValueSet::interval(1, 2).mul(-1);
        assert_eq!(set, ValueSet::interval(-2, -1));
    }

    #[test]
    fn test_mul_wraps() {
        assert_eq!(ValueSet::of(i32::MAX).mul(2), ValueSet::of(-2));
        assert_eq!(ValueSet::of(i32::MIN).mul(-1), ValueSet::of(i32::MIN));

        // 1001 values, past the exact limit, products stay within 2^32 of each other
        let set = ValueSet::interval(0, 1000).mul(1 << 22);
        assert!(set.contains(0));
        assert!(set.contains(i32::MAX));
        assert!(set.contains((600i32).wrapping_mul(1 << 22)));
        assert!(!set.contains(-1));
    }

    #[test]
    fn test_mul_large_set_widens() {
        assert!(ValueSet::all().mul(2).is_all());
        assert!(ValueSet::interval(0, 1000).mul(1 << 23).is_all());
    }

    #[test]
    fn test_div() {
        assert_eq!(ValueSet::interval(10, 20).div(10), ValueSet::interval(1, 2));
        assert_eq!(ValueSet::interval(10, 20).div(-10), ValueSet::interval(-2, -1));
        assert!(ValueSet::of(3).div(0).is_all());
        assert_eq!(ValueSet::of(i32::MIN).div(-1), ValueSet::of(i32::MAX));
    }

    #[test]
    fn test_resolve() {
        let set: ValueSet = [5, 1, 3].into_iter().collect();
        assert_eq!(set.resolve(3), Resolution::Values(vec![1, 3, 5]));
        assert_eq!(set.resolve(2), Resolution::Inconclusive);
        assert_eq!(ValueSet::all().resolve(20), Resolution::Inconclusive);
        assert_eq!(ValueSet::empty().resolve(0), Resolution::Values(vec![]));
    }
}
