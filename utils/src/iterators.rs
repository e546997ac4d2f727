use std::fmt::Display;

/// Given an iterator that's clonable, split off the first N elements
/// at the pivot point. If the iterator would be empty, return None.
/// Return the count of the remainder.
pub fn iterator_split_nonempty_rest_count<I>(
    it: I,
    max: usize,
) -> Option<(impl Iterator<Item = I::Item>, usize)>
where
    I: Iterator + Clone,
{
    let rest = it.clone();
    let mut it = it.peekable();
    if it.peek().is_some() {
        Some((it.take(max), rest.skip(max).count()))
    } else {
        None
    }
}

/// Render at most `max` elements joined by `sep`, followed by a
/// `(and N more)` suffix when elements were left out. Empty input
/// renders as `-`.
pub fn format_truncated<I>(it: I, max: usize, sep: &str) -> String
where
    I: Iterator + Clone,
    I::Item: Display,
{
    let Some((head, rest)) = iterator_split_nonempty_rest_count(it, max) else {
        return "-".to_string();
    };
    let mut r = head.map(|v| v.to_string()).collect::<Vec<_>>().join(sep);
    if rest > 0 {
        r.push_str(&format!(" (and {rest} more)"));
    }
    r
}
