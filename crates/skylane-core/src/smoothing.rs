/// Greedy line-of-sight shortcutting.
///
/// From each kept vertex, jump to the furthest later vertex whose direct
/// segment passes `is_clear`. Consecutive vertices are kept as-is, so the
/// output never has more vertices than the input and running it twice gives
/// the same result as running it once.
pub fn smooth_path<T, F>(path: &[T], mut is_clear: F) -> Vec<T>
where
    T: Clone,
    F: FnMut(&T, &T) -> bool,
{
    if path.len() <= 2 {
        return path.to_vec();
    }

    let mut smoothed = vec![path[0].clone()];
    let mut current_idx = 0usize;

    while current_idx < path.len() - 1 {
        let current = &path[current_idx];
        let mut furthest_valid = current_idx + 1;

        for target_idx in (current_idx + 2)..path.len() {
            if is_clear(current, &path[target_idx]) {
                furthest_valid = target_idx;
            }
        }

        smoothed.push(path[furthest_valid].clone());
        current_idx = furthest_valid;
    }

    smoothed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::segments_intersect_2d;

    /// Clear unless the segment crosses the wall x = 5, y in [-10, 10].
    fn clear(a: &(f64, f64), b: &(f64, f64)) -> bool {
        !segments_intersect_2d(*a, *b, (5.0, -10.0), (5.0, 10.0))
    }

    fn detour() -> Vec<(f64, f64)> {
        vec![
            (0.0, 0.0),
            (1.0, 5.0),
            (2.0, 10.0),
            (3.0, 11.0),
            (5.0, 11.0),
            (7.0, 11.0),
            (8.0, 10.0),
            (10.0, 0.0),
        ]
    }

    #[test]
    fn drops_redundant_vertices() {
        let path = detour();
        let smoothed = smooth_path(&path, clear);
        assert!(smoothed.len() < path.len());
        assert_eq!(smoothed.first(), path.first());
        assert_eq!(smoothed.last(), path.last());
        for pair in smoothed.windows(2) {
            assert!(clear(&pair[0], &pair[1]));
        }
    }

    #[test]
    fn smoothing_is_idempotent() {
        let once = smooth_path(&detour(), clear);
        let twice = smooth_path(&once, clear);
        assert_eq!(once, twice);
    }

    #[test]
    fn unobstructed_path_collapses_to_endpoints() {
        let path = vec![(0.0, 0.0), (1.0, 1.0), (2.0, 0.0), (3.0, 1.0)];
        let smoothed = smooth_path(&path, |_, _| true);
        assert_eq!(smoothed, vec![(0.0, 0.0), (3.0, 1.0)]);
    }

    #[test]
    fn short_paths_pass_through() {
        let path = vec![(0.0, 0.0), (1.0, 1.0)];
        assert_eq!(smooth_path(&path, |_, _| false), path);
    }
}
