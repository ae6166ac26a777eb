//! Turning a tag array into member lists.

use std::collections::BTreeMap;

/// Members of one tagged group.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// The tag shared by all members
    pub tag: i64,
    /// Member rows, ascending
    pub members: Vec<usize>,
    /// Representative row: the densest member when densities are given,
    /// otherwise the member with the smallest key
    pub peak: usize,
}

/// Collect groups in ascending tag order; tag `-1` is noise and is skipped.
///
/// Density ties resolve to the smaller key.
pub fn group_particles(tags: &[i64], density: Option<&[f64]>, keys: &[i64]) -> Vec<Group> {
    let mut by_tag: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, &t) in tags.iter().enumerate() {
        if t >= 0 {
            by_tag.entry(t).or_default().push(i);
        }
    }

    by_tag
        .into_iter()
        .map(|(tag, members)| {
            let mut peak = members[0];
            for &i in &members[1..] {
                let better = match density {
                    Some(d) => d[i] > d[peak] || (d[i] == d[peak] && keys[i] < keys[peak]),
                    None => keys[i] < keys[peak],
                };
                if better {
                    peak = i;
                }
            }
            Group { tag, members, peak }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_sorted_by_tag_without_noise() {
        let tags = [1, -1, 0, 1, 0];
        let density = [5.0, 9.0, 1.0, 7.0, 3.0];
        let keys = [10, 11, 12, 13, 14];
        let groups = group_particles(&tags, Some(&density), &keys);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members, vec![2, 4]);
        assert_eq!(groups[0].peak, 4);
        assert_eq!(groups[1].members, vec![0, 3]);
        assert_eq!(groups[1].peak, 3);
    }

    #[test]
    fn without_density_peak_is_smallest_key() {
        let groups = group_particles(&[0, 0, 0], None, &[7, 3, 5]);
        assert_eq!(groups[0].peak, 1);
    }
}
