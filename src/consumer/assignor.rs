use std::collections::HashMap;

use crate::PartitionId;

/// Distributes a topic's partitions over the members of a consumer group.
///
/// Partitions and member ids are laid out in sorted order and every member
/// takes a contiguous slice; the first `n mod m` members take one extra
/// partition when the division is uneven. The function is pure, so every
/// member of the group computes the identical mapping from the same inputs.
/// Members left without partitions are absent from the result.
pub fn resolve_assignments(
    partitions: &[PartitionId],
    member_ids: &[String],
) -> HashMap<String, Vec<PartitionId>> {
    let mut assignments = HashMap::new();
    if partitions.is_empty() || member_ids.is_empty() {
        return assignments;
    }

    let mut partitions = partitions.to_vec();
    partitions.sort_unstable();
    let mut members = member_ids.to_vec();
    members.sort_unstable();

    let base = partitions.len() / members.len();
    let extra = partitions.len() % members.len();

    let mut start = 0;
    for (i, member) in members.iter().enumerate() {
        let size = base + usize::from(i < extra);
        if size == 0 {
            break;
        }
        assignments.insert(member.clone(), partitions[start..start + size].to_vec());
        start += size;
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    fn sorted_keys(assignments: &HashMap<String, Vec<PartitionId>>) -> Vec<String> {
        let mut keys: Vec<String> = assignments.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[test]
    fn empty_inputs_produce_empty_mapping() {
        assert!(resolve_assignments(&[], &[]).is_empty());
        assert!(resolve_assignments(&[], &members(&["a"])).is_empty());
        assert!(resolve_assignments(&[], &members(&["a", "b"])).is_empty());
        assert!(resolve_assignments(&[1], &[]).is_empty());
    }

    #[test]
    fn single_member_takes_everything() {
        let assignments = resolve_assignments(&[0], &members(&["a"]));
        assert_eq!(assignments["a"], vec![0]);

        let assignments = resolve_assignments(&[1, 2, 0], &members(&["a"]));
        assert_eq!(assignments["a"], vec![0, 1, 2]);
    }

    #[test]
    fn surplus_members_get_nothing() {
        let assignments = resolve_assignments(&[0], &members(&["b", "a"]));
        assert_eq!(sorted_keys(&assignments), members(&["a"]));
        assert_eq!(assignments["a"], vec![0]);
    }

    #[test]
    fn contiguous_slices_over_sorted_inputs() {
        let assignments = resolve_assignments(&[0, 3, 1, 2], &members(&["b", "a"]));
        assert_eq!(assignments["a"], vec![0, 1]);
        assert_eq!(assignments["b"], vec![2, 3]);

        let assignments = resolve_assignments(&[0, 3, 1, 2], &members(&["b", "c", "a"]));
        assert_eq!(assignments["a"], vec![0, 1]);
        assert_eq!(assignments["b"], vec![2]);
        assert_eq!(assignments["c"], vec![3]);

        let assignments = resolve_assignments(&[0, 3, 1, 2, 4], &members(&["b", "c", "a"]));
        assert_eq!(assignments["a"], vec![0, 1]);
        assert_eq!(assignments["b"], vec![2, 3]);
        assert_eq!(assignments["c"], vec![4]);

        let assignments = resolve_assignments(&[0, 3, 1, 2, 5, 4], &members(&["b", "c", "a"]));
        assert_eq!(assignments["a"], vec![0, 1]);
        assert_eq!(assignments["b"], vec![2, 3]);
        assert_eq!(assignments["c"], vec![4, 5]);

        let assignments = resolve_assignments(&[6, 0, 3, 1, 2, 5, 4], &members(&["b", "c", "a"]));
        assert_eq!(assignments["a"], vec![0, 1, 2]);
        assert_eq!(assignments["b"], vec![3, 4]);
        assert_eq!(assignments["c"], vec![5, 6]);

        let assignments =
            resolve_assignments(&[6, 0, 3, 1, 2, 5, 4], &members(&["d", "b", "c", "a"]));
        assert_eq!(assignments["a"], vec![0, 1]);
        assert_eq!(assignments["b"], vec![2, 3]);
        assert_eq!(assignments["c"], vec![4, 5]);
        assert_eq!(assignments["d"], vec![6]);
    }

    #[test]
    fn slices_form_a_disjoint_cover_with_balanced_sizes() {
        for n in 1..12 {
            for m in 1..6 {
                let partitions: Vec<PartitionId> = (0..n).collect();
                let ids: Vec<String> = (0..m).map(|i| format!("member-{i}")).collect();
                let assignments = resolve_assignments(&partitions, &ids);

                let mut all: Vec<PartitionId> =
                    assignments.values().flatten().copied().collect();
                all.sort_unstable();
                assert_eq!(all, partitions, "cover broken for n={n} m={m}");

                let sizes: Vec<usize> = assignments.values().map(|v| v.len()).collect();
                let min = sizes.iter().min().unwrap();
                let max = sizes.iter().max().unwrap();
                assert!(max - min <= 1, "unbalanced for n={n} m={m}: {sizes:?}");

                // identical inputs resolve identically for every member
                assert_eq!(assignments, resolve_assignments(&partitions, &ids));
            }
        }
    }
}
