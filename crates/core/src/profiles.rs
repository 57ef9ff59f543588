//! Profile-edit merging for clones.
//!
//! Edits are evaluated in order against the source profiles:
//! - `-` clears everything accumulated so far
//! - `-<name>` removes `<name>`
//! - `<name>` adds `<name>` (no-op if already present)
//!
//! Order of the result follows first insertion, so the source's ordering is
//! preserved for profiles that survive.

/// Apply `edits` to `source` and return the resulting profile list.
pub fn merge_profiles<S, E>(source: &[S], edits: &[E]) -> Vec<String>
where
    S: AsRef<str>,
    E: AsRef<str>,
{
    let mut merged: Vec<String> = Vec::with_capacity(source.len() + edits.len());
    for name in source {
        add(&mut merged, name.as_ref());
    }

    for edit in edits {
        let edit = edit.as_ref().trim();
        if edit.is_empty() {
            continue;
        }
        if edit == "-" {
            merged.clear();
        } else if let Some(name) = edit.strip_prefix('-') {
            merged.retain(|p| p != name);
        } else {
            add(&mut merged, edit);
        }
    }

    merged
}

fn add(set: &mut Vec<String>, name: &str) {
    if !set.iter().any(|p| p == name) {
        set.push(name.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn clear_then_add() {
        assert_eq!(merge_profiles(&["a", "b"], &["-", "web"]), vec!["web"]);
    }

    #[test]
    fn remove_and_re_add_existing() {
        assert_eq!(
            merge_profiles(&["base", "ssh", "x"], &["-base", "ssh"]),
            vec!["ssh", "x"]
        );
    }

    #[test]
    fn last_write_wins_per_name() {
        assert_eq!(merge_profiles(&["a"], &["b", "-b"]), vec!["a"]);
        assert_eq!(merge_profiles(&["a"], &["-b", "b"]), vec!["a", "b"]);
    }

    #[test]
    fn no_edits_keeps_source() {
        let empty: [&str; 0] = [];
        assert_eq!(merge_profiles(&["default", "net"], &empty), vec!["default", "net"]);
    }

    fn profile_name() -> impl Strategy<Value = String> {
        "[a-z]{1,6}"
    }

    proptest! {
        #[test]
        fn result_has_no_duplicates(
            source in prop::collection::vec(profile_name(), 0..8),
            edits in prop::collection::vec(
                prop_oneof![
                    Just("-".to_string()),
                    profile_name(),
                    profile_name().prop_map(|n| format!("-{n}")),
                ],
                0..12,
            ),
        ) {
            let merged = merge_profiles(&source, &edits);
            let mut sorted = merged.clone();
            sorted.sort();
            sorted.dedup();
            prop_assert_eq!(sorted.len(), merged.len());
        }

        #[test]
        fn clear_discards_everything_before_it(
            source in prop::collection::vec(profile_name(), 0..8),
            before in prop::collection::vec(profile_name(), 0..6),
            after in prop::collection::vec(profile_name(), 0..6),
        ) {
            let mut edits = before.clone();
            edits.push("-".to_string());
            edits.extend(after.iter().cloned());

            let empty: [&str; 0] = [];
            prop_assert_eq!(merge_profiles(&source, &edits), merge_profiles(&empty, &after));
        }

        #[test]
        fn removal_is_final_unless_re_added(
            source in prop::collection::vec(profile_name(), 1..8),
        ) {
            let target = source[0].clone();
            let merged = merge_profiles(&source, &[format!("-{target}")]);
            prop_assert!(!merged.contains(&target));
        }
    }
}
