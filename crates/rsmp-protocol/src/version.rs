// Core version ordering and negotiation.

use std::cmp::Ordering;

use crate::error::ProtocolError;

/// Core versions this implementation speaks, oldest first.
pub const SUPPORTED_CORE_VERSIONS: &[&str] = &[
    "3.1.1", "3.1.2", "3.1.3", "3.1.4", "3.1.5", "3.2", "3.2.1", "3.2.2",
];

/// Compare two dotted version strings numerically, component by component.
///
/// Missing components count as zero (`3.2 == 3.2.0`). A component that is not
/// a number sorts before any numeric one and is otherwise compared as text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (l, r) => {
                let ord = compare_component(l.unwrap_or("0"), r.unwrap_or("0"));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn compare_component(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Greater,
        (Err(_), Ok(_)) => Ordering::Less,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Pick the highest version present in both lists.
pub fn negotiate(requested: &[String], supported: &[String]) -> Result<String, ProtocolError> {
    requested
        .iter()
        .filter(|v| supported.iter().any(|s| s == *v))
        .max_by(|a, b| compare_versions(a, b))
        .cloned()
        .ok_or_else(|| ProtocolError::UnsupportedVersion {
            requested: requested.to_vec(),
            supported: supported.to_vec(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        assert_eq!(compare_versions("3.1.10", "3.1.9"), Ordering::Greater);
        assert_eq!(compare_versions("3.2", "3.1.5"), Ordering::Greater);
        assert_eq!(compare_versions("3.2", "3.2.0"), Ordering::Equal);
        assert_eq!(compare_versions("3.1", "3.1.1"), Ordering::Less);
    }

    #[test]
    fn negotiate_takes_highest_common_version() {
        let requested = strings(&["3.1.3", "3.1.4", "3.2"]);
        let supported = strings(&["3.1.4", "3.1.5", "3.2", "3.2.1"]);
        assert_eq!(negotiate(&requested, &supported).unwrap(), "3.2");
    }

    #[test]
    fn negotiate_fails_without_overlap() {
        let err = negotiate(&strings(&["2.0"]), &strings(&["3.1.5"])).unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedVersion { .. }));
    }

    #[test]
    fn supported_list_is_sorted() {
        for pair in SUPPORTED_CORE_VERSIONS.windows(2) {
            assert_eq!(compare_versions(pair[0], pair[1]), Ordering::Less);
        }
    }
}
