use std::collections::BTreeSet;

/// Filters starting with one of these prefixes crash some host parsers.
const UNSUPPORTED_PREFIXES: [&str; 4] = ["|$", "||$", "@@|$", "@@||$"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptimizeStats {
    pub before: usize,
    pub after: usize,
    pub deduped: usize,
    pub unsupported: usize,
}

pub fn is_unsupported(filter: &str) -> bool {
    UNSUPPORTED_PREFIXES.iter().any(|prefix| filter.starts_with(prefix))
}

/// Drop unsupported and duplicate filters, leaving the rest sorted.
pub fn optimize_filters(filters: &mut Vec<String>) -> OptimizeStats {
    let before = filters.len();

    let mut unsupported = 0usize;
    filters.retain(|filter| {
        if is_unsupported(filter) {
            unsupported += 1;
            false
        } else {
            true
        }
    });

    let supported = filters.len();
    let unique: BTreeSet<String> = filters.drain(..).collect();
    filters.extend(unique);

    let after = filters.len();

    OptimizeStats {
        before,
        after,
        deduped: supported - after,
        unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(filters: &[&str]) -> Vec<String> {
        filters.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_unsupported_prefixes() {
        assert!(is_unsupported("|$script"));
        assert!(is_unsupported("||$image,third-party"));
        assert!(is_unsupported("@@|$document"));
        assert!(is_unsupported("@@||$popup"));
        assert!(!is_unsupported("||ads.example^$script"));
        assert!(!is_unsupported("@@||shop.example^$document"));
        assert!(!is_unsupported("|https://ads.example/"));
    }

    #[test]
    fn test_cross_list_dedup() {
        let mut filters = owned(&["ads.example^", "##.banner", "ads.example^"]);
        let stats = optimize_filters(&mut filters);
        assert_eq!(filters, owned(&["##.banner", "ads.example^"]));
        assert_eq!(stats.deduped, 1);
        assert_eq!(stats.after, 2);
    }

    #[test]
    fn test_drops_unsupported() {
        let mut filters = owned(&["||$script", "||ads.example^", "@@||$document"]);
        let stats = optimize_filters(&mut filters);
        assert_eq!(filters, owned(&["||ads.example^"]));
        assert_eq!(
            stats,
            OptimizeStats {
                before: 3,
                after: 1,
                deduped: 0,
                unsupported: 2,
            }
        );
    }

    #[test]
    fn test_empty() {
        let mut filters = Vec::new();
        assert_eq!(optimize_filters(&mut filters), OptimizeStats::default());
    }
}
