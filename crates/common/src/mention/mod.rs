// Mention markup parsing (`@[target]` and `@[target|label]`).
//
// Mentions point at a collaborator or another entity by id. They are
// extracted from text fields on every local write and stored as
// `mention` references so that dependents can be found without
// materializing every document.

/// A parsed mention from a text field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    /// Id of the mentioned collaborator or entity.
    pub target: String,
    /// Optional display label after `|`.
    pub label: Option<String>,
    /// Byte offset of the leading `@`.
    pub start_offset: usize,
    /// Byte offset just after the closing `]`.
    pub end_offset: usize,
}

/// Parse every `@[...]` mention in `text`, in document order.
pub fn parse_mentions(text: &str) -> Vec<Mention> {
    let mut mentions = Vec::new();
    let mut rest = 0usize;

    while let Some(found) = text[rest..].find("@[") {
        let start = rest + found;
        let inner_start = start + 2;
        let Some(close) = text[inner_start..].find(']') else {
            break;
        };
        let inner_end = inner_start + close;
        if let Some(mention) = parse_inner(&text[inner_start..inner_end], start, inner_end + 1) {
            mentions.push(mention);
        }
        rest = inner_end + 1;
    }

    mentions
}

/// Unique mention targets in first-seen order.
pub fn mention_targets(text: &str) -> Vec<String> {
    let mut targets: Vec<String> = Vec::new();
    for mention in parse_mentions(text) {
        if !targets.contains(&mention.target) {
            targets.push(mention.target);
        }
    }
    targets
}

fn parse_inner(inner: &str, start_offset: usize, end_offset: usize) -> Option<Mention> {
    let (target, label) = match inner.split_once('|') {
        Some((target, label)) => (target.trim(), Some(label.trim())),
        None => (inner.trim(), None),
    };

    if target.is_empty() || target.contains(char::is_whitespace) {
        return None;
    }

    Some(Mention {
        target: target.to_string(),
        label: label.filter(|value| !value.is_empty()).map(str::to_string),
        start_offset,
        end_offset,
    })
}

#[cfg(test)]
mod tests {
    use super::{mention_targets, parse_mentions};

    #[test]
    fn parses_plain_mention() {
        let mentions = parse_mentions("ping @[user-7] please");
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].target, "user-7");
        assert_eq!(mentions[0].label, None);
    }

    #[test]
    fn parses_label() {
        let mentions = parse_mentions("@[user-7|Ada Lovelace] wrote this");
        assert_eq!(mentions[0].target, "user-7");
        assert_eq!(mentions[0].label.as_deref(), Some("Ada Lovelace"));
    }

    #[test]
    fn ignores_malformed_mentions() {
        assert!(parse_mentions("@[] @[ |x] @[two words] @[open").is_empty());
        assert!(parse_mentions("email me @ home [soon]").is_empty());
    }

    #[test]
    fn preserves_source_offsets() {
        let text = "a @[u1] b @[u2|Two]";
        let mentions = parse_mentions(text);
        assert_eq!(&text[mentions[0].start_offset..mentions[0].end_offset], "@[u1]");
        assert_eq!(&text[mentions[1].start_offset..mentions[1].end_offset], "@[u2|Two]");
    }

    #[test]
    fn targets_are_deduplicated_in_order() {
        assert_eq!(mention_targets("@[b] @[a] @[b|again]"), vec!["b".to_string(), "a".to_string()]);
    }
}
