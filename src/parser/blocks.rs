use std::sync::LazyLock;

use regex::Regex;

static HEADING_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.+)$").unwrap());
static INLINE_LINKS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\(([^)]+)\)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Heading { level: u8, text: String },
    Link { text: String, url: String },
    Text(String),
    Empty,
}

/// Classify every line of `markdown` into blocks, preserving document order.
///
/// A heading line can also carry inline links; the heading block comes first,
/// followed by its links left to right.
pub fn classify_lines(markdown: &str) -> Vec<Block> {
    let mut blocks = Vec::new();

    for line in markdown.lines() {
        if line.trim().is_empty() {
            blocks.push(Block::Empty);
            continue;
        }

        let mut matched = false;

        // ── Heading: ## text (matched against the raw line start) ──
        if let Some(heading) = match_heading(line) {
            blocks.push(heading);
            matched = true;
        }

        // ── Inline links: [text](url), any number per line ──
        if line.contains("](") {
            for caps in INLINE_LINKS_RE.captures_iter(line) {
                blocks.push(Block::Link {
                    text: caps[1].to_string(),
                    url: caps[2].to_string(),
                });
                matched = true;
            }
        }

        if !matched {
            blocks.push(Block::Text(line.to_string()));
        }
    }

    blocks
}

fn match_heading(line: &str) -> Option<Block> {
    let caps = HEADING_RE.captures(line)?;
    let text = caps[2].trim();
    if text.is_empty() {
        return None;
    }
    Some(Block::Heading {
        level: caps[1].len() as u8,
        text: text.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heading() {
        let blocks = classify_lines("### Some heading text");
        assert!(matches!(&blocks[0], Block::Heading { level: 3, text } if text == "Some heading text"));
    }

    #[test]
    fn heading_text_is_trimmed() {
        let blocks = classify_lines("##   Spaced out   ");
        assert!(matches!(&blocks[0], Block::Heading { level: 2, text } if text == "Spaced out"));
    }

    #[test]
    fn seven_hashes_is_text() {
        let blocks = classify_lines("####### too deep");
        assert_eq!(blocks, vec![Block::Text("####### too deep".into())]);
    }

    #[test]
    fn hashes_without_content_is_text() {
        assert!(matches!(&classify_lines("#")[0], Block::Text(_)));
        assert!(matches!(&classify_lines("##   ")[0], Block::Text(_)));
        assert!(matches!(&classify_lines("##  \t x")[0], Block::Heading { level: 2, text } if text == "x"));
    }

    #[test]
    fn hash_without_space_is_text() {
        let blocks = classify_lines("#hashtag");
        assert!(matches!(&blocks[0], Block::Text(t) if t == "#hashtag"));
    }

    #[test]
    fn indented_heading_is_not_a_heading() {
        let blocks = classify_lines("  # indented");
        assert!(matches!(&blocks[0], Block::Text(_)));
    }

    #[test]
    fn link() {
        let blocks = classify_lines("[Stripe](https://stripe.com)");
        assert!(matches!(&blocks[0], Block::Link { text, url } if text == "Stripe" && url == "https://stripe.com"));
    }

    #[test]
    fn multiple_links_left_to_right() {
        let blocks = classify_lines("a [one](/1) b [two](/2) c [](/3)");
        let urls: Vec<_> = blocks
            .iter()
            .filter_map(|b| match b {
                Block::Link { url, .. } => Some(url.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(urls, vec!["/1", "/2", "/3"]);
    }

    #[test]
    fn heading_with_link_emits_both() {
        let blocks = classify_lines("## See [docs](/docs)");
        assert!(matches!(&blocks[0], Block::Heading { level: 2, text } if text == "See [docs](/docs)"));
        assert!(matches!(&blocks[1], Block::Link { text, url } if text == "docs" && url == "/docs"));
    }

    #[test]
    fn link_anchor_that_looks_like_heading() {
        let blocks = classify_lines("[# Not a heading](/x)");
        assert_eq!(blocks.len(), 1);
        assert!(matches!(&blocks[0], Block::Link { text, .. } if text == "# Not a heading"));
    }

    #[test]
    fn malformed_links_are_skipped() {
        for line in ["[open](no close", "[no paren] here", "[empty]()", "](orphan)"] {
            let blocks = classify_lines(line);
            assert!(
                blocks.iter().all(|b| !matches!(b, Block::Link { .. })),
                "unexpected link in {line:?}: {blocks:?}"
            );
        }
    }

    #[test]
    fn empty_string() {
        assert!(classify_lines("").is_empty());
    }

    #[test]
    fn empty_line() {
        let blocks = classify_lines("text\n\nmore");
        assert!(matches!(&blocks[1], Block::Empty));
    }
}
