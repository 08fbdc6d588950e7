pub mod blocks;

use serde::Serialize;

use blocks::Block;

pub use blocks::classify_lines;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Heading {
    pub level: u8,
    pub text: String,
    pub order_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Link {
    pub url: String,
    pub anchor_text: String,
    pub is_external: bool,
    pub order_index: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedPage {
    pub headings: Vec<Heading>,
    pub links: Vec<Link>,
}

/// Two-pass extraction: markdown → blocks → ordered headings and links.
///
/// Heading and link indices are independent counters over the whole document.
pub fn parse_markdown(markdown: &str) -> ParsedPage {
    let mut parsed = ParsedPage::default();

    for block in classify_lines(markdown) {
        match block {
            Block::Heading { level, text } => {
                let order_index = parsed.headings.len() as u32;
                parsed.headings.push(Heading {
                    level,
                    text,
                    order_index,
                });
            }
            Block::Link { text, url } => {
                let order_index = parsed.links.len() as u32;
                let anchor_text = if text.trim().is_empty() {
                    url.clone()
                } else {
                    text
                };
                parsed.links.push(Link {
                    is_external: is_external(&url),
                    url,
                    anchor_text,
                    order_index,
                });
            }
            Block::Text(_) | Block::Empty => {}
        }
    }

    parsed
}

/// Absolute targets are the ones that carry an http(s) scheme.
pub fn is_external(url: &str) -> bool {
    url.starts_with("http")
}
