//! Markup walking and region classification
//!
//! Walks a parsed HTML tree once, collecting primary body text and, as
//! separate sections, the text of footer, legal and navigation regions.
//! html5ever recovers from malformed input, so the walk never fails; an
//! empty outline tells the caller to fall back to plain text.

use kbforge_common::SemanticSource;
use regex_lite::Regex;
use scraper::{ElementRef, Html, Node};
use std::sync::OnceLock;

/// Subtrees that never contribute text
const SKIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "head", "iframe",
];

/// Elements that start and end a paragraph
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "body", "dd", "details", "div", "dl", "dt",
    "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6",
    "header", "hr", "html", "li", "main", "nav", "ol", "p", "pre", "section", "summary", "table",
    "td", "th", "tr", "ul",
];

const LEGAL_MARKERS: &[&str] = &[
    "disclaimer", "terms", "policy", "privacy", "legal", "notice", "cookie", "cookies",
];

const NAV_MARKERS: &[&str] = &["nav", "navbar", "navigation", "menu", "menubar"];

/// Leading class words that describe page state rather than the element
const STATE_PREFIXES: &[&str] = &["has", "is", "no", "with", "without", "show", "hide"];

fn tag_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"</?[a-zA-Z!][^<>]*>").ok())
        .as_ref()
}

/// True when the text contains at least one tag-shaped token
pub fn looks_like_markup(text: &str) -> bool {
    tag_pattern().is_some_and(|pattern| pattern.is_match(text))
}

/// Text of one classified region
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub source: SemanticSource,
    pub text: String,
}

/// Body text plus structural regions in document order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkupOutline {
    pub body: String,
    pub regions: Vec<Section>,
}

impl MarkupOutline {
    pub fn is_empty(&self) -> bool {
        self.body.is_empty() && self.regions.is_empty()
    }
}

/// Parse and walk a markup document
pub fn outline(html: &str) -> MarkupOutline {
    let document = Html::parse_document(html);
    let mut collector = RegionCollector::default();
    let mut body = TextBuffer::default();
    collector.visit(document.root_element(), &mut body, false);
    collector.finish(body)
}

/// Classify an element as a structural region from its tag, role,
/// class and id
pub fn classify_region(element: ElementRef<'_>) -> Option<SemanticSource> {
    let value = element.value();
    let tag = value.name();
    if matches!(tag, "html" | "body" | "main") {
        return None;
    }

    let role = value.attr("role").map(str::to_ascii_lowercase);
    let words = marker_words(value.id(), value.classes());
    let has = |markers: &[&str]| words.iter().any(|w| markers.contains(&w.as_str()));

    let region = if tag == "footer" || role.as_deref() == Some("contentinfo") || has(&["footer"]) {
        SemanticSource::LikelyFooter
    } else if tag == "nav" || role.as_deref() == Some("navigation") || has(NAV_MARKERS) {
        SemanticSource::Navigation
    } else if has(LEGAL_MARKERS) {
        SemanticSource::LegalBlock
    } else {
        return None;
    };

    // A wrapper around the main content is layout, whatever it is named
    if tag != "footer" && tag != "nav" && wraps_main_content(element) {
        return None;
    }
    Some(region)
}

/// Lowercased words of the id and class names, split on `-` and `_`
fn marker_words<'a>(id: Option<&'a str>, classes: impl Iterator<Item = &'a str>) -> Vec<String> {
    id.into_iter()
        .chain(classes)
        .filter_map(|name| {
            let name = name.to_ascii_lowercase();
            let words: Vec<String> = name
                .split(['-', '_'])
                .filter(|w| !w.is_empty())
                .map(str::to_string)
                .collect();
            let describes_state = words
                .first()
                .is_some_and(|first| STATE_PREFIXES.contains(&first.as_str()));
            (!describes_state).then_some(words)
        })
        .flatten()
        .collect()
}

fn wraps_main_content(element: ElementRef<'_>) -> bool {
    element.descendants().skip(1).any(|node| {
        node.value()
            .as_element()
            .is_some_and(|e| matches!(e.name(), "main" | "article"))
    })
}

#[derive(Default)]
struct RegionCollector {
    regions: Vec<Section>,
}

impl RegionCollector {
    fn visit(&mut self, element: ElementRef<'_>, buffer: &mut TextBuffer, in_region: bool) {
        let tag = element.value().name();
        if SKIPPED_ELEMENTS.contains(&tag) {
            return;
        }

        // Outermost classified ancestor wins
        if !in_region {
            if let Some(source) = classify_region(element) {
                let mut region = TextBuffer::default();
                self.walk_children(element, &mut region, true);
                self.push_region(source, region.finish());
                return;
            }
        }

        if tag == "br" {
            buffer.line_break();
            return;
        }

        let block = BLOCK_ELEMENTS.contains(&tag);
        if block {
            buffer.paragraph_break();
        }

        self.walk_children(element, buffer, in_region);

        if tag == "a" {
            if let Some(href) = element.value().attr("href").filter(|h| is_link_target(h)) {
                buffer.push_text(" ");
                buffer.push_text(&format!("({})", href.trim()));
            }
        }

        if block {
            buffer.paragraph_break();
        }
    }

    fn walk_children(&mut self, element: ElementRef<'_>, buffer: &mut TextBuffer, in_region: bool) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => buffer.push_text(text),
                Node::Element(_) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        self.visit(child, buffer, in_region);
                    }
                }
                _ => {}
            }
        }
    }

    fn push_region(&mut self, source: SemanticSource, text: String) {
        if text.is_empty() || self.regions.iter().any(|section| section.text == text) {
            return;
        }
        self.regions.push(Section { source, text });
    }

    fn finish(self, body: TextBuffer) -> MarkupOutline {
        MarkupOutline {
            body: body.finish(),
            regions: self.regions,
        }
    }
}

fn is_link_target(href: &str) -> bool {
    let href = href.trim();
    !href.is_empty() && !href.starts_with('#') && !href.starts_with("javascript:")
}

/// Accumulates text with collapsed inline whitespace and explicit breaks
#[derive(Default)]
struct TextBuffer {
    text: String,
    pending_space: bool,
}

impl TextBuffer {
    fn push_text(&mut self, raw: &str) {
        let mut words = raw.split_whitespace().peekable();
        if words.peek().is_none() {
            if !raw.is_empty() {
                self.pending_space = true;
            }
            return;
        }

        if raw.starts_with(char::is_whitespace) {
            self.pending_space = true;
        }
        for word in words {
            if self.pending_space && !self.text.is_empty() && !self.text.ends_with('\n') {
                self.text.push(' ');
            }
            self.text.push_str(word);
            self.pending_space = true;
        }
        self.pending_space = raw.ends_with(char::is_whitespace);
    }

    fn line_break(&mut self) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.pending_space = false;
    }

    fn paragraph_break(&mut self) {
        if !self.text.is_empty() && !self.text.ends_with("\n\n") {
            if self.text.ends_with('\n') {
                self.text.push('\n');
            } else {
                self.text.push_str("\n\n");
            }
        }
        self.pending_space = false;
    }

    fn finish(self) -> String {
        self.text.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_markup() {
        assert!(looks_like_markup("<p>Intro.</p>"));
        assert!(looks_like_markup("text <!DOCTYPE html> more"));
        assert!(!looks_like_markup("a < b and c > d"));
        assert!(!looks_like_markup("plain text"));
    }

    #[test]
    fn test_separates_footer_from_body() {
        let outline = outline(
            "<html><body><p>Intro.</p><footer>Must have a privacy policy.</footer></body></html>",
        );
        assert_eq!(outline.body, "Intro.");
        assert_eq!(
            outline.regions,
            vec![Section {
                source: SemanticSource::LikelyFooter,
                text: "Must have a privacy policy.".into()
            }]
        );
    }

    #[test]
    fn test_skips_non_content_elements() {
        let outline = outline(
            "<html><head><title>T</title><style>p{}</style></head>\
             <body><script>var x = 1;</script><p>Visible</p><noscript>Enable JS</noscript></body></html>",
        );
        assert_eq!(outline.body, "Visible");
        assert!(outline.regions.is_empty());
    }

    #[test]
    fn test_classifies_regions_by_role_class_and_id() {
        let outline = outline(
            r#"<body>
                <div role="navigation"><a href="/home">Home</a></div>
                <p>Main text</p>
                <div class="site-Disclaimer">No warranty is given.</div>
                <div id="page-footer">Contact us</div>
            </body>"#,
        );
        let sources: Vec<_> = outline.regions.iter().map(|s| s.source).collect();
        assert_eq!(
            sources,
            vec![
                SemanticSource::Navigation,
                SemanticSource::LegalBlock,
                SemanticSource::LikelyFooter
            ]
        );
        assert_eq!(outline.regions[0].text, "Home (/home)");
        assert_eq!(outline.body, "Main text");
    }

    #[test]
    fn test_outermost_region_wins_and_duplicates_collapse() {
        let outline = outline(
            r#"<body>
                <footer><nav>Sitemap</nav><div class="legal">Terms apply</div></footer>
                <footer><nav>Sitemap</nav><div class="legal">Terms apply</div></footer>
            </body>"#,
        );
        assert_eq!(outline.regions.len(), 1);
        assert_eq!(outline.regions[0].source, SemanticSource::LikelyFooter);
        assert_eq!(outline.regions[0].text, "Sitemap\n\nTerms apply");
        assert!(outline.body.is_empty());
    }

    #[test]
    fn test_block_elements_break_paragraphs_and_inline_collapses() {
        let outline = outline("<body><h1>Title</h1><p>One   <b>two</b>\n three</p><p>Four<br>five</p></body>");
        assert_eq!(outline.body, "Title\n\nOne two three\n\nFour\nfive");
    }

    #[test]
    fn test_malformed_markup_still_yields_text() {
        let outline = outline("<div><p>Unclosed <b>bold <i>text</div></span>");
        assert_eq!(outline.body, "Unclosed bold text");
    }

    #[test]
    fn test_marker_words_match_whole_words_only() {
        let outline = outline(
            r#"<body>
                <div class="page has-navbar"><p>Welcome text</p></div>
                <div class="canvas">Chart caption</div>
                <div id="unavailable">Out of stock</div>
                <div class="main-nav"><a href="/shop">Shop</a></div>
                <div class="cookie_notice">We use cookies</div>
            </body>"#,
        );
        assert_eq!(
            outline.body,
            "Welcome text\n\nChart caption\n\nOut of stock"
        );
        let sources: Vec<_> = outline.regions.iter().map(|s| s.source).collect();
        assert_eq!(
            sources,
            vec![SemanticSource::Navigation, SemanticSource::LegalBlock]
        );
    }

    #[test]
    fn test_marked_wrapper_around_main_content_is_body() {
        let outline = outline(
            r#"<body><div class="menu-layout"><main><p>Article body</p></main></div></body>"#,
        );
        assert_eq!(outline.body, "Article body");
        assert!(outline.regions.is_empty());
    }

    #[test]
    fn test_body_class_does_not_swallow_document() {
        let outline = outline(r#"<body class="privacy-page"><p>Policy text</p></body>"#);
        assert_eq!(outline.body, "Policy text");
        assert!(outline.regions.is_empty());
    }
}
