//! Markdown resume layout on A4 with greedy word wrap.
//!
//! Supported blocks: `##`..`######` headings (only `##` is styled, with a
//! rule underneath), `-`/`*` bullets, `---` rules and plain paragraphs.
//! Inline `**bold**` and `[text](url)` are reduced to their visible text.

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::metrics::{get_metrics, Font};
use super::{
    Page, PlacedItem, RenderError, RenderOutcome, RenderPolicy, RenderedDocument, Renderer,
};

const A4_WIDTH: f32 = 595.2756;
const A4_HEIGHT: f32 = 841.8898;
/// Inner padding of the text frame on every side.
const FRAME_PADDING: f32 = 6.0;
const EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy)]
struct TextStyle {
    font: Font,
    size: f32,
    leading: f32,
    space_before: f32,
    space_after: f32,
    left_indent: f32,
    keep_with_next: bool,
}

#[derive(Debug, Clone, Copy)]
struct RuleStyle {
    thickness: f32,
    space_before: f32,
    space_after: f32,
}

#[derive(Debug, Clone)]
pub struct Theme {
    page_width: f32,
    page_height: f32,
    left_margin: f32,
    right_margin: f32,
    top_margin: f32,
    bottom_margin: f32,
    normal: TextStyle,
    h2: TextStyle,
    bullet: TextStyle,
    bullet_indent: f32,
    bullet_size: f32,
    section_rule: RuleStyle,
    /// Gap after a bullet list unless a section heading follows.
    section_spacer: f32,
}

impl Default for Theme {
    fn default() -> Self {
        let normal = TextStyle {
            font: Font::Helvetica,
            size: 10.0,
            leading: 9.0,
            space_before: 0.0,
            space_after: 0.0,
            left_indent: 0.0,
            keep_with_next: false,
        };
        Self {
            page_width: A4_WIDTH,
            page_height: A4_HEIGHT,
            left_margin: 33.3,
            right_margin: 35.1,
            top_margin: 28.8,
            bottom_margin: 28.8,
            normal,
            h2: TextStyle {
                font: Font::HelveticaBold,
                size: 12.0,
                leading: 15.45,
                space_after: 3.0,
                keep_with_next: true,
                ..normal
            },
            bullet: TextStyle {
                left_indent: 24.01,
                ..normal
            },
            bullet_indent: 12.0,
            bullet_size: 7.2,
            section_rule: RuleStyle {
                thickness: 1.0,
                space_before: 0.0,
                space_after: 15.45,
            },
            section_spacer: 7.76,
        }
    }
}

impl Theme {
    fn frame_width(&self) -> f32 {
        self.page_width - self.left_margin - self.right_margin - 2.0 * FRAME_PADDING
    }

    fn frame_height(&self) -> f32 {
        self.page_height - self.top_margin - self.bottom_margin - 2.0 * FRAME_PADDING
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Block {
    Heading { level: usize, text: String },
    Rule,
    Bullet(String),
    Paragraph(String),
}

fn heading_pattern() -> &'static Regex {
    static HEADING: OnceLock<Regex> = OnceLock::new();
    HEADING.get_or_init(|| Regex::new(r"^(#{2,6})\s+(.*)$").expect("valid heading regex"))
}

fn link_pattern() -> &'static Regex {
    static LINK: OnceLock<Regex> = OnceLock::new();
    LINK.get_or_init(|| Regex::new(r"\[(.*?)\]\((.*?)\)").expect("valid link regex"))
}

fn bold_pattern() -> &'static Regex {
    static BOLD: OnceLock<Regex> = OnceLock::new();
    BOLD.get_or_init(|| Regex::new(r"\*\*(.*?)\*\*").expect("valid bold regex"))
}

fn parse_line(line: &str) -> Option<Block> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some(caps) = heading_pattern().captures(line) {
        return Some(Block::Heading {
            level: caps[1].len(),
            text: caps[2].trim().to_string(),
        });
    }
    if line == "---" {
        return Some(Block::Rule);
    }
    if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
        return Some(Block::Bullet(rest.trim().to_string()));
    }
    Some(Block::Paragraph(line.to_string()))
}

/// A word may mix fonts, e.g. `**Rust**,`.
#[derive(Debug, Clone, PartialEq)]
struct Word {
    pieces: Vec<(String, Font)>,
}

impl Word {
    fn text(&self) -> String {
        self.pieces.iter().map(|(s, _)| s.as_str()).collect()
    }

    fn width(&self, size: f32) -> f32 {
        self.pieces
            .iter()
            .map(|(s, font)| get_metrics(*font).measure_str(s, size))
            .sum()
    }
}

fn inline_words(text: &str, base: Font) -> Vec<Word> {
    let plain = link_pattern().replace_all(text, "${1}");

    let mut segments: Vec<(&str, Font)> = Vec::new();
    let mut last = 0;
    for caps in bold_pattern().captures_iter(&plain) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        segments.push((&plain[last..whole.start()], base));
        segments.push((inner.as_str(), Font::HelveticaBold));
        last = whole.end();
    }
    segments.push((&plain[last..], base));

    let mut words = Vec::new();
    let mut current: Vec<(String, Font)> = Vec::new();
    for (segment, font) in segments {
        let mut piece = String::new();
        for c in segment.chars() {
            if c.is_whitespace() {
                if !piece.is_empty() {
                    current.push((std::mem::take(&mut piece), font));
                }
                if !current.is_empty() {
                    words.push(Word {
                        pieces: std::mem::take(&mut current),
                    });
                }
            } else {
                piece.push(c);
            }
        }
        if !piece.is_empty() {
            current.push((piece, font));
        }
    }
    if !current.is_empty() {
        words.push(Word { pieces: current });
    }
    words
}

/// Greedy wrap; a word wider than the line gets a line of its own.
fn wrap(words: &[Word], size: f32, max_width: f32) -> Vec<String> {
    let space = get_metrics(Font::Helvetica).measure_str(" ", size);
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut width = 0.0_f32;

    for word in words {
        let word_width = word.width(size);
        if line.is_empty() {
            line = word.text();
            width = word_width;
        } else if width + space + word_width <= max_width + EPSILON {
            line.push(' ');
            line.push_str(&word.text());
            width += space + word_width;
        } else {
            lines.push(std::mem::take(&mut line));
            line = word.text();
            width = word_width;
        }
    }
    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

enum Flowable {
    Text {
        style: TextStyle,
        words: Vec<Word>,
        bullet: bool,
    },
    Rule(RuleStyle),
    Spacer(f32),
}

/// Places flowables top-down, starting a new page when the frame is full.
struct PageCursor<'a> {
    theme: &'a Theme,
    pages: Vec<Page>,
    items: Vec<PlacedItem>,
    used: f32,
}

impl<'a> PageCursor<'a> {
    fn new(theme: &'a Theme) -> Self {
        Self {
            theme,
            pages: Vec::new(),
            items: Vec::new(),
            used: 0.0,
        }
    }

    fn at_top(&self) -> bool {
        self.used <= 0.0
    }

    fn remaining(&self) -> f32 {
        self.theme.frame_height() - self.used
    }

    fn origin_x(&self) -> f32 {
        self.theme.left_margin + FRAME_PADDING
    }

    fn origin_y(&self) -> f32 {
        self.theme.top_margin + FRAME_PADDING
    }

    fn new_page(&mut self) {
        let number = self.pages.len() as u32 + 1;
        self.pages.push(Page {
            number,
            items: std::mem::take(&mut self.items),
        });
        self.used = 0.0;
    }

    /// Vertical space is dropped at the top of a page.
    fn skip(&mut self, gap: f32) {
        if !self.at_top() {
            self.used = (self.used + gap).min(self.theme.frame_height());
        }
    }

    fn ensure_room(&mut self, height: f32) {
        if !self.at_top() && height > self.remaining() + EPSILON {
            self.new_page();
        }
    }

    fn place_text(&mut self, style: &TextStyle, lines: &[String], bullet: bool, keep_height: f32) {
        if lines.is_empty() {
            return;
        }
        if style.keep_with_next {
            let block = style.space_before
                + lines.len() as f32 * style.leading
                + style.space_after
                + keep_height;
            self.ensure_room(block);
        }
        self.skip(style.space_before);

        for (index, line) in lines.iter().enumerate() {
            self.ensure_room(style.leading);
            self.used += style.leading;
            let y = self.origin_y() + self.used;
            if bullet && index == 0 {
                self.items.push(PlacedItem::Bullet {
                    x: self.origin_x() + self.theme.bullet_indent,
                    y,
                    size: self.theme.bullet_size,
                });
            }
            self.items.push(PlacedItem::Text {
                x: self.origin_x() + style.left_indent,
                y,
                font: style.font,
                size: style.size,
                text: line.clone(),
            });
        }
        self.skip(style.space_after);
    }

    fn place_rule(&mut self, rule: &RuleStyle) {
        self.skip(rule.space_before);
        self.ensure_room(rule.thickness);
        self.used += rule.thickness;
        self.items.push(PlacedItem::Rule {
            x: self.origin_x(),
            y: self.origin_y() + self.used,
            width: self.theme.frame_width(),
            thickness: rule.thickness,
        });
        self.skip(rule.space_after);
    }

    fn finish(mut self) -> Vec<Page> {
        if !self.items.is_empty() || self.pages.is_empty() {
            self.new_page();
        }
        self.pages
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarkdownRenderer {
    theme: Theme,
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_story(&self, text: &str) -> Vec<Flowable> {
        let theme = &self.theme;
        let mut story = Vec::new();
        let mut bullets: Vec<String> = Vec::new();

        for block in text.split('\n').filter_map(parse_line) {
            if !matches!(block, Block::Bullet(_)) && !bullets.is_empty() {
                self.flush_bullets(&mut story, &mut bullets);
                if !matches!(block, Block::Heading { level: 2, .. }) {
                    story.push(Flowable::Spacer(theme.section_spacer));
                }
            }
            match block {
                Block::Heading { level, text } => {
                    let style = if level == 2 { theme.h2 } else { theme.normal };
                    story.push(Flowable::Text {
                        style,
                        words: inline_words(&text, style.font),
                        bullet: false,
                    });
                    if level == 2 {
                        story.push(Flowable::Rule(theme.section_rule));
                    }
                }
                Block::Rule => story.push(Flowable::Rule(RuleStyle {
                    space_before: 0.0,
                    space_after: 0.0,
                    ..theme.section_rule
                })),
                Block::Bullet(text) => bullets.push(text),
                Block::Paragraph(text) => story.push(Flowable::Text {
                    style: theme.normal,
                    words: inline_words(&text, theme.normal.font),
                    bullet: false,
                }),
            }
        }
        self.flush_bullets(&mut story, &mut bullets);
        story
    }

    fn flush_bullets(&self, story: &mut Vec<Flowable>, bullets: &mut Vec<String>) {
        let style = self.theme.bullet;
        for text in bullets.drain(..) {
            story.push(Flowable::Text {
                style,
                words: inline_words(&text, style.font),
                bullet: true,
            });
        }
    }

    pub fn layout(&self, text: &str) -> RenderedDocument {
        let theme = &self.theme;
        let story = self.build_story(text);
        let mut cursor = PageCursor::new(theme);

        for (index, flowable) in story.iter().enumerate() {
            match flowable {
                Flowable::Text {
                    style,
                    words,
                    bullet,
                } => {
                    let lines = wrap(words, style.size, theme.frame_width() - style.left_indent);
                    let keep_height = match story.get(index + 1) {
                        Some(Flowable::Rule(rule)) if style.keep_with_next => {
                            rule.space_before + rule.thickness
                        }
                        _ => 0.0,
                    };
                    cursor.place_text(style, &lines, *bullet, keep_height);
                }
                Flowable::Rule(rule) => cursor.place_rule(rule),
                Flowable::Spacer(height) => cursor.skip(*height),
            }
        }

        RenderedDocument {
            page_width: theme.page_width,
            page_height: theme.page_height,
            pages: cursor.finish(),
        }
    }
}

impl Renderer for MarkdownRenderer {
    fn render(&self, text: &str, policy: RenderPolicy) -> Result<RenderOutcome, RenderError> {
        if policy.max_pages == 0 {
            return Err(RenderError::InvalidPolicy);
        }
        let document = self.layout(text);
        let page_count = document.page_count();
        if page_count > policy.max_pages {
            debug!(page_count, max_pages = policy.max_pages, "Render exceeds page limit");
            return Ok(RenderOutcome::ExceedsPageLimit {
                page_count,
                max_pages: policy.max_pages,
            });
        }
        Ok(RenderOutcome::Rendered(document))
    }
}
