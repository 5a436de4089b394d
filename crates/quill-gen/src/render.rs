// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Terminal rendering seam.
//!
//! The printers never branch on rendered content — they hand markdown to a
//! [`Renderer`] and write whatever comes back.  [`PlainRenderer`] passes text
//! through untouched (the right choice when stdout is a pipe);
//! [`AnsiRenderer`] walks the markdown event stream and emits ANSI styling
//! for interactive terminals.

use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd};

/// Two-method rendering interface: `render` for the final answer (stdout),
/// `render_aside` for diagnostic traffic (stderr) where a dimmer, flatter
/// treatment reads better.
pub trait Renderer: Send + Sync {
    fn render(&self, markdown: &str) -> String;
    fn render_aside(&self, markdown: &str) -> String;
}

/// Identity renderer.
pub struct PlainRenderer;

impl Renderer for PlainRenderer {
    fn render(&self, markdown: &str) -> String {
        markdown.to_string()
    }

    fn render_aside(&self, markdown: &str) -> String {
        markdown.to_string()
    }
}

const BOLD: &str = "\x1b[1m";
const ITALIC: &str = "\x1b[3m";
const DIM: &str = "\x1b[2m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

/// ANSI terminal renderer built on the pulldown-cmark event stream.
pub struct AnsiRenderer;

impl Renderer for AnsiRenderer {
    fn render(&self, markdown: &str) -> String {
        render_events(markdown)
    }

    fn render_aside(&self, markdown: &str) -> String {
        format!("{DIM}{}{RESET}", flatten(markdown))
    }
}

/// Walk the markdown events into a styled string.  Block structure maps to
/// blank-line separation; inline emphasis maps to ANSI attributes.
fn render_events(markdown: &str) -> String {
    let mut opts = Options::empty();
    opts.insert(Options::ENABLE_STRIKETHROUGH);
    opts.insert(Options::ENABLE_TABLES);

    let mut out = String::with_capacity(markdown.len() + 64);
    let mut list_stack: Vec<Option<u64>> = Vec::new();
    let mut in_code_block = false;

    for event in Parser::new_ext(markdown, opts) {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(BOLD);
                out.push_str(heading_marker(level));
            }
            Event::End(TagEnd::Heading(_)) => {
                out.push_str(RESET);
                out.push('\n');
            }
            Event::Start(Tag::Paragraph) => {
                // Tight list items stay on their bullet line; top-level
                // paragraphs get a separating blank line.
                if !out.is_empty() && list_stack.is_empty() {
                    if !out.ends_with('\n') {
                        out.push('\n');
                    }
                    if !out.ends_with("\n\n") {
                        out.push('\n');
                    }
                }
            }
            Event::End(TagEnd::Paragraph) => out.push('\n'),
            Event::Start(Tag::CodeBlock(_)) => {
                if !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
                in_code_block = true;
            }
            Event::End(TagEnd::CodeBlock) => {
                in_code_block = false;
            }
            Event::Start(Tag::List(start)) => list_stack.push(start),
            Event::End(TagEnd::List(_)) => {
                list_stack.pop();
            }
            Event::Start(Tag::Item) => {
                if !out.ends_with('\n') && !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(&"  ".repeat(list_stack.len().saturating_sub(1)));
                match list_stack.last_mut() {
                    Some(Some(n)) => {
                        out.push_str(&format!("{n}. "));
                        *n += 1;
                    }
                    _ => out.push_str("• "),
                }
            }
            Event::End(TagEnd::Item) => {}
            Event::Start(Tag::Emphasis) => out.push_str(ITALIC),
            Event::End(TagEnd::Emphasis) => out.push_str(RESET),
            Event::Start(Tag::Strong) => out.push_str(BOLD),
            Event::End(TagEnd::Strong) => out.push_str(RESET),
            Event::Start(Tag::Link { .. }) => out.push_str(CYAN),
            Event::End(TagEnd::Link) => out.push_str(RESET),
            Event::Text(t) => {
                if in_code_block {
                    for line in t.lines() {
                        out.push_str("    ");
                        out.push_str(line);
                        out.push('\n');
                    }
                } else {
                    out.push_str(&t);
                }
            }
            Event::Code(code) => {
                out.push_str(CYAN);
                out.push_str(&code);
                out.push_str(RESET);
            }
            Event::SoftBreak => out.push(' '),
            Event::HardBreak => out.push('\n'),
            Event::Rule => {
                out.push_str("────────\n");
            }
            _ => {}
        }
    }

    while out.ends_with('\n') {
        out.pop();
    }
    out.push('\n');
    out
}

fn heading_marker(level: HeadingLevel) -> &'static str {
    match level {
        HeadingLevel::H1 => "# ",
        HeadingLevel::H2 => "## ",
        _ => "### ",
    }
}

/// Collapse markdown to plain text, one physical line per source line.
fn flatten(markdown: &str) -> String {
    markdown.trim_end().to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
