//! Packs ranked search results into a bounded context block.
//!
//! Knowledge-class documents always go first. Each class is packed greedily:
//! a block that would overflow the remaining budget ends that class, and the
//! conversation pass then works with whatever budget is left. Blocks are
//! atomic, except the very first knowledge block, which is clipped to the
//! budget when it cannot fit whole.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::document::{DocType, Document, SearchHit};

pub const BLOCK_SEPARATOR: &str = "\n\n---\n\n";
pub const MAX_KNOWLEDGE_BLOCKS: usize = 3;
pub const MAX_CONVERSATION_BLOCKS: usize = 2;
const ELLIPSIS: char = '…';

/// Assembled context handed to the generation layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContextBundle {
    pub text: String,
    /// Length of `text` in characters.
    pub chars_used: usize,
    pub docs_used: usize,
    /// Results returned by search, packed or not.
    pub total_found: usize,
    /// Categories of every result found, packed or not.
    pub categories_covered: Vec<String>,
}

/// Which document classes to request from search.
pub fn doc_types_for(include_conversations: bool, include_knowledge: bool) -> Vec<DocType> {
    let mut types = Vec::new();
    if include_knowledge {
        types.extend(DocType::KNOWLEDGE_CLASS);
    }
    if include_conversations {
        types.push(DocType::Conversation);
    }
    types
}

pub fn format_block(doc: &Document) -> String {
    if doc.doc_type.is_knowledge() {
        format!(
            "[{}] {} (category: {})\n{}",
            doc.doc_type, doc.title, doc.category, doc.content
        )
    } else {
        format!("[conversation] {}\n{}", doc.title, doc.content)
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Cut `block` to at most `max_chars` characters, marking the cut.
fn clip(block: &str, max_chars: usize) -> String {
    if char_len(block) <= max_chars {
        return block.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut clipped: String = block.chars().take(max_chars - 1).collect();
    clipped.push(ELLIPSIS);
    clipped
}

struct Packer {
    max_chars: usize,
    used: usize,
    blocks: Vec<String>,
}

impl Packer {
    fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            used: 0,
            blocks: Vec::new(),
        }
    }

    fn separator_cost(&self) -> usize {
        if self.blocks.is_empty() {
            0
        } else {
            char_len(BLOCK_SEPARATOR)
        }
    }

    /// Append `block` whole if it fits and return whether it did. When
    /// `clip_first` is set and nothing is packed yet, an oversized block is
    /// clipped to the budget instead.
    fn push(&mut self, block: String, clip_first: bool) -> bool {
        let cost = self.separator_cost() + char_len(&block);
        if self.used + cost <= self.max_chars {
            self.used += cost;
            self.blocks.push(block);
            return true;
        }
        if clip_first && self.blocks.is_empty() {
            let clipped = clip(&block, self.max_chars);
            if !clipped.is_empty() {
                self.used = char_len(&clipped);
                self.blocks.push(clipped);
            }
        }
        false
    }
}

/// Pack ranked hits into a context bundle under `max_chars`.
///
/// `hits` must already be in ranking order; each class keeps that order.
pub fn assemble(hits: &[SearchHit], max_chars: usize, include_conversations: bool) -> ContextBundle {
    let categories_covered: BTreeSet<String> =
        hits.iter().map(|h| h.category().to_string()).collect();

    let (knowledge, conversations): (Vec<&SearchHit>, Vec<&SearchHit>) =
        hits.iter().partition(|h| h.doc_type().is_knowledge());

    let mut packer = Packer::new(max_chars);
    for hit in knowledge.iter().take(MAX_KNOWLEDGE_BLOCKS) {
        if !packer.push(format_block(&hit.document), true) {
            break;
        }
    }
    if include_conversations {
        for hit in conversations.iter().take(MAX_CONVERSATION_BLOCKS) {
            if !packer.push(format_block(&hit.document), false) {
                break;
            }
        }
    }

    let docs_used = packer.blocks.len();
    let text = packer.blocks.join(BLOCK_SEPARATOR);
    ContextBundle {
        chars_used: char_len(&text),
        text,
        docs_used,
        total_found: hits.len(),
        categories_covered: categories_covered.into_iter().collect(),
    }
}
