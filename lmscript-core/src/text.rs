//! Translatable text blocks: maximal runs of characters and line breaks in a
//! `TpWord` body.

use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::novel::{split_event, BreakType, CharGlyph, Glyph, TpWord};
use crate::{LsbError, Result};

fn digest(text: &str) -> String {
    let hash = Sha256::digest(text.as_bytes());
    hex::encode(&hash[..8])
}

/// One block of display text. `start`, `end` and `digest` stay tied to the
/// body the block was read from; `text` is free to change.
#[derive(Debug, Clone, Serialize)]
pub struct TextBlock {
    pub text: String,
    orig_text: String,
    start: usize,
    end: usize,
    digest: String,
    /// Speaker set by the last `NAMELABEL` event before this block.
    pub name_label: Option<String>,
}

impl TextBlock {
    pub fn new(text: &str, start: usize, end: usize, name_label: Option<String>) -> Result<TextBlock> {
        if end <= start {
            return Err(LsbError::MalformedGlyph {
                index: start,
                reason: format!("text block ends at {} before it starts", end),
            });
        }
        Ok(TextBlock {
            text: text.to_string(),
            orig_text: text.to_string(),
            start,
            end,
            digest: digest(text),
            name_label,
        })
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn orig_text(&self) -> &str {
        &self.orig_text
    }

    pub fn is_modified(&self) -> bool {
        self.text != self.orig_text
    }

    pub fn overlaps(&self, other: &TextBlock) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Blocks compare by position and original text, not by current text.
impl PartialEq for TextBlock {
    fn eq(&self, other: &TextBlock) -> bool {
        self.start == other.start && self.end == other.end && self.digest == other.digest
    }
}

/// Ordered, non-overlapping text blocks of one `TpWord`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TextBlocks {
    blocks: Vec<TextBlock>,
}

impl TextBlocks {
    pub fn from_tpword(tp: &TpWord) -> TextBlocks {
        let mut blocks = TextBlocks::default();
        let mut current = String::new();
        let mut start = 0;
        let mut speaker: Option<String> = None;
        let body = tp.body();

        let mut flush = |current: &mut String, start: usize, speaker: &Option<String>| {
            if current.is_empty() {
                return;
            }
            // repeated blank lines are a common way to clear the message box
            let text = current.trim_end_matches('\n');
            let chars = text.chars().count();
            if let Ok(block) = TextBlock::new(text, start, start + chars.max(1), speaker.clone()) {
                blocks.blocks.push(block);
            }
            current.clear();
        };

        for (i, glyph) in body.iter().enumerate() {
            match glyph {
                Glyph::Char(c) => {
                    if current.is_empty() {
                        start = i;
                    }
                    current.push(c.ch);
                    continue;
                }
                Glyph::Return {
                    break_type: BreakType::Line,
                    ..
                } if !current.is_empty() => {
                    current.push('\n');
                    continue;
                }
                _ => {}
            }
            flush(&mut current, start, &speaker);
            if let Glyph::Event { event, .. } = glyph {
                let call = split_event(event);
                if call.name == "NAMELABEL" {
                    speaker = if call.system {
                        None
                    } else {
                        call.args.first().map(|s| s.to_string())
                    };
                }
            }
        }
        flush(&mut current, start, &speaker);
        blocks
    }

    /// Insert a block in position order, rejecting one that overlaps a
    /// neighbour.
    pub fn add(&mut self, block: TextBlock) -> Result<()> {
        let at = self.blocks.partition_point(|b| b.start < block.start);
        for neighbour in [at.checked_sub(1), Some(at)].into_iter().flatten() {
            if let Some(other) = self.blocks.get(neighbour) {
                if other.overlaps(&block) {
                    return Err(LsbError::MalformedGlyph {
                        index: block.start,
                        reason: format!(
                            "text block {}..{} overlaps block {}..{}",
                            block.start, block.end, other.start, other.end
                        ),
                    });
                }
            }
        }
        self.blocks.insert(at, block);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TextBlock> {
        self.blocks.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TextBlock> {
        self.blocks.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TextBlock> {
        self.blocks.iter()
    }
}

impl<'a> IntoIterator for &'a TextBlocks {
    type Item = &'a TextBlock;
    type IntoIter = std::slice::Iter<'a, TextBlock>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}

impl TpWord {
    pub fn text_blocks(&self) -> TextBlocks {
        TextBlocks::from_tpword(self)
    }

    /// Write edited block text back into the body.
    ///
    /// New characters copy decorator, link, speed and condition from the
    /// first glyph of the block they replace; `\n` becomes a line break.
    /// With `strict`, `blocks` must describe exactly this body's blocks.
    pub fn replace_text_blocks(&mut self, blocks: &TextBlocks, strict: bool) -> Result<()> {
        if strict && *blocks != self.text_blocks() {
            return Err(LsbError::IdentifierMismatch {
                id: "text blocks".to_string(),
                reason: "replacement blocks were not read from this text".to_string(),
            });
        }
        let mut body = self.body().to_vec();
        for block in blocks.blocks.iter().rev() {
            if block.end > body.len() {
                return Err(LsbError::MalformedGlyph {
                    index: block.end,
                    reason: format!("text block ends past the body ({} glyphs)", body.len()),
                });
            }
            let template = match &body[block.start] {
                Glyph::Char(c) => c.clone(),
                other => {
                    return Err(LsbError::MalformedGlyph {
                        index: block.start,
                        reason: format!("text block starts on {:?}, not a character", other),
                    })
                }
            };
            if block.is_modified() {
                debug!("replacing {:?} with {:?}", block.orig_text, block.text);
            }
            let glyphs: Vec<Glyph> = block
                .text
                .chars()
                .map(|ch| match ch {
                    '\n' => Glyph::Return {
                        condition: template.condition,
                        break_type: BreakType::Line,
                    },
                    ch => Glyph::Char(CharGlyph { ch, ..template.clone() }),
                })
                .collect();
            body.splice(block.start..block.end, glyphs);
        }
        self.replace_body(body)
    }
}
