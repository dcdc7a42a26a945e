//! Sermon → section → paragraph → block hierarchy.
//!
//! The outline is an arena: nodes of each level live in one flat `Vec`, and
//! every parent holds the `Range` of its children in the next level. It is
//! built in a single pass over one query ordered by position.

use std::ops::Range;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::StorageError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SermonInfo {
    pub uid: String,
    pub title: String,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SectionNode {
    pub uid: String,
    pub number: Option<i64>,
    pub paragraphs: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParagraphNode {
    pub uid: String,
    pub blocks: Range<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockNode {
    pub uid: String,
    pub text: String,
    /// Display kind, e.g. "text" or "scripture".
    pub kind: Option<String>,
    pub indented: bool,
}

/// A whole sermon, ready to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SermonOutline {
    pub sermon: SermonInfo,
    pub sections: Vec<SectionNode>,
    pub paragraphs: Vec<ParagraphNode>,
    pub blocks: Vec<BlockNode>,
}

impl SermonOutline {
    pub fn paragraphs_of(&self, section: &SectionNode) -> &[ParagraphNode] {
        &self.paragraphs[section.paragraphs.clone()]
    }

    pub fn blocks_of(&self, paragraph: &ParagraphNode) -> &[BlockNode] {
        &self.blocks[paragraph.blocks.clone()]
    }
}

/// One row of the ordered hierarchy join. Outer-joined levels may be absent.
struct OutlineRow {
    section_uid: Option<String>,
    section_number: Option<i64>,
    paragraph_uid: Option<String>,
    block: Option<BlockNode>,
}

struct OutlineBuilder {
    outline: SermonOutline,
}

impl OutlineBuilder {
    fn new(sermon: SermonInfo) -> Self {
        Self {
            outline: SermonOutline {
                sermon,
                sections: Vec::new(),
                paragraphs: Vec::new(),
                blocks: Vec::new(),
            },
        }
    }

    fn push(&mut self, row: OutlineRow) {
        let Some(section_uid) = row.section_uid else {
            return;
        };
        let o = &mut self.outline;

        if o.sections.last().map(|s| s.uid.as_str()) != Some(section_uid.as_str()) {
            let start = o.paragraphs.len();
            o.sections.push(SectionNode {
                uid: section_uid,
                number: row.section_number,
                paragraphs: start..start,
            });
        }

        let Some(paragraph_uid) = row.paragraph_uid else {
            return;
        };
        let section_start = o.sections.last().map_or(0, |s| s.paragraphs.start);
        let in_section = &o.paragraphs[section_start..];
        if in_section.last().map(|p| p.uid.as_str()) != Some(paragraph_uid.as_str()) {
            let start = o.blocks.len();
            o.paragraphs.push(ParagraphNode {
                uid: paragraph_uid,
                blocks: start..start,
            });
            if let Some(section) = o.sections.last_mut() {
                section.paragraphs.end = o.paragraphs.len();
            }
        }

        if let Some(block) = row.block {
            o.blocks.push(block);
            if let Some(paragraph) = o.paragraphs.last_mut() {
                paragraph.blocks.end = o.blocks.len();
            }
        }
    }

    fn finish(self) -> SermonOutline {
        self.outline
    }
}

/// Load one sermon outline, or `None` when the uid is unknown.
pub fn load_sermon(conn: &Connection, uid: &str) -> Result<Option<SermonOutline>, StorageError> {
    let sermon = conn
        .query_row(
            "SELECT uid, title, date FROM sermons WHERE uid = ?1",
            params![uid],
            |row| {
                Ok(SermonInfo {
                    uid: row.get(0)?,
                    title: row.get(1)?,
                    date: row.get(2)?,
                })
            },
        )
        .optional()?;
    let Some(sermon) = sermon else {
        return Ok(None);
    };

    let mut stmt = conn.prepare(
        "SELECT sec.uid, sec.number, p.uid, b.uid, b.text, b.type, b.indented
         FROM sections sec
         LEFT JOIN paragraphs p ON p.section_uid = sec.uid
         LEFT JOIN blocks b ON b.paragraph_uid = p.uid
         WHERE sec.sermon_uid = ?1
         ORDER BY sec.order_index, sec.uid, p.order_index, p.uid, b.order_index, b.uid",
    )?;
    let rows = stmt.query_map(params![uid], |row| {
        let block_uid: Option<String> = row.get(3)?;
        let block = match block_uid {
            Some(uid) => Some(BlockNode {
                uid,
                text: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                kind: row.get(5)?,
                indented: row.get::<_, Option<i64>>(6)?.unwrap_or(0) != 0,
            }),
            None => None,
        };
        Ok(OutlineRow {
            section_uid: row.get(0)?,
            section_number: row.get(1)?,
            paragraph_uid: row.get(2)?,
            block,
        })
    })?;

    let mut builder = OutlineBuilder::new(sermon);
    for row in rows {
        builder.push(row?);
    }
    Ok(Some(builder.finish()))
}

/// Blocks of one paragraph in display order. Unknown paragraph ⇒ empty.
pub fn paragraph_blocks(conn: &Connection, paragraph_uid: &str) -> Result<Vec<BlockNode>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT uid, text, type, indented FROM blocks
         WHERE paragraph_uid = ?1
         ORDER BY order_index, uid",
    )?;
    let blocks = stmt
        .query_map(params![paragraph_uid], |row| {
            Ok(BlockNode {
                uid: row.get(0)?,
                text: row.get(1)?,
                kind: row.get(2)?,
                indented: row.get::<_, i64>(3)? != 0,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(blocks)
}
