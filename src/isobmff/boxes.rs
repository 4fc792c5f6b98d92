// SPDX-License-Identifier: GPL-2.0-or-later

use byteio::{ByteIterator, ReadError};
use thiserror::Error;

pub type BoxType = [u8; 4];

// Containers whose children are parsed recursively. Everything
// else is kept as an opaque leaf.
const CONTAINER_TYPES: [BoxType; 11] = [
    *b"moov", *b"trak", *b"mdia", *b"minf", *b"stbl", *b"dinf", *b"edts", *b"mvex", *b"moof",
    *b"traf", *b"mfra",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BoxError {
    #[error("box at offset {0} is truncated")]
    Truncated(u64),

    #[error("box '{fourcc_}' at offset {1}: size {2} smaller than header", fourcc_ = fourcc(*.0))]
    SizeTooSmall(BoxType, u64, u64),

    #[error("box '{fourcc_}' at offset {1}: children overflow parent", fourcc_ = fourcc(*.0))]
    ChildOverflow(BoxType, u64),
}

impl From<ReadError> for BoxError {
    fn from(_: ReadError) -> Self {
        // Subtrees are parsed from a fully buffered slice, so
        // running out of bytes means the size fields lied.
        BoxError::Truncated(0)
    }
}

#[must_use]
pub fn fourcc(typ: BoxType) -> String {
    typ.iter()
        .map(|b| {
            if b.is_ascii_graphic() || *b == b' ' {
                char::from(*b)
            } else {
                '.'
            }
        })
        .collect()
}

// Header of a single box: 32-bit size and FourCC, with the
// 64-bit `largesize` and "to end of file" escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub typ: BoxType,
    pub offset: u64,

    // Total box size including the header, `None` for size
    // zero which extends to the end of the file.
    pub size: Option<u64>,

    pub header_len: u64,
}

impl BoxHeader {
    pub fn parse(it: &mut ByteIterator) -> Result<BoxHeader, ReadError> {
        let offset = it.pos();
        let size32 = it.read_u32()?;
        let typ = match it.read_fourcc() {
            Ok(v) => v,
            Err(e) => {
                it.rewind(4);
                return Err(e);
            }
        };

        let (size, header_len) = match size32 {
            0 => (None, 8),
            1 => match it.read_u64() {
                Ok(v) => (Some(v), 16),
                Err(e) => {
                    it.rewind(8);
                    return Err(e);
                }
            },
            _ => (Some(u64::from(size32)), 8),
        };

        Ok(BoxHeader {
            typ,
            offset,
            size,
            header_len,
        })
    }

    pub fn payload_size(&self) -> Option<u64> {
        self.size.map(|v| v.saturating_sub(self.header_len))
    }
}

// Parsed subtree. `payload` borrows from the buffered box bytes;
// identity is the absolute offset within the source.
#[derive(Debug)]
pub struct BoxTree<'a> {
    pub typ: BoxType,
    pub offset: u64,
    pub size: u64,
    pub payload: &'a [u8],
    pub children: Vec<BoxTree<'a>>,
}

impl<'a> BoxTree<'a> {
    // Parses one fully buffered box, descending into known containers.
    pub fn parse(data: &'a [u8], offset: u64) -> Result<BoxTree<'a>, BoxError> {
        let mut it = ByteIterator::new(data, offset);
        let header = BoxHeader::parse(&mut it).map_err(|_| BoxError::Truncated(offset))?;
        let size = header.size.unwrap_or(
            u64::try_from(data.len()).expect("u64 fit usize"),
        );
        if size < header.header_len {
            return Err(BoxError::SizeTooSmall(header.typ, offset, size));
        }
        let payload_len = usize::try_from(size - header.header_len).expect("usize fit size");
        let header_len = usize::try_from(header.header_len).expect("usize fit header");
        if header_len + payload_len > data.len() {
            return Err(BoxError::Truncated(offset));
        }
        let payload = &data[header_len..header_len + payload_len];

        let mut children = Vec::new();
        if CONTAINER_TYPES.contains(&header.typ) {
            children = parse_children(payload, offset + header.header_len)
                .map_err(|_| BoxError::ChildOverflow(header.typ, offset))?;
        }

        Ok(BoxTree {
            typ: header.typ,
            offset,
            size,
            payload,
            children,
        })
    }

    #[must_use]
    pub fn child(&self, typ: BoxType) -> Option<&BoxTree<'a>> {
        self.children.iter().find(|c| c.typ == typ)
    }

    pub fn children_of(&self, typ: BoxType) -> impl Iterator<Item = &BoxTree<'a>> {
        self.children.iter().filter(move |c| c.typ == typ)
    }

    // Finds `typ` along a path of containers, e.g. mdia > minf > stbl.
    #[must_use]
    pub fn find(&self, path: &[BoxType]) -> Option<&BoxTree<'a>> {
        let mut node = self;
        for typ in path {
            node = node.child(*typ)?;
        }
        Some(node)
    }
}

// Also used for sample-entry children, whose parents carry
// fixed fields before the first child box.
pub(crate) fn parse_children(payload: &[u8], base: u64) -> Result<Vec<BoxTree>, BoxError> {
    let mut children = Vec::new();
    let mut pos: usize = 0;
    while pos < payload.len() {
        let offset = base + u64::try_from(pos).expect("u64 fit usize");
        let child = BoxTree::parse(&payload[pos..], offset)?;
        let child_size = usize::try_from(child.size).expect("usize fit size");
        if child_size == 0 || pos + child_size > payload.len() {
            return Err(BoxError::ChildOverflow(child.typ, offset));
        }
        pos += child_size;
        children.push(child);
    }
    Ok(children)
}
