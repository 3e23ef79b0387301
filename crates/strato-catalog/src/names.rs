//! Filename codec for persisted artifacts.
//!
//! Every artifact the catalog manages is named by this module, and replay
//! classifies directory entries with the inverse parsers. Parsing is the
//! exact inverse of encoding on the set of valid names; names that do not
//! parse are classified as [`FileKind::Other`].

use std::path::Path;

use strato_common::{BlockId, SegmentId, TableId, Version};

/// Extension of table checkpoint files.
pub const TABLE_CKP_EXT: &str = "tckp";
/// Extension of info checkpoint files.
pub const INFO_CKP_EXT: &str = "ickp";
/// Extension of block payload files.
pub const BLOCK_EXT: &str = "blk";
/// Extension of sorted segment files.
pub const SEGMENT_EXT: &str = "seg";

/// Classification of a managed file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    /// Table catalog checkpoint.
    TableCkp(TableId, Version),
    /// Global catalog checkpoint.
    InfoCkp(Version),
    /// Column block payload.
    Block(TableId, SegmentId, BlockId),
    /// Merged sorted segment.
    Segment(TableId, SegmentId),
    /// Anything else in the managed directory.
    Other,
}

/// Encodes a table checkpoint filename.
pub fn table_ckp_name(table: TableId, version: Version) -> String {
    format!(
        "tbl_{:08x}_{:016x}.{}",
        table.as_u64(),
        version.as_u64(),
        TABLE_CKP_EXT
    )
}

/// Encodes an info checkpoint filename.
pub fn info_ckp_name(version: Version) -> String {
    format!("info_{:016x}.{}", version.as_u64(), INFO_CKP_EXT)
}

/// Encodes a block payload filename.
pub fn block_name(table: TableId, segment: SegmentId, block: BlockId) -> String {
    format!(
        "blk_{:08x}_{:08x}_{:08x}.{}",
        table.as_u64(),
        segment.as_u64(),
        block.as_u64(),
        BLOCK_EXT
    )
}

/// Encodes a sorted segment filename.
pub fn segment_name(table: TableId, segment: SegmentId) -> String {
    format!(
        "seg_{:08x}_{:08x}.{}",
        table.as_u64(),
        segment.as_u64(),
        SEGMENT_EXT
    )
}

/// Parses a table checkpoint filename.
///
/// Parsing is lenient about zero padding, so a hand-renamed or legacy
/// file can collide with a canonically-named one; replay treats such a
/// collision as corruption.
pub fn parse_table_ckp_name(name: &str) -> Option<(TableId, Version)> {
    let stem = strip_ext(name, TABLE_CKP_EXT)?;
    let rest = stem.strip_prefix("tbl_")?;
    let (table, version) = split2(rest)?;
    Some((
        TableId::new(parse_hex(table)?),
        Version::new(parse_hex(version)?),
    ))
}

/// Parses an info checkpoint filename.
pub fn parse_info_ckp_name(name: &str) -> Option<Version> {
    let stem = strip_ext(name, INFO_CKP_EXT)?;
    let rest = stem.strip_prefix("info_")?;
    Some(Version::new(parse_hex(rest)?))
}

/// Parses a block payload filename.
pub fn parse_block_name(name: &str) -> Option<(TableId, SegmentId, BlockId)> {
    let stem = strip_ext(name, BLOCK_EXT)?;
    let rest = stem.strip_prefix("blk_")?;
    let mut parts = rest.split('_');
    let table = parse_hex(parts.next()?)?;
    let segment = parse_hex(parts.next()?)?;
    let block = parse_hex(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some((
        TableId::new(table),
        SegmentId::new(segment),
        BlockId::new(block),
    ))
}

/// Parses a sorted segment filename.
pub fn parse_segment_name(name: &str) -> Option<(TableId, SegmentId)> {
    let stem = strip_ext(name, SEGMENT_EXT)?;
    let rest = stem.strip_prefix("seg_")?;
    let (table, segment) = split2(rest)?;
    Some((
        TableId::new(parse_hex(table)?),
        SegmentId::new(parse_hex(segment)?),
    ))
}

/// Classifies a filename in a managed directory.
pub fn classify(path: &Path) -> FileKind {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return FileKind::Other;
    };
    if let Some((table, version)) = parse_table_ckp_name(name) {
        return FileKind::TableCkp(table, version);
    }
    if let Some(version) = parse_info_ckp_name(name) {
        return FileKind::InfoCkp(version);
    }
    if let Some((table, segment, block)) = parse_block_name(name) {
        return FileKind::Block(table, segment, block);
    }
    if let Some((table, segment)) = parse_segment_name(name) {
        return FileKind::Segment(table, segment);
    }
    FileKind::Other
}

fn strip_ext<'a>(name: &'a str, ext: &str) -> Option<&'a str> {
    let stem = name.strip_suffix(ext)?;
    stem.strip_suffix('.')
}

fn split2(s: &str) -> Option<(&str, &str)> {
    let mut parts = s.split('_');
    let a = parts.next()?;
    let b = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some((a, b))
}

fn parse_hex(s: &str) -> Option<u64> {
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    u64::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ckp_round_trip() {
        let name = table_ckp_name(TableId::new(1), Version::new(3));
        assert_eq!(name, "tbl_00000001_0000000000000003.tckp");
        assert_eq!(
            parse_table_ckp_name(&name),
            Some((TableId::new(1), Version::new(3)))
        );
    }

    #[test]
    fn test_info_ckp_round_trip() {
        let name = info_ckp_name(Version::new(42));
        assert_eq!(parse_info_ckp_name(&name), Some(Version::new(42)));
    }

    #[test]
    fn test_block_round_trip() {
        let name = block_name(TableId::new(7), SegmentId::new(2), BlockId::new(9));
        assert_eq!(
            parse_block_name(&name),
            Some((TableId::new(7), SegmentId::new(2), BlockId::new(9)))
        );
    }

    #[test]
    fn test_segment_round_trip() {
        let name = segment_name(TableId::new(7), SegmentId::new(2));
        assert_eq!(
            parse_segment_name(&name),
            Some((TableId::new(7), SegmentId::new(2)))
        );
    }

    #[test]
    fn test_unparseable_names() {
        assert_eq!(parse_table_ckp_name("garbage.txt"), None);
        assert_eq!(parse_table_ckp_name("tbl_zz_0000000000000003.tckp"), None);
        assert_eq!(parse_info_ckp_name("info_nothex.ickp"), None);
        assert_eq!(parse_block_name("blk_00000001_00000002.blk"), None);
        assert_eq!(parse_segment_name("seg_00000001.seg"), None);
    }

    #[test]
    fn test_lenient_padding_collides() {
        // An unpadded legacy name parses to the same key as the canonical
        // one; replay detects the duplicate and treats it as corruption.
        assert_eq!(
            parse_table_ckp_name("tbl_1_2.tckp"),
            parse_table_ckp_name("tbl_00000001_0000000000000002.tckp"),
        );
    }

    #[test]
    fn test_classify() {
        let path = Path::new("/w/meta/tbl_00000001_0000000000000002.tckp");
        assert_eq!(
            classify(path),
            FileKind::TableCkp(TableId::new(1), Version::new(2))
        );

        let path = Path::new("/w/data/blk_00000001_00000001_00000001.blk");
        assert!(matches!(classify(path), FileKind::Block(..)));

        let path = Path::new("/w/data/notes.txt");
        assert_eq!(classify(path), FileKind::Other);
    }

    #[test]
    fn test_suffix_variants_do_not_parse() {
        // A stray backup suffix must not collide with the real name.
        assert_eq!(parse_table_ckp_name("tbl_00000001_0000000000000002"), None);
        assert_eq!(
            parse_table_ckp_name("tbl_00000001_0000000000000002.tckp.bak"),
            None
        );
    }
}
