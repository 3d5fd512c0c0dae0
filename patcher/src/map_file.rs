// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Linker map parsing
//!
//! The toolchain's map file lists every placed section with its execution
//! address, load address, size and kind. Only those lines matter here; the
//! rest of the file (symbol tables, cross references, totals) is skipped.
//! The section kinds classify the address space into executable and data
//! ranges, which the relocator uses to decide whether a word is a code
//! pointer or a data pointer.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Code,
    Data,
    Zero,
    Other,
}

impl SectionKind {
    fn classify(word: &str) -> SectionKind {
        match word {
            "Code" => SectionKind::Code,
            "Data" => SectionKind::Data,
            "Zero" => SectionKind::Zero,
            _ => SectionKind::Other,
        }
    }
}

/// One placed section from the map file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub start: u32,
    pub size: u32,
    pub kind: SectionKind,
}

/// A half-open address interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub start: u32,
    pub end: u32,
}

impl AddressRange {
    pub fn contains(self, addr: u32) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Linear membership test; the range lists are a handful of entries.
pub fn contains(ranges: &[AddressRange], addr: u32) -> bool {
    ranges.iter().any(|r| r.contains(addr))
}

#[derive(Debug, Default)]
pub struct MapFile {
    pub sections: BTreeMap<String, Section>,
}

impl MapFile {
    pub fn parse(path: &Path) -> Result<MapFile, PatchError> {
        let text = fs::read_to_string(path).map_err(|source| PatchError::MapUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(MapFile::parse_str(&text))
    }

    /// Lines that do not have the section shape are skipped silently.
    /// Duplicate section names keep the last occurrence, which is the
    /// linker's own convention.
    pub fn parse_str(text: &str) -> MapFile {
        let mut sections = BTreeMap::new();
        for line in text.lines() {
            if let Some((name, section)) = parse_section_line(line) {
                sections.insert(name, section);
            }
        }
        MapFile { sections }
    }

    /// Ranges a valid code pointer may point into.
    pub fn executable_ranges(&self) -> Vec<AddressRange> {
        self.ranges_of(|kind| kind == SectionKind::Code)
    }

    /// Ranges a valid data pointer may point into.
    pub fn data_ranges(&self) -> Vec<AddressRange> {
        self.ranges_of(|kind| matches!(kind, SectionKind::Data | SectionKind::Zero))
    }

    fn ranges_of(&self, pred: impl Fn(SectionKind) -> bool) -> Vec<AddressRange> {
        self.sections
            .values()
            .filter(|s| pred(s.kind))
            .map(|s| AddressRange {
                start: s.start,
                end: s.start.wrapping_add(s.size),
            })
            .collect()
    }
}

/// Recognizes a section line: execution address, load address, size, kind,
/// attribute, index, object file, section name. Anything else is `None`.
fn parse_section_line(line: &str) -> Option<(String, Section)> {
    let mut tokens = line.split_whitespace();
    let start = parse_hex(tokens.next()?)?;
    if !is_hex_or_dash(tokens.next()?) {
        return None;
    }
    let size = parse_hex(tokens.next()?)?;
    let kind = tokens.next()?;
    if !is_word(kind) {
        return None;
    }
    if !is_word(tokens.next()?) {
        return None;
    }
    if !tokens.next()?.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let _object = tokens.next()?;
    let name = section_name(tokens.next()?)?;
    Some((
        name,
        Section {
            start,
            size,
            kind: SectionKind::classify(kind),
        },
    ))
}

fn parse_hex(token: &str) -> Option<u32> {
    let digits = token.strip_prefix("0x")?;
    u32::from_str_radix(digits, 16).ok()
}

fn is_hex_or_dash(token: &str) -> bool {
    token.strip_prefix("0x").is_some_and(|rest| {
        !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_hexdigit() || b == b'-')
    })
}

fn is_word(token: &str) -> bool {
    token.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// The name column is the leading run of section-name characters; trailing
/// annotations do not disqualify the line.
fn section_name(token: &str) -> Option<String> {
    let end = token
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '$')))
        .unwrap_or(token.len());
    (end > 0).then(|| token[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MAP: &str = "\
  Memory Map of the image

    Exec Addr    Load Addr    Size         Type   Attr      Idx    Object            Section Name

    0x00000000   0x00000000   0x00000130   Code   RO   3    startup_m480.o    RESET
    0x00000130   0x00000130   0x00000824   Code   RO   241  main.o            .text
    0x20000000   0x00000954   0x00000040   Data   RW   242  main.o            .data
    0x20000040   0x00000994   0x00000200   Zero   RW   243  main.o            .bss
    0x20000240   0x00000994   0x00000020   PAD
";

    #[test]
    fn parses_section_lines_and_skips_the_rest() {
        let map = MapFile::parse_str(MAP);
        assert_eq!(map.sections.len(), 4);
        assert_eq!(
            map.sections["RESET"],
            Section {
                start: 0,
                size: 0x130,
                kind: SectionKind::Code
            }
        );
        assert_eq!(map.sections[".bss"].kind, SectionKind::Zero);
        assert!(!map.sections.contains_key("PAD"));
    }

    #[test]
    fn classifies_ranges() {
        let map = MapFile::parse_str(MAP);
        let exec = map.executable_ranges();
        let data = map.data_ranges();
        assert_eq!(exec.len(), 2);
        assert_eq!(data.len(), 2);
        assert!(contains(&exec, 0x131));
        assert!(!contains(&exec, 0x954));
        assert!(contains(&data, 0x2000_0000));
        assert!(contains(&data, 0x2000_0100));
        assert!(!contains(&data, 0x2000_0240));
    }

    #[test]
    fn duplicate_names_keep_the_last_entry() {
        let text = "\
    0x00000000   0x00000000   0x00000100   Code   RO   1    a.o    .text
    0x00001000   0x00001000   0x00000200   Code   RO   2    b.o    .text
";
        let map = MapFile::parse_str(text);
        assert_eq!(map.sections.len(), 1);
        assert_eq!(map.sections[".text"].start, 0x1000);
    }

    #[test]
    fn unknown_kind_is_other() {
        let text = "    0x00000000   0x00000000   0x00000100   Ro   RO   1    a.o    .rodata\n";
        let map = MapFile::parse_str(text);
        assert_eq!(map.sections[".rodata"].kind, SectionKind::Other);
        assert!(map.executable_ranges().is_empty());
        assert!(map.data_ranges().is_empty());
    }

    #[test]
    fn reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MAP.as_bytes()).unwrap();
        let map = MapFile::parse(file.path()).unwrap();
        assert_eq!(map.sections.len(), 4);
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = MapFile::parse(Path::new("/nonexistent/fw.map")).unwrap_err();
        assert!(matches!(err, PatchError::MapUnreadable { .. }));
    }
}
