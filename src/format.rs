//! Program image files
use std::path::Path;

use anyhow::{Context, Result};

use crate::update::record::{Record, Records};

/// Data bytes per generated hex line.
const LINE_BYTES: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// ASCII hex lines, fed to the update engine as they are.
    Hex,
    /// Raw record stream, wrapped into hex lines on load.
    Binary,
}

/// Reads an image file, returning hex text ready for the update engine.
pub fn read_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p).with_context(|| format!("reading {}", p.display()))?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        ImageFormat::Hex => Ok(raw),
        ImageFormat::Binary => Ok(binary_to_hex(&raw)?.into_bytes()),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> ImageFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["hex", "ihex", "isp"].contains(&&*ext) {
        return ImageFormat::Hex;
    }

    let text = raw
        .iter()
        .all(|&c| c.is_ascii_hexdigit() || c == b':' || c.is_ascii_whitespace());
    if raw.first() == Some(&b':') && text {
        ImageFormat::Hex
    } else {
        ImageFormat::Binary
    }
}

/// Wraps a raw record stream into hex lines with valid checksums. Streams
/// past 64 KiB get extended linear address lines.
pub fn binary_to_hex(raw: &[u8]) -> Result<String> {
    let mut lines = Vec::with_capacity(raw.len() / LINE_BYTES + 2);
    let mut upper = 0u16;
    for (i, chunk) in raw.chunks(LINE_BYTES).enumerate() {
        let address = i * LINE_BYTES;
        let segment = u16::try_from(address >> 16).context("image larger than 4 GiB")?;
        if segment != upper {
            lines.push(ihex::Record::ExtendedLinearAddress(segment));
            upper = segment;
        }
        lines.push(ihex::Record::Data {
            offset: address as u16,
            value: chunk.to_vec(),
        });
    }
    lines.push(ihex::Record::EndOfFile);
    Ok(ihex::create_object_file_representation(&lines)?)
}

/// Encodes records into a hex image. The end line stands in for an explicit
/// end-of-records record.
pub fn records_to_hex(records: &[Record]) -> Result<String> {
    let mut raw = Vec::new();
    for record in records.iter().filter(|r| **r != Record::EndOfRecords) {
        raw.extend(record.encode()?);
    }
    binary_to_hex(&raw)
}

/// Result of a dry decode of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub lines: usize,
    pub records: Vec<Record>,
}

/// Validates line checksums and decodes every record without touching a bus.
pub fn inspect(text: &str) -> Result<Inspection> {
    let mut lines = 0;
    for (n, line) in ihex::Reader::new(text).enumerate() {
        line.with_context(|| format!("line {}", n + 1))?;
        lines += 1;
    }

    let records = Records::new(text.bytes())
        .collect::<crate::Result<Vec<_>>>()
        .context("decoding records")?;
    anyhow::ensure!(
        records.last() == Some(&Record::EndOfRecords),
        "image has no end-of-records marker"
    );
    Ok(Inspection { lines, records })
}
