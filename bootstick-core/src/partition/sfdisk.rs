//! The `sfdisk` back-end, used when tables must be written through the
//! elevation helper.
//!
//! A whole layout is rendered into one script and fed to a single elevated
//! `sfdisk` run. The script is the only place user-supplied text (GPT names)
//! is quoted.

use std::path::Path;

use super::{PartitionEntry, PartitionLayout, PartitionType};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::privilege::{Invocation, failure_text};
use crate::types::PartitionStyle;

const KIB: u64 = 1024;

/// Quotes a GPT name for the script, backslash-escaping `"` and `\`.
pub fn quote(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// One partition line, e.g. `size=262144KiB, type=C12A..., name="EFI"`.
pub fn entry_line(entry: &PartitionEntry, style: PartitionStyle) -> String {
    let mut fields = Vec::new();
    if entry.start > 0 {
        fields.push(format!("start={}KiB", entry.start.div_ceil(KIB)));
    }
    if entry.size > 0 {
        fields.push(format!("size={}KiB", entry.size.div_ceil(KIB)));
    }
    fields.push(format!("type={}", entry.resolved_type(style)));
    match style {
        PartitionStyle::Mbr if entry.bootable => fields.push("bootable".to_string()),
        PartitionStyle::Gpt if !entry.label.is_empty() => {
            fields.push(format!("name={}", quote(&entry.label)))
        }
        _ => {}
    }
    fields.join(", ")
}

/// A complete script: the label line followed by one line per partition.
pub fn layout_script(style: PartitionStyle, entries: &[PartitionEntry]) -> String {
    let label = match style {
        PartitionStyle::Mbr => "dos",
        PartitionStyle::Gpt => "gpt",
    };
    let mut script = format!("label: {label}\n");
    for entry in entries {
        script.push_str(&entry_line(entry, style));
        script.push('\n');
    }
    script
}

fn run(invocation: &Invocation, script: &str, config: &Config) -> Result<()> {
    log::debug!("sfdisk script:\n{script}");
    let output = invocation.output_with_input(config, script.as_bytes())?;
    if output.status.success() {
        Ok(())
    } else {
        Err(Error::Partition(failure_text(output.status, &output.stderr)))
    }
}

/// Replaces the table on `device` with `entries`, wiping old signatures.
pub fn apply_layout(
    device: &Path,
    style: PartitionStyle,
    entries: &[PartitionEntry],
    config: &Config,
) -> Result<()> {
    let invocation = Invocation::new("sfdisk")
        .args(["--wipe", "always", "--wipe-partitions", "always", "--lock"])
        .arg(device);
    run(&invocation, &layout_script(style, entries), config)
}

/// Appends one partition after the existing ones.
pub fn append(
    device: &Path,
    style: PartitionStyle,
    entry: &PartitionEntry,
    config: &Config,
) -> Result<()> {
    let invocation = Invocation::new("sfdisk")
        .args(["--append", "--lock"])
        .arg(device);
    let script = format!("{}\n", entry_line(entry, style));
    run(&invocation, &script, config)
}

/// Reads the table through an elevated `sfdisk --dump`.
pub fn dump(device: &Path, config: &Config) -> Result<PartitionLayout> {
    let output = Invocation::new("sfdisk")
        .arg("--dump")
        .arg(device)
        .output(config)?;
    if !output.status.success() {
        return Err(Error::Partition(failure_text(output.status, &output.stderr)));
    }
    parse_dump(&String::from_utf8_lossy(&output.stdout))
}

/// Splits a partition line's fields on commas outside quotes.
fn split_fields(spec: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = spec.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect()
}

fn parse_number(value: &str, line: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Partition(format!("unexpected sfdisk output: {line}")))
}

/// Parses `sfdisk --dump` output. Offsets in the dump are sectors.
pub fn parse_dump(text: &str) -> Result<PartitionLayout> {
    let mut style = None;
    let mut sector_size = 512;
    let mut raw = Vec::new();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some((_, spec)) = line.split_once(" : ") {
            raw.push((line, spec));
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "label" => {
                style = Some(match value.trim() {
                    "gpt" => PartitionStyle::Gpt,
                    "dos" => PartitionStyle::Mbr,
                    other => {
                        return Err(Error::Partition(format!(
                            "unsupported partition table type '{other}'"
                        )));
                    }
                })
            }
            "sector-size" => sector_size = parse_number(value, line)?,
            _ => {}
        }
    }

    let style = style.ok_or_else(|| Error::Partition("sfdisk reported no partition table".into()))?;
    let mut entries = Vec::new();
    for (line, spec) in raw {
        let mut start = 0;
        let mut size = 0;
        let mut part_type = None;
        let mut bootable = false;
        let mut label = String::new();
        for field in split_fields(spec) {
            match field.split_once('=') {
                Some(("start", v)) => start = parse_number(v, line)?,
                Some(("size", v)) => size = parse_number(v, line)?,
                Some(("type", v)) => {
                    let v = v.trim();
                    part_type = Some(match style {
                        PartitionStyle::Mbr => PartitionType::Mbr(
                            u8::from_str_radix(v, 16).map_err(|_| {
                                Error::Partition(format!("unexpected sfdisk output: {line}"))
                            })?,
                        ),
                        PartitionStyle::Gpt => PartitionType::gpt(v),
                    });
                }
                Some(("name", v)) => label = v.trim().to_string(),
                None if field == "bootable" => bootable = true,
                _ => {}
            }
        }
        let part_type = part_type
            .ok_or_else(|| Error::Partition(format!("unexpected sfdisk output: {line}")))?;
        let mut entry = PartitionEntry::observed(start * sector_size, size * sector_size, part_type);
        entry.bootable = bootable;
        entry.label = label;
        entries.push(entry);
    }

    Ok(PartitionLayout { style, entries })
}
