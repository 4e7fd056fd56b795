// src/structure_io.rs
//
// =============================================================================
// ATOMFLOW: CANONICAL EXTENDED-XYZ CODEC (v 0.1)
// =============================================================================
//
// The sole on-disk format for structure batches and trajectories. Extended-XYZ
// with exactly three per-atom columns, in this order: symbols, positions,
// move_mask. The comment line carries the lattice and PBC flags. This file
// is the sole input to MD5 hashing, so the writer must be fully deterministic
// (fixed float formatting, fixed column order, no incidental whitespace).

use crate::core::Structure;
use crate::error::CoreResult;
use serde_json::Value;
use std::fmt::Write as _;
use std::io::{BufRead, Write};

/// `Lattice="ax ay az bx by bz cx cy cz" Properties=species:S:1:pos:R:3:move_mask:L:1 pbc="T T T" key=value ...`
///
/// Trailing `key=value` tokens carry `Structure::info`: only scalar
/// (string/number/bool) entries round-trip, written in sorted key order so
/// the comment line stays deterministic for the content hash. Structures
/// passed through `canonicalize()` have an empty `info`, so this never
/// touches the content-addressed store's hashed bytes.
fn write_comment(out: &mut String, s: &Structure) {
    write!(out, "Lattice=\"").unwrap();
    for (i, row) in s.cell.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        write!(out, "{} {} {}", fmt_f64(row[0]), fmt_f64(row[1]), fmt_f64(row[2])).unwrap();
    }
    out.push_str("\" Properties=species:S:1:pos:R:3:move_mask:L:1 pbc=\"");
    for (i, p) in s.pbc.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push(if *p { 'T' } else { 'F' });
    }
    out.push('"');
    write_info(out, &s.info);
}

fn write_info(out: &mut String, info: &std::collections::HashMap<String, Value>) {
    let mut keys: Vec<&String> = info.keys().collect();
    keys.sort();
    for key in keys {
        let token = match &info[key] {
            Value::String(v) => v.clone(),
            Value::Number(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Null | Value::Array(_) | Value::Object(_) => continue,
        };
        write!(out, " {key}={token}").unwrap();
    }
}

/// Parses the trailing `key=value` tokens written by [`write_info`], typing
/// each value as an integer, float, bool, or string in that order.
fn parse_info(line: &str) -> std::collections::HashMap<String, Value> {
    let pbc_end = match line.find("pbc=") {
        Some(start) => match line[start..].find('"') {
            Some(open) => {
                let rest = &line[start + open + 1..];
                match rest.find('"') {
                    Some(close) => start + open + 1 + close + 1,
                    None => return Default::default(),
                }
            }
            None => return Default::default(),
        },
        None => return Default::default(),
    };

    line[pbc_end..]
        .split_whitespace()
        .filter_map(|tok| tok.split_once('='))
        .map(|(k, v)| {
            let value = if let Ok(i) = v.parse::<i64>() {
                Value::from(i)
            } else if let Ok(f) = v.parse::<f64>() {
                Value::from(f)
            } else if let Ok(b) = v.parse::<bool>() {
                Value::from(b)
            } else {
                Value::String(v.to_string())
            };
            (k.to_string(), value)
        })
        .collect()
}

fn fmt_f64(x: f64) -> String {
    // Fixed precision so that semantically-equal structures always produce
    // byte-identical XYZ, which is the contract the content hash depends on.
    format!("{:.10}", x)
}

/// Writes one frame in canonical column order, including any scalar
/// `Structure::info` entries as trailing `key=value` tokens on the comment
/// line.
pub fn write_frame(out: &mut impl Write, s: &Structure) -> CoreResult<()> {
    writeln!(out, "{}", s.natoms())?;
    let mut comment = String::new();
    write_comment(&mut comment, s);
    writeln!(out, "{comment}")?;
    for i in 0..s.natoms() {
        let p = s.positions[i];
        let mobile = s.move_mask.get(i).copied().unwrap_or(true);
        writeln!(
            out,
            "{:<3} {} {} {} {}",
            s.symbols[i],
            fmt_f64(p[0]),
            fmt_f64(p[1]),
            fmt_f64(p[2]),
            if mobile { "T" } else { "F" }
        )?;
    }
    Ok(())
}

pub fn write_batch(out: &mut impl Write, batch: &[Structure]) -> CoreResult<()> {
    for s in batch {
        write_frame(out, s)?;
    }
    Ok(())
}

/// Parses one `Lattice="..." ... pbc="T T T"` comment line.
fn parse_comment(line: &str) -> CoreResult<([[f64; 3]; 3], [bool; 3])> {
    let lattice_str = extract_quoted(line, "Lattice=").ok_or_else(|| {
        crate::error::CoreError::Configuration("canonical xyz: missing Lattice=".into())
    })?;
    let nums: Vec<f64> = lattice_str
        .split_whitespace()
        .map(|t| t.parse::<f64>().unwrap_or(0.0))
        .collect();
    if nums.len() != 9 {
        return Err(crate::error::CoreError::Configuration(
            "canonical xyz: Lattice must have 9 values".into(),
        ));
    }
    let cell = [
        [nums[0], nums[1], nums[2]],
        [nums[3], nums[4], nums[5]],
        [nums[6], nums[7], nums[8]],
    ];

    let pbc_str = extract_quoted(line, "pbc=").ok_or_else(|| {
        crate::error::CoreError::Configuration("canonical xyz: missing pbc=".into())
    })?;
    let flags: Vec<bool> = pbc_str.split_whitespace().map(|t| t == "T").collect();
    if flags.len() != 3 {
        return Err(crate::error::CoreError::Configuration(
            "canonical xyz: pbc must have 3 flags".into(),
        ));
    }
    Ok((cell, [flags[0], flags[1], flags[2]]))
}

fn extract_quoted<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    let rest = rest.strip_prefix('"')?;
    let end = rest.find('"')?;
    Some(&rest[..end])
}

/// Reads `n` canonical frames from `input`. Each frame is: count line,
/// comment line, `n` atom lines.
pub fn read_frames(input: impl BufRead, mut n: Option<usize>) -> CoreResult<Vec<Structure>> {
    let mut lines = input.lines();
    let mut out = Vec::new();

    loop {
        if let Some(remaining) = n {
            if remaining == 0 {
                break;
            }
        }
        let count_line = match lines.next() {
            Some(l) => l?,
            None => break,
        };
        let count_line = count_line.trim();
        if count_line.is_empty() {
            break;
        }
        let natoms: usize = count_line.parse().map_err(|_| {
            crate::error::CoreError::Configuration(format!(
                "canonical xyz: expected atom count, got '{count_line}'"
            ))
        })?;

        let comment = lines
            .next()
            .ok_or_else(|| crate::error::CoreError::TrajectoryEmpty)??;
        let (cell, pbc) = parse_comment(&comment)?;
        let info = parse_info(&comment);

        let mut symbols = Vec::with_capacity(natoms);
        let mut positions = Vec::with_capacity(natoms);
        let mut move_mask = Vec::with_capacity(natoms);
        for _ in 0..natoms {
            let line = lines
                .next()
                .ok_or_else(|| crate::error::CoreError::TrajectoryEmpty)??;
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 5 {
                return Err(crate::error::CoreError::Configuration(format!(
                    "canonical xyz: malformed atom line '{line}'"
                )));
            }
            symbols.push(parts[0].to_string());
            let x: f64 = parts[1].parse().unwrap_or(0.0);
            let y: f64 = parts[2].parse().unwrap_or(0.0);
            let z: f64 = parts[3].parse().unwrap_or(0.0);
            positions.push([x, y, z]);
            move_mask.push(parts[4] == "T");
        }

        out.push(Structure {
            cell,
            pbc,
            symbols,
            positions,
            velocities: None,
            tags: None,
            move_mask,
            info,
        });

        if let Some(remaining) = n.as_mut() {
            *remaining -= 1;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> Structure {
        Structure {
            cell: [[10.0, 0.0, 0.0], [0.0, 10.0, 0.0], [0.0, 0.0, 10.0]],
            pbc: [true, true, false],
            symbols: vec!["Pt".into(), "O".into()],
            positions: vec![[0.0, 0.0, 0.0], [1.5, 2.5, 3.5]],
            velocities: None,
            tags: None,
            move_mask: vec![true, false],
            info: Default::default(),
        }
    }

    #[test]
    fn round_trip_identity() {
        let s = sample();
        let mut buf = Vec::new();
        write_frame(&mut buf, &s).unwrap();
        let back = read_frames(Cursor::new(&buf), None).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0], s);
        assert_eq!(back[0].move_mask, s.move_mask);
    }

    #[test]
    fn info_round_trips_through_comment_line() {
        let mut s = sample();
        s.info.insert("wdir".into(), serde_json::Value::String("cand3".into()));
        s.info.insert("energy".into(), serde_json::json!(-12.5));

        let mut buf = Vec::new();
        write_frame(&mut buf, &s).unwrap();
        let back = read_frames(Cursor::new(&buf), None).unwrap();

        assert_eq!(back[0].info.get("wdir").and_then(|v| v.as_str()), Some("cand3"));
        assert_eq!(back[0].info.get("energy").and_then(|v| v.as_f64()), Some(-12.5));
    }

    #[test]
    fn deterministic_bytes_for_equal_batches() {
        let mut a = sample();
        let mut b = sample();
        a.info.insert("confid".into(), serde_json::Value::from(1));
        b.info.insert("step".into(), serde_json::Value::from(99));
        let ca = a.canonicalize();
        let cb = b.canonicalize();

        let mut buf_a = Vec::new();
        let mut buf_b = Vec::new();
        write_frame(&mut buf_a, &ca).unwrap();
        write_frame(&mut buf_b, &cb).unwrap();
        assert_eq!(buf_a, buf_b);
    }
}
