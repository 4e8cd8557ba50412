//! Plain-text coordinate files.
//!
//! One entry per line, whitespace separated: `x y b` for dislocations and
//! `x y` for point defects. Values are written with 16 digits after the
//! decimal point in C scientific notation.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::dislocation::{Dislocation, PointDefect};
use crate::error::{Result, SimulationError};
use crate::format::{general, scientific};

const DIGITS: usize = 16;

/// Extension of sub-configuration snapshots.
pub const CHECKPOINT_SUFFIX: &str = "dconf";

fn parse_records<const N: usize>(path: &Path, text: &str) -> Result<Vec<[f64; N]>> {
    let mut records = Vec::new();
    let mut pending = [0.0; N];
    let mut filled = 0;
    let mut last_line = 0;
    for (index, line) in text.lines().enumerate() {
        last_line = index + 1;
        for token in line.split_whitespace() {
            pending[filled] =
                token
                    .parse()
                    .map_err(|_| SimulationError::MalformedConfiguration {
                        path: path.to_path_buf(),
                        line: index + 1,
                        reason: format!("'{token}' is not a number"),
                    })?;
            filled += 1;
            if filled == N {
                records.push(pending);
                filled = 0;
            }
        }
    }
    if filled != 0 {
        return Err(SimulationError::MalformedConfiguration {
            path: path.to_path_buf(),
            line: last_line,
            reason: format!("incomplete entry, expected {N} values and found {filled}"),
        });
    }
    Ok(records)
}

fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|err| SimulationError::io(path, err))
}

pub fn parse_dislocations(path: &Path, text: &str) -> Result<Vec<Dislocation>> {
    Ok(parse_records::<3>(path, text)?
        .into_iter()
        .map(|[x, y, b]| Dislocation::new(x, y, b))
        .collect())
}

pub fn read_dislocations(path: impl AsRef<Path>) -> Result<Vec<Dislocation>> {
    let path = path.as_ref();
    parse_dislocations(path, &read_text(path)?)
}

pub fn read_point_defects(path: impl AsRef<Path>) -> Result<Vec<PointDefect>> {
    let path = path.as_ref();
    Ok(parse_records::<2>(path, &read_text(path)?)?
        .into_iter()
        .map(|[x, y]| PointDefect::new(x, y))
        .collect())
}

fn write_lines<I>(path: &Path, lines: I) -> Result<()>
where
    I: IntoIterator<Item = String>,
{
    let wrap = |err| SimulationError::io(path, err);
    let mut writer = BufWriter::new(File::create(path).map_err(wrap)?);
    for line in lines {
        writeln!(writer, "{line}").map_err(wrap)?;
    }
    writer.flush().map_err(wrap)
}

pub fn write_dislocations(path: impl AsRef<Path>, dislocations: &[Dislocation]) -> Result<()> {
    write_lines(
        path.as_ref(),
        dislocations.iter().map(|d| {
            format!(
                "{} {} {}",
                scientific(d.x, DIGITS),
                scientific(d.y, DIGITS),
                scientific(d.b, DIGITS)
            )
        }),
    )
}

pub fn write_point_defects(path: impl AsRef<Path>, points: &[PointDefect]) -> Result<()> {
    write_lines(
        path.as_ref(),
        points
            .iter()
            .map(|p| format!("{} {}", scientific(p.x, DIGITS), scientific(p.y, DIGITS))),
    )
}

/// Snapshot path for simulation time `time` inside `directory`.
pub fn checkpoint_path(directory: &Path, time: f64) -> PathBuf {
    directory.join(format!("{}.{CHECKPOINT_SUFFIX}", general(time, DIGITS)))
}
