//! String deltas in the diff-match-patch delta format.
//!
//! A delta is a tab separated list of tokens applied left to right over the
//! origin text:
//! - `=N` keeps `N` units
//! - `-N` deletes `N` units
//! - `+text` inserts percent-encoded `text`
//!
//! Lengths are counted in UTF-16 code units, which is what the server uses.

use dissimilar::Chunk;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use super::{DiffError, Result};

/// Characters left literal in inserted text (the `encodeURI` reserved set).
const DELTA_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b' ')
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')')
    .remove(b'*')
    .remove(b'+')
    .remove(b',')
    .remove(b'-')
    .remove(b'.')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'?')
    .remove(b'@')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
enum Op {
    Equal(usize),
    Delete(usize),
    Insert(String),
}

/// A contiguous edit expressed in origin coordinates.
#[derive(Debug, Clone, Default)]
struct Hunk {
    position: usize,
    delete: usize,
    insert: String,
    insert_len: usize,
}

impl Hunk {
    fn at(position: usize) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    fn end(&self) -> usize {
        self.position + self.delete
    }

    /// Whether a local hunk cannot be rebased over this remote hunk.
    ///
    /// Editing inside a range the remote removed is a conflict, as is
    /// deleting across a point where the remote inserted text. Hunks that
    /// only meet at a border rebase cleanly.
    fn conflicts_with(&self, remote: &Hunk) -> bool {
        if remote.delete > 0 {
            self.position < remote.end() && self.end() > remote.position
        } else {
            self.position < remote.position && remote.position < self.end()
        }
    }

    /// Whether this remote hunk lands before the given local hunk.
    fn precedes(&self, local: &Hunk) -> bool {
        if self.delete > 0 {
            self.end() <= local.position
        } else {
            self.position <= local.position
        }
    }
}

pub(crate) fn utf16_len(text: &str) -> usize {
    text.encode_utf16().count()
}

fn encode_insert(text: &str) -> String {
    utf8_percent_encode(text, DELTA_ENCODE_SET).to_string()
}

fn to_delta(ops: &[Op]) -> String {
    ops.iter()
        .map(|op| match op {
            Op::Equal(n) => format!("={n}"),
            Op::Delete(n) => format!("-{n}"),
            Op::Insert(text) => format!("+{}", encode_insert(text)),
        })
        .collect::<Vec<_>>()
        .join("\t")
}

fn parse_count(token: &str, count: &str) -> Result<usize> {
    count
        .parse::<usize>()
        .map_err(|_| DiffError::InvalidDelta(format!("invalid number in delta token '{token}'")))
}

fn parse_delta(delta: &str) -> Result<Vec<Op>> {
    let mut ops = Vec::new();
    for token in delta.split('\t') {
        // blank tokens come from a trailing tab
        let Some(kind) = token.chars().next() else {
            continue;
        };
        let param = &token[kind.len_utf8()..];
        let op = match kind {
            '+' => {
                let text = percent_decode_str(param).decode_utf8().map_err(|e| {
                    DiffError::InvalidDelta(format!("invalid insert text '{param}': {e}"))
                })?;
                Op::Insert(text.into_owned())
            }
            '=' => Op::Equal(parse_count(token, param)?),
            '-' => Op::Delete(parse_count(token, param)?),
            other => {
                return Err(DiffError::InvalidDelta(format!(
                    "invalid delta operation '{other}'"
                )));
            }
        };
        ops.push(op);
    }
    Ok(ops)
}

fn hunks(ops: &[Op], origin_len: usize) -> Result<Vec<Hunk>> {
    let mut hunks = Vec::new();
    let mut position = 0usize;
    let mut current: Option<Hunk> = None;

    for op in ops {
        match op {
            Op::Equal(n) => {
                if let Some(hunk) = current.take() {
                    hunks.push(hunk);
                }
                position += n;
            }
            Op::Delete(n) => {
                let hunk = current.get_or_insert_with(|| Hunk::at(position));
                hunk.delete += n;
                position += n;
            }
            Op::Insert(text) => {
                let hunk = current.get_or_insert_with(|| Hunk::at(position));
                hunk.insert.push_str(text);
                hunk.insert_len += utf16_len(text);
            }
        }
    }
    if let Some(hunk) = current.take() {
        hunks.push(hunk);
    }

    if position != origin_len {
        return Err(DiffError::DeltaLength {
            expected: origin_len,
            actual: position,
        });
    }
    Ok(hunks)
}

/// Computes the delta turning `origin` into `target`, `None` when equal.
pub fn diff(origin: &str, target: &str) -> Option<String> {
    if origin == target {
        return None;
    }

    let ops: Vec<Op> = dissimilar::diff(origin, target)
        .into_iter()
        .map(|chunk| match chunk {
            Chunk::Equal(text) => Op::Equal(utf16_len(text)),
            Chunk::Delete(text) => Op::Delete(utf16_len(text)),
            Chunk::Insert(text) => Op::Insert(text.to_string()),
        })
        .collect();

    Some(to_delta(&ops))
}

/// Applies `delta` to `origin`.
///
/// The delta must account for every unit of the origin.
pub fn apply(origin: &str, delta: &str) -> Result<String> {
    let units: Vec<u16> = origin.encode_utf16().collect();
    let mut result: Vec<u16> = Vec::with_capacity(units.len());
    let mut cursor = 0usize;

    for op in parse_delta(delta)? {
        match op {
            Op::Equal(n) | Op::Delete(n) => {
                let end = cursor + n;
                if end > units.len() {
                    return Err(DiffError::DeltaLength {
                        expected: units.len(),
                        actual: end,
                    });
                }
                if matches!(op, Op::Equal(_)) {
                    result.extend_from_slice(&units[cursor..end]);
                }
                cursor = end;
            }
            Op::Insert(text) => result.extend(text.encode_utf16()),
        }
    }

    if cursor != units.len() {
        return Err(DiffError::DeltaLength {
            expected: units.len(),
            actual: cursor,
        });
    }

    String::from_utf16(&result)
        .map_err(|_| DiffError::InvalidDelta("delta splits a surrogate pair".to_string()))
}

/// Rebases the `local` delta so it applies to `origin` after `remote` was
/// applied to it.
pub fn transform(local: &str, remote: &str, origin: &str) -> Result<String> {
    let origin_len = utf16_len(origin);
    let local_hunks = hunks(&parse_delta(local)?, origin_len)?;
    let remote_hunks = hunks(&parse_delta(remote)?, origin_len)?;

    let rebased_len = remote_hunks
        .iter()
        .fold(origin_len, |len, hunk| len + hunk.insert_len - hunk.delete);

    let mut ops = Vec::new();
    let mut cursor = 0usize;

    for hunk in &local_hunks {
        let mut inserted = 0usize;
        let mut deleted = 0usize;
        for remote in &remote_hunks {
            if hunk.conflicts_with(remote) {
                return Err(DiffError::Conflict {
                    position: hunk.position,
                });
            }
            if remote.precedes(hunk) {
                inserted += remote.insert_len;
                deleted += remote.delete;
            }
        }

        let position = hunk.position + inserted - deleted;
        if position > cursor {
            ops.push(Op::Equal(position - cursor));
        }
        if hunk.delete > 0 {
            ops.push(Op::Delete(hunk.delete));
        }
        if !hunk.insert.is_empty() {
            ops.push(Op::Insert(hunk.insert.clone()));
        }
        cursor = position + hunk.delete;
    }

    if rebased_len > cursor {
        ops.push(Op::Equal(rebased_len - cursor));
    }

    Ok(to_delta(&ops))
}
