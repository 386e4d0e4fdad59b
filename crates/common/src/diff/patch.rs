use yrs::{Text, TextRef, TransactionMut};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextPatchOp {
    Insert { index: u32, text: String },
    Delete { index: u32, len: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharEdit {
    Keep(char),
    Insert(char),
    Delete(char),
}

/// Computes splice operations turning `old_text` into `new_text`.
///
/// Indices are UTF-8 byte offsets into the *original* text, matching the
/// default `yrs::Text` offset kind. Operations are ordered by position and
/// must be applied in sequence with [`apply_patch_ops`].
pub fn diff_to_patch_ops(old_text: &str, new_text: &str) -> Vec<TextPatchOp> {
    if old_text == new_text {
        return Vec::new();
    }

    let old_chars: Vec<char> = old_text.chars().collect();
    let new_chars: Vec<char> = new_text.chars().collect();

    let prefix = old_chars.iter().zip(&new_chars).take_while(|(a, b)| a == b).count();
    let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
    let suffix = old_chars
        .iter()
        .rev()
        .zip(new_chars.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();

    let old_middle = &old_chars[prefix..old_chars.len() - suffix];
    let new_middle = &new_chars[prefix..new_chars.len() - suffix];
    let mut edits: Vec<CharEdit> = old_chars[..prefix].iter().copied().map(CharEdit::Keep).collect();
    match shortest_edit_script(old_middle, new_middle) {
        Some(script) => edits.extend(script),
        None => {
            edits.extend(old_middle.iter().copied().map(CharEdit::Delete));
            edits.extend(new_middle.iter().copied().map(CharEdit::Insert));
        }
    }
    edits_to_patch_ops(&edits)
}

/// Applies splice operations inside an open write transaction.
pub fn apply_patch_ops(txn: &mut TransactionMut, ytext: &TextRef, patch_ops: &[TextPatchOp]) {
    let mut shift: i64 = 0;

    for patch_op in patch_ops {
        match patch_op {
            TextPatchOp::Delete { index, len } => {
                ytext.remove_range(txn, shifted(*index, shift), *len);
                shift -= i64::from(*len);
            }
            TextPatchOp::Insert { index, text } => {
                ytext.insert(txn, shifted(*index, shift), text);
                shift += text.len() as i64;
            }
        }
    }
}

fn shifted(index: u32, shift: i64) -> u32 {
    u32::try_from(i64::from(index) + shift).expect("patch operation produced negative index after offset adjustment")
}

/// Edit distance past which the differing middle is replaced wholesale.
const MAX_EDIT_DISTANCE: usize = 1024;

/// Myers O(ND) shortest edit script over the differing middle section, or
/// `None` when it needs more than [`MAX_EDIT_DISTANCE`] edits.
fn shortest_edit_script(old: &[char], new: &[char]) -> Option<Vec<CharEdit>> {
    if old.is_empty() {
        return Some(new.iter().copied().map(CharEdit::Insert).collect());
    }
    if new.is_empty() {
        return Some(old.iter().copied().map(CharEdit::Delete).collect());
    }

    let n = old.len() as isize;
    let m = new.len() as isize;
    let limit = (old.len() + new.len()).min(MAX_EDIT_DISTANCE) as isize;
    let offset = limit + 1;
    let mut frontier = vec![0isize; (2 * limit + 3) as usize];
    // Only diagonals -d..=d are live at step d.
    let mut history: Vec<Vec<isize>> = Vec::new();
    let mut found = false;

    'search: for d in 0..=limit {
        history.push(frontier[(offset - d) as usize..=(offset + d) as usize].to_vec());
        for k in (-d..=d).step_by(2) {
            let down = k == -d
                || (k != d && frontier[(k - 1 + offset) as usize] < frontier[(k + 1 + offset) as usize]);
            let mut x = if down {
                frontier[(k + 1 + offset) as usize]
            } else {
                frontier[(k - 1 + offset) as usize] + 1
            };
            let mut y = x - k;
            while x < n && y < m && old[x as usize] == new[y as usize] {
                x += 1;
                y += 1;
            }
            frontier[(k + offset) as usize] = x;
            if x >= n && y >= m {
                found = true;
                break 'search;
            }
        }
    }
    if !found {
        return None;
    }

    let mut edits = Vec::with_capacity(old.len() + new.len());
    let (mut x, mut y) = (n, m);
    for d in (0..history.len() as isize).rev() {
        let v = &history[d as usize];
        let at = |k: isize| v[(k + d) as usize];
        let k = x - y;
        let prev_k = if d == 0 {
            0
        } else if k == -d || (k != d && at(k - 1) < at(k + 1)) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = if d == 0 { 0 } else { at(prev_k) };
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            x -= 1;
            y -= 1;
            edits.push(CharEdit::Keep(old[x as usize]));
        }
        if d == 0 {
            break;
        }
        if x == prev_x {
            y -= 1;
            edits.push(CharEdit::Insert(new[y as usize]));
        } else {
            x -= 1;
            edits.push(CharEdit::Delete(old[x as usize]));
        }
    }

    edits.reverse();
    Some(edits)
}

fn edits_to_patch_ops(edits: &[CharEdit]) -> Vec<TextPatchOp> {
    let mut patch_ops: Vec<TextPatchOp> = Vec::new();
    let mut cursor = 0u32;

    for edit in edits {
        match *edit {
            CharEdit::Keep(ch) => cursor += ch.len_utf8() as u32,
            CharEdit::Delete(ch) => {
                let width = ch.len_utf8() as u32;
                match patch_ops.last_mut() {
                    Some(TextPatchOp::Delete { index, len }) if *index + *len == cursor => {
                        *len += width;
                    }
                    _ => patch_ops.push(TextPatchOp::Delete { index: cursor, len: width }),
                }
                cursor += width;
            }
            CharEdit::Insert(ch) => match patch_ops.last_mut() {
                Some(TextPatchOp::Insert { index, text }) if *index == cursor => text.push(ch),
                _ => patch_ops.push(TextPatchOp::Insert { index: cursor, text: ch.to_string() }),
            },
        }
    }

    patch_ops
}
