//! Line-based unified diff for patch and conflict artifacts.

const CONTEXT: usize = 3;
/// Above this many LCS cells the diff degrades to one whole-file hunk.
const MAX_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Equal(usize, usize),
    Delete(usize),
    Insert(usize),
}

fn line_ops(old: &[&str], new: &[&str]) -> Vec<Op> {
    let (n, m) = (old.len(), new.len());
    if n.saturating_mul(m) > MAX_CELLS {
        let mut ops: Vec<Op> = (0..n).map(Op::Delete).collect();
        ops.extend((0..m).map(Op::Insert));
        return ops;
    }

    // lcs[i][j]: length of the LCS of old[i..] and new[j..].
    let width = m + 1;
    let mut lcs = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i * width + j] = if old[i] == new[j] {
                lcs[(i + 1) * width + j + 1] + 1
            } else {
                lcs[(i + 1) * width + j].max(lcs[i * width + j + 1])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(Op::Equal(i, j));
            i += 1;
            j += 1;
        } else if lcs[(i + 1) * width + j] >= lcs[i * width + j + 1] {
            ops.push(Op::Delete(i));
            i += 1;
        } else {
            ops.push(Op::Insert(j));
            j += 1;
        }
    }
    ops.extend((i..n).map(Op::Delete));
    ops.extend((j..m).map(Op::Insert));
    ops
}

/// Render a unified diff from `old` to `new`. Empty when they are equal.
pub fn unified(old: &str, new: &str, old_label: &str, new_label: &str) -> String {
    if old == new {
        return String::new();
    }
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let ops = line_ops(&old_lines, &new_lines);

    let changed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !matches!(op, Op::Equal(..)))
        .map(|(idx, _)| idx)
        .collect();

    let mut out = format!("--- {old_label}\n+++ {new_label}\n");
    if changed.is_empty() {
        // Only line endings differ.
        out.push_str("@@ trailing newline differs @@\n");
        return out;
    }

    let mut groups: Vec<(usize, usize)> = Vec::new();
    for idx in changed {
        let start = idx.saturating_sub(CONTEXT);
        let end = (idx + CONTEXT + 1).min(ops.len());
        match groups.last_mut() {
            Some((_, last_end)) if start <= *last_end => *last_end = end,
            _ => groups.push((start, end)),
        }
    }

    for (start, end) in groups {
        let slice = &ops[start..end];
        let old_start = first_old_line(&ops, start);
        let new_start = first_new_line(&ops, start);
        let old_count = slice.iter().filter(|op| !matches!(op, Op::Insert(_))).count();
        let new_count = slice.iter().filter(|op| !matches!(op, Op::Delete(_))).count();
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            hunk_start(old_start, old_count),
            old_count,
            hunk_start(new_start, new_count),
            new_count
        ));
        for op in slice {
            match *op {
                Op::Equal(i, _) => out.push_str(&format!(" {}\n", old_lines[i])),
                Op::Delete(i) => out.push_str(&format!("-{}\n", old_lines[i])),
                Op::Insert(j) => out.push_str(&format!("+{}\n", new_lines[j])),
            }
        }
    }
    out
}

fn hunk_start(zero_based: usize, count: usize) -> usize {
    if count == 0 { zero_based } else { zero_based + 1 }
}

fn first_old_line(ops: &[Op], from: usize) -> usize {
    ops[..from]
        .iter()
        .filter(|op| !matches!(op, Op::Insert(_)))
        .count()
}

fn first_new_line(ops: &[Op], from: usize) -> usize {
    ops[..from]
        .iter()
        .filter(|op| !matches!(op, Op::Delete(_)))
        .count()
}
