//! Tiling layout computation.
//!
//! Produces layout strings in the multiplexer's own grammar:
//! `WxH,X,Y,leaf` for a single pane, `WxH,X,Y{a,b}` for a side-by-side split
//! and `WxH,X,Y[a,b]` for a stacked split. The whole body is prefixed with a
//! 16-bit checksum the multiplexer verifies before applying.
//!
//! Panes are ordered oldest to newest. Every split gives the older half the
//! first partition and the newer half the second, so recently opened panes end
//! up with larger cells.

use std::collections::HashSet;

use crate::core::types::{LivePane, PaneEntry, SplitDirection, WindowSize};

/// Multiplexer layout checksum of `body`, as four lowercase hex digits.
pub fn checksum(body: &str) -> String {
    let mut csum: u32 = 0;
    for ch in body.chars() {
        csum = ((csum >> 1) + ((csum & 1) << 15) + ch as u32) & 0xFFFF;
    }
    format!("{csum:04x}")
}

/// Layout string for `n` panes numbered `0..n`. Empty when `n == 0`.
pub fn compute_layout(n: usize, width: u32, height: u32) -> String {
    let leaves: Vec<u32> = (0..n as u32).collect();
    layout_for_leaves(&leaves, width, height).unwrap_or_default()
}

/// Layout string addressing each cell by the given leaf numbers.
///
/// Returns `None` for an empty leaf list.
pub fn layout_for_leaves(leaves: &[u32], width: u32, height: u32) -> Option<String> {
    if leaves.is_empty() {
        return None;
    }
    let body = layout_node(leaves, 0, 0, width, height, None);
    Some(format!("{},{}", checksum(&body), body))
}

fn layout_node(
    leaves: &[u32],
    x: u32,
    y: u32,
    w: u32,
    h: u32,
    force: Option<SplitDirection>,
) -> String {
    if let [leaf] = leaves {
        return format!("{w}x{h},{x},{y},{leaf}");
    }

    let mid = leaves.len().div_ceil(2);
    let (older, newer) = leaves.split_at(mid);

    let axis = force.unwrap_or(if w >= h.saturating_mul(2) {
        SplitDirection::Horizontal
    } else {
        SplitDirection::Vertical
    });
    let child_axis = match axis {
        SplitDirection::Horizontal => SplitDirection::Vertical,
        SplitDirection::Vertical => SplitDirection::Horizontal,
    };
    let force_for = |group: &[u32]| (group.len() > 1).then_some(child_axis);

    match axis {
        SplitDirection::Horizontal => {
            let (first, second) = partition(w);
            let left = layout_node(older, x, y, first, h, force_for(older));
            let right = layout_node(newer, x + first + 1, y, second, h, force_for(newer));
            format!("{w}x{h},{x},{y}{{{left},{right}}}")
        }
        SplitDirection::Vertical => {
            let (first, second) = partition(h);
            let top = layout_node(older, x, y, w, first, force_for(older));
            let bottom = layout_node(newer, x, y + first + 1, w, second, force_for(newer));
            format!("{w}x{h},{x},{y}[{top},{bottom}]")
        }
    }
}

/// Split `extent` into two cells separated by a one-cell gutter.
fn partition(extent: u32) -> (u32, u32) {
    let first = extent.saturating_sub(1) / 2;
    let second = extent.saturating_sub(first).saturating_sub(1);
    (first.max(1), second.max(1))
}

/// Numeric leaf for a pane handle (`%12` -> `12`).
pub fn leaf_number(pane_id: &str) -> Option<u32> {
    pane_id.trim_start_matches('%').parse().ok()
}

/// Split direction for a new pane given the window size.
///
/// Falls back to side-by-side when the size is unknown.
pub fn preferred_split(size: Option<WindowSize>) -> SplitDirection {
    match size {
        Some(size) if !size.is_landscape() => SplitDirection::Vertical,
        _ => SplitDirection::Horizontal,
    }
}

/// Order in which live panes should be laid out.
///
/// Registered live panes come first by insertion order; live panes the
/// registry does not know about are appended in their current position, since
/// a layout string must cover every pane in the window.
pub fn desired_order(registered: &[&PaneEntry], live: &[LivePane]) -> Vec<String> {
    let live_ids: HashSet<&str> = live.iter().map(|p| p.id.as_str()).collect();
    let mut order: Vec<String> = registered
        .iter()
        .filter(|p| live_ids.contains(p.id.as_str()))
        .map(|p| p.id.clone())
        .collect();
    let known: HashSet<String> = order.iter().cloned().collect();
    let mut remaining: Vec<&LivePane> = live.iter().filter(|p| !known.contains(&p.id)).collect();
    remaining.sort_by_key(|p| p.index);
    order.extend(remaining.into_iter().map(|p| p.id.clone()));
    order
}

/// Pairwise swaps that turn `current` into `desired`.
///
/// Each returned `(source, target)` means "swap `source` into the position
/// currently held by `target`". At most `desired.len()` swaps are produced.
pub fn plan_swaps(current: &[String], desired: &[String]) -> Vec<(String, String)> {
    let mut positions: Vec<String> = current.to_vec();
    let mut swaps = Vec::new();
    for (i, want) in desired.iter().enumerate() {
        if i >= positions.len() {
            break;
        }
        if positions[i] == *want {
            continue;
        }
        let Some(j) = positions.iter().position(|id| id == want) else {
            continue;
        };
        if j > i {
            swaps.push((want.clone(), positions[i].clone()));
            positions.swap(i, j);
        }
    }
    swaps
}
