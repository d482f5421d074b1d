use std::collections::HashSet;

use serde::Deserialize;

use crate::listing::Item;

/// How a fresh fetch is compared against the stored cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    /// Everything above the first already-seen id is new.
    #[default]
    StopAtFirstKnown,
    /// Every fetched item whose id is not in the cursor is new.
    AllUnseen,
}

/// Items from `fetched` (newest first) that are not covered by `previous`.
pub fn new_items(previous: &[i64], fetched: &[Item], mode: DiffMode) -> Vec<Item> {
    let seen: HashSet<i64> = previous.iter().copied().collect();
    match mode {
        DiffMode::StopAtFirstKnown => fetched
            .iter()
            .take_while(|item| !seen.contains(&item.id))
            .cloned()
            .collect(),
        DiffMode::AllUnseen => fetched
            .iter()
            .filter(|item| !seen.contains(&item.id))
            .cloned()
            .collect(),
    }
}

pub fn cursor_of(items: &[Item]) -> Vec<i64> {
    items.iter().map(|item| item.id).collect()
}
