//! Page-fetch order across tables.

use std::collections::HashMap;

use tablesync_common::TableId;

/// Compute the order in which table pages are fetched.
///
/// Tables are visited round-robin in `table_ids` order. A sequential table
/// emits all of its remaining pages when reached. When at least two tables
/// of `table_ids` are parallel, each parallel table emits one page per
/// visit, and serving the last parallel table (by position) wraps the scan
/// back to the start, so every parallel table gets one page per round.
///
/// Tables missing from `pages_per_table` or with zero pages are skipped.
/// Entries for tables not listed in `table_ids` are ignored.
pub fn sort_table_ids(
    table_ids: &[TableId],
    parallel_table_ids: &[TableId],
    pages_per_table: &HashMap<TableId, u32>,
) -> Vec<TableId> {
    let mut remaining: HashMap<TableId, u32> = HashMap::new();
    for id in table_ids {
        if let Some(pages) = pages_per_table.get(id) {
            remaining.insert(*id, *pages);
        }
    }

    let parallel: Vec<TableId> = table_ids
        .iter()
        .copied()
        .filter(|id| parallel_table_ids.contains(id))
        .collect();
    let interleave = parallel.len() > 1;
    let last_parallel = parallel.last().copied();

    let mut total: u64 = remaining.values().map(|p| u64::from(*p)).sum();
    let mut sorted = Vec::with_capacity(total as usize);
    let mut index = 0;

    while total > 0 {
        let table_id = table_ids[index];
        let pages = remaining.get_mut(&table_id).filter(|p| **p > 0);

        let Some(pages) = pages else {
            index = (index + 1) % table_ids.len();
            continue;
        };

        if interleave && parallel.contains(&table_id) {
            sorted.push(table_id);
            *pages -= 1;
            total -= 1;

            if Some(table_id) == last_parallel {
                index = 0;
                continue;
            }
        } else {
            sorted.extend(std::iter::repeat(table_id).take(*pages as usize));
            total -= u64::from(*pages);
            *pages = 0;
        }

        index = (index + 1) % table_ids.len();
    }

    sorted
}
