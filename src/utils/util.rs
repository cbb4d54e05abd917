use std::collections::VecDeque;

use comfy_table::Cell;

use crate::buffer::INVALID_PAGE_ID;
use crate::error::VellumResult;
use crate::storage::codec::BPlusTreePageCodec;
use crate::storage::index::BPlusTreeIndex;
use crate::storage::page::BPlusTreePage;

fn format_key(key: &[u8]) -> String {
    key.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Render the tree level by level for debugging.
pub fn pretty_format_index_tree(index: &BPlusTreeIndex) -> VellumResult<String> {
    let mut display = String::new();

    if index.is_empty()? {
        display.push_str("Empty tree.");
        return Ok(display);
    }

    let mut curr_queue = VecDeque::new();
    curr_queue.push_back(index.get_root_page_id()?);

    let mut level_index = 1;
    while !curr_queue.is_empty() {
        let mut next_queue = VecDeque::new();

        display.push_str(&format!("B+ Tree Level No.{}:\n", level_index));

        let mut level_table = comfy_table::Table::new();
        level_table.load_preset("||--+-++|    ++++++");
        let mut level_header = vec![];
        let mut level_row = vec![];

        while let Some(page_id) = curr_queue.pop_front() {
            let guard = index.buffer_pool.fetch_page_read(page_id)?;
            let (page, _) = BPlusTreePageCodec::decode(guard.data(), index.key_schema)?;

            match page {
                BPlusTreePage::Internal(internal) => {
                    let mut page_table = comfy_table::Table::new();
                    page_table.load_preset("||--+-++|    ++++++");
                    let mut page_header = Vec::new();
                    let mut page_row = Vec::new();
                    for (slot, (key, child_page_id)) in internal.array.iter().enumerate() {
                        if slot == 0 {
                            page_header.push(Cell::new("~"));
                        } else {
                            page_header.push(Cell::new(format_key(key)));
                        }
                        page_row.push(Cell::new(child_page_id));
                    }
                    page_table.set_header(page_header);
                    page_table.add_row(page_row);

                    level_header.push(Cell::new(format!(
                        "page_id={}, size: {}/{}",
                        page_id, internal.header.current_size, internal.header.max_size
                    )));
                    level_row.push(Cell::new(page_table));

                    next_queue.extend(internal.values());
                }
                BPlusTreePage::Leaf(leaf) => {
                    let mut page_table = comfy_table::Table::new();
                    page_table.load_preset("||--+-++|    ++++++");
                    let mut page_header = Vec::new();
                    let mut page_row = Vec::new();
                    for (key, rid) in leaf.array.iter() {
                        page_header.push(Cell::new(format_key(key)));
                        page_row.push(Cell::new(format!("{}", rid)));
                    }
                    page_table.set_header(page_header);
                    page_table.add_row(page_row);

                    let next = if leaf.header.next_page_id == INVALID_PAGE_ID {
                        "-".to_string()
                    } else {
                        leaf.header.next_page_id.to_string()
                    };
                    level_header.push(Cell::new(format!(
                        "page_id={}, size: {}/{}, next={}",
                        page_id, leaf.header.current_size, leaf.header.max_size, next
                    )));
                    level_row.push(Cell::new(page_table));
                }
            }
        }
        level_table.set_header(level_header);
        level_table.add_row(level_row);
        display.push_str(&format!("{level_table}\n"));

        level_index += 1;
        curr_queue = next_queue;
    }
    Ok(display)
}
